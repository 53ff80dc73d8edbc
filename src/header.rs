//! Transient header records exchanged between the marker parser/emitter and the engines.

use std::fmt;

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Pod, Zeroable, PartialEq, Eq, Debug)]
#[repr(C)]
pub struct QTable {
    /// Coefficients in natural (row-major) order.
    pub values: [u32; 64],
}

impl QTable {
    pub fn from_natural(values: &[u8; 64]) -> Self {
        Self {
            values: values.map(u32::from),
        }
    }
}

/// Chroma sub-sampling of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sampling {
    Yuv444,
    Yuv422,
    Yuv420,
    Gray,
}

impl Sampling {
    /// Per-component `(H, V)` sampling factors used when emitting a frame header.
    pub fn factors(self) -> &'static [(u8, u8)] {
        match self {
            Sampling::Yuv444 => &[(1, 1), (1, 1), (1, 1)],
            Sampling::Yuv422 => &[(2, 1), (1, 1), (1, 1)],
            Sampling::Yuv420 => &[(2, 2), (1, 1), (1, 1)],
            Sampling::Gray => &[(1, 1)],
        }
    }

    /// MCU extent in pixels, `(width, height)`.
    pub fn mcu_size(self) -> (u32, u32) {
        let (h, v) = self.factors()[0];
        (u32::from(h) * 8, u32::from(v) * 8)
    }

    #[inline]
    pub fn num_components(self) -> u8 {
        self.factors().len() as u8
    }

    /// Classifies a frame by its component count and the packed `HiVi` byte of component 0.
    pub fn classify(num_components: u8, luma_hv: u8) -> Result<Self> {
        if num_components == 1 {
            return Ok(Sampling::Gray);
        }
        match luma_hv {
            0x11 => Ok(Sampling::Yuv444),
            0x21 => Ok(Sampling::Yuv422),
            0x22 => Ok(Sampling::Yuv420),
            other => Err(Error::invalid_arg(format!(
                "unrecognized sampling factor {:x}x{:x}",
                other >> 4,
                other & 0xf
            ))),
        }
    }
}

/// Result of a pre-flight header inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureInfo {
    pub width: u32,
    pub height: u32,
    pub sampling: Sampling,
}

/// Header state collected by the marker parser for a single decode.
///
/// Starts out zeroed and is complete once the parser reaches the SOS marker.
#[derive(Clone, Zeroable)]
pub struct DecodeHeaderInfo {
    /// Offset of the unparsed remainder of the bitstream. Points at the SOS marker after parsing.
    pub buffer_offset: usize,
    pub buffer_left: usize,
    pub header_size: usize,
    pub origin_width: u32,
    pub origin_height: u32,
    /// Dimensions rounded up to whole MCUs.
    pub process_width: u32,
    pub process_height: u32,
    pub mcu_width: u32,
    pub mcu_height: u32,
    pub num_components: u8,
    pub component_ids: [u8; 4],
    pub sampling_hv: [u8; 4],
    pub qtable_ids: [u8; 4],
    pub qtables: [QTable; 4],
    pub qtable_present: [bool; 4],
    /// Indexed by `[class][id]`.
    pub huffman_bits: [[[u8; 16]; 2]; 2],
    pub huffman_values: [[[u8; 256]; 2]; 2],
    pub huffman_present: [[bool; 2]; 2],
    pub restart_interval: u16,
    pub dri_present: bool,
    pub sof_present: bool,
}

impl DecodeHeaderInfo {
    pub fn new(len: usize) -> Box<Self> {
        let mut info = Box::new(Self::zeroed());
        info.buffer_left = len;
        info
    }

    pub fn sampling(&self) -> Result<Sampling> {
        Sampling::classify(self.num_components, self.sampling_hv[0])
    }

    pub fn huffman_values(&self, class: usize, id: usize) -> &[u8] {
        let count: usize = self.huffman_bits[class][id]
            .iter()
            .map(|&n| usize::from(n))
            .sum();
        &self.huffman_values[class][id][..count]
    }
}

impl fmt::Debug for DecodeHeaderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = usize::from(self.num_components).min(4);
        f.debug_struct("DecodeHeaderInfo")
            .field("header_size", &self.header_size)
            .field("buffer_left", &self.buffer_left)
            .field("origin", &(self.origin_width, self.origin_height))
            .field("process", &(self.process_width, self.process_height))
            .field("sampling_hv", &&self.sampling_hv[..n])
            .field("qtable_present", &self.qtable_present)
            .field("huffman_present", &self.huffman_present)
            .field("restart_interval", &self.dri_present.then_some(self.restart_interval))
            .finish_non_exhaustive()
    }
}

/// Parameters and output state of the marker emitter for a single encode.
pub struct EncodeHeaderInfo {
    pub header: Vec<u8>,
    pub quality: u8,
    pub sampling: Sampling,
    pub num_components: u8,
    pub origin_width: u16,
    pub origin_height: u16,
    /// Luminance and chrominance tables, natural order.
    pub qtables: [QTable; 2],
}

impl EncodeHeaderInfo {
    pub fn new(
        quality: u8,
        sampling: Sampling,
        origin_width: u16,
        origin_height: u16,
    ) -> Result<Self> {
        let mut header = Vec::new();
        header
            .try_reserve(1024)
            .map_err(|_| Error::no_memory("cannot allocate JPEG header buffer"))?;
        Ok(Self {
            header,
            quality,
            sampling,
            num_components: sampling.num_components(),
            origin_width,
            origin_height,
            qtables: [QTable::zeroed(); 2],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify() {
        assert_eq!(Sampling::classify(3, 0x11).unwrap(), Sampling::Yuv444);
        assert_eq!(Sampling::classify(3, 0x21).unwrap(), Sampling::Yuv422);
        assert_eq!(Sampling::classify(3, 0x22).unwrap(), Sampling::Yuv420);
        assert_eq!(Sampling::classify(1, 0x22).unwrap(), Sampling::Gray);
        assert!(Sampling::classify(3, 0x12).is_err());
    }

    #[test]
    fn zeroed_header() {
        let info = DecodeHeaderInfo::new(100);
        assert_eq!(info.buffer_left, 100);
        assert_eq!(info.origin_width, 0);
        assert!(!info.sof_present);
        assert!(info.huffman_values(1, 1).is_empty());
    }

    #[test]
    fn header_debug_skips_table_contents() {
        let mut info = DecodeHeaderInfo::new(10);
        info.num_components = 1;
        info.sampling_hv[0] = 0x11;
        let dbg = format!("{info:?}");
        assert!(dbg.starts_with("DecodeHeaderInfo { header_size: 0, buffer_left: 10,"), "{dbg}");
        assert!(dbg.contains("sampling_hv: [17]"), "{dbg}");
        assert!(!dbg.contains("huffman_values"), "{dbg}");
    }
}
