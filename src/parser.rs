//! JPEG marker parser for the decode path.
//!
//! The parser walks the marker segments up to the SOS marker and collects everything the codec
//! has to be programmed with (frame geometry, quantization and Huffman tables, restart interval)
//! into a [`DecodeHeaderInfo`]. The SOS segment itself and the entropy-coded data following it
//! are left in the stream, since the hardware consumes them directly.

#![allow(non_snake_case)]


use std::{fmt, mem};

use bytemuck::AnyBitPattern;

use crate::{
    error::{Error, Result},
    header::{DecodeHeaderInfo, PictureInfo, Sampling},
    tables::ZIGZAG,
};

pub(crate) mod marker {
    pub const SOF0: u8 = 0xC0;
    pub const DHT: u8 = 0xC4;
    pub const SOI: u8 = 0xD8;
    pub const SOS: u8 = 0xDA;
    pub const DQT: u8 = 0xDB;
    pub const DRI: u8 = 0xDD;
    pub const APP0: u8 = 0xE0;
    pub const APP15: u8 = 0xEF;
    pub const COM: u8 = 0xFE;
}

/// Parses all header segments of a baseline JPEG up to (but not including) the SOS marker.
pub fn parse_header(buf: &[u8]) -> Result<Box<DecodeHeaderInfo>> {
    let mut info = DecodeHeaderInfo::new(buf.len());
    MarkerParser::new(buf, &mut info, Mode::Full).run()?;
    Ok(info)
}

/// Reads the picture dimensions and sub-sampling from the first SOF0 segment of `buf`.
///
/// Every other segment is skipped without being interpreted.
pub fn picture_info(buf: &[u8]) -> Result<PictureInfo> {
    let mut info = DecodeHeaderInfo::new(buf.len());
    MarkerParser::new(buf, &mut info, Mode::FrameOnly).run()?;
    Ok(PictureInfo {
        width: info.origin_width,
        height: info.origin_height,
        sampling: info.sampling()?,
    })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Collect everything up to SOS.
    Full,
    /// Stop after the first SOF0 segment.
    FrameOnly,
}

struct MarkerParser<'a, 'i> {
    reader: Reader<'a>,
    info: &'i mut DecodeHeaderInfo,
    mode: Mode,
}

impl<'a, 'i> MarkerParser<'a, 'i> {
    fn new(buf: &'a [u8], info: &'i mut DecodeHeaderInfo, mode: Mode) -> Self {
        Self {
            reader: Reader { buf, position: 0 },
            info,
            mode,
        }
    }

    fn run(&mut self) -> Result<()> {
        loop {
            let marker = self.next_marker()?;
            log::trace!(
                "marker ff {:02x} at offset {}",
                marker,
                self.reader.position - 2
            );

            match marker {
                marker::SOI => {}
                marker::SOF0 => {
                    self.read_sof()?;
                    if self.mode == Mode::FrameOnly {
                        return Ok(());
                    }
                }
                0xC1..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF => {
                    return Err(Error::invalid_arg(format!(
                        "{:?} is unsupported, not baseline-DCT",
                        SofMarker(marker)
                    )));
                }
                marker::SOS => {
                    if !self.info.sof_present {
                        return Err(Error::invalid_arg("SOS not preceded by SOF0 header"));
                    }
                    // The SOS segment is parsed by the codec itself, so leave the marker in the
                    // stream.
                    self.reader.position -= 2;
                    self.info.buffer_offset = self.reader.position;
                    self.info.buffer_left = self.reader.buf.len() - self.reader.position;
                    self.info.header_size = self.reader.position;
                    log::trace!(
                        "header size {} bytes, {} bytes of scan data",
                        self.info.header_size,
                        self.info.buffer_left
                    );
                    return Ok(());
                }
                _ if self.mode == Mode::FrameOnly => {
                    if has_length(marker) {
                        self.skip_segment()?;
                    }
                }
                marker::APP0..=marker::APP15 | marker::COM => self.skip_segment()?,
                marker::DQT => self.read_dqt()?,
                marker::DHT => self.read_dht()?,
                marker::DRI => self.read_dri()?,
                _ => log::trace!("ignoring marker ff {:02x}", marker),
            }
        }
    }

    /// Reads the next `FF xx` marker, skipping fill bytes and anything that isn't a marker.
    fn next_marker(&mut self) -> Result<u8> {
        let missing = || {
            Error::invalid_arg(
                "reached end of data while looking for the next marker (no SOS/SOF0 found)",
            )
        };

        loop {
            while self.reader.read_u8().map_err(|_| missing())? != 0xff {}

            let mut marker = self.reader.read_u8().map_err(|_| missing())?;
            while marker == 0xff {
                marker = self.reader.read_u8().map_err(|_| missing())?;
            }
            if marker != 0x00 {
                return Ok(marker);
            }
        }
    }

    /// Returns a reader over the payload of the current segment and advances past it.
    fn segment(&mut self) -> Result<Reader<'a>> {
        let length = usize::from(self.reader.read_length()?);
        let expected_end = self.reader.position + length;
        let reader = Reader {
            buf: &self.reader.buf[..expected_end],
            position: self.reader.position,
        };
        self.reader.position = expected_end;
        Ok(reader)
    }

    fn skip_segment(&mut self) -> Result<()> {
        self.segment().map(drop)
    }

    fn read_dqt(&mut self) -> Result<()> {
        let mut reader = self.segment()?;

        while !reader.remaining().is_empty() {
            let PqTq = reader.read_u8()?;
            let (Pq, Tq) = (PqTq >> 4, usize::from(PqTq & 0xf));
            if Tq > 3 {
                return Err(Error::invalid_arg(format!(
                    "invalid quantization table destination Tq={Tq} (0-3 are allowed)"
                )));
            }

            let table = &mut self.info.qtables[Tq].values;
            for &pos in &ZIGZAG {
                table[usize::from(pos)] = match Pq {
                    0 => u32::from(reader.read_u8()?),
                    1 => u32::from(reader.read_u16()?),
                    _ => {
                        return Err(Error::invalid_arg(format!(
                            "invalid quantization table precision Pq={Pq}"
                        )))
                    }
                };
            }
            self.info.qtable_present[Tq] = true;
            log::trace!("DQT Pq={Pq} Tq={Tq}");
        }
        Ok(())
    }

    fn read_sof(&mut self) -> Result<()> {
        if self.info.sof_present {
            return Err(Error::invalid_arg("encountered multiple SOF markers"));
        }

        let mut reader = self.segment()?;
        let P = reader.read_u8()?;
        if P != 8 {
            return Err(Error::invalid_arg(format!(
                "sample precision not 8 (P={P})"
            )));
        }
        let Y = reader.read_u16()?;
        let X = reader.read_u16()?;
        if X == 0 || Y == 0 {
            return Err(Error::invalid_arg(format!("invalid picture size {X}x{Y}")));
        }
        if (u32::from(X) * u32::from(Y)) % 8 != 0 {
            return Err(Error::invalid_arg(format!(
                "picture size {X}x{Y} is not a multiple of 8 pixels"
            )));
        }

        let num_components = reader.read_u8()?;
        if !(1..=3).contains(&num_components) {
            return Err(Error::invalid_arg(format!(
                "frame with {num_components} components not supported (1-3 are allowed)"
            )));
        }
        let components = reader.read_objs::<FrameComponent>(num_components.into())?;
        for (i, c) in components.iter().enumerate() {
            log::trace!("{:?}", c);
            if c.Tqi > 3 {
                return Err(Error::invalid_arg(format!(
                    "invalid quantization table selection {} for component {}",
                    c.Tqi, c.Ci
                )));
            }
            self.info.component_ids[i] = c.Ci;
            self.info.sampling_hv[i] = c.HiVi;
            self.info.qtable_ids[i] = c.Tqi;
        }

        let luma = components[0];
        if luma.Hi() == 0 || luma.Vi() == 0 {
            return Err(Error::invalid_arg(format!(
                "invalid sampling factors {}x{}",
                luma.Hi(),
                luma.Vi()
            )));
        }
        let sampling = Sampling::classify(num_components, luma.HiVi)?;

        let info = &mut *self.info;
        info.num_components = num_components;
        info.origin_width = X.into();
        info.origin_height = Y.into();
        info.mcu_width = u32::from(luma.Hi()) * 8;
        info.mcu_height = u32::from(luma.Vi()) * 8;
        info.process_width = round_to_mcu(info.origin_width, info.mcu_width);
        info.process_height = round_to_mcu(info.origin_height, info.mcu_height);
        info.sof_present = true;

        log::debug!(
            "SOF0 {}x{} ({}x{} processed), {} components, {:?}",
            X,
            Y,
            info.process_width,
            info.process_height,
            num_components,
            sampling,
        );
        Ok(())
    }

    fn read_dht(&mut self) -> Result<()> {
        let mut reader = self.segment()?;

        while !reader.remaining().is_empty() {
            let header: &DhtHeader = reader.read_obj()?;
            let (class, id) = (header.Tc(), header.Th());
            if class > 1 {
                return Err(Error::invalid_arg(format!(
                    "invalid table class Tc={class} (only 0 and 1 are valid)"
                )));
            }
            if id > 1 {
                return Err(Error::invalid_arg(format!(
                    "DHT Th={id}, only 0 and 1 are allowed for baseline JPEGs"
                )));
            }
            let count = header.num_values();
            if count > 256 {
                return Err(Error::invalid_arg(format!(
                    "DHT table with {count} values (at most 256 are allowed)"
                )));
            }
            let values = reader.read_slice(count)?;

            let (class, id) = (usize::from(class), usize::from(id));
            self.info.huffman_bits[class][id] = header.Li;
            self.info.huffman_values[class][id][..count].copy_from_slice(values);
            self.info.huffman_present[class][id] = true;
            log::trace!("DHT Tc={class} Th={id}, {count} codes");
        }
        Ok(())
    }

    fn read_dri(&mut self) -> Result<()> {
        let length = self.reader.peek_u16()?;
        if length != 4 {
            return Err(Error::invalid_arg(format!(
                "DRI segment length must be 4, got {length}"
            )));
        }
        let mut reader = self.segment()?;
        self.info.restart_interval = reader.read_u16()?;
        self.info.dri_present = true;
        log::trace!("DRI Ri={}", self.info.restart_interval);
        Ok(())
    }
}

/// Rounds `origin` up to a whole number of MCUs.
fn round_to_mcu(origin: u32, mcu: u32) -> u32 {
    if origin % mcu != 0 {
        (origin / mcu + 1) * mcu
    } else {
        origin
    }
}

/// Whether `marker` introduces a segment with a length field.
fn has_length(marker: u8) -> bool {
    !matches!(marker, 0x01 | 0xD0..=0xD9)
}

#[derive(Debug)]
struct Reader<'a> {
    buf: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.position..]
    }

    fn eof() -> Error {
        Error::invalid_arg("reached end of data while decoding JPEG header")
    }

    fn peek_u8(&self, offset: usize) -> Result<u8> {
        self.buf
            .get(self.position + offset)
            .copied()
            .ok_or_else(Self::eof)
    }

    fn peek_u16(&self) -> Result<u16> {
        Ok(u16::from_be_bytes([self.peek_u8(0)?, self.peek_u8(1)?]))
    }

    fn read_u8(&mut self) -> Result<u8> {
        let res = self.peek_u8(0);
        if res.is_ok() {
            self.position += 1;
        }
        res
    }

    fn read_u16(&mut self) -> Result<u16> {
        let b = [self.read_u8()?, self.read_u8()?];
        Ok(u16::from_be_bytes(b))
    }

    fn read_slice(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.remaining().len() < count {
            Err(Self::eof())
        } else {
            let slice = &self.remaining()[..count];
            self.position += count;
            Ok(slice)
        }
    }

    fn read_obj<T: AnyBitPattern>(&mut self) -> Result<&'a T> {
        debug_assert_eq!(mem::align_of::<T>(), 1);
        let bytes = self.read_slice(mem::size_of::<T>())?;
        Ok(bytemuck::from_bytes(bytes))
    }

    fn read_objs<T: AnyBitPattern>(&mut self, count: usize) -> Result<&'a [T]> {
        debug_assert_eq!(mem::align_of::<T>(), 1);
        let bytes = self.read_slice(count * mem::size_of::<T>())?;
        Ok(bytemuck::cast_slice(bytes))
    }

    fn read_length(&mut self) -> Result<u16> {
        // Length parameter is the length of the segment parameters, including the length parameter,
        // but excluding the FF xx marker.

        let len = self.read_u16()?;
        if len < 2 {
            return Err(Error::invalid_arg(format!("invalid segment length {len}")));
        }
        if self.remaining().len() < (len - 2).into() {
            return Err(Self::eof());
        }
        Ok(len - 2)
    }
}

#[derive(Clone, Copy, AnyBitPattern)]
#[repr(C)]
struct DhtHeader {
    TcTh: u8,
    Li: [u8; 16],
}

impl DhtHeader {
    fn Tc(&self) -> u8 {
        self.TcTh >> 4
    }

    fn Th(&self) -> u8 {
        self.TcTh & 0xf
    }

    fn num_values(&self) -> usize {
        self.Li.iter().map(|l| *l as usize).sum()
    }
}

#[derive(Clone, Copy, AnyBitPattern)]
#[repr(C)]
struct FrameComponent {
    Ci: u8,
    HiVi: u8,
    Tqi: u8,
}

impl FrameComponent {
    fn Hi(&self) -> u8 {
        self.HiVi >> 4
    }

    fn Vi(&self) -> u8 {
        self.HiVi & 0xf
    }
}

impl fmt::Debug for FrameComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameComponent")
            .field("Ci", &self.Ci)
            .field("Hi", &self.Hi())
            .field("Vi", &self.Vi())
            .field("Tqi", &self.Tqi)
            .finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct SofMarker(u8);

impl fmt::Debug for SofMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0xC0 => f.write_str("SOF0"),
            0xC1 => f.write_str("SOF1 (extended sequential)"),
            0xC2 => f.write_str("SOF2 (progressive)"),
            0xC3 => f.write_str("SOF3 (lossless)"),
            0xC5 => f.write_str("SOF5 (differential sequential)"),
            0xC6 => f.write_str("SOF6 (differential progressive)"),
            0xC7 => f.write_str("SOF7 (differential lossless)"),
            0xC9 => f.write_str("SOF9 (arithmetic sequential)"),
            0xCA => f.write_str("SOF10 (arithmetic progressive)"),
            0xCB => f.write_str("SOF11 (arithmetic lossless)"),
            0xCD => f.write_str("SOF13 (arithmetic differential sequential)"),
            0xCE => f.write_str("SOF14 (arithmetic differential progressive)"),
            0xCF => f.write_str("SOF15 (arithmetic differential lossless)"),
            other => f
                .debug_tuple("SofMarker")
                .field(&format_args!("{:02x}", other))
                .finish(),
        }
    }
}
