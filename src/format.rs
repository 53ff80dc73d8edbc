//! Pixel formats and the hardware lookup tables keyed by them.

use std::fmt;

use crate::{
    error::{Error, Result},
    header::Sampling,
};

/// Pixel layout written to memory by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DecodeOutputFormat {
    #[default]
    Rgb888,
    Rgb565,
    Gray,
    Yuv444,
    Yuv422,
    Yuv420,
}

/// Pixel layout the encoder reads from memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EncodeSourceFormat {
    #[default]
    Rgb888,
    Rgb565,
    Gray,
    Yuv444,
    Yuv422,
    Yuv420,
}

/// Byte order of RGB output pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RgbOrder {
    #[default]
    Rgb,
    Bgr,
}

/// YUV to RGB conversion matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum YuvRgbStandard {
    #[default]
    Bt601,
    Bt709,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RgbPacking {
    Rgb888,
    Rgb565,
}

/// Configuration of the color-space conversion unit on the DMA receive channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CscMode {
    /// Pixels are passed through unchanged.
    Bypass,
    YuvToRgb {
        from: Sampling,
        standard: YuvRgbStandard,
        packing: RgbPacking,
        order: RgbOrder,
    },
    /// Chroma is up-sampled to 4:4:4.
    Upsample { from: Sampling },
}

/// DMA `pbyte` packing value: bytes per pixel as the engine encodes it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pbyte(u8);

impl Pbyte {
    pub const HALF: Self = Self(0);
    pub const ONE: Self = Self(1);
    pub const ONE_AND_HALF: Self = Self(2);
    pub const TWO: Self = Self(3);
    pub const THREE: Self = Self(4);
    pub const FOUR: Self = Self(5);

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for Pbyte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self.0 {
            0 => "0.5",
            1 => "1",
            2 => "1.5",
            3 => "2",
            4 => "3",
            5 => "4",
            _ => "?",
        };
        write!(f, "Pbyte({s})")
    }
}

fn bits_per_pixel(layout: Layout) -> u32 {
    match layout {
        Layout::Rgb888 | Layout::Yuv444 => 24,
        Layout::Rgb565 | Layout::Yuv422 => 16,
        Layout::Yuv420 => 12,
        Layout::Gray => 8,
    }
}

fn pbyte(layout: Layout) -> Pbyte {
    match layout {
        Layout::Rgb888 | Layout::Yuv444 => Pbyte::THREE,
        Layout::Rgb565 | Layout::Yuv422 => Pbyte::TWO,
        Layout::Yuv420 => Pbyte::ONE_AND_HALF,
        Layout::Gray => Pbyte::ONE,
    }
}

/// Both format enums share the same set of memory layouts.
#[derive(Clone, Copy)]
enum Layout {
    Rgb888,
    Rgb565,
    Gray,
    Yuv444,
    Yuv422,
    Yuv420,
}

macro_rules! layout_fns {
    ($ty:ident) => {
        impl $ty {
            fn layout(self) -> Layout {
                match self {
                    $ty::Rgb888 => Layout::Rgb888,
                    $ty::Rgb565 => Layout::Rgb565,
                    $ty::Gray => Layout::Gray,
                    $ty::Yuv444 => Layout::Yuv444,
                    $ty::Yuv422 => Layout::Yuv422,
                    $ty::Yuv420 => Layout::Yuv420,
                }
            }

            #[inline]
            pub fn bits_per_pixel(self) -> u32 {
                bits_per_pixel(self.layout())
            }

            /// Size in bytes of a `width` x `height` picture in this format.
            pub fn frame_size(self, width: u32, height: u32) -> usize {
                width as usize * height as usize * self.bits_per_pixel() as usize / 8
            }

            #[inline]
            pub fn pbyte(self) -> Pbyte {
                pbyte(self.layout())
            }
        }
    };
}

layout_fns!(DecodeOutputFormat);
layout_fns!(EncodeSourceFormat);

fn sampling_index(sampling: Sampling) -> usize {
    match sampling {
        Sampling::Yuv444 => 0,
        Sampling::Yuv422 => 1,
        Sampling::Yuv420 => 2,
        Sampling::Gray => 3,
    }
}

/// Decode block width in bytes, `[sampling][output format]`. 0 marks unsupported pairs.
#[rustfmt::skip]
const DECODE_BEST_HB: [[u32; 6]; 4] = [
    //  rgb888 rgb565 gray yuv444 yuv422 yuv420
    [   24,    16,    0,   24,    0,     0  ], // 4:4:4
    [   48,    32,    0,   48,    32,    0  ], // 4:2:2
    [   48,    32,    0,   48,    0,     24 ], // 4:2:0
    [   0,     0,     8,   0,     0,     0  ], // gray
];

/// Encode block width in bytes, `[source format][sampling]`. 0 marks unsupported pairs.
#[rustfmt::skip]
const ENCODE_BEST_HB: [[u32; 4]; 6] = [
    //  444 422 420 gray
    [   24, 48, 48, 0 ], // rgb888
    [   16, 32, 32, 0 ], // rgb565
    [   0,  0,  0,  8 ], // gray
    [   24, 0,  0,  0 ], // yuv444
    [   0,  32, 0,  0 ], // yuv422
    [   0,  0,  24, 0 ], // yuv420
];

/// Horizontal DMA block size in bytes for decoding a `sampling` frame into `format`.
pub fn decode_best_hb(format: DecodeOutputFormat, sampling: Sampling) -> Result<u32> {
    match DECODE_BEST_HB[sampling_index(sampling)][format as usize] {
        0 => Err(Error::not_supported(format!(
            "cannot decode {sampling:?} picture to {format:?}"
        ))),
        hb => Ok(hb),
    }
}

/// Horizontal DMA block size in bytes for encoding `format` pixels with `sampling`.
///
/// Also serves as the compatibility check between source format and sub-sampling.
pub fn encode_best_hb(format: EncodeSourceFormat, sampling: Sampling) -> Result<u32> {
    match ENCODE_BEST_HB[format as usize][sampling_index(sampling)] {
        0 => Err(Error::not_supported(format!(
            "cannot encode {format:?} source with {sampling:?} sub-sampling"
        ))),
        hb => Ok(hb),
    }
}

/// Picks the receive channel color conversion for decoding a `sampling` frame into `format`.
pub fn rx_csc_mode(
    format: DecodeOutputFormat,
    order: RgbOrder,
    standard: YuvRgbStandard,
    sampling: Sampling,
) -> Result<CscMode> {
    use DecodeOutputFormat as F;

    let unsupported = || {
        Err(Error::not_supported(format!(
            "no color conversion from {sampling:?} to {format:?}"
        )))
    };

    if sampling == Sampling::Gray {
        return match format {
            F::Gray => Ok(CscMode::Bypass),
            _ => unsupported(),
        };
    }

    match (format, sampling) {
        (F::Rgb888 | F::Rgb565, from) => Ok(CscMode::YuvToRgb {
            from,
            standard,
            packing: if format == F::Rgb888 {
                RgbPacking::Rgb888
            } else {
                RgbPacking::Rgb565
            },
            order,
        }),
        (F::Yuv444, Sampling::Yuv444) => Ok(CscMode::Bypass),
        (F::Yuv444, from) => Ok(CscMode::Upsample { from }),
        (F::Yuv422, Sampling::Yuv422) | (F::Yuv420, Sampling::Yuv420) => Ok(CscMode::Bypass),
        _ => unsupported(),
    }
}
