//! Driver for a fixed-function baseline JPEG codec fed by a 2D DMA engine.
//!
//! The hardware consumes raw scan data and register-level table configuration. This crate
//! provides the software half: parsing headers into register writes when decoding, emitting
//! JFIF headers when encoding, building the DMA descriptors that move pixels and bitstream
//! between memory and the codec, and serializing transactions on the shared hardware.
//!
//! Everything platform specific is reached through the traits in [`hal`].

mod codec;
mod decoder;
pub mod dma;
mod emitter;
mod encoder;
mod error;
mod format;
pub mod hal;
mod header;
mod huffman;
mod intr;
mod parser;
mod tables;
mod transaction;

#[cfg(test)]
mod sim;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use codec::{Codec, CodecSlot};
pub use decoder::{DecodeConfig, DecoderConfig, JpegDecoder};
pub use emitter::{emit_header, quality_scale, scale_qtable};
pub use encoder::{EncodeConfig, EncoderConfig, JpegEncoder};
pub use error::{Error, ErrorKind, Result};
pub use format::{
    decode_best_hb, encode_best_hb, rx_csc_mode, CscMode, DecodeOutputFormat, EncodeSourceFormat,
    Pbyte, RgbOrder, RgbPacking, YuvRgbStandard,
};
pub use header::{DecodeHeaderInfo, EncodeHeaderInfo, PictureInfo, QTable, Sampling};
pub use huffman::HuffmanCodes;
pub use intr::{Handler, HandlerToken, InterruptDispatch};
pub use parser::{parse_header, picture_info};
pub use transaction::{TransactionEvent, EVENT_QUEUE_DEPTH};

/// Locks `mutex`, ignoring poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
