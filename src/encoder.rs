//! Hardware JPEG encoding.

use std::{fmt, sync::Arc, time::Duration};

use crate::{
    codec::{Codec, CodecSlot},
    dma::{
        check_dma_aligned, round_up, DescriptorPair, Direction, DmaDescriptor, MAX_DIMENSION,
        MAX_TRANSFER_LEN,
    },
    emitter,
    error::{Error, Result},
    format::{self, EncodeSourceFormat},
    hal::{CodecMode, ComponentInfo, IntrStatus, JpegHal, Platform, SyncDirection, SyncFlags},
    header::{EncodeHeaderInfo, Sampling},
    intr::HandlerToken,
    transaction::{post, ChannelSetup, EventQueue, State, Transaction, TransactionEvent},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct EncoderConfig {
    /// Interrupt priority, 0 for the platform default.
    pub intr_priority: u8,
    /// `None` waits forever for each encode.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
pub struct EncodeConfig {
    pub src_format: EncodeSourceFormat,
    pub sub_sampling: Sampling,
    /// 1-100.
    pub quality: u8,
    pub width: u32,
    pub height: u32,
}

/// An encoder engine on a shared codec.
pub struct JpegEncoder {
    codec: Codec,
    token: HandlerToken,
    descs: DescriptorPair,
    events: EventQueue,
    timeout: Option<Duration>,
}

impl JpegEncoder {
    pub fn new(slot: &Arc<CodecSlot>, platform: &Platform, config: EncoderConfig) -> Result<Self> {
        let codec = slot.acquire(platform)?;
        let ctx = codec.context();
        ctx.dispatch.check_priority(config.intr_priority)?;

        let descs = DescriptorPair::new(ctx.platform.cache_line_size)?;
        let events = EventQueue::new();
        let sender = events.sender();
        let token = ctx.dispatch.register(
            IntrStatus::ENCODE_ERRORS,
            Arc::new(move |status: IntrStatus| post(&sender, TransactionEvent::status(status))),
        )?;
        log::debug!("created JPEG encoder with {config:?}");

        Ok(Self {
            codec,
            token,
            descs,
            events,
            timeout: config.timeout,
        })
    }

    /// Encodes the pixels in `src` into a complete JFIF file in `out`, returning its length.
    ///
    /// `out` has to be aligned to the platform cache line in address and size.
    pub fn process(&mut self, config: &EncodeConfig, src: &[u8], out: &mut [u8]) -> Result<usize> {
        if !(1..=100).contains(&config.quality) {
            return Err(Error::invalid_arg(format!(
                "quality {} out of range (1-100 are allowed)",
                config.quality
            )));
        }
        if config.width == 0
            || config.height == 0
            || config.width > MAX_DIMENSION
            || config.height > MAX_DIMENSION
        {
            return Err(Error::invalid_arg(format!(
                "invalid picture size {}x{}",
                config.width, config.height
            )));
        }
        if src.is_empty() || out.is_empty() {
            return Err(Error::invalid_arg("empty source or output buffer"));
        }

        let ctx = self.codec.context();
        let platform = &ctx.platform;
        check_dma_aligned(out, platform.cache_line_size)?;

        let hb = format::encode_best_hb(config.src_format, config.sub_sampling)?;
        let src_size = config.src_format.frame_size(config.width, config.height);
        if src.len() < src_size {
            return Err(Error::invalid_arg(format!(
                "source buffer of {} bytes is too small for a {}x{} {:?} picture ({src_size} bytes)",
                src.len(),
                config.width,
                config.height,
                config.src_format,
            )));
        }

        let mut info = EncodeHeaderInfo::new(
            config.quality,
            config.sub_sampling,
            config.width as u16,
            config.height as u16,
        )?;
        let header_len = emitter::emit_header(&mut info, platform.cache_line_size)?;
        if out.len() <= header_len {
            return Err(Error::invalid_arg(format!(
                "output buffer of {} bytes cannot hold the {header_len} byte header and any data",
                out.len()
            )));
        }

        let (_, mcu_y) = config.sub_sampling.mcu_size();
        let tx_desc = DmaDescriptor::block(
            src.as_ptr() as usize,
            mcu_y,
            hb,
            config.height,
            config.width,
            config.src_format.pbyte(),
        )?;
        let data = &mut out[header_len..];
        let rx_desc = DmaDescriptor::linear(
            data.as_mut_ptr() as usize,
            data.len().min(MAX_TRANSFER_LEN),
            true,
        )?;

        log::debug!(
            "encoding {}x{} {:?} picture with {:?} sub-sampling at quality {}",
            config.width,
            config.height,
            config.src_format,
            config.sub_sampling,
            config.quality
        );

        let mut tx = Transaction::begin(ctx, &self.events);
        program_header(tx.hal(), config, &info);
        out[..header_len].copy_from_slice(&info.header);
        tx.advance(State::HeaderReady);

        let tx_addr = self.descs.write(Direction::Tx, tx_desc, &*platform.cache)?;
        let rx_addr = self.descs.write(Direction::Rx, rx_desc, &*platform.cache)?;
        tx.advance(State::DescriptorsReady);

        platform.cache.sync(
            out.as_ptr() as usize,
            header_len,
            SyncDirection::CpuToDevice,
            SyncFlags::empty(),
        )?;
        platform.cache.sync(
            src.as_ptr() as usize,
            src_size,
            SyncDirection::CpuToDevice,
            SyncFlags::UNALIGNED,
        )?;
        tx.enqueue(ChannelSetup {
            hal: platform.hal.clone(),
            tx_desc: tx_addr,
            rx_desc: rx_addr,
            csc: None,
            events: self.events.sender(),
        })?;
        tx.wait(&self.events, self.timeout, IntrStatus::ENCODE_ERRORS)?;

        let compressed = self.descs.read(Direction::Rx, &*platform.cache)?.transfer_len();
        if compressed > out.len() - header_len {
            return Err(Error::invalid_state(format!(
                "codec reported {compressed} bytes of output, more than the buffer holds"
            )));
        }
        let synced = round_up(compressed, platform.cache_line_size).min(out.len() - header_len);
        platform.cache.sync(
            out[header_len..].as_ptr() as usize,
            synced,
            SyncDirection::DeviceToCpu,
            SyncFlags::empty(),
        )?;
        drop(tx);

        log::debug!("encoded {header_len} byte header and {compressed} bytes of scan data");
        Ok(header_len + compressed)
    }
}

impl fmt::Debug for JpegEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JpegEncoder")
            .field("token", &self.token)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Drop for JpegEncoder {
    fn drop(&mut self) {
        if let Err(e) = self.codec.dispatch().deregister(self.token) {
            log::warn!("failed to deregister encoder interrupt handler: {e}");
        }
    }
}

fn program_header(hal: &dyn JpegHal, config: &EncodeConfig, info: &EncodeHeaderInfo) {
    hal.set_codec_mode(CodecMode::Encode);
    hal.set_picture_size(config.width, config.height);
    hal.set_source_format(config.src_format);
    hal.set_sample_mode(config.sub_sampling);

    let components: Vec<_> = config
        .sub_sampling
        .factors()
        .iter()
        .enumerate()
        .map(|(i, &(h, v))| ComponentInfo {
            id: i as u8 + 1,
            h,
            v,
            qtable: if i == 0 { 0 } else { 1 },
        })
        .collect();
    hal.set_frame_info(&components);

    // The luminance and chrominance tables also occupy slots 2 and 3.
    let [luma, chroma] = &info.qtables;
    hal.write_qtable(0, luma);
    hal.write_qtable(1, chroma);
    hal.write_qtable(2, luma);
    hal.write_qtable(3, chroma);

    hal.set_restart_interval(None);
    hal.enable_interrupts(IntrStatus::ENCODE_ERRORS);
}
