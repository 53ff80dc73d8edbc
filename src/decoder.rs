//! Hardware JPEG decoding.

use std::{fmt, sync::Arc, time::Duration};

use crate::{
    codec::{Codec, CodecSlot},
    dma::{check_dma_aligned, DescriptorPair, Direction, DmaDescriptor},
    error::{Error, Result},
    format::{self, DecodeOutputFormat, RgbOrder, YuvRgbStandard},
    hal::{CodecMode, ComponentInfo, IntrStatus, JpegHal, Platform, SyncDirection, SyncFlags},
    header::{DecodeHeaderInfo, PictureInfo},
    huffman::HuffmanCodes,
    intr::HandlerToken,
    parser,
    transaction::{post, ChannelSetup, EventQueue, State, Transaction, TransactionEvent},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderConfig {
    /// Interrupt priority, 0 for the platform default.
    pub intr_priority: u8,
    /// `None` waits forever for each decode.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeConfig {
    pub output_format: DecodeOutputFormat,
    /// Only used for RGB output.
    pub rgb_order: RgbOrder,
    /// Only used for RGB output.
    pub conv_std: YuvRgbStandard,
}

/// A decoder engine on a shared codec.
pub struct JpegDecoder {
    codec: Codec,
    token: HandlerToken,
    descs: DescriptorPair,
    events: EventQueue,
    timeout: Option<Duration>,
}

impl JpegDecoder {
    pub fn new(slot: &Arc<CodecSlot>, platform: &Platform, config: DecoderConfig) -> Result<Self> {
        let codec = slot.acquire(platform)?;
        let ctx = codec.context();
        ctx.dispatch.check_priority(config.intr_priority)?;

        let descs = DescriptorPair::new(ctx.platform.cache_line_size)?;
        let events = EventQueue::new();
        let sender = events.sender();
        let token = ctx.dispatch.register(
            IntrStatus::DECODE_ERRORS,
            Arc::new(move |status: IntrStatus| post(&sender, TransactionEvent::status(status))),
        )?;
        log::debug!("created JPEG decoder with {config:?}");

        Ok(Self {
            codec,
            token,
            descs,
            events,
            timeout: config.timeout,
        })
    }

    /// Reads the dimensions and sub-sampling of `bitstream` without touching the hardware.
    pub fn picture_info(&self, bitstream: &[u8]) -> Result<PictureInfo> {
        parser::picture_info(bitstream)
    }

    /// Decodes one baseline JPEG into `out`, returning the number of bytes written.
    ///
    /// `out` has to be aligned to the platform cache line in address and size, and large enough
    /// for the picture rounded up to whole MCUs.
    pub fn process(
        &mut self,
        config: &DecodeConfig,
        bitstream: &[u8],
        out: &mut [u8],
    ) -> Result<usize> {
        if bitstream.is_empty() {
            return Err(Error::invalid_arg("empty JPEG bitstream"));
        }
        if out.is_empty() {
            return Err(Error::invalid_arg("empty output buffer"));
        }

        let ctx = self.codec.context();
        let platform = &ctx.platform;
        check_dma_aligned(out, platform.cache_line_size)?;

        let header = parser::parse_header(bitstream)?;
        let sampling = header.sampling()?;
        let csc = format::rx_csc_mode(
            config.output_format,
            config.rgb_order,
            config.conv_std,
            sampling,
        )?;
        let hb = format::decode_best_hb(config.output_format, sampling)?;
        let huffman = build_huffman_tables(&header)?;

        let size = config
            .output_format
            .frame_size(header.process_width, header.process_height);
        if out.len() < size {
            return Err(Error::invalid_arg(format!(
                "output buffer of {} bytes is too small for a {}x{} {:?} picture ({size} bytes)",
                out.len(),
                header.process_width,
                header.process_height,
                config.output_format,
            )));
        }

        let tx_desc = DmaDescriptor::linear(
            bitstream.as_ptr() as usize + header.buffer_offset,
            header.buffer_left,
            true,
        )?;
        let rx_desc = DmaDescriptor::block(
            out.as_mut_ptr() as usize,
            header.mcu_height,
            hb,
            header.process_height,
            header.process_width,
            config.output_format.pbyte(),
        )?;

        log::debug!(
            "decoding {}x{} {:?} picture to {:?}",
            header.origin_width,
            header.origin_height,
            sampling,
            config.output_format
        );

        let mut tx = Transaction::begin(ctx, &self.events);
        program_header(tx.hal(), &header, &huffman);
        tx.advance(State::HeaderReady);

        let tx_addr = self.descs.write(Direction::Tx, tx_desc, &*platform.cache)?;
        let rx_addr = self.descs.write(Direction::Rx, rx_desc, &*platform.cache)?;
        tx.advance(State::DescriptorsReady);

        platform.cache.sync(
            tx_desc.buffer(),
            header.buffer_left,
            SyncDirection::CpuToDevice,
            SyncFlags::UNALIGNED,
        )?;
        tx.enqueue(ChannelSetup {
            hal: platform.hal.clone(),
            tx_desc: tx_addr,
            rx_desc: rx_addr,
            csc: Some(csc),
            events: self.events.sender(),
        })?;
        tx.wait(&self.events, self.timeout, IntrStatus::DECODE_ERRORS)?;

        platform.cache.sync(
            out.as_ptr() as usize,
            out.len(),
            SyncDirection::DeviceToCpu,
            SyncFlags::empty(),
        )?;
        Ok(size)
    }
}

impl fmt::Debug for JpegDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JpegDecoder")
            .field("token", &self.token)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Drop for JpegDecoder {
    fn drop(&mut self) {
        if let Err(e) = self.codec.dispatch().deregister(self.token) {
            log::warn!("failed to deregister decoder interrupt handler: {e}");
        }
    }
}

/// Huffman tables indexed by `[class][id]`, `None` where the stream defines none.
type HuffmanSet = [[Option<HuffmanCodes>; 2]; 2];

fn build_huffman_tables(header: &DecodeHeaderInfo) -> Result<HuffmanSet> {
    let mut set: HuffmanSet = Default::default();
    for class in 0..2 {
        for id in 0..2 {
            if header.huffman_present[class][id] {
                set[class][id] = Some(HuffmanCodes::build(
                    &header.huffman_bits[class][id],
                    header.huffman_values(class, id),
                )?);
            }
        }
    }
    Ok(set)
}

fn program_header(
    hal: &dyn JpegHal,
    header: &DecodeHeaderInfo,
    huffman: &HuffmanSet,
) {
    hal.set_codec_mode(CodecMode::Decode);
    hal.set_picture_size(header.origin_width, header.origin_height);

    let n = usize::from(header.num_components);
    let components: Vec<_> = (0..n)
        .map(|i| ComponentInfo {
            id: header.component_ids[i],
            h: header.sampling_hv[i] >> 4,
            v: header.sampling_hv[i] & 0xf,
            qtable: header.qtable_ids[i],
        })
        .collect();
    hal.set_frame_info(&components);

    for (slot, table) in header.qtables.iter().enumerate() {
        if header.qtable_present[slot] {
            hal.write_qtable(slot as u8, table);
        }
    }

    for (class, tables) in huffman.iter().enumerate() {
        for (id, codes) in tables.iter().enumerate() {
            if let Some(codes) = codes {
                hal.write_huffman_table(
                    class as u8,
                    id as u8,
                    &header.huffman_bits[class][id],
                    header.huffman_values(class, id),
                    codes.min_codes(),
                );
            }
        }
    }

    hal.set_restart_interval(header.dri_present.then_some(header.restart_interval));
    hal.enable_interrupts(IntrStatus::DECODE_ERRORS);
}
