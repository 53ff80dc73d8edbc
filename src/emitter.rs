//! JPEG marker emitter for the encode path.
//!
//! The codec only produces entropy-coded scan data, so the driver writes the JFIF header itself.
//! The header is padded with a COM segment so that it ends on a cache line boundary, which lets
//! the DMA engine write the scan data directly behind it.

use std::mem;

use crate::{
    dma::check_cache_line,
    error::Result,
    header::{EncodeHeaderInfo, QTable},
    parser::marker,
    tables::{self, ZIGZAG},
};

/// Returns the IJG scaling factor (in percent) for a quality setting of 1-100.
pub fn quality_scale(quality: u8) -> u32 {
    let quality = u32::from(quality.clamp(1, 100));
    if quality < 50 {
        5000 / quality
    } else {
        200 - quality * 2
    }
}

/// Scales a base quantization table to `quality`, clamping each coefficient to `1..=255`.
pub fn scale_qtable(base: &[u8; 64], quality: u8) -> QTable {
    let scale = quality_scale(quality);
    QTable {
        values: base.map(|b| ((u32::from(b) * scale + 50) / 100).clamp(1, 255)),
    }
}

/// Writes the complete header (SOI up to and including SOS) into `info.header`.
///
/// Returns the header length, which is always a multiple of `cache_line`.
pub fn emit_header(info: &mut EncodeHeaderInfo, cache_line: usize) -> Result<usize> {
    check_cache_line(cache_line)?;

    info.qtables = [
        scale_qtable(&tables::BASE_LUMA_QTABLE, info.quality),
        scale_qtable(&tables::BASE_CHROMA_QTABLE, info.quality),
    ];

    let mut header = mem::take(&mut info.header);
    header.clear();
    let mut w = Writer { out: &mut header };

    w.marker(marker::SOI);
    emit_app0(&mut w);

    let num_qtables = if info.num_components == 1 { 1 } else { 2 };
    for (id, table) in info.qtables[..num_qtables].iter().enumerate() {
        emit_dqt(&mut w, id as u8, table);
    }

    emit_sof(&mut w, info);

    emit_dht(&mut w, 0x00, &tables::LUMA_DC_BITS, &tables::LUMA_DC_VALUES);
    emit_dht(&mut w, 0x10, &tables::LUMA_AC_BITS, &tables::LUMA_AC_VALUES);
    if info.num_components == 3 {
        emit_dht(&mut w, 0x01, &tables::CHROMA_DC_BITS, &tables::CHROMA_DC_VALUES);
        emit_dht(&mut w, 0x11, &tables::CHROMA_AC_BITS, &tables::CHROMA_AC_VALUES);
    }

    emit_com_padding(&mut w, info.num_components, cache_line);
    emit_sos(&mut w, info.num_components);

    let len = header.len();
    info.header = header;
    debug_assert_eq!(len % cache_line, 0);
    log::trace!(
        "emitted {len} byte header for {}x{} {:?}, quality {}",
        info.origin_width,
        info.origin_height,
        info.sampling,
        info.quality,
    );
    Ok(len)
}

struct Writer<'a> {
    out: &'a mut Vec<u8>,
}

impl Writer<'_> {
    fn u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.out.extend_from_slice(v);
    }

    fn marker(&mut self, m: u8) {
        self.bytes(&[0xFF, m]);
    }

    /// Starts a segment whose payload (excluding the length field) is `payload_len` bytes.
    fn segment(&mut self, m: u8, payload_len: usize) {
        self.marker(m);
        self.u16((payload_len + 2) as u16);
    }
}

fn emit_app0(w: &mut Writer<'_>) {
    w.segment(marker::APP0, 14);
    w.bytes(b"JFIF\0");
    w.bytes(&[1, 1]); // version 1.1
    w.u8(0); // no density unit
    w.u16(1);
    w.u16(1);
    w.bytes(&[0, 0]); // no thumbnail
}

fn emit_dqt(w: &mut Writer<'_>, id: u8, table: &QTable) {
    w.segment(marker::DQT, 1 + 64);
    w.u8(id); // 8-bit precision
    for &pos in &ZIGZAG {
        w.u8(table.values[usize::from(pos)] as u8);
    }
}

fn emit_sof(w: &mut Writer<'_>, info: &EncodeHeaderInfo) {
    let factors = info.sampling.factors();
    w.segment(marker::SOF0, 6 + 3 * factors.len());
    w.u8(8);
    w.u16(info.origin_height);
    w.u16(info.origin_width);
    w.u8(factors.len() as u8);
    for (i, &(h, v)) in factors.iter().enumerate() {
        w.u8(i as u8 + 1);
        w.u8(h << 4 | v);
        w.u8(if i == 0 { 0 } else { 1 });
    }
}

fn emit_dht(w: &mut Writer<'_>, class_id: u8, bits: &[u8; 16], values: &[u8]) {
    w.segment(marker::DHT, 1 + 16 + values.len());
    w.u8(class_id);
    w.bytes(bits);
    w.bytes(values);
}

fn sos_len(num_components: u8) -> usize {
    2 + 2 + 1 + 2 * usize::from(num_components) + 3
}

fn emit_com_padding(w: &mut Writer<'_>, num_components: u8, cache_line: usize) {
    let unpadded = w.out.len() + 4 + sos_len(num_components);
    let pad = (cache_line - unpadded % cache_line) % cache_line;
    w.segment(marker::COM, pad);
    w.out.resize(w.out.len() + pad, 0);
}

fn emit_sos(w: &mut Writer<'_>, num_components: u8) {
    w.segment(marker::SOS, sos_len(num_components) - 4);
    w.u8(num_components);
    for i in 0..num_components {
        w.u8(i + 1);
        w.u8(if i == 0 { 0x00 } else { 0x11 });
    }
    w.bytes(&[0, 63, 0]);
}
