//! Collaborator interfaces the driver is built on top of.
//!
//! The driver never touches registers, DMA channels, caches or interrupt lines directly. Instead,
//! a [`Platform`] bundles implementations of the traits in this module, which lets the same
//! transaction logic run against real hardware or a simulated backend.

use std::{fmt, sync::Arc};

use bitflags::bitflags;

use crate::{
    error::Result,
    format::{CscMode, EncodeSourceFormat},
    header::{QTable, Sampling},
};

bitflags! {
    /// Codec interrupt status bits.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct IntrStatus: u32 {
        const DONE = 1 << 0;
        const RLE_PARALLEL_ERR = 1 << 1;
        const CID_ERR = 1 << 2;
        const C_DHT_DC_ID_ERR = 1 << 3;
        const C_DHT_AC_ID_ERR = 1 << 4;
        const C_DQT_ID_ERR = 1 << 5;
        const RST_UXP_ERR = 1 << 6;
        const RST_CHECK_NONE_ERR = 1 << 7;
        const RST_CHECK_POS_ERR = 1 << 8;
        const OUT_EOF = 1 << 9;
        const SR_COLOR_MODE_ERR = 1 << 10;
        const DCT_DONE = 1 << 11;
        const BS_LAST_BLOCK_EOF = 1 << 12;
        const SCAN_CHECK_NONE_ERR = 1 << 13;
        const SCAN_CHECK_POS_ERR = 1 << 14;
        const UXP_DET = 1 << 15;
        const EN_FRAME_EOF_ERR = 1 << 16;
        const EN_FRAME_EOF_LACK = 1 << 17;
        const DE_FRAME_EOF_ERR = 1 << 18;
        const DE_FRAME_EOF_LACK = 1 << 19;
        const SOS_UNMATCH_ERR = 1 << 20;
        const MARKER_ERR_FST_SCAN = 1 << 21;
        const MARKER_ERR_OTHER_SCAN = 1 << 22;
        const UNDET = 1 << 23;
        const DECODE_TIMEOUT = 1 << 24;
    }
}

impl IntrStatus {
    /// Error bits the decoder listens for.
    pub const DECODE_ERRORS: Self = Self::CID_ERR
        .union(Self::C_DHT_DC_ID_ERR)
        .union(Self::C_DHT_AC_ID_ERR)
        .union(Self::C_DQT_ID_ERR)
        .union(Self::RST_UXP_ERR)
        .union(Self::RST_CHECK_NONE_ERR)
        .union(Self::RST_CHECK_POS_ERR)
        .union(Self::SCAN_CHECK_NONE_ERR)
        .union(Self::SCAN_CHECK_POS_ERR)
        .union(Self::UXP_DET)
        .union(Self::DE_FRAME_EOF_ERR)
        .union(Self::DE_FRAME_EOF_LACK)
        .union(Self::SOS_UNMATCH_ERR)
        .union(Self::MARKER_ERR_FST_SCAN)
        .union(Self::MARKER_ERR_OTHER_SCAN)
        .union(Self::UNDET)
        .union(Self::DECODE_TIMEOUT);

    /// Error bits the encoder listens for.
    pub const ENCODE_ERRORS: Self = Self::RLE_PARALLEL_ERR
        .union(Self::SR_COLOR_MODE_ERR)
        .union(Self::EN_FRAME_EOF_ERR)
        .union(Self::EN_FRAME_EOF_LACK);

    /// Returns a diagnostic message for every error bit set in `self`.
    pub fn diagnostics(self) -> impl Iterator<Item = &'static str> {
        DIAGNOSTICS
            .iter()
            .filter(move |(flag, _)| self.contains(*flag))
            .map(|(_, msg)| *msg)
    }
}

const DIAGNOSTICS: &[(IntrStatus, &str)] = &[
    (IntrStatus::RLE_PARALLEL_ERR, "run-length encoder parallel processing error"),
    (IntrStatus::CID_ERR, "scan component id does not match any frame component"),
    (IntrStatus::C_DHT_DC_ID_ERR, "scan references a DC Huffman table that was not configured"),
    (IntrStatus::C_DHT_AC_ID_ERR, "scan references an AC Huffman table that was not configured"),
    (IntrStatus::C_DQT_ID_ERR, "frame references a quantization table that was not configured"),
    (IntrStatus::RST_UXP_ERR, "RST marker found although restart interval is 0"),
    (IntrStatus::RST_CHECK_NONE_ERR, "expected RST marker not found"),
    (IntrStatus::RST_CHECK_POS_ERR, "RST marker found at the wrong position"),
    (IntrStatus::SR_COLOR_MODE_ERR, "source color mode does not match sampling mode"),
    (IntrStatus::SCAN_CHECK_NONE_ERR, "SOS marker of next scan not found"),
    (IntrStatus::SCAN_CHECK_POS_ERR, "scan header found at the wrong position"),
    (IntrStatus::UXP_DET, "unsupported marker detected"),
    (IntrStatus::EN_FRAME_EOF_ERR, "encoder received more pixels than the frame size"),
    (IntrStatus::EN_FRAME_EOF_LACK, "encoder received fewer pixels than the frame size"),
    (IntrStatus::DE_FRAME_EOF_ERR, "decoded block count exceeds the frame size"),
    (IntrStatus::DE_FRAME_EOF_LACK, "decoded block count is less than the frame size"),
    (IntrStatus::SOS_UNMATCH_ERR, "SOS component count or length does not match"),
    (IntrStatus::MARKER_ERR_FST_SCAN, "marker error in first scan"),
    (IntrStatus::MARKER_ERR_OTHER_SCAN, "marker error in a subsequent scan"),
    (IntrStatus::UNDET, "bitstream ended without an SOS marker"),
    (IntrStatus::DECODE_TIMEOUT, "decoder timed out"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecMode {
    Decode,
    Encode,
}

/// Per-component frame parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentInfo {
    pub id: u8,
    pub h: u8,
    pub v: u8,
    /// Quantization table slot used by this component.
    pub qtable: u8,
}

/// Register level access to the JPEG codec.
///
/// Every operation is assumed to be atomic at the register level.
pub trait JpegHal: Send + Sync {
    fn soft_reset(&self);
    fn set_codec_mode(&self, mode: CodecMode);
    fn set_picture_size(&self, width: u32, height: u32);
    fn set_frame_info(&self, components: &[ComponentInfo]);
    fn write_qtable(&self, slot: u8, table: &QTable);
    /// Pushes a Huffman table into the table FIFO. `class` is 0 for DC and 1 for AC.
    fn write_huffman_table(
        &self,
        class: u8,
        id: u8,
        bits: &[u8; 16],
        values: &[u8],
        min_codes: &[u32; 16],
    );
    /// `None` disables restart markers.
    fn set_restart_interval(&self, interval: Option<u16>);
    fn set_sample_mode(&self, sampling: Sampling);
    fn set_source_format(&self, format: EncodeSourceFormat);
    fn enable_interrupts(&self, mask: IntrStatus);
    fn interrupt_status(&self) -> IntrStatus;
    fn clear_interrupts(&self, mask: IntrStatus);
    /// Kicks off processing once both DMA channels are running.
    fn start(&self);

    fn enable_bus_clock(&self, enable: bool);
    fn reset_module(&self);
    /// Registers the codec's register file with sleep retention.
    fn register_retention(&self) -> Result<()>;
}

/// Peripheral a DMA channel is triggered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaTrigger {
    JpegTx,
    JpegRx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferAbility {
    pub desc_burst: bool,
    /// Maximum data burst length in bytes.
    pub data_burst: u32,
}

pub type EofCallback = Box<dyn FnMut() + Send>;

/// One channel of a 2D DMA transaction, handed out while the transaction is being started.
pub trait DmaChannel {
    fn connect(&mut self, trigger: DmaTrigger);
    fn set_transfer_ability(&mut self, ability: TransferAbility);
    fn configure_csc(&mut self, mode: CscMode);
    fn register_eof_callback(&mut self, callback: EofCallback);
    /// Starts the channel on the descriptor at `desc`.
    fn start(&mut self, desc: usize);
}

/// Both channels of a picked transaction.
pub struct DmaChannels<'a> {
    pub tx: &'a mut dyn DmaChannel,
    pub rx: &'a mut dyn DmaChannel,
}

/// Called by the transport once the transaction owns its channels.
pub type OnPicked = Box<dyn FnOnce(DmaChannels<'_>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DmaJobId(pub u64);

/// Channel pool of the 2D DMA engine.
pub trait DmaTransport: Send + Sync {
    fn enqueue(&self, on_picked: OnPicked) -> Result<DmaJobId>;
    /// Stops a transaction that has not completed.
    fn force_end(&self, job: DmaJobId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Write back CPU cache contents so the device sees them.
    CpuToDevice,
    /// Drop stale cache lines so the CPU sees what the device wrote.
    DeviceToCpu,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        const INVALIDATE = 1 << 0;
        const UNALIGNED = 1 << 1;
    }
}

pub trait CacheSync: Send + Sync {
    fn sync(&self, addr: usize, len: usize, direction: SyncDirection, flags: SyncFlags)
        -> Result<()>;
}

/// Parameters of a shared interrupt line allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntrAllocation {
    pub source: u32,
    /// 0 lets the controller choose.
    pub priority: u8,
    pub mask: IntrStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntrHandle(pub u32);

pub type Isr = Arc<dyn Fn() + Send + Sync>;

pub trait InterruptController: Send + Sync {
    fn allocate(&self, alloc: IntrAllocation, isr: Isr) -> Result<IntrHandle>;
    fn free(&self, handle: IntrHandle);
}

/// Keeps the system out of low power states while held.
pub trait PowerLock: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Everything the driver needs from the surrounding system.
#[derive(Clone)]
pub struct Platform {
    pub hal: Arc<dyn JpegHal>,
    pub dma: Arc<dyn DmaTransport>,
    pub cache: Arc<dyn CacheSync>,
    pub intr: Arc<dyn InterruptController>,
    pub power: Option<Arc<dyn PowerLock>>,
    pub cache_line_size: usize,
    pub intr_source: u32,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("power", &self.power.is_some())
            .field("cache_line_size", &self.cache_line_size)
            .field("intr_source", &self.intr_source)
            .finish_non_exhaustive()
    }
}
