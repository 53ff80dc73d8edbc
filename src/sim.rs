//! A simulated platform that records what the driver does to it.
//!
//! The DMA transport runs every job to completion synchronously inside `enqueue`, unless told
//! to report a hardware error or to never finish.

use std::{
    collections::VecDeque,
    mem, ptr,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use crate::{
    dma::{BlockMode, DmaBuffer, DmaDescriptor},
    error::{Error, Result},
    format::{CscMode, EncodeSourceFormat},
    hal::{
        CacheSync, CodecMode, ComponentInfo, DmaChannel, DmaChannels, DmaJobId, DmaTransport,
        DmaTrigger, EofCallback, InterruptController, IntrAllocation, IntrHandle, IntrStatus,
        Isr, JpegHal, OnPicked, Platform, PowerLock, SyncDirection, SyncFlags, TransferAbility,
    },
    header::{QTable, Sampling},
};

pub(crate) const CACHE_LINE: usize = 64;
const INTR_SOURCE: u32 = 42;

pub(crate) struct Sim {
    pub(crate) hal: Arc<SimHal>,
    pub(crate) dma: Arc<SimDma>,
    pub(crate) cache: Arc<SimCache>,
    pub(crate) intr: Arc<SimIntr>,
    pub(crate) power: Arc<SimPower>,
}

impl Sim {
    pub(crate) fn new() -> Self {
        let hal = Arc::new(SimHal::new());
        let intr = Arc::new(SimIntr::default());
        Self {
            dma: Arc::new(SimDma::new(hal.clone(), intr.clone())),
            hal,
            cache: Arc::default(),
            intr,
            power: Arc::default(),
        }
    }

    pub(crate) fn platform(&self) -> Platform {
        Platform {
            hal: self.hal.clone(),
            dma: self.dma.clone(),
            cache: self.cache.clone(),
            intr: self.intr.clone(),
            power: Some(self.power.clone()),
            cache_line_size: CACHE_LINE,
            intr_source: INTR_SOURCE,
        }
    }

    /// An output buffer the driver accepts.
    pub(crate) fn buffer(size: usize) -> DmaBuffer {
        DmaBuffer::alloc(size, CACHE_LINE).unwrap()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RegWrite {
    SoftReset,
    CodecMode(CodecMode),
    PictureSize(u32, u32),
    FrameInfo(Vec<ComponentInfo>),
    QTable(u8, QTable),
    Huffman { class: u8, id: u8, values: usize },
    RestartInterval(Option<u16>),
    SampleMode(Sampling),
    SourceFormat(EncodeSourceFormat),
    EnableInterrupts(IntrStatus),
    ClearInterrupts(IntrStatus),
    Start,
    BusClock(bool),
    ResetModule,
}

pub(crate) struct SimHal {
    writes: Mutex<Vec<RegWrite>>,
    pending: Mutex<IntrStatus>,
    retention_fails: AtomicBool,
}

impl SimHal {
    fn new() -> Self {
        Self {
            writes: Mutex::default(),
            pending: Mutex::new(IntrStatus::empty()),
            retention_fails: AtomicBool::new(false),
        }
    }

    fn record(&self, write: RegWrite) {
        self.writes.lock().unwrap().push(write);
    }

    pub(crate) fn take_writes(&self) -> Vec<RegWrite> {
        mem::take(&mut *self.writes.lock().unwrap())
    }

    /// Latches status bits as if the hardware raised them.
    pub(crate) fn raise(&self, status: IntrStatus) {
        *self.pending.lock().unwrap() |= status;
    }

    pub(crate) fn pending(&self) -> IntrStatus {
        *self.pending.lock().unwrap()
    }

    pub(crate) fn fail_retention(&self) {
        self.retention_fails.store(true, Ordering::Relaxed);
    }
}

impl JpegHal for SimHal {
    fn soft_reset(&self) {
        self.record(RegWrite::SoftReset);
    }

    fn set_codec_mode(&self, mode: CodecMode) {
        self.record(RegWrite::CodecMode(mode));
    }

    fn set_picture_size(&self, width: u32, height: u32) {
        self.record(RegWrite::PictureSize(width, height));
    }

    fn set_frame_info(&self, components: &[ComponentInfo]) {
        self.record(RegWrite::FrameInfo(components.to_vec()));
    }

    fn write_qtable(&self, slot: u8, table: &QTable) {
        self.record(RegWrite::QTable(slot, *table));
    }

    fn write_huffman_table(
        &self,
        class: u8,
        id: u8,
        bits: &[u8; 16],
        values: &[u8],
        _min_codes: &[u32; 16],
    ) {
        assert_eq!(
            bits.iter().map(|&n| usize::from(n)).sum::<usize>(),
            values.len()
        );
        self.record(RegWrite::Huffman {
            class,
            id,
            values: values.len(),
        });
    }

    fn set_restart_interval(&self, interval: Option<u16>) {
        self.record(RegWrite::RestartInterval(interval));
    }

    fn set_sample_mode(&self, sampling: Sampling) {
        self.record(RegWrite::SampleMode(sampling));
    }

    fn set_source_format(&self, format: EncodeSourceFormat) {
        self.record(RegWrite::SourceFormat(format));
    }

    fn enable_interrupts(&self, mask: IntrStatus) {
        self.record(RegWrite::EnableInterrupts(mask));
    }

    fn interrupt_status(&self) -> IntrStatus {
        self.pending()
    }

    fn clear_interrupts(&self, mask: IntrStatus) {
        self.pending.lock().unwrap().remove(mask);
        self.record(RegWrite::ClearInterrupts(mask));
    }

    fn start(&self) {
        self.record(RegWrite::Start);
    }

    fn enable_bus_clock(&self, enable: bool) {
        self.record(RegWrite::BusClock(enable));
    }

    fn reset_module(&self) {
        self.record(RegWrite::ResetModule);
    }

    fn register_retention(&self) -> Result<()> {
        if self.retention_fails.load(Ordering::Relaxed) {
            Err(Error::no_memory("no retention memory left"))
        } else {
            Ok(())
        }
    }
}

/// How the simulated DMA finishes the next job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    /// Write the payload (1D receive side) and signal end of frame.
    Finish,
    /// Raise codec status bits instead of finishing.
    Error(IntrStatus),
    /// Never finish.
    Hang,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ChannelRecord {
    pub(crate) trigger: Option<DmaTrigger>,
    pub(crate) ability: Option<TransferAbility>,
    pub(crate) csc: Option<CscMode>,
    pub(crate) desc: Option<usize>,
}

#[derive(Debug, Clone)]
pub(crate) struct JobRecord {
    pub(crate) id: DmaJobId,
    pub(crate) tx: ChannelRecord,
    pub(crate) rx: ChannelRecord,
    /// Descriptors as the engine saw them when the channels started.
    pub(crate) tx_desc: DmaDescriptor,
    pub(crate) rx_desc: DmaDescriptor,
}

#[derive(Default)]
struct SimChannel {
    record: ChannelRecord,
    eof: Option<EofCallback>,
}

impl DmaChannel for SimChannel {
    fn connect(&mut self, trigger: DmaTrigger) {
        self.record.trigger = Some(trigger);
    }

    fn set_transfer_ability(&mut self, ability: TransferAbility) {
        self.record.ability = Some(ability);
    }

    fn configure_csc(&mut self, mode: CscMode) {
        self.record.csc = Some(mode);
    }

    fn register_eof_callback(&mut self, callback: EofCallback) {
        self.eof = Some(callback);
    }

    fn start(&mut self, desc: usize) {
        self.record.desc = Some(desc);
    }
}

pub(crate) struct SimDma {
    hal: Arc<SimHal>,
    intr: Arc<SimIntr>,
    plan: Mutex<VecDeque<Completion>>,
    payload: Mutex<Vec<u8>>,
    jobs: Mutex<Vec<JobRecord>>,
    forced: Mutex<Vec<DmaJobId>>,
    next_id: AtomicU64,
}

impl SimDma {
    fn new(hal: Arc<SimHal>, intr: Arc<SimIntr>) -> Self {
        Self {
            hal,
            intr,
            plan: Mutex::default(),
            payload: Mutex::new(vec![0x12, 0x34, 0x56, 0x78, 0xFF, 0xD9]),
            jobs: Mutex::default(),
            forced: Mutex::default(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Queues the outcome of an upcoming job. Jobs without a planned outcome finish.
    pub(crate) fn plan(&self, completion: Completion) {
        self.plan.lock().unwrap().push_back(completion);
    }

    /// Bytes the codec "produces" on a 1D receive channel.
    pub(crate) fn set_payload(&self, payload: &[u8]) {
        *self.payload.lock().unwrap() = payload.to_vec();
    }

    pub(crate) fn jobs(&self) -> Vec<JobRecord> {
        self.jobs.lock().unwrap().clone()
    }

    pub(crate) fn forced(&self) -> Vec<DmaJobId> {
        self.forced.lock().unwrap().clone()
    }
}

impl DmaTransport for SimDma {
    fn enqueue(&self, on_picked: OnPicked) -> Result<DmaJobId> {
        let id = DmaJobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut tx = SimChannel::default();
        let mut rx = SimChannel::default();
        on_picked(DmaChannels {
            tx: &mut tx,
            rx: &mut rx,
        });

        let (Some(tx_addr), Some(rx_addr)) = (tx.record.desc, rx.record.desc) else {
            return Err(Error::invalid_state("DMA job did not start both channels"));
        };
        // SAFETY: the driver keeps both descriptors alive until the job ends.
        let tx_desc = unsafe { ptr::read(tx_addr as *const DmaDescriptor) };
        let mut rx_desc = unsafe { ptr::read(rx_addr as *const DmaDescriptor) };

        self.jobs.lock().unwrap().push(JobRecord {
            id,
            tx: tx.record.clone(),
            rx: rx.record.clone(),
            tx_desc,
            rx_desc,
        });

        let completion = self
            .plan
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Completion::Finish);
        match completion {
            Completion::Finish => {
                if rx_desc.block_mode() == BlockMode::Single {
                    let payload = self.payload.lock().unwrap().clone();
                    let n = payload.len().min(rx_desc.transfer_len());
                    // SAFETY: the receive buffer holds `transfer_len()` bytes.
                    unsafe {
                        ptr::copy_nonoverlapping(payload.as_ptr(), rx_desc.buffer() as *mut u8, n);
                    }
                    rx_desc.complete(n);
                    // SAFETY: see above; the descriptor slot is owned by the driver.
                    unsafe { ptr::write(rx_addr as *mut DmaDescriptor, rx_desc) };
                }
                if let Some(mut eof) = rx.eof.take() {
                    eof();
                }
            }
            Completion::Error(status) => {
                self.hal.raise(status);
                self.intr.fire();
            }
            Completion::Hang => {}
        }
        Ok(id)
    }

    fn force_end(&self, job: DmaJobId) {
        self.forced.lock().unwrap().push(job);
    }
}

#[derive(Default)]
pub(crate) struct SimCache {
    syncs: Mutex<Vec<(usize, usize, SyncDirection)>>,
}

impl SimCache {
    pub(crate) fn take(&self) -> Vec<(usize, usize, SyncDirection)> {
        mem::take(&mut *self.syncs.lock().unwrap())
    }
}

impl CacheSync for SimCache {
    fn sync(&self, addr: usize, len: usize, direction: SyncDirection, flags: SyncFlags) -> Result<()> {
        if !flags.contains(SyncFlags::UNALIGNED)
            && (addr % CACHE_LINE != 0 || len % CACHE_LINE != 0)
        {
            return Err(Error::invalid_arg(format!(
                "unaligned cache sync of {len} bytes at {addr:#x}"
            )));
        }
        self.syncs.lock().unwrap().push((addr, len, direction));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct SimIntr {
    line: Mutex<Option<(IntrHandle, IntrAllocation, Isr)>>,
    allocations: AtomicUsize,
    fail_next: AtomicBool,
    next_handle: AtomicU32,
}

impl SimIntr {
    /// Runs the ISR like the interrupt controller would.
    pub(crate) fn fire(&self) {
        let isr = self.line.lock().unwrap().as_ref().map(|(_, _, isr)| isr.clone());
        if let Some(isr) = isr {
            isr();
        }
    }

    pub(crate) fn is_allocated(&self) -> bool {
        self.line.lock().unwrap().is_some()
    }

    pub(crate) fn allocation(&self) -> Option<IntrAllocation> {
        self.line.lock().unwrap().as_ref().map(|(_, alloc, _)| *alloc)
    }

    /// Number of allocations ever made.
    pub(crate) fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    pub(crate) fn fail_next_allocation(&self) {
        self.fail_next.store(true, Ordering::Relaxed);
    }
}

impl InterruptController for SimIntr {
    fn allocate(&self, alloc: IntrAllocation, isr: Isr) -> Result<IntrHandle> {
        if self.fail_next.swap(false, Ordering::Relaxed) {
            return Err(Error::no_memory("no free interrupt"));
        }
        let mut line = self.line.lock().unwrap();
        if line.is_some() {
            return Err(Error::invalid_state("interrupt already allocated"));
        }
        let handle = IntrHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        *line = Some((handle, alloc, isr));
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    fn free(&self, handle: IntrHandle) {
        let mut line = self.line.lock().unwrap();
        assert_eq!(line.as_ref().map(|(h, _, _)| *h), Some(handle));
        *line = None;
    }
}

#[derive(Default)]
pub(crate) struct SimPower {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl SimPower {
    /// `(acquired, released)` counts.
    pub(crate) fn counts(&self) -> (usize, usize) {
        (
            self.acquired.load(Ordering::Relaxed),
            self.released.load(Ordering::Relaxed),
        )
    }
}

impl PowerLock for SimPower {
    fn acquire(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}
