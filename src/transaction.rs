//! The per-transaction protocol shared by the decoder and the encoder.
//!
//! A transaction owns the codec mutex from [`Transaction::begin`] until it is dropped. The
//! interrupt handler and the DMA end-of-frame callback each post a [`TransactionEvent`] into a
//! bounded queue which the caller blocks on.

use std::{
    fmt,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender},
        Arc, MutexGuard,
    },
    time::{Duration, Instant},
};

use crate::{
    codec::CodecContext,
    error::{Error, ErrorKind, Result},
    format::CscMode,
    hal::{
        DmaChannels, DmaJobId, DmaTrigger, IntrStatus, JpegHal, OnPicked, TransferAbility,
    },
};

/// Capacity of the event queue: one hardware status event plus one DMA completion.
pub const EVENT_QUEUE_DEPTH: usize = 2;

const TRANSFER_ABILITY: TransferAbility = TransferAbility {
    desc_burst: true,
    data_burst: 128,
};

/// Something that happened while a transaction was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionEvent {
    /// Hardware error bits. Nonzero ends the transaction with an error.
    pub status: IntrStatus,
    /// The receive channel reached end of frame.
    pub dma_eof: bool,
}

impl TransactionEvent {
    pub fn status(status: IntrStatus) -> Self {
        Self {
            status,
            dma_eof: false,
        }
    }

    pub fn dma_eof() -> Self {
        Self {
            status: IntrStatus::empty(),
            dma_eof: true,
        }
    }
}

/// Posts an event without blocking; used from interrupt context.
///
/// A full queue already holds an event the waiter has not seen, so the new one is dropped.
pub(crate) fn post(tx: &SyncSender<TransactionEvent>, event: TransactionEvent) {
    let _ = tx.try_send(event);
}

pub(crate) struct EventQueue {
    tx: SyncSender<TransactionEvent>,
    rx: Receiver<TransactionEvent>,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
        Self { tx, rx }
    }

    pub(crate) fn sender(&self) -> SyncSender<TransactionEvent> {
        self.tx.clone()
    }

    /// Drops events left over from an earlier transaction.
    fn purge(&self) {
        let mut stale = 0;
        while self.rx.try_recv().is_ok() {
            stale += 1;
        }
        if stale != 0 {
            log::debug!("purged {stale} stale events");
        }
    }

    /// `None` waits forever.
    fn recv(&self, deadline: Option<Instant>) -> Result<TransactionEvent> {
        let res = match deadline {
            None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(deadline) => self
                .rx
                .recv_timeout(deadline.saturating_duration_since(Instant::now())),
        };
        res.map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::timeout("codec did not finish in time"),
            RecvTimeoutError::Disconnected => Error::invalid_state("event queue disconnected"),
        })
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Idle,
    HeaderReady,
    DescriptorsReady,
    DmaEnqueued,
    WaitingForCompletion,
    Done,
    HardwareError,
    Timeout,
}

/// Everything the DMA job needs once it gets its channels.
pub(crate) struct ChannelSetup {
    pub(crate) hal: Arc<dyn JpegHal>,
    pub(crate) tx_desc: usize,
    pub(crate) rx_desc: usize,
    pub(crate) csc: Option<CscMode>,
    pub(crate) events: SyncSender<TransactionEvent>,
}

impl ChannelSetup {
    fn into_on_picked(self) -> OnPicked {
        Box::new(move |DmaChannels { tx, rx }: DmaChannels<'_>| {
            tx.connect(DmaTrigger::JpegTx);
            rx.connect(DmaTrigger::JpegRx);
            tx.set_transfer_ability(TRANSFER_ABILITY);
            rx.set_transfer_ability(TRANSFER_ABILITY);
            if let Some(csc) = self.csc {
                rx.configure_csc(csc);
            }
            let events = self.events;
            rx.register_eof_callback(Box::new(move || {
                post(&events, TransactionEvent::dma_eof())
            }));
            tx.start(self.tx_desc);
            rx.start(self.rx_desc);
            self.hal.start();
        })
    }
}

/// Exclusive use of the codec for the duration of one decode or encode.
///
/// Dropping the transaction stops an unfinished DMA job, then releases the power lock and the
/// codec mutex, in that order.
pub(crate) struct Transaction<'a> {
    ctx: &'a CodecContext,
    state: State,
    job: Option<DmaJobId>,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> Transaction<'a> {
    /// Waits for the codec, then resets it and clears the event queue.
    pub(crate) fn begin(ctx: &'a CodecContext, events: &EventQueue) -> Self {
        let guard = ctx.lock_codec();
        if let Some(power) = &ctx.platform.power {
            power.acquire();
        }
        events.purge();
        ctx.platform.hal.soft_reset();
        Self {
            ctx,
            state: State::Idle,
            job: None,
            _guard: guard,
        }
    }

    pub(crate) fn hal(&self) -> &dyn JpegHal {
        &*self.ctx.platform.hal
    }

    pub(crate) fn advance(&mut self, next: State) {
        debug_assert!(next > self.state, "{:?} -> {:?}", self.state, next);
        log::trace!("transaction {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub(crate) fn enqueue(&mut self, setup: ChannelSetup) -> Result<()> {
        let job = self.ctx.platform.dma.enqueue(setup.into_on_picked())?;
        self.job = Some(job);
        self.advance(State::DmaEnqueued);
        Ok(())
    }

    /// Blocks until the receive channel finishes or the hardware reports one of `errors`.
    pub(crate) fn wait(
        &mut self,
        events: &EventQueue,
        timeout: Option<Duration>,
        errors: IntrStatus,
    ) -> Result<()> {
        self.advance(State::WaitingForCompletion);
        // A deadline past the end of `Instant` waits forever.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            let event = match events.recv(deadline) {
                Ok(event) => event,
                Err(e) => {
                    self.state = match e.kind() {
                        ErrorKind::Timeout => State::Timeout,
                        _ => State::HardwareError,
                    };
                    log::error!("JPEG transaction failed: {e}");
                    self.abort();
                    return Err(e);
                }
            };

            let status = event.status & errors;
            if !status.is_empty() {
                self.state = State::HardwareError;
                for msg in status.diagnostics() {
                    log::error!("JPEG codec error: {msg}");
                }
                self.abort();
                return Err(Error::invalid_state(format!(
                    "codec reported error status {:#x}",
                    status.bits()
                )));
            }

            if event.dma_eof {
                self.job = None;
                self.advance(State::Done);
                return Ok(());
            }
        }
    }

    fn abort(&mut self) {
        if let Some(job) = self.job.take() {
            log::debug!("force-ending DMA job {job:?}");
            self.ctx.platform.dma.force_end(job);
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.abort();
        if let Some(power) = &self.ctx.platform.power {
            power.release();
        }
        log::debug!("transaction finished in state {:?}", self.state);
    }
}
