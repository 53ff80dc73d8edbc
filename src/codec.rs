//! Reference counted ownership of the codec hardware.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, OnceLock},
};

use crate::{dma::check_cache_line, error::Result, hal::Platform, intr::InterruptDispatch, lock};

/// Holds the shared state of one codec instance while at least one [`Codec`] handle exists.
///
/// Every decoder and encoder acquires a handle from the slot of the codec it runs on. The first
/// acquisition powers up the hardware and the last release powers it down again.
pub struct CodecSlot {
    state: Mutex<SlotState>,
}

struct SlotState {
    ctx: Option<Arc<CodecContext>>,
    refs: usize,
}

impl CodecSlot {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                ctx: None,
                refs: 0,
            }),
        }
    }

    /// The process-wide slot of the on-chip codec.
    pub fn global() -> &'static Arc<CodecSlot> {
        static GLOBAL: OnceLock<Arc<CodecSlot>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(CodecSlot::new()))
    }

    /// Acquires a handle to the codec, bringing it up if this is the first one.
    ///
    /// `platform` is only used when the codec is not yet allocated; later acquisitions share the
    /// platform of the first.
    pub fn acquire(self: &Arc<Self>, platform: &Platform) -> Result<Codec> {
        let mut state = lock(&self.state);
        let ctx = match &state.ctx {
            Some(ctx) => ctx.clone(),
            None => {
                check_cache_line(platform.cache_line_size)?;
                let ctx = Arc::new(CodecContext::new(platform.clone()));
                state.ctx = Some(ctx.clone());
                ctx
            }
        };
        state.refs += 1;
        log::trace!("codec acquired, {} references", state.refs);
        Ok(Codec {
            slot: self.clone(),
            ctx,
        })
    }

    fn release(&self) {
        let mut state = lock(&self.state);
        state.refs -= 1;
        log::trace!("codec released, {} references", state.refs);
        if state.refs == 0 {
            if let Some(ctx) = state.ctx.take() {
                ctx.shutdown();
            }
        }
    }

    pub fn ref_count(&self) -> usize {
        lock(&self.state).refs
    }

    /// Whether the codec context currently exists.
    pub fn is_allocated(&self) -> bool {
        lock(&self.state).ctx.is_some()
    }
}

impl Default for CodecSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CodecSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("CodecSlot")
            .field("refs", &state.refs)
            .field("allocated", &state.ctx.is_some())
            .finish()
    }
}

/// A counted reference to an allocated codec. Dropping it releases the reference.
pub struct Codec {
    slot: Arc<CodecSlot>,
    ctx: Arc<CodecContext>,
}

impl Codec {
    /// Releases this reference. Same as dropping the handle.
    pub fn release(self) {}

    pub(crate) fn context(&self) -> &CodecContext {
        &self.ctx
    }

    pub fn dispatch(&self) -> &InterruptDispatch {
        &self.ctx.dispatch
    }
}

impl Drop for Codec {
    fn drop(&mut self) {
        self.slot.release();
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("platform", &self.ctx.platform)
            .finish_non_exhaustive()
    }
}

pub(crate) struct CodecContext {
    pub(crate) platform: Platform,
    /// Serializes transactions on the hardware.
    codec_mutex: Mutex<()>,
    pub(crate) dispatch: InterruptDispatch,
}

impl CodecContext {
    fn new(platform: Platform) -> Self {
        let hal = &platform.hal;
        hal.enable_bus_clock(true);
        hal.reset_module();
        if let Err(e) = hal.register_retention() {
            log::warn!("failed to register JPEG codec sleep retention, continuing without: {e}");
        }
        log::debug!("codec context created on {platform:?}");

        Self {
            dispatch: InterruptDispatch::new(
                platform.hal.clone(),
                platform.intr.clone(),
                platform.intr_source,
            ),
            codec_mutex: Mutex::new(()),
            platform,
        }
    }

    /// Blocks until no other transaction runs on the codec.
    ///
    /// A poisoned mutex is taken over, since every transaction resets the hardware first.
    pub(crate) fn lock_codec(&self) -> MutexGuard<'_, ()> {
        lock(&self.codec_mutex)
    }

    fn shutdown(&self) {
        self.platform.hal.enable_bus_clock(false);
        log::debug!("codec context destroyed");
    }
}
