//! Shared interrupt line of the codec.
//!
//! Decoders and encoders sharing one codec each register a handler for the status bits they care
//! about. The line itself is allocated on the first registration and freed once the last handler
//! is gone.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use crate::{
    error::{Error, Result},
    hal::{InterruptController, IntrAllocation, IntrHandle, IntrStatus, JpegHal},
    lock,
};

/// Interrupt handler; receives the live status masked to the bits it registered for.
pub type Handler = Arc<dyn Fn(IntrStatus) + Send + Sync>;

/// Identifies a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(u64);

struct Entry {
    token: HandlerToken,
    mask: IntrStatus,
    handler: Handler,
}

/// State visible to the ISR.
struct DispatchTable {
    hal: Arc<dyn JpegHal>,
    entries: Mutex<Vec<Entry>>,
}

impl DispatchTable {
    fn isr(&self) {
        let status = self.hal.interrupt_status();
        // Handlers run with the table locked and must not register or deregister.
        for entry in lock(&self.entries).iter() {
            if entry.mask.intersects(status) {
                (entry.handler)(status & entry.mask);
            }
        }
        self.hal.clear_interrupts(status);
    }
}

struct Line {
    handle: Option<IntrHandle>,
    /// 0 until some user requests a specific priority.
    priority: u8,
    next_token: u64,
}

pub struct InterruptDispatch {
    table: Arc<DispatchTable>,
    line: Mutex<Line>,
    controller: Arc<dyn InterruptController>,
    source: u32,
}

impl InterruptDispatch {
    pub(crate) fn new(
        hal: Arc<dyn JpegHal>,
        controller: Arc<dyn InterruptController>,
        source: u32,
    ) -> Self {
        Self {
            table: Arc::new(DispatchTable {
                hal,
                entries: Default::default(),
            }),
            line: Mutex::new(Line {
                handle: None,
                priority: 0,
                next_token: 0,
            }),
            controller,
            source,
        }
    }

    /// Fixes the line priority on the first nonzero request.
    ///
    /// Fails with [`ErrorKind::InvalidState`][crate::ErrorKind::InvalidState] if a different
    /// nonzero priority was already requested.
    pub fn check_priority(&self, priority: u8) -> Result<()> {
        let mut line = lock(&self.line);
        if priority == 0 {
            return Ok(());
        }
        match line.priority {
            0 => {
                line.priority = priority;
                Ok(())
            }
            p if p == priority => Ok(()),
            p => Err(Error::invalid_state(format!(
                "interrupt priority {priority} conflicts with the already configured priority {p}"
            ))),
        }
    }

    /// Adds `handler` to the end of the dispatch list.
    pub fn register(&self, mask: IntrStatus, handler: Handler) -> Result<HandlerToken> {
        let mut line = lock(&self.line);
        let token = HandlerToken(line.next_token);
        line.next_token += 1;

        lock(&self.table.entries).push(Entry {
            token,
            mask,
            handler,
        });

        if line.handle.is_none() {
            let table = self.table.clone();
            let alloc = IntrAllocation {
                source: self.source,
                priority: line.priority,
                mask: IntrStatus::all(),
            };
            match self.controller.allocate(alloc, Arc::new(move || table.isr())) {
                Ok(handle) => {
                    log::debug!("allocated interrupt {handle:?} for source {}", self.source);
                    line.handle = Some(handle);
                }
                Err(err) => {
                    lock(&self.table.entries).retain(|e| e.token != token);
                    return Err(err);
                }
            }
        }

        Ok(token)
    }

    pub fn deregister(&self, token: HandlerToken) -> Result<()> {
        let mut line = lock(&self.line);
        let mut entries = lock(&self.table.entries);
        let pos = entries
            .iter()
            .position(|e| e.token == token)
            .ok_or_else(|| Error::invalid_state(format!("{token:?} is not registered")))?;
        entries.remove(pos);

        if entries.is_empty() {
            drop(entries);
            if let Some(handle) = line.handle.take() {
                self.controller.free(handle);
                log::debug!("freed interrupt {handle:?}");
            }
            line.priority = 0;
        }
        Ok(())
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        lock(&self.table.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for InterruptDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let line = lock(&self.line);
        f.debug_struct("InterruptDispatch")
            .field("source", &self.source)
            .field("handle", &line.handle)
            .field("priority", &line.priority)
            .field("handlers", &lock(&self.table.entries).len())
            .finish()
    }
}
