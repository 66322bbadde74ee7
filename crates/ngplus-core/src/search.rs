//! Background scans that must not stall the monitor tick.
//!
//! At most one scan runs at a time. Its result is tagged with the attachment
//! generation it was started under, and a result from an older attachment is
//! dropped instead of being reported. Each scan gets its own cancel signal so
//! a detach can end it without stopping anything else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::error::Result;
use crate::retry::{RetryOutcome, RetryStrategy, retry_with};
use crate::shutdown::ShutdownSignal;

/// What the rest of the system sees of a background search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchStatus<T> {
    /// Running, or nothing to report.
    Pending,
    Found(T),
    GaveUp(String),
}

type Slot<T> = Arc<Mutex<Option<(u64, SearchStatus<T>)>>>;

pub struct AuxiliaryScan<T> {
    busy: Arc<AtomicBool>,
    result: Slot<T>,
    cancel: Arc<ShutdownSignal>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> AuxiliaryScan<T> {
    pub fn new() -> Self {
        Self {
            busy: Arc::new(AtomicBool::new(false)),
            result: Arc::new(Mutex::new(None)),
            cancel: Arc::new(ShutdownSignal::new()),
            handle: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Start `op` under `strategy` on the auxiliary thread.
    ///
    /// Returns `false` without doing anything if a scan is already running.
    pub fn spawn<F>(
        &mut self,
        name: &str,
        generation: u64,
        strategy: Arc<dyn RetryStrategy>,
        mut op: F,
    ) -> bool
    where
        F: FnMut(u32) -> Result<T> + Send + 'static,
    {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.reap();

        let busy = Arc::clone(&self.busy);
        let slot = Arc::clone(&self.result);
        self.cancel = Arc::new(ShutdownSignal::new());
        let cancel = Arc::clone(&self.cancel);
        let label = name.to_string();

        let spawned = thread::Builder::new()
            .name(format!("scan-{}", name))
            .spawn(move || {
                let status = match retry_with(strategy.as_ref(), &cancel, |attempt| {
                    debug!("{}: scan attempt {}", label, attempt);
                    op(attempt)
                }) {
                    RetryOutcome::Succeeded(value) => SearchStatus::Found(value),
                    RetryOutcome::Exhausted(e) => SearchStatus::GaveUp(e.to_string()),
                    RetryOutcome::Cancelled => SearchStatus::GaveUp("cancelled".to_string()),
                };
                if let Ok(mut slot) = slot.lock() {
                    *slot = Some((generation, status));
                }
                busy.store(false, Ordering::SeqCst);
            });

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                true
            }
            Err(e) => {
                warn!("Failed to start {} scan thread: {}", name, e);
                self.busy.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Status for the attachment `generation`. A finished result is handed
    /// out once.
    pub fn poll(&mut self, generation: u64) -> SearchStatus<T> {
        if self.is_busy() {
            return SearchStatus::Pending;
        }

        let finished = self.result.lock().ok().and_then(|mut slot| slot.take());
        self.reap();

        match finished {
            Some((scanned, status)) if scanned == generation => status,
            Some((scanned, _)) => {
                debug!(
                    "Dropping scan result from attachment {} (now {})",
                    scanned, generation
                );
                SearchStatus::Pending
            }
            None => SearchStatus::Pending,
        }
    }

    /// Ask the running scan to stop at its next retry pause. The scan
    /// reports `GaveUp("cancelled")`.
    pub fn cancel(&self) {
        if self.is_busy() {
            debug!("Cancelling background scan");
        }
        self.cancel.trigger();
    }

    /// Wait for a running scan to end.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Scan thread panicked");
            self.busy.store(false, Ordering::SeqCst);
        }
    }

    fn reap(&mut self) {
        if self.handle.as_ref().is_some_and(|h| h.is_finished()) {
            self.join();
        }
    }
}

impl<T: Send + 'static> Default for AuxiliaryScan<T> {
    fn default() -> Self {
        Self::new()
    }
}
