//! The control loop: follows the process, keeps records located, and
//! applies level changes.
//!
//! ```text
//! WaitingForAttach --attach--> Ready --request--> Applying --done--> Ready
//!        ^                       |
//!        +-------detach----------+
//! ```
//!
//! Only the monitor thread touches the process. Other threads talk to it
//! through a [`MonitorHandle`]: two atomics for the levels plus a request
//! channel for diagnostics.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strum::{Display, IntoEnumIterator};
use tracing::{debug, error, info, warn};

use crate::attach::{AttachEvent, ProcessAttachment};
use crate::config::MonitorConfig;
use crate::error::{Error, Result};
use crate::injector::{LocateState, Located, RecordInjector, scan_candidates};
use crate::memory::{CodeSignature, PointerChain, ProcessProvider};
use crate::persist::LevelStore;
use crate::record::{FixedRowCodec, RecordCodec, RecordKind, Row};
use crate::retry::{FixedDelay, NoRetry, RetryStrategy};
use crate::scaling::ScalingEngine;
use crate::search::{AuxiliaryScan, SearchStatus};
use crate::shutdown::ShutdownSignal;

/// Name of the host's own NG+ level pointer.
pub const NG_LEVEL_POINTER: &str = "ng_level";

/// Offset of the NG+ level inside GameDataMan
const NG_LEVEL_OFFSET: i64 = 0x120;

/// How long a console request waits for the monitor thread
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// `mov rax, [GameDataMan]; test rax, rax; je +5; mov rax, [rax+58]; ret`
pub fn ng_level_chain() -> PointerChain {
    PointerChain::new(NG_LEVEL_POINTER)
        .pattern(
            CodeSignature {
                pattern: "48 8B 05 ?? ?? ?? ?? 48 85 C0 74 05 48 8B 40 58 C3 C3".to_string(),
                instr_offset: 0,
                disp_offset: 3,
                instr_len: 7,
            },
            0,
        )
        .deref_offset(NG_LEVEL_OFFSET)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MonitorState {
    #[strum(serialize = "waiting for game")]
    WaitingForAttach,
    #[strum(serialize = "ready")]
    Ready,
    #[strum(serialize = "applying")]
    Applying,
}

/// Snapshot published by the monitor once per tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorStatus {
    pub state: MonitorState,
    pub pid: Option<u32>,
    pub records: Vec<(RecordKind, String)>,
    /// Attached, every record settled, and the requested level written
    pub settled: bool,
}

enum Request {
    ReadRow {
        kind: RecordKind,
        row: i32,
        reply: Sender<Result<Option<Row>>>,
    },
    ReadInternal {
        reply: Sender<Result<i32>>,
    },
    WriteInternal {
        value: i32,
        reply: Sender<Result<()>>,
    },
}

struct Shared {
    current: AtomicU32,
    requested: AtomicU32,
    status: Mutex<MonitorStatus>,
}

/// Thread-safe front end of a running [`MonitorLoop`].
#[derive(Clone)]
pub struct MonitorHandle {
    shared: Arc<Shared>,
    requests: Sender<Request>,
    shutdown: Arc<ShutdownSignal>,
}

impl MonitorHandle {
    /// Last level written to the process.
    pub fn current(&self) -> u32 {
        self.shared.current.load(Ordering::SeqCst)
    }

    /// Level the monitor is working towards.
    pub fn requested(&self) -> u32 {
        self.shared.requested.load(Ordering::SeqCst)
    }

    /// Request `current + delta`, floored at zero. Pending requests do not
    /// compound.
    pub fn request_relative(&self, delta: i64) -> u32 {
        let target = (self.current() as i64).saturating_add(delta);
        self.store_request(target)
    }

    /// Request an absolute level; negative values become zero.
    pub fn request_absolute(&self, level: i64) -> u32 {
        self.store_request(level)
    }

    fn store_request(&self, level: i64) -> u32 {
        let level = level.clamp(0, u32::MAX as i64) as u32;
        self.shared.requested.store(level, Ordering::SeqCst);
        info!("Level {} requested (current {})", level, self.current());
        level
    }

    pub fn status(&self) -> MonitorStatus {
        self.shared
            .status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Live values of one row, read from the first located copy.
    pub fn read_row(&self, kind: RecordKind, row: i32) -> Result<Option<Row>> {
        self.ask(|reply| Request::ReadRow { kind, row, reply })
    }

    /// The host's own NG+ level.
    pub fn read_internal_level(&self) -> Result<i32> {
        self.ask(|reply| Request::ReadInternal { reply })
    }

    pub fn write_internal_level(&self, value: i32) -> Result<()> {
        self.ask(|reply| Request::WriteInternal { value, reply })
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    fn ask<T>(&self, build: impl FnOnce(Sender<Result<T>>) -> Request) -> Result<T> {
        let (reply, answer) = mpsc::channel();
        self.requests
            .send(build(reply))
            .map_err(|_| Error::MonitorUnavailable("monitor has stopped".to_string()))?;
        answer
            .recv_timeout(REQUEST_TIMEOUT)
            .map_err(|_| Error::MonitorUnavailable("monitor did not answer".to_string()))?
    }
}

pub struct MonitorLoop<P: ProcessProvider> {
    config: MonitorConfig,
    attachment: ProcessAttachment<P>,
    injector: RecordInjector,
    engine: Arc<ScalingEngine>,
    store: Box<dyn LevelStore>,
    shared: Arc<Shared>,
    requests: Receiver<Request>,
    shutdown: Arc<ShutdownSignal>,
    retry: Arc<dyn RetryStrategy>,
    aux: AuxiliaryScan<Located>,
    /// Kind and generation of the scan in flight
    scanning: Option<(u64, RecordKind)>,
    /// Kinds whose scan finished (either way) under this attachment
    settled: HashSet<RecordKind>,
    state: MonitorState,
    /// The process was (re)acquired and holds vanilla values
    needs_full_apply: bool,
}

impl<P: ProcessProvider> MonitorLoop<P> {
    pub fn new(
        provider: P,
        config: MonitorConfig,
        engine: ScalingEngine,
        store: Box<dyn LevelStore>,
        shutdown: Arc<ShutdownSignal>,
    ) -> Result<(Self, MonitorHandle)> {
        config.validate()?;

        let last = store.read_last_level();
        info!("Starting at level {}", last);

        let shared = Arc::new(Shared {
            current: AtomicU32::new(last),
            requested: AtomicU32::new(last),
            status: Mutex::new(MonitorStatus {
                state: MonitorState::WaitingForAttach,
                pid: None,
                records: Vec::new(),
                settled: false,
            }),
        });
        let (tx, rx) = mpsc::channel();

        let retry: Arc<dyn RetryStrategy> = if config.scan_max_attempts <= 1 {
            Arc::new(NoRetry)
        } else {
            Arc::new(FixedDelay::new(config.scan_max_attempts, config.scan_retry_delay))
        };

        let mut attachment = ProcessAttachment::new(provider, &config);
        attachment.register_pointer(ng_level_chain());

        let monitor = Self {
            injector: RecordInjector::new(Arc::new(FixedRowCodec), config.regions.clone()),
            retry,
            config,
            attachment,
            engine: Arc::new(engine),
            store,
            shared: Arc::clone(&shared),
            requests: rx,
            shutdown: Arc::clone(&shutdown),
            aux: AuxiliaryScan::new(),
            scanning: None,
            settled: HashSet::new(),
            state: MonitorState::WaitingForAttach,
            needs_full_apply: false,
        };
        let handle = MonitorHandle {
            shared,
            requests: tx,
            shutdown,
        };
        Ok((monitor, handle))
    }

    /// Replace the record codec.
    pub fn with_codec(mut self, codec: Arc<dyn RecordCodec>) -> Self {
        self.injector = RecordInjector::new(codec, self.config.regions.clone());
        self
    }

    /// Replace the scan retry policy.
    pub fn with_retry(mut self, retry: Arc<dyn RetryStrategy>) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Run until shutdown is signalled. The process handle is released and
    /// any background scan joined before returning.
    pub fn run(mut self) {
        self.attachment.start();
        while !self.shutdown.is_shutdown() {
            self.tick();

            let pause = if self.attachment.is_attached() {
                self.config.tick_interval
            } else {
                self.config.tick_interval.min(self.config.poll_interval)
            };
            if self.shutdown.wait(pause) {
                break;
            }
        }

        debug!("Monitor stopping");
        self.aux.cancel();
        self.aux.join();
        self.attachment.stop();
        self.publish();
        info!("Monitor stopped at level {}", self.shared.current.load(Ordering::SeqCst));
    }

    /// One iteration: liveness, notifications, requests, locate, apply.
    pub fn tick(&mut self) {
        if !self.attachment.is_running() {
            self.attachment.start();
        }
        self.attachment.poll();
        self.handle_events();
        self.serve_requests();

        if self.attachment.is_attached() {
            self.drive_locate();
            if self.locate_settled() && self.needs_apply() {
                self.apply();
            }
        }
        self.publish();
    }

    fn handle_events(&mut self) {
        for event in self.attachment.drain_events() {
            match event {
                AttachEvent::Attached { generation, .. } => {
                    debug!("Attachment {} begins", generation);
                    self.injector.reset_for_attach();
                    self.settled.clear();
                    self.needs_full_apply = true;
                    self.state = MonitorState::Ready;
                }
                AttachEvent::Detached { reason, .. } => {
                    self.aux.cancel();
                    self.injector.mark_stale();
                    self.state = MonitorState::WaitingForAttach;
                    let current = self.shared.current.load(Ordering::SeqCst);
                    let requested = self.shared.requested.load(Ordering::SeqCst);
                    if current != requested {
                        info!(
                            "Game lost ({}); level {} will be applied when it returns",
                            reason, requested
                        );
                    }
                }
            }
        }
    }

    fn needs_apply(&self) -> bool {
        self.needs_full_apply
            || self.shared.current.load(Ordering::SeqCst)
                != self.shared.requested.load(Ordering::SeqCst)
    }

    fn locate_settled(&self) -> bool {
        self.scanning.is_none()
            && self
                .injector
                .unlocated()
                .iter()
                .all(|kind| self.settled.contains(kind))
    }

    /// Collect a finished scan and start the next one.
    fn drive_locate(&mut self) {
        let generation = self.attachment.generation();

        if let Some((scanned, kind)) = self.scanning {
            match self.aux.poll(generation) {
                SearchStatus::Found(located) => {
                    self.injector.set_located(kind, located);
                    self.settled.insert(kind);
                    self.scanning = None;
                }
                SearchStatus::GaveUp(reason) => {
                    self.injector.fail(kind, &Error::PatternNotFound(reason));
                    self.settled.insert(kind);
                    self.scanning = None;
                }
                SearchStatus::Pending => {
                    if scanned != generation && !self.aux.is_busy() {
                        self.scanning = None;
                    }
                }
            }
        }

        if self.scanning.is_some() || self.aux.is_busy() {
            return;
        }

        let Some(kind) = self
            .injector
            .unlocated()
            .into_iter()
            .find(|k| !self.settled.contains(k))
        else {
            return;
        };

        match self.prepare_scan(kind, generation) {
            Ok(true) => self.scanning = Some((generation, kind)),
            Ok(false) => {}
            Err(e) => {
                self.injector.fail(kind, &e);
                self.settled.insert(kind);
            }
        }
    }

    fn prepare_scan(&mut self, kind: RecordKind, generation: u64) -> Result<bool> {
        let current = self.shared.current.load(Ordering::SeqCst);
        let references = [self.engine.record(kind, 1)?, self.engine.record(kind, current)?];
        let candidates = self.injector.reference_bytes(kind, &references)?;
        let lease = self.attachment.lease()?;
        let regions = self.injector.regions().to_vec();

        info!("Scanning for {}", kind);
        Ok(self.aux.spawn(
            &kind.to_string(),
            generation,
            Arc::clone(&self.retry),
            move |_| {
                if !lease.memory.is_alive() {
                    return Err(Error::Attachment("process exited during scan".to_string()));
                }
                scan_candidates(lease.memory.as_ref(), &regions, kind, &candidates)
            },
        ))
    }

    /// Write every located record at the requested level, then the host flag.
    fn apply(&mut self) {
        let target = self.shared.requested.load(Ordering::SeqCst);
        self.state = MonitorState::Applying;
        let mut written = 0;

        for kind in RecordKind::iter() {
            if !matches!(self.injector.state(kind), LocateState::Located(_)) {
                warn!("{} is {}, not updating it", kind, self.injector.state(kind).label());
                continue;
            }

            let record = match self.engine.record(kind, target) {
                Ok(record) => record,
                Err(e) => {
                    self.injector.fail(kind, &e);
                    continue;
                }
            };

            let injector = &mut self.injector;
            match self.attachment.with_memory(|mem| injector.inject(mem, &record)) {
                Ok(report) => written += report.written,
                Err(e) => warn!("{} not updated: {}", kind, e),
            }
        }

        if !self.attachment.is_attached() {
            warn!("Game lost while applying level {}", target);
            self.state = MonitorState::WaitingForAttach;
            return;
        }

        let flag = i32::from(target != 0);
        if let Err(e) = self.attachment.write_pointer_i32(NG_LEVEL_POINTER, flag) {
            debug!("Host NG+ flag not written: {}", e);
        }

        self.shared.current.store(target, Ordering::SeqCst);
        self.needs_full_apply = false;
        self.state = MonitorState::Ready;
        info!("Level {} applied ({} record copies written)", target, written);

        if let Err(e) = self.store.write_last_level(target) {
            warn!("Could not save level {}: {}", target, e);
        }
    }

    fn serve_requests(&mut self) {
        while let Ok(request) = self.requests.try_recv() {
            match request {
                Request::ReadRow { kind, row, reply } => {
                    let injector = &self.injector;
                    let result = self
                        .attachment
                        .with_memory(|mem| injector.read_live(mem, kind))
                        .map(|record| record.row(row).cloned());
                    let _ = reply.send(result);
                }
                Request::ReadInternal { reply } => {
                    let _ = reply.send(self.attachment.read_pointer_i32(NG_LEVEL_POINTER));
                }
                Request::WriteInternal { value, reply } => {
                    let _ = reply.send(self.attachment.write_pointer_i32(NG_LEVEL_POINTER, value));
                }
            }
        }
    }

    fn publish(&self) {
        let settled = self.attachment.is_attached()
            && self.state == MonitorState::Ready
            && self.locate_settled()
            && !self.needs_apply();
        let status = MonitorStatus {
            state: self.state,
            pid: self.attachment.pid(),
            records: RecordKind::iter()
                .map(|kind| {
                    let label = match self.injector.state(kind) {
                        LocateState::Located(located) => {
                            format!("located ({} copies)", located.addresses.len())
                        }
                        LocateState::Disabled(reason) => format!("disabled: {}", reason),
                        other if self.scanning.is_some_and(|(_, k)| k == kind) => {
                            format!("{} (scanning)", other.label())
                        }
                        other => other.label().to_string(),
                    };
                    (kind, label)
                })
                .collect(),
            settled,
        };
        if let Ok(mut slot) = self.shared.status.lock() {
            *slot = status;
        }
    }
}

impl<P: ProcessProvider> Drop for MonitorLoop<P> {
    fn drop(&mut self) {
        if self.aux.is_busy() {
            error!("Monitor dropped with a scan still running; cancelling it");
        }
        self.aux.cancel();
        self.aux.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MockMemoryBuilder, MockProcessProvider};
    use crate::persist::MemoryLevelStore;
    use crate::scaling::ScalingTable;

    fn monitor() -> (MonitorLoop<MockProcessProvider>, MonitorHandle) {
        let config = MonitorConfig::builder()
            .min_lifetime(Duration::ZERO)
            .poll_interval(Duration::from_millis(1))
            .build();
        MonitorLoop::new(
            MockProcessProvider::new(),
            config,
            ScalingEngine::new(ScalingTable::builtin().unwrap()),
            Box::new(MemoryLevelStore::with_level(4)),
            Arc::new(ShutdownSignal::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_starts_from_stored_level() {
        let (_monitor, handle) = monitor();
        assert_eq!(handle.current(), 4);
        assert_eq!(handle.requested(), 4);
    }

    #[test]
    fn test_relative_requests_do_not_compound() {
        let (_monitor, handle) = monitor();
        assert_eq!(handle.request_relative(2), 6);
        assert_eq!(handle.request_relative(2), 6);
        assert_eq!(handle.request_relative(-10), 0);
        assert_eq!(handle.requested(), 0);
    }

    #[test]
    fn test_absolute_requests_clamp_at_zero() {
        let (_monitor, handle) = monitor();
        assert_eq!(handle.request_absolute(-3), 0);
        assert_eq!(handle.request_absolute(25), 25);
        assert_eq!(handle.current(), 4);
    }

    #[test]
    fn test_tick_without_game_waits() {
        let (mut monitor, handle) = monitor();
        handle.request_absolute(9);
        monitor.tick();
        assert_eq!(monitor.state(), MonitorState::WaitingForAttach);
        assert_eq!(handle.current(), 4);
        assert_eq!(handle.status().records.len(), 2);
        assert!(!handle.status().settled);
    }

    #[test]
    fn test_requests_fail_when_monitor_is_gone() {
        let (monitor, handle) = monitor();
        drop(monitor);
        assert!(matches!(
            handle.read_internal_level(),
            Err(Error::MonitorUnavailable(_))
        ));
    }

    #[test]
    fn test_ng_level_chain_layout() {
        let chain = ng_level_chain();
        assert_eq!(chain.name, NG_LEVEL_POINTER);
        assert_eq!(chain.hops.len(), 2);
        assert_eq!(chain.derefs, 0);
        let memory = MockMemoryBuilder::new().build();
        let mut resolver = crate::memory::PointerResolver::new();
        assert!(resolver.resolve(&memory, &chain).is_err());
    }
}
