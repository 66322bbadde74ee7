//! Finding, binding to and losing the target process.
//!
//! [`ProcessAttachment`] is polled from the monitor thread. It has two states,
//! waiting and attached, and reports transitions through a queue that the
//! caller drains once per tick instead of running callbacks.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::error::{Error, Result};
use crate::memory::{
    MemoryAccess, PointerChain, PointerResolver, ProcessInfo, ProcessProvider, exe_matches,
};

/// Recognises the target among running processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSelector {
    pub exe_name: String,
    pub window_title: Option<String>,
}

impl ProcessSelector {
    pub fn new(exe_name: impl Into<String>, window_title: Option<String>) -> Self {
        Self {
            exe_name: exe_name.into(),
            window_title,
        }
    }

    /// A window title is only required where the provider can see windows.
    pub fn matches(&self, info: &ProcessInfo, observes_windows: bool) -> bool {
        if !exe_matches(&info.name, &self.exe_name) {
            return false;
        }
        match (&self.window_title, observes_windows) {
            (Some(title), true) => info.window_title.as_deref() == Some(title.as_str()),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachEvent {
    Attached {
        pid: u32,
        base_address: u64,
        generation: u64,
    },
    Detached {
        pid: u32,
        generation: u64,
        reason: String,
    },
}

struct Attached {
    pid: u32,
    memory: Arc<dyn MemoryAccess>,
}

/// A handle on the attached process for one long-running operation, tagged
/// with the attachment it belongs to.
#[derive(Clone)]
pub struct MemoryLease {
    pub memory: Arc<dyn MemoryAccess>,
    pub generation: u64,
}

pub struct ProcessAttachment<P: ProcessProvider> {
    provider: P,
    selector: ProcessSelector,
    poll_interval: Duration,
    min_lifetime: Duration,
    access_error_threshold: u32,
    running: bool,
    current: Option<Attached>,
    /// When each matching pid was first observed
    first_seen: HashMap<u32, Instant>,
    last_poll: Option<Instant>,
    generation: u64,
    consecutive_errors: u32,
    resolver: PointerResolver,
    pointers: HashMap<String, PointerChain>,
    events: VecDeque<AttachEvent>,
}

impl<P: ProcessProvider> ProcessAttachment<P> {
    pub fn new(provider: P, config: &MonitorConfig) -> Self {
        Self {
            provider,
            selector: ProcessSelector::new(config.exe_name.clone(), config.window_title.clone()),
            poll_interval: config.poll_interval,
            min_lifetime: config.min_lifetime,
            access_error_threshold: config.access_error_threshold,
            running: false,
            current: None,
            first_seen: HashMap::new(),
            last_poll: None,
            generation: 0,
            consecutive_errors: 0,
            resolver: PointerResolver::new(),
            pointers: HashMap::new(),
            events: VecDeque::new(),
        }
    }

    /// Begin polling. Calling it again has no effect.
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        self.last_poll = None;
        info!(
            "Waiting for {}{}",
            self.selector.exe_name,
            self.selector
                .window_title
                .as_deref()
                .map(|t| format!(" (window '{}')", t))
                .unwrap_or_default()
        );
    }

    /// Stop polling and drop the process handle.
    pub fn stop(&mut self) {
        self.running = false;
        self.detach("stopped");
        self.first_seen.clear();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_attached(&self) -> bool {
        self.current.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.current.as_ref().map(|a| a.pid)
    }

    /// Incremented on every attach; zero before the first one.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Check liveness and, while detached, look for the target.
    ///
    /// The process list is consulted at most once per poll interval.
    pub fn poll(&mut self) {
        if !self.running {
            return;
        }

        if let Some(current) = &self.current {
            if !current.memory.is_alive() {
                self.detach("process exited");
            }
            return;
        }

        let now = Instant::now();
        if self
            .last_poll
            .is_some_and(|last| now.duration_since(last) < self.poll_interval)
        {
            return;
        }
        self.last_poll = Some(now);

        let processes = match self.provider.list() {
            Ok(list) => list,
            Err(e) => {
                debug!("Process enumeration failed: {}", e);
                return;
            }
        };

        let observes_windows = self.provider.observes_windows();
        let candidates: Vec<u32> = processes
            .iter()
            .filter(|p| self.selector.matches(p, observes_windows))
            .map(|p| p.pid)
            .collect();

        self.first_seen.retain(|pid, _| candidates.contains(pid));
        for &pid in &candidates {
            self.first_seen.entry(pid).or_insert(now);
        }

        let ready = candidates.iter().copied().find(|pid| {
            self.first_seen
                .get(pid)
                .is_some_and(|seen| now.duration_since(*seen) >= self.min_lifetime)
        });

        if let Some(pid) = ready {
            self.attach(pid);
        } else if let Some(pid) = candidates.first() {
            debug!("Found pid {} but it is younger than {:?}", pid, self.min_lifetime);
        }
    }

    fn attach(&mut self, pid: u32) {
        let memory = match self.provider.open(pid) {
            Ok(memory) => memory,
            Err(e) => {
                debug!("Cannot attach to pid {} yet: {}", pid, e);
                return;
            }
        };

        self.generation += 1;
        self.consecutive_errors = 0;
        self.resolver.reset(self.generation);
        let base_address = memory.base_address();
        self.current = Some(Attached { pid, memory });

        info!(
            "Attached to {} (pid {}, base {:#x})",
            self.selector.exe_name, pid, base_address
        );
        self.events.push_back(AttachEvent::Attached {
            pid,
            base_address,
            generation: self.generation,
        });
    }

    fn detach(&mut self, reason: &str) {
        let Some(previous) = self.current.take() else {
            return;
        };
        self.resolver.reset(self.generation);
        self.consecutive_errors = 0;
        self.last_poll = None;
        self.first_seen.clear();

        info!("Detached from pid {}: {}", previous.pid, reason);
        self.events.push_back(AttachEvent::Detached {
            pid: previous.pid,
            generation: self.generation,
            reason: reason.to_string(),
        });
    }

    /// Pending attach/detach notifications, oldest first.
    pub fn drain_events(&mut self) -> Vec<AttachEvent> {
        self.events.drain(..).collect()
    }

    /// Run `f` against the attached process.
    ///
    /// Fails with [`Error::Attachment`] while detached. Repeated
    /// [`Error::Access`] failures count towards an implicit detach.
    pub fn with_memory<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn MemoryAccess) -> Result<T>,
    {
        let memory = self.memory()?;
        let result = f(memory.as_ref());
        self.record_access(&result);
        result
    }

    /// A handle for work that outlives one call, such as a background scan.
    pub fn lease(&self) -> Result<MemoryLease> {
        Ok(MemoryLease {
            memory: self.memory()?,
            generation: self.generation,
        })
    }

    fn memory(&self) -> Result<Arc<dyn MemoryAccess>> {
        self.current
            .as_ref()
            .map(|a| Arc::clone(&a.memory))
            .ok_or_else(|| Error::Attachment(format!("{} is not attached", self.selector.exe_name)))
    }

    /// Feed the outcome of an access made outside [`Self::with_memory`].
    pub fn record_access<T>(&mut self, result: &Result<T>) {
        match result {
            Err(Error::Access { address, message }) => {
                self.consecutive_errors += 1;
                debug!(
                    "Access error {}/{} at {:#x}: {}",
                    self.consecutive_errors, self.access_error_threshold, address, message
                );
                if self.consecutive_errors >= self.access_error_threshold {
                    warn!(
                        "{} consecutive access errors, treating the process as gone",
                        self.consecutive_errors
                    );
                    self.detach("repeated access errors");
                }
            }
            Ok(_) => self.consecutive_errors = 0,
            Err(_) => {}
        }
    }

    pub fn register_pointer(&mut self, chain: PointerChain) {
        self.pointers.insert(chain.name.clone(), chain);
    }

    /// Resolve a named pointer against the current attachment.
    pub fn resolve_pointer(&mut self, name: &str) -> Result<u64> {
        let chain = self
            .pointers
            .get(name)
            .ok_or_else(|| Error::Config(format!("no pointer named '{}'", name)))?;
        let memory = self.memory()?;
        self.resolver.resolve(memory.as_ref(), chain)
    }

    pub fn read_pointer_i32(&mut self, name: &str) -> Result<i32> {
        let address = self.resolve_pointer(name)?;
        self.with_memory(|mem| mem.read_i32(address))
    }

    pub fn write_pointer_i32(&mut self, name: &str, value: i32) -> Result<()> {
        let address = self.resolve_pointer(name)?;
        self.with_memory(|mem| mem.write_i32(address, value))
    }
}
