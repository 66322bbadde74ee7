//! Sparse in-memory address space for tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::memory::{MemoryAccess, MemoryRegion, ProcessInfo, ProcessProvider, ReadMemory, WriteMemory};

/// A fake process: a set of mapped byte regions plus liveness.
///
/// Reads and writes that touch any unmapped byte fail with
/// [`Error::Access`], the same way a partially committed range does on a
/// real process.
pub struct MockMemory {
    regions: Mutex<BTreeMap<u64, Vec<u8>>>,
    base_address: u64,
    module_size: usize,
    alive: AtomicBool,
    failing_writes: Mutex<HashSet<u64>>,
}

impl MockMemory {
    /// Mark the process as exited.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Make every write starting at `address` fail.
    pub fn fail_writes_at(&self, address: u64) {
        if let Ok(mut set) = self.failing_writes.lock() {
            set.insert(address);
        }
    }

    /// Snapshot of `size` bytes at `address`, for assertions.
    pub fn snapshot(&self, address: u64, size: usize) -> Vec<u8> {
        self.read_bytes(address, size).unwrap_or_default()
    }

    fn locate(regions: &BTreeMap<u64, Vec<u8>>, address: u64, size: usize) -> Option<(u64, usize)> {
        let (&start, data) = regions.range(..=address).next_back()?;
        let offset = (address - start) as usize;
        (offset + size <= data.len()).then_some((start, offset))
    }
}

impl ReadMemory for MockMemory {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let regions = self
            .regions
            .lock()
            .map_err(|_| Error::access(address, "mock poisoned"))?;
        let (start, offset) = Self::locate(&regions, address, size)
            .ok_or_else(|| Error::access(address, format!("unmapped read of {} bytes", size)))?;
        Ok(regions[&start][offset..offset + size].to_vec())
    }

    fn base_address(&self) -> u64 {
        self.base_address
    }

    fn module_size(&self) -> usize {
        self.module_size
    }
}

impl WriteMemory for MockMemory {
    fn write_bytes(&self, address: u64, data: &[u8]) -> Result<()> {
        if self
            .failing_writes
            .lock()
            .map(|set| set.contains(&address))
            .unwrap_or(false)
        {
            return Err(Error::access(address, "write rejected"));
        }

        let mut regions = self
            .regions
            .lock()
            .map_err(|_| Error::access(address, "mock poisoned"))?;
        let (start, offset) = Self::locate(&regions, address, data.len()).ok_or_else(|| {
            Error::access(address, format!("unmapped write of {} bytes", data.len()))
        })?;
        if let Some(region) = regions.get_mut(&start) {
            region[offset..offset + data.len()].copy_from_slice(data);
        }
        Ok(())
    }
}

impl MemoryAccess for MockMemory {
    fn mapped_regions(&self) -> Result<Vec<MemoryRegion>> {
        let regions = self
            .regions
            .lock()
            .map_err(|_| Error::access(0, "mock poisoned"))?;
        Ok(regions
            .iter()
            .map(|(&start, data)| MemoryRegion::new(start, data.len() as u64))
            .collect())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Builder for [`MockMemory`].
#[derive(Default)]
pub struct MockMemoryBuilder {
    regions: BTreeMap<u64, Vec<u8>>,
    base_address: u64,
    module_size: Option<usize>,
}

impl MockMemoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_address(mut self, address: u64) -> Self {
        self.base_address = address;
        self
    }

    pub fn module_size(mut self, size: usize) -> Self {
        self.module_size = Some(size);
        self
    }

    /// Map `data` at `start`. Regions must not overlap.
    pub fn region(mut self, start: u64, data: Vec<u8>) -> Self {
        self.regions.insert(start, data);
        self
    }

    /// Write `data` into an already mapped region at `address`.
    pub fn write(mut self, address: u64, data: &[u8]) -> Self {
        if let Some((start, offset)) = MockMemory::locate(&self.regions, address, data.len())
            && let Some(region) = self.regions.get_mut(&start)
        {
            region[offset..offset + data.len()].copy_from_slice(data);
        }
        self
    }

    pub fn write_u64(self, address: u64, value: u64) -> Self {
        self.write(address, &value.to_le_bytes())
    }

    pub fn build(self) -> MockMemory {
        let module_size = self.module_size.unwrap_or_else(|| {
            self.regions
                .get(&self.base_address)
                .map(Vec::len)
                .unwrap_or(0)
        });
        MockMemory {
            regions: Mutex::new(self.regions),
            base_address: self.base_address,
            module_size,
            alive: AtomicBool::new(true),
            failing_writes: Mutex::new(HashSet::new()),
        }
    }
}

/// Scriptable process list; clones share the same list.
#[derive(Clone, Default)]
pub struct MockProcessProvider {
    processes: Arc<Mutex<Vec<(ProcessInfo, Arc<MockMemory>)>>>,
    hide_windows: bool,
}

impl MockProcessProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behave like a platform that cannot see window titles.
    pub fn without_windows(mut self) -> Self {
        self.hide_windows = true;
        self
    }

    /// Start a process. Returns the memory so tests can inspect it.
    pub fn spawn(&self, pid: u32, name: &str, window_title: Option<&str>, memory: MockMemory) -> Arc<MockMemory> {
        let memory = Arc::new(memory);
        if let Ok(mut list) = self.processes.lock() {
            list.push((
                ProcessInfo {
                    pid,
                    name: name.to_string(),
                    window_title: window_title.map(str::to_string),
                },
                Arc::clone(&memory),
            ));
        }
        memory
    }

    /// Terminate a process: it leaves the list and its memory reports dead.
    pub fn exit(&self, pid: u32) {
        if let Ok(mut list) = self.processes.lock() {
            list.retain(|(info, memory)| {
                if info.pid == pid {
                    memory.kill();
                }
                info.pid != pid
            });
        }
    }
}

impl ProcessProvider for MockProcessProvider {
    fn list(&self) -> Result<Vec<ProcessInfo>> {
        let list = self
            .processes
            .lock()
            .map_err(|_| Error::Attachment("mock poisoned".to_string()))?;
        Ok(list.iter().map(|(info, _)| info.clone()).collect())
    }

    fn open(&self, pid: u32) -> Result<Arc<dyn MemoryAccess>> {
        let list = self
            .processes
            .lock()
            .map_err(|_| Error::Attachment("mock poisoned".to_string()))?;
        list.iter()
            .find(|(info, _)| info.pid == pid)
            .map(|(_, memory)| Arc::clone(memory) as Arc<dyn MemoryAccess>)
            .ok_or_else(|| Error::Attachment(format!("process {} not found", pid)))
    }

    fn observes_windows(&self) -> bool {
        !self.hide_windows
    }
}
