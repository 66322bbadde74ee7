//! Chunked byte-pattern scanning over a foreign address space.

use memchr::memmem;
use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::pattern::find_wildcard_matches;
use crate::memory::{MemoryRegion, ReadMemory};

/// Size of each remote read (4MB)
pub const SCAN_CHUNK_SIZE: usize = 4 * 1024 * 1024;
/// Upper bound on the primary module bytes searched for code signatures (128MB)
pub const MODULE_SCAN_LIMIT: usize = 128 * 1024 * 1024;

/// Finds exact copies of byte sequences inside declared regions.
///
/// Reads are chunked, and each chunk keeps a `pattern.len() - 1` tail of the
/// previous one so matches across chunk boundaries are not lost.
pub struct MemoryPatternScanner<'a, R: ReadMemory + ?Sized> {
    reader: &'a R,
    chunk_size: usize,
}

impl<'a, R: ReadMemory + ?Sized> MemoryPatternScanner<'a, R> {
    pub fn new(reader: &'a R) -> Self {
        Self {
            reader,
            chunk_size: SCAN_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Every address where `pattern` occurs in `regions`.
    ///
    /// Results are grouped by region in the order given, ascending within a
    /// region. No match is an empty vector, not an error. Unreadable chunks
    /// are skipped.
    pub fn scan(&self, pattern: &[u8], regions: &[MemoryRegion]) -> Vec<u64> {
        if pattern.is_empty() {
            return Vec::new();
        }

        let finder = memmem::Finder::new(pattern);
        let mut results = Vec::new();
        for region in regions {
            let before = results.len();
            self.scan_region(region, pattern.len(), &mut results, |data| {
                finder.find_iter(data).collect()
            });
            debug!(
                "Scanned {} for {} bytes: {} match(es)",
                region,
                pattern.len(),
                results.len() - before
            );
        }
        results
    }

    /// Search the primary module for a code signature with wildcards.
    pub fn scan_module(&self, pattern: &[Option<u8>]) -> Result<Vec<u64>> {
        let base = self.reader.base_address();
        let size = self.reader.module_size().min(MODULE_SCAN_LIMIT);
        if size == 0 {
            return Err(Error::PatternNotFound(
                "primary module has no readable image".to_string(),
            ));
        }

        let mut results = Vec::new();
        self.scan_region(
            &MemoryRegion::new(base, size as u64),
            pattern.len(),
            &mut results,
            |data| find_wildcard_matches(data, pattern),
        );
        Ok(results)
    }

    fn scan_region<F>(
        &self,
        region: &MemoryRegion,
        pattern_len: usize,
        results: &mut Vec<u64>,
        find: F,
    ) where
        F: Fn(&[u8]) -> Vec<usize>,
    {
        let keep = pattern_len.saturating_sub(1);
        let mut tail: Vec<u8> = Vec::new();
        let mut addr = region.start;

        while addr < region.end() {
            let read_size = ((region.end() - addr) as usize).min(self.chunk_size);

            let chunk = match self.reader.read_bytes(addr, read_size) {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!("Skipping unreadable chunk at {:#x}: {}", addr, e);
                    tail.clear();
                    addr += read_size as u64;
                    continue;
                }
            };

            let mut data = Vec::with_capacity(tail.len() + chunk.len());
            data.extend_from_slice(&tail);
            data.extend_from_slice(&chunk);

            let data_base = addr - tail.len() as u64;
            results.extend(find(&data).into_iter().map(|i| data_base + i as u64));

            tail = if data.len() >= keep {
                data[data.len() - keep..].to_vec()
            } else {
                data
            };

            addr += read_size as u64;
        }
    }
}
