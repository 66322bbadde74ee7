use std::fmt;

use serde::{Deserialize, Serialize};

/// A byte range of the foreign address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub start: u64,
    pub size: u64,
}

impl MemoryRegion {
    pub fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// Exclusive end address.
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end()
    }

    /// Overlapping part of two regions, if any.
    pub fn intersect(&self, other: &MemoryRegion) -> Option<MemoryRegion> {
        let start = self.start.max(other.start);
        let end = self.end().min(other.end());
        (start < end).then(|| MemoryRegion::new(start, end - start))
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}..{:#x}", self.start, self.end())
    }
}

/// Restrict declared scan windows to what the process actually has mapped.
///
/// Output follows declaration order; pieces of one declared window are in
/// ascending address order.
pub fn clip_regions(declared: &[MemoryRegion], mapped: &[MemoryRegion]) -> Vec<MemoryRegion> {
    let mut mapped = mapped.to_vec();
    mapped.sort_by_key(|r| r.start);

    let mut clipped: Vec<MemoryRegion> = Vec::new();
    for window in declared {
        for region in &mapped {
            if region.start >= window.end() {
                break;
            }
            if let Some(piece) = window.intersect(region) {
                // Adjacent mappings are scanned as one piece so matches can
                // straddle the boundary.
                match clipped.last_mut() {
                    Some(prev) if prev.end() == piece.start && window.contains(prev.start) => {
                        prev.size += piece.size;
                    }
                    _ => clipped.push(piece),
                }
            }
        }
    }
    clipped
}
