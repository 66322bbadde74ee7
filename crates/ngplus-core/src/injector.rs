//! Locating live copies of records and overwriting them.
//!
//! Each record kind moves through
//! `Unlocated -> Located -> Stale -> Unlocated`, the last step happening when
//! the process is re-acquired. A kind whose serialization is inconsistent
//! with what was found is disabled for the rest of the session.

use std::collections::BTreeMap;
use std::sync::Arc;

use strum::IntoEnumIterator;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::memory::{MemoryAccess, MemoryPatternScanner, MemoryRegion, clip_regions};
use crate::record::{Record, RecordCodec, RecordKind};

/// Every address holding a copy of one record, plus the copy's length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub addresses: Vec<u64>,
    pub len: usize,
    /// Which reference serialization matched, in the order they were tried.
    pub candidate: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocateState {
    Unlocated,
    Located(Located),
    /// Found under an attachment that no longer exists.
    Stale,
    Disabled(String),
}

impl LocateState {
    pub fn label(&self) -> &'static str {
        match self {
            LocateState::Unlocated => "not located",
            LocateState::Located(_) => "located",
            LocateState::Stale => "stale",
            LocateState::Disabled(_) => "disabled",
        }
    }
}

/// Summary of one inject call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InjectReport {
    pub written: usize,
    pub failed: usize,
}

/// Scan for the first reference serialization that occurs anywhere.
///
/// `candidates` are tried in order; the first with at least one match wins.
pub fn scan_candidates<M: MemoryAccess + ?Sized>(
    memory: &M,
    regions: &[MemoryRegion],
    kind: RecordKind,
    candidates: &[Vec<u8>],
) -> Result<Located> {
    let clipped = clip_regions(regions, &memory.mapped_regions()?);
    if clipped.is_empty() {
        return Err(Error::PatternNotFound(format!(
            "{}: none of the {} scan regions are mapped",
            kind,
            regions.len()
        )));
    }

    let scanner = MemoryPatternScanner::new(memory);
    for (index, bytes) in candidates.iter().enumerate() {
        if bytes.is_empty() {
            return Err(Error::Schema(format!("{} serializes to zero bytes", kind)));
        }

        let addresses = scanner.scan(bytes, &clipped);
        debug!(
            "{} candidate {} ({} bytes): {} match(es)",
            kind,
            index,
            bytes.len(),
            addresses.len()
        );
        if !addresses.is_empty() {
            return Ok(Located {
                addresses,
                len: bytes.len(),
                candidate: index,
            });
        }
    }

    Err(Error::PatternNotFound(format!(
        "{}: no copy of any of {} reference serializations in memory",
        kind,
        candidates.len()
    )))
}

/// Keeps the address set of every record kind and writes new values to it.
pub struct RecordInjector {
    codec: Arc<dyn RecordCodec>,
    regions: Vec<MemoryRegion>,
    states: BTreeMap<RecordKind, LocateState>,
}

impl RecordInjector {
    pub fn new(codec: Arc<dyn RecordCodec>, regions: Vec<MemoryRegion>) -> Self {
        Self {
            codec,
            regions,
            states: RecordKind::iter().map(|k| (k, LocateState::Unlocated)).collect(),
        }
    }

    pub fn codec(&self) -> Arc<dyn RecordCodec> {
        Arc::clone(&self.codec)
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn state(&self, kind: RecordKind) -> &LocateState {
        self.states.get(&kind).unwrap_or(&LocateState::Unlocated)
    }

    pub fn addresses(&self, kind: RecordKind) -> Option<&[u64]> {
        match self.state(kind) {
            LocateState::Located(located) => Some(&located.addresses),
            _ => None,
        }
    }

    /// Kinds that still need a scan under the current attachment.
    pub fn unlocated(&self) -> Vec<RecordKind> {
        self.states
            .iter()
            .filter(|(_, s)| matches!(s, LocateState::Unlocated))
            .map(|(&k, _)| k)
            .collect()
    }

    /// Serialize the reference records for `kind`, in the order to try them.
    ///
    /// Identical serializations are tried once.
    pub fn reference_bytes(&mut self, kind: RecordKind, references: &[Record]) -> Result<Vec<Vec<u8>>> {
        let mut candidates: Vec<Vec<u8>> = Vec::with_capacity(references.len());
        for record in references {
            let bytes = self
                .codec
                .encode(record)
                .inspect_err(|e| self.fail(kind, e))?;
            if !candidates.contains(&bytes) {
                candidates.push(bytes);
            }
        }
        Ok(candidates)
    }

    /// Find all live copies of `kind` synchronously.
    pub fn locate<M: MemoryAccess + ?Sized>(
        &mut self,
        memory: &M,
        kind: RecordKind,
        references: &[Record],
    ) -> Result<&[u64]> {
        if let LocateState::Disabled(reason) = self.state(kind) {
            return Err(Error::Schema(format!("{} is disabled: {}", kind, reason)));
        }

        let candidates = self.reference_bytes(kind, references)?;
        match scan_candidates(memory, &self.regions, kind, &candidates) {
            Ok(located) => {
                self.set_located(kind, located);
                Ok(self.addresses(kind).unwrap_or_default())
            }
            Err(e) => {
                self.fail(kind, &e);
                Err(e)
            }
        }
    }

    pub fn set_located(&mut self, kind: RecordKind, located: Located) {
        if matches!(self.state(kind), LocateState::Disabled(_)) {
            return;
        }
        info!(
            "{} located at {} address(es): {}",
            kind,
            located.addresses.len(),
            located
                .addresses
                .iter()
                .map(|a| format!("{:#x}", a))
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.states.insert(kind, LocateState::Located(located));
    }

    /// Record a failed locate. Non-recoverable errors disable the kind.
    pub fn fail(&mut self, kind: RecordKind, err: &Error) {
        if err.is_recoverable() {
            error!("Could not locate {}: {}. It will be retried after the game restarts", kind, err);
            self.states.insert(kind, LocateState::Unlocated);
        } else {
            error!("Disabling {} for this session: {}", kind, err);
            self.states.insert(kind, LocateState::Disabled(err.to_string()));
        }
    }

    /// The process went away: no address may be used again.
    pub fn mark_stale(&mut self) {
        for state in self.states.values_mut() {
            if matches!(state, LocateState::Located(_)) {
                *state = LocateState::Stale;
            }
        }
    }

    /// A new attachment begins: everything not disabled is scanned again.
    pub fn reset_for_attach(&mut self) {
        for state in self.states.values_mut() {
            if !matches!(state, LocateState::Disabled(_)) {
                *state = LocateState::Unlocated;
            }
        }
    }

    /// Write `record` to every address of its kind.
    ///
    /// A failed address is logged and the rest are still written. The call
    /// fails only when nothing could be written or the length changed.
    pub fn inject<M: MemoryAccess + ?Sized>(&mut self, memory: &M, record: &Record) -> Result<InjectReport> {
        let kind = record.kind;
        let located = match self.state(kind) {
            LocateState::Located(located) => located.clone(),
            other => {
                return Err(Error::PatternNotFound(format!(
                    "{} is {}, skipping write",
                    kind,
                    other.label()
                )));
            }
        };

        let bytes = self.codec.encode(record).inspect_err(|e| self.fail(kind, e))?;
        if bytes.len() != located.len {
            let err = Error::Schema(format!(
                "{} serialized to {} bytes but the live copy is {} bytes",
                kind,
                bytes.len(),
                located.len
            ));
            self.fail(kind, &err);
            return Err(err);
        }

        let mut report = InjectReport::default();
        let mut last_error = None;
        for &address in &located.addresses {
            match memory.write_bytes(address, &bytes) {
                Ok(()) => report.written += 1,
                Err(e) => {
                    warn!("Failed to write {} at {:#x}: {}", kind, address, e);
                    report.failed += 1;
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if report.written == 0 => Err(e),
            _ => {
                debug!("{}: wrote {} copies ({} failed)", kind, report.written, report.failed);
                Ok(report)
            }
        }
    }

    /// Decode the first live copy of `kind`, for diagnostics.
    pub fn read_live<M: MemoryAccess + ?Sized>(&self, memory: &M, kind: RecordKind) -> Result<Record> {
        let LocateState::Located(located) = self.state(kind) else {
            return Err(Error::PatternNotFound(format!("{} is {}", kind, self.state(kind).label())));
        };
        let first = *located
            .addresses
            .first()
            .ok_or_else(|| Error::PatternNotFound(format!("{} has no addresses", kind)))?;
        let bytes = memory.read_bytes(first, located.len)?;
        self.codec.decode(&bytes, &kind.schema())
    }
}
