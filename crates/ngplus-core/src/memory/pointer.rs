//! Pointer chains into the foreign process and their resolution.
//!
//! A chain starts from a code signature inside the primary module and walks
//! offset hops from there. Signature hops only depend on the module image, so
//! they are cached for the lifetime of one attachment. Offset hops follow
//! live heap pointers and are walked fresh on every access.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::memory::{MemoryPatternScanner, ReadMemory, parse_pattern};

/// A RIP-relative instruction whose displacement points at a static.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSignature {
    pub pattern: String,
    /// Start of the instruction relative to the match.
    #[serde(default)]
    pub instr_offset: usize,
    /// Position of the disp32 inside the instruction.
    pub disp_offset: usize,
    pub instr_len: usize,
}

impl CodeSignature {
    pub fn pattern_bytes(&self) -> Result<Vec<Option<u8>>> {
        parse_pattern(&self.pattern)
    }

    /// Address targeted by the instruction found at `match_addr`.
    pub fn resolve_target<R: ReadMemory + ?Sized>(&self, reader: &R, match_addr: u64) -> Result<u64> {
        let instr_addr = match_addr + self.instr_offset as u64;
        let disp = reader.read_i32(instr_addr + self.disp_offset as u64)?;
        let next_ip = instr_addr + self.instr_len as u64;
        Ok(next_ip.wrapping_add_signed(disp as i64))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hop {
    /// Locate `signature` in the primary module, then add `offset` to the
    /// address it references.
    Pattern { signature: CodeSignature, offset: i64 },
    /// Add `offset` to the previous address. With `deref`, the pointer stored
    /// at the previous address is followed first.
    Offset { offset: i64, deref: bool },
}

/// An ordered list of hops plus a final dereference count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerChain {
    pub name: String,
    pub hops: Vec<Hop>,
    /// Pointer-sized dereferences applied after the last hop.
    #[serde(default)]
    pub derefs: usize,
}

impl PointerChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hops: Vec::new(),
            derefs: 0,
        }
    }

    pub fn pattern(mut self, signature: CodeSignature, offset: i64) -> Self {
        self.hops.push(Hop::Pattern { signature, offset });
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.hops.push(Hop::Offset { offset, deref: false });
        self
    }

    pub fn deref_offset(mut self, offset: i64) -> Self {
        self.hops.push(Hop::Offset { offset, deref: true });
        self
    }

    pub fn derefs(mut self, count: usize) -> Self {
        self.derefs = count;
        self
    }
}

/// Resolves [`PointerChain`]s against the current attachment.
#[derive(Debug, Default)]
pub struct PointerResolver {
    /// (chain name, hop index) -> static address, valid for `generation`.
    pattern_cache: HashMap<(String, usize), u64>,
    generation: u64,
    /// Chains currently in a failure streak.
    failing: HashSet<String>,
}

impl PointerResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything learned under the previous attachment.
    pub fn reset(&mut self, generation: u64) {
        if generation != self.generation {
            debug!(
                "Pointer cache reset for attachment {} ({} entries dropped)",
                generation,
                self.pattern_cache.len()
            );
        }
        self.pattern_cache.clear();
        self.failing.clear();
        self.generation = generation;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cached_patterns(&self) -> usize {
        self.pattern_cache.len()
    }

    /// Walk `chain` left to right and return the live address.
    ///
    /// Failures are logged at `warn` once per streak and at `debug` after.
    pub fn resolve<R: ReadMemory + ?Sized>(&mut self, reader: &R, chain: &PointerChain) -> Result<u64> {
        match self.walk(reader, chain) {
            Ok(address) => {
                if self.failing.remove(&chain.name) {
                    info!("Pointer '{}' resolved again at {:#x}", chain.name, address);
                }
                Ok(address)
            }
            Err(e) => {
                if self.failing.insert(chain.name.clone()) {
                    warn!("{}", e);
                } else {
                    debug!("{}", e);
                }
                Err(e)
            }
        }
    }

    fn walk<R: ReadMemory + ?Sized>(&mut self, reader: &R, chain: &PointerChain) -> Result<u64> {
        let mut address: Option<u64> = None;

        for (index, hop) in chain.hops.iter().enumerate() {
            address = Some(match hop {
                Hop::Pattern { signature, offset } => {
                    let target = self.static_address(reader, chain, index, signature)?;
                    target.wrapping_add_signed(*offset)
                }
                Hop::Offset { offset, deref } => {
                    let previous = address.ok_or_else(|| {
                        Error::unresolved(&chain.name, index, "offset hop has no starting address")
                    })?;
                    let from = if *deref {
                        follow(reader, &chain.name, index, previous)?
                    } else {
                        previous
                    };
                    from.wrapping_add_signed(*offset)
                }
            });
        }

        let mut address =
            address.ok_or_else(|| Error::unresolved(&chain.name, 0, "chain has no hops"))?;
        for n in 0..chain.derefs {
            address = follow(reader, &chain.name, chain.hops.len() + n, address)?;
        }
        Ok(address)
    }

    fn static_address<R: ReadMemory + ?Sized>(
        &mut self,
        reader: &R,
        chain: &PointerChain,
        index: usize,
        signature: &CodeSignature,
    ) -> Result<u64> {
        let key = (chain.name.clone(), index);
        if let Some(&cached) = self.pattern_cache.get(&key) {
            return Ok(cached);
        }

        let pattern = signature.pattern_bytes()?;
        let matches = MemoryPatternScanner::new(reader)
            .scan_module(&pattern)
            .map_err(|e| Error::unresolved(&chain.name, index, e.to_string()))?;
        let first = *matches.first().ok_or_else(|| {
            Error::unresolved(&chain.name, index, "code signature not found in module")
        })?;
        if matches.len() > 1 {
            debug!(
                "Signature for '{}' matched {} times, using {:#x}",
                chain.name,
                matches.len(),
                first
            );
        }

        let target = signature
            .resolve_target(reader, first)
            .map_err(|e| Error::unresolved(&chain.name, index, e.to_string()))?;
        debug!("Pointer '{}' hop {} -> static {:#x}", chain.name, index, target);
        self.pattern_cache.insert(key, target);
        Ok(target)
    }
}

fn follow<R: ReadMemory + ?Sized>(reader: &R, name: &str, hop: usize, address: u64) -> Result<u64> {
    match reader.read_u64(address) {
        Ok(0) => Err(Error::unresolved(name, hop, format!("null pointer at {:#x}", address))),
        Ok(ptr) => Ok(ptr),
        Err(e) => Err(Error::unresolved(name, hop, e.to_string())),
    }
}
