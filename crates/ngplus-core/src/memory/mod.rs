//! Foreign-process memory access.
//!
//! Everything that touches another process's address space goes through the
//! traits in [`reader`]. The OS implementation lives in [`process`]; tests use
//! the sparse in-memory [`mock`].

pub mod pattern;
pub mod pointer;
mod process;
mod reader;
mod region;
pub mod scanner;

// Mock memory for testing (always available for unit and integration tests)
#[doc(hidden)]
pub mod mock;

pub use pattern::parse_pattern;
pub use pointer::{CodeSignature, Hop, PointerChain, PointerResolver};
pub use process::*;
pub(crate) use process::exe_matches;
pub use reader::{MemoryAccess, ReadMemory, WriteMemory};
pub use region::{MemoryRegion, clip_regions};
pub use scanner::MemoryPatternScanner;

#[doc(hidden)]
pub use mock::{MockMemory, MockMemoryBuilder, MockProcessProvider};
