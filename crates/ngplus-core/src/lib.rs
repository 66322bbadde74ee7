//! # ngplus-core
//!
//! Core library for the Infinite NG+ companion.
//!
//! This crate provides:
//! - Process discovery and memory access (Windows and Linux `/proc`)
//! - Signature scanning and named pointer chains
//! - The param record model and its byte codec
//! - Level scaling of record values
//! - The monitor loop that keeps a running game at the requested level

pub mod attach;
pub mod config;
pub mod error;
pub mod injector;
pub mod memory;
pub mod monitor;
pub mod persist;
pub mod record;
pub mod retry;
pub mod scaling;
pub mod search;
pub mod shutdown;

pub use attach::{AttachEvent, ProcessAttachment, ProcessSelector};
pub use config::{MonitorConfig, MonitorConfigBuilder};
pub use error::{Error, Result};
pub use injector::{InjectReport, LocateState, Located, RecordInjector};
pub use memory::{
    CodeSignature, MemoryAccess, MemoryRegion, OsProcessProvider, PointerChain, ProcessInfo,
    ProcessProvider, ReadMemory, WriteMemory,
};
pub use monitor::{MonitorHandle, MonitorLoop, MonitorState, MonitorStatus};
pub use persist::{FileLevelStore, LevelStore, MemoryLevelStore};
pub use record::{FixedRowCodec, Record, RecordCodec, RecordKind, Row};
pub use retry::{FixedDelay, NoRetry, RetryStrategy};
pub use scaling::{ScalingEngine, ScalingTable};
pub use search::{AuxiliaryScan, SearchStatus};
pub use shutdown::ShutdownSignal;
