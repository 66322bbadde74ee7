//! Runtime configuration and defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::memory::MemoryRegion;

/// Timing defaults
pub mod timing {
    use std::time::Duration;

    /// How often the process list is polled while detached
    pub const POLL_INTERVAL: Duration = Duration::from_millis(1000);
    /// A candidate must be seen this long before it is attached to
    pub const MIN_LIFETIME: Duration = Duration::from_millis(1000);
    /// Monitor loop period while attached
    pub const TICK_INTERVAL: Duration = Duration::from_millis(33);
    /// Backoff between record scan attempts
    pub const SCAN_RETRY_DELAY: Duration = Duration::from_secs(5);
    pub const SCAN_MAX_ATTEMPTS: u32 = 5;
}

/// Where the host keeps its parameter tables
pub mod scan {
    pub const REGION_BASE: u64 = 0x7FF4_0000_0000;
    pub const REGION_STRIDE: u64 = 0x1000_0000;
    pub const REGION_SIZE: u64 = 0x0FFF_FFFF;
    pub const REGION_COUNT: u64 = 15;
}

/// Target process defaults
pub mod target {
    pub const EXE_NAME: &str = "eldenring.exe";
    pub const WINDOW_TITLE: &str = "ELDEN RING™";
    pub const LEVEL_FILE: &str = "LAST_NG_LEVEL.cfg";
    /// Consecutive failed accesses before the process is treated as gone
    pub const ACCESS_ERROR_THRESHOLD: u32 = 3;
}

/// The fifteen scan windows the parameter tables are allocated in.
pub fn default_regions() -> Vec<MemoryRegion> {
    (0..scan::REGION_COUNT)
        .map(|k| MemoryRegion::new(scan::REGION_BASE + k * scan::REGION_STRIDE, scan::REGION_SIZE))
        .collect()
}

/// Configuration for the monitor and its process attachment
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Executable name of the target process
    pub exe_name: String,
    /// Required main window title, if any
    pub window_title: Option<String>,
    pub poll_interval: Duration,
    pub min_lifetime: Duration,
    pub tick_interval: Duration,
    /// Declared windows scanned for records
    pub regions: Vec<MemoryRegion>,
    /// Where the last applied level is kept between runs
    pub level_file: PathBuf,
    pub scan_max_attempts: u32,
    pub scan_retry_delay: Duration,
    pub access_error_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            exe_name: target::EXE_NAME.to_string(),
            window_title: Some(target::WINDOW_TITLE.to_string()),
            poll_interval: timing::POLL_INTERVAL,
            min_lifetime: timing::MIN_LIFETIME,
            tick_interval: timing::TICK_INTERVAL,
            regions: default_regions(),
            level_file: PathBuf::from(target::LEVEL_FILE),
            scan_max_attempts: timing::SCAN_MAX_ATTEMPTS,
            scan_retry_delay: timing::SCAN_RETRY_DELAY,
            access_error_threshold: target::ACCESS_ERROR_THRESHOLD,
        }
    }
}

impl MonitorConfig {
    /// Create a new configuration builder
    pub fn builder() -> MonitorConfigBuilder {
        MonitorConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.exe_name.trim().is_empty() {
            return Err(Error::Config("executable name is empty".to_string()));
        }
        if self.regions.is_empty() {
            return Err(Error::Config("no scan regions configured".to_string()));
        }
        if let Some(empty) = self.regions.iter().find(|r| r.size == 0) {
            return Err(Error::Config(format!("scan region at {:#x} is empty", empty.start)));
        }
        if self.scan_max_attempts == 0 {
            return Err(Error::Config("scan attempts must be at least 1".to_string()));
        }
        if self.access_error_threshold == 0 {
            return Err(Error::Config("access error threshold must be at least 1".to_string()));
        }
        if self.tick_interval.is_zero() || self.poll_interval.is_zero() {
            return Err(Error::Config("poll and tick intervals must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Builder for MonitorConfig
#[derive(Debug, Clone, Default)]
pub struct MonitorConfigBuilder {
    exe_name: Option<String>,
    window_title: Option<Option<String>>,
    poll_interval: Option<Duration>,
    min_lifetime: Option<Duration>,
    tick_interval: Option<Duration>,
    regions: Option<Vec<MemoryRegion>>,
    level_file: Option<PathBuf>,
    scan_max_attempts: Option<u32>,
    scan_retry_delay: Option<Duration>,
    access_error_threshold: Option<u32>,
}

impl MonitorConfigBuilder {
    pub fn exe_name(mut self, name: impl Into<String>) -> Self {
        self.exe_name = Some(name.into());
        self
    }

    /// Require a main window title; `None` matches on executable name only.
    pub fn window_title(mut self, title: Option<String>) -> Self {
        self.window_title = Some(title);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn min_lifetime(mut self, lifetime: Duration) -> Self {
        self.min_lifetime = Some(lifetime);
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval);
        self
    }

    pub fn regions(mut self, regions: Vec<MemoryRegion>) -> Self {
        self.regions = Some(regions);
        self
    }

    pub fn level_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.level_file = Some(path.into());
        self
    }

    pub fn scan_retry(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.scan_max_attempts = Some(max_attempts);
        self.scan_retry_delay = Some(delay);
        self
    }

    pub fn access_error_threshold(mut self, threshold: u32) -> Self {
        self.access_error_threshold = Some(threshold);
        self
    }

    /// Build the configuration
    pub fn build(self) -> MonitorConfig {
        let default = MonitorConfig::default();
        MonitorConfig {
            exe_name: self.exe_name.unwrap_or(default.exe_name),
            window_title: self.window_title.unwrap_or(default.window_title),
            poll_interval: self.poll_interval.unwrap_or(default.poll_interval),
            min_lifetime: self.min_lifetime.unwrap_or(default.min_lifetime),
            tick_interval: self.tick_interval.unwrap_or(default.tick_interval),
            regions: self.regions.unwrap_or(default.regions),
            level_file: self.level_file.unwrap_or(default.level_file),
            scan_max_attempts: self.scan_max_attempts.unwrap_or(default.scan_max_attempts),
            scan_retry_delay: self.scan_retry_delay.unwrap_or(default.scan_retry_delay),
            access_error_threshold: self
                .access_error_threshold
                .unwrap_or(default.access_error_threshold),
        }
    }
}
