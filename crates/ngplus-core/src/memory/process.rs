//! OS process enumeration and the live process handle.

use std::sync::Arc;

use crate::error::Result;
use crate::memory::MemoryAccess;

#[cfg(any(target_os = "windows", target_os = "linux"))]
use crate::error::Error;
#[cfg(any(target_os = "windows", target_os = "linux"))]
use crate::memory::{MemoryRegion, ReadMemory, WriteMemory};

/// One running process as seen by a [`ProcessProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Executable file name, e.g. `eldenring.exe`.
    pub name: String,
    /// Title of the process's main window, when it has one.
    pub window_title: Option<String>,
}

/// Source of running processes and handles to them.
pub trait ProcessProvider: Send {
    fn list(&self) -> Result<Vec<ProcessInfo>>;

    /// Open `pid` for reading and writing. The handle stays valid until it
    /// is dropped.
    fn open(&self, pid: u32) -> Result<Arc<dyn MemoryAccess>>;

    /// Whether [`ProcessInfo::window_title`] is populated on this platform.
    fn observes_windows(&self) -> bool {
        true
    }
}

/// The provider backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessProvider;

/// Executable names compare case-insensitively.
pub(crate) fn exe_matches(candidate: &str, wanted: &str) -> bool {
    candidate.eq_ignore_ascii_case(wanted)
}

#[cfg(target_os = "windows")]
mod platform {
    use super::*;
    use std::collections::HashMap;
    use std::ffi::c_void;

    use windows::Win32::Foundation::{BOOL, CloseHandle, HANDLE, HWND, LPARAM};
    use windows::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, MODULEENTRY32W, Module32FirstW, PROCESSENTRY32W,
        Process32FirstW, Process32NextW, TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32,
        TH32CS_SNAPPROCESS,
    };
    use windows::Win32::System::Memory::{
        MEM_COMMIT, MEMORY_BASIC_INFORMATION, PAGE_GUARD, PAGE_NOACCESS, VirtualQueryEx,
    };
    use windows::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION,
        PROCESS_VM_READ, PROCESS_VM_WRITE,
    };
    use windows::Win32::UI::WindowsAndMessaging::{
        EnumWindows, GetWindowTextW, GetWindowThreadProcessId, IsWindowVisible,
    };

    const STILL_ACTIVE: u32 = 259;
    const USER_SPACE_END: u64 = 0x7FFF_FFFF_FFFF;

    /// Handle to a foreign process opened with read/write access.
    pub struct ProcessHandle {
        handle: HANDLE,
        pub pid: u32,
        base_address: u64,
        module_size: usize,
    }

    // SAFETY: the raw handle is only passed to thread-safe Win32 calls.
    unsafe impl Send for ProcessHandle {}
    unsafe impl Sync for ProcessHandle {}

    impl ProcessHandle {
        pub fn open(pid: u32, exe_name: &str) -> Result<Self> {
            let access =
                PROCESS_VM_READ | PROCESS_VM_WRITE | PROCESS_VM_OPERATION | PROCESS_QUERY_INFORMATION;
            // SAFETY: OpenProcess has no preconditions beyond valid flags.
            let handle = unsafe { OpenProcess(access, false, pid) }
                .map_err(|e| Error::Attachment(format!("OpenProcess({}) failed: {}", pid, e)))?;

            let (base_address, module_size) = match primary_module(pid, exe_name) {
                Ok(module) => module,
                Err(e) => {
                    // SAFETY: handle was returned by OpenProcess above.
                    unsafe {
                        let _ = CloseHandle(handle);
                    }
                    return Err(e);
                }
            };

            Ok(Self {
                handle,
                pid,
                base_address,
                module_size,
            })
        }
    }

    impl Drop for ProcessHandle {
        fn drop(&mut self) {
            // SAFETY: handle is owned and closed exactly once.
            unsafe {
                let _ = CloseHandle(self.handle);
            }
        }
    }

    impl ReadMemory for ProcessHandle {
        fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
            let mut buffer = vec![0u8; size];
            let mut read = 0usize;
            // SAFETY: buffer is valid for `size` bytes.
            unsafe {
                ReadProcessMemory(
                    self.handle,
                    address as *const c_void,
                    buffer.as_mut_ptr() as *mut c_void,
                    size,
                    Some(&mut read),
                )
            }
            .map_err(|e| Error::access(address, e.to_string()))?;

            if read != size {
                return Err(Error::access(address, format!("partial read: {} of {} bytes", read, size)));
            }
            Ok(buffer)
        }

        fn base_address(&self) -> u64 {
            self.base_address
        }

        fn module_size(&self) -> usize {
            self.module_size
        }
    }

    impl WriteMemory for ProcessHandle {
        fn write_bytes(&self, address: u64, data: &[u8]) -> Result<()> {
            let mut written = 0usize;
            // SAFETY: data is valid for its length.
            unsafe {
                WriteProcessMemory(
                    self.handle,
                    address as *const c_void,
                    data.as_ptr() as *const c_void,
                    data.len(),
                    Some(&mut written),
                )
            }
            .map_err(|e| Error::access(address, e.to_string()))?;

            if written != data.len() {
                return Err(Error::access(
                    address,
                    format!("partial write: {} of {} bytes", written, data.len()),
                ));
            }
            Ok(())
        }
    }

    impl MemoryAccess for ProcessHandle {
        fn mapped_regions(&self) -> Result<Vec<MemoryRegion>> {
            let mut regions = Vec::new();
            let mut address = 0u64;
            let mut info = MEMORY_BASIC_INFORMATION::default();

            while address < USER_SPACE_END {
                // SAFETY: info is a valid out-parameter of the given size.
                let written = unsafe {
                    VirtualQueryEx(
                        self.handle,
                        Some(address as *const c_void),
                        &mut info,
                        std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                    )
                };
                if written == 0 {
                    break;
                }

                let start = info.BaseAddress as u64;
                let size = info.RegionSize as u64;
                let readable = info.State == MEM_COMMIT
                    && info.Protect.0 & PAGE_NOACCESS.0 == 0
                    && info.Protect.0 & PAGE_GUARD.0 == 0;
                if readable {
                    regions.push(MemoryRegion::new(start, size));
                }

                match start.checked_add(size) {
                    Some(next) if next > address => address = next,
                    _ => break,
                }
            }
            Ok(regions)
        }

        fn is_alive(&self) -> bool {
            let mut code = 0u32;
            // SAFETY: code is a valid out-parameter.
            unsafe { GetExitCodeProcess(self.handle, &mut code) }.is_ok() && code == STILL_ACTIVE
        }
    }

    fn primary_module(pid: u32, exe_name: &str) -> Result<(u64, usize)> {
        // SAFETY: snapshot handle is closed below.
        let snapshot =
            unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid) }
                .map_err(|e| Error::Attachment(format!("module snapshot of {} failed: {}", pid, e)))?;

        let mut entry = MODULEENTRY32W {
            dwSize: std::mem::size_of::<MODULEENTRY32W>() as u32,
            ..Default::default()
        };
        // SAFETY: entry.dwSize is initialised as required.
        let found = unsafe { Module32FirstW(snapshot, &mut entry) }.is_ok();
        // SAFETY: snapshot came from CreateToolhelp32Snapshot.
        unsafe {
            let _ = CloseHandle(snapshot);
        }

        if !found {
            return Err(Error::Attachment(format!(
                "{} (pid {}) has no readable main module yet",
                exe_name, pid
            )));
        }
        Ok((entry.modBaseAddr as u64, entry.modBaseSize as usize))
    }

    fn wide_to_string(wide: &[u16]) -> String {
        let len = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
        String::from_utf16_lossy(&wide[..len])
    }

    unsafe extern "system" fn collect_titles(hwnd: HWND, lparam: LPARAM) -> BOOL {
        // SAFETY: lparam points at the map owned by window_titles().
        let titles = unsafe { &mut *(lparam.0 as *mut HashMap<u32, String>) };
        let mut pid = 0u32;
        unsafe { GetWindowThreadProcessId(hwnd, Some(&mut pid)) };

        if unsafe { IsWindowVisible(hwnd) }.as_bool() && !titles.contains_key(&pid) {
            let mut buf = [0u16; 256];
            let len = unsafe { GetWindowTextW(hwnd, &mut buf) };
            if len > 0 {
                titles.insert(pid, wide_to_string(&buf[..len as usize]));
            }
        }
        BOOL(1)
    }

    fn window_titles() -> HashMap<u32, String> {
        let mut titles: HashMap<u32, String> = HashMap::new();
        // SAFETY: the callback only touches `titles` for the duration of the call.
        unsafe {
            let _ = EnumWindows(
                Some(collect_titles),
                LPARAM(&mut titles as *mut HashMap<u32, String> as isize),
            );
        }
        titles
    }

    pub(super) fn list_processes() -> Result<Vec<ProcessInfo>> {
        // SAFETY: snapshot handle is closed below.
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }
            .map_err(|e| Error::Attachment(format!("process snapshot failed: {}", e)))?;

        let titles = window_titles();
        let mut processes = Vec::new();
        let mut entry = PROCESSENTRY32W {
            dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
            ..Default::default()
        };

        // SAFETY: entry.dwSize is initialised as required.
        if unsafe { Process32FirstW(snapshot, &mut entry) }.is_ok() {
            loop {
                let pid = entry.th32ProcessID;
                processes.push(ProcessInfo {
                    pid,
                    name: wide_to_string(&entry.szExeFile),
                    window_title: titles.get(&pid).cloned(),
                });
                // SAFETY: same snapshot and entry as above.
                if unsafe { Process32NextW(snapshot, &mut entry) }.is_err() {
                    break;
                }
            }
        }

        // SAFETY: snapshot came from CreateToolhelp32Snapshot.
        unsafe {
            let _ = CloseHandle(snapshot);
        }
        Ok(processes)
    }

    pub(super) fn exe_name_of(pid: u32) -> Result<String> {
        list_processes()?
            .into_iter()
            .find(|p| p.pid == pid)
            .map(|p| p.name)
            .ok_or_else(|| Error::Attachment(format!("process {} not found", pid)))
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use super::*;
    use std::fs::{self, File, OpenOptions};
    use std::os::unix::fs::FileExt;
    use std::path::Path;

    /// Handle to a foreign process through `/proc/<pid>/mem`.
    pub struct ProcessHandle {
        mem: File,
        pub pid: u32,
        base_address: u64,
        module_size: usize,
    }

    impl ProcessHandle {
        pub fn open(pid: u32, exe_name: &str) -> Result<Self> {
            let mem = OpenOptions::new()
                .read(true)
                .write(true)
                .open(format!("/proc/{}/mem", pid))
                .map_err(|e| Error::Attachment(format!("cannot open memory of {}: {}", pid, e)))?;

            let maps = read_maps(pid)?;
            let image: Vec<&MapsEntry> = maps
                .iter()
                .filter(|m| {
                    m.path
                        .as_deref()
                        .and_then(|p| Path::new(p).file_name())
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| exe_matches(n, exe_name))
                })
                .collect();

            let (base_address, module_size) = match (image.first(), image.last()) {
                (Some(first), Some(last)) => (first.region.start, (last.region.end() - first.region.start) as usize),
                _ => {
                    return Err(Error::Attachment(format!(
                        "{} (pid {}) has no mapped image yet",
                        exe_name, pid
                    )));
                }
            };

            Ok(Self {
                mem,
                pid,
                base_address,
                module_size,
            })
        }
    }

    impl ReadMemory for ProcessHandle {
        fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
            let mut buffer = vec![0u8; size];
            self.mem
                .read_exact_at(&mut buffer, address)
                .map_err(|e| Error::access(address, e.to_string()))?;
            Ok(buffer)
        }

        fn base_address(&self) -> u64 {
            self.base_address
        }

        fn module_size(&self) -> usize {
            self.module_size
        }
    }

    impl WriteMemory for ProcessHandle {
        fn write_bytes(&self, address: u64, data: &[u8]) -> Result<()> {
            let written = self
                .mem
                .write_at(data, address)
                .map_err(|e| Error::access(address, e.to_string()))?;
            if written != data.len() {
                return Err(Error::access(
                    address,
                    format!("partial write: {} of {} bytes", written, data.len()),
                ));
            }
            Ok(())
        }
    }

    impl MemoryAccess for ProcessHandle {
        fn mapped_regions(&self) -> Result<Vec<MemoryRegion>> {
            Ok(read_maps(self.pid)?
                .into_iter()
                .filter(|m| m.readable)
                .map(|m| m.region)
                .collect())
        }

        fn is_alive(&self) -> bool {
            // zombies keep their /proc entry; state 'Z' counts as exited
            fs::read_to_string(format!("/proc/{}/stat", self.pid))
                .ok()
                .and_then(|stat| {
                    stat.rsplit_once(')')
                        .and_then(|(_, rest)| rest.split_whitespace().next().map(str::to_owned))
                })
                .is_some_and(|state| state != "Z" && state != "X")
        }
    }

    struct MapsEntry {
        region: MemoryRegion,
        readable: bool,
        path: Option<String>,
    }

    fn read_maps(pid: u32) -> Result<Vec<MapsEntry>> {
        let content = fs::read_to_string(format!("/proc/{}/maps", pid))?;
        Ok(content.lines().filter_map(parse_maps_line).collect())
    }

    /// `7f12..-7f13.. r-xp 00000000 08:01 123456 /path/to/image`
    fn parse_maps_line(line: &str) -> Option<MapsEntry> {
        let mut parts = line.split_whitespace();
        let (start, end) = parts.next()?.split_once('-')?;
        let perms = parts.next()?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        let path = parts.nth(3).map(str::to_owned);

        Some(MapsEntry {
            region: MemoryRegion::new(start, end.saturating_sub(start)),
            readable: perms.starts_with('r'),
            path,
        })
    }

    pub(super) fn list_processes() -> Result<Vec<ProcessInfo>> {
        let mut processes = Vec::new();
        for entry in fs::read_dir("/proc")? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            if let Ok(name) = exe_name_of(pid) {
                processes.push(ProcessInfo {
                    pid,
                    name,
                    window_title: None,
                });
            }
        }
        Ok(processes)
    }

    /// Executable name from the command line, falling back to `comm`.
    ///
    /// Windows executables under a compatibility layer show up with their
    /// `.exe` path as the first argument.
    pub(super) fn exe_name_of(pid: u32) -> Result<String> {
        let cmdline = fs::read(format!("/proc/{}/cmdline", pid))?;
        let first = cmdline.split(|&b| b == 0).next().unwrap_or_default();
        let arg0 = String::from_utf8_lossy(first);
        let name = arg0.rsplit(['/', '\\']).next().unwrap_or_default().to_string();
        if !name.is_empty() {
            return Ok(name);
        }
        Ok(fs::read_to_string(format!("/proc/{}/comm", pid))?.trim().to_string())
    }

}

#[cfg(any(target_os = "windows", target_os = "linux"))]
pub use platform::ProcessHandle;

#[cfg(any(target_os = "windows", target_os = "linux"))]
impl ProcessProvider for OsProcessProvider {
    fn list(&self) -> Result<Vec<ProcessInfo>> {
        platform::list_processes()
    }

    fn open(&self, pid: u32) -> Result<Arc<dyn MemoryAccess>> {
        let name = platform::exe_name_of(pid)?;
        Ok(Arc::new(ProcessHandle::open(pid, &name)?))
    }

    fn observes_windows(&self) -> bool {
        cfg!(target_os = "windows")
    }
}

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
impl ProcessProvider for OsProcessProvider {
    fn list(&self) -> Result<Vec<ProcessInfo>> {
        Err(crate::error::Error::Unsupported(
            "process enumeration is only available on Windows and Linux".to_string(),
        ))
    }

    fn open(&self, pid: u32) -> Result<Arc<dyn MemoryAccess>> {
        Err(crate::error::Error::Unsupported(format!(
            "cannot open process {} on this platform",
            pid
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exe_match_ignores_case() {
        assert!(exe_matches("EldenRing.EXE", "eldenring.exe"));
        assert!(!exe_matches("start_protected_game.exe", "eldenring.exe"));
    }
}
