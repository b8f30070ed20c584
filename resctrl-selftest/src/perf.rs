// Copyright (c) Facebook, Inc. and its affiliates.
//
// Minimal perf_event_open(2) plumbing: core LLC events for a task and
// uncore IMC CAS counts for a CPU.
use glob::glob;
use log::{debug, trace};
use scan_fmt::scan_fmt;
use std::fs;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
pub const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;

const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;
const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_RESET: libc::c_ulong = 0x2403;

const ATTR_DISABLED: u64 = 1 << 0;
const ATTR_INHERIT: u64 = 1 << 1;
const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;
const ATTR_EXCLUDE_HV: u64 = 1 << 6;

/// Each CAS command moves one 64-byte cache line.
pub const CAS_LINE_SIZE: u64 = 64;
pub const UNCORE_IMC_GLOB: &str = "/sys/bus/event_source/devices/uncore_imc_*";

/// `struct perf_event_attr` as of PERF_ATTR_SIZE_VER5.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub reserved_2: u16,
}

impl PerfEventAttr {
    pub fn new(type_: u32, config: u64) -> Self {
        Self {
            type_,
            size: mem::size_of::<Self>() as u32,
            config,
            flags: ATTR_DISABLED,
            ..Default::default()
        }
    }

    /// Counts in user space only, following the task into its children.
    pub fn task_hw(config: u64) -> Self {
        let mut attr = Self::new(PERF_TYPE_HARDWARE, config);
        attr.flags |= ATTR_INHERIT | ATTR_EXCLUDE_KERNEL | ATTR_EXCLUDE_HV;
        attr
    }
}

/// An open perf event fd, closed on drop.
#[derive(Debug)]
pub struct PerfEvent {
    fd: RawFd,
    name: String,
}

impl PerfEvent {
    pub fn open(attr: &PerfEventAttr, pid: i32, cpu: i32, name: &str) -> io::Result<Self> {
        let fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                attr as *const PerfEventAttr,
                pid,
                cpu,
                -1 as libc::c_int,
                PERF_FLAG_FD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        debug!("perf: opened {} (pid={} cpu={} fd={})", name, pid, cpu, fd);
        Ok(Self {
            fd: fd as RawFd,
            name: name.into(),
        })
    }

    fn ioctl(&self, req: libc::c_ulong) -> io::Result<()> {
        if unsafe { libc::ioctl(self.fd, req as _, 0) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn reset_and_enable(&self) -> io::Result<()> {
        self.ioctl(PERF_EVENT_IOC_RESET)?;
        self.ioctl(PERF_EVENT_IOC_ENABLE)
    }

    pub fn read(&self) -> io::Result<u64> {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if ret as usize != mem::size_of::<u64>() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short read from perf event {}", &self.name),
            ));
        }
        trace!("perf: {} = {}", &self.name, val);
        Ok(val)
    }
}

impl Drop for PerfEvent {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// One uncore memory controller PMU and its CAS events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImcPmu {
    pub name: String,
    pub type_: u32,
    pub cas_read: u64,
    pub cas_write: u64,
}

/// Parses an event description such as `event=0x04,umask=0x03` into a raw
/// config value.
pub fn parse_event_config(desc: &str) -> Option<u64> {
    let mut event = None;
    let mut umask = 0;
    for tok in desc.trim().split(',') {
        let (key, val) = scan_fmt!(tok, "{}={}", String, String).ok()?;
        let val = val.trim_start_matches("0x");
        let val = u64::from_str_radix(val, 16).ok()?;
        match key.as_str() {
            "event" => event = Some(val),
            "umask" => umask = val,
            _ => {}
        }
    }
    Some(event? | (umask << 8))
}

fn read_trimmed(path: &Path) -> io::Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

impl ImcPmu {
    pub fn load(dir: &Path) -> io::Result<Self> {
        let invalid = |what: &str| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid {} in {:?}", what, dir),
            )
        };
        let type_ = read_trimmed(&dir.join("type"))?
            .parse::<u32>()
            .map_err(|_| invalid("type"))?;
        let cas_read = parse_event_config(&read_trimmed(&dir.join("events/cas_count_read"))?)
            .ok_or_else(|| invalid("cas_count_read"))?;
        let cas_write = parse_event_config(&read_trimmed(&dir.join("events/cas_count_write"))?)
            .ok_or_else(|| invalid("cas_count_write"))?;
        Ok(Self {
            name: dir
                .file_name()
                .map(|x| x.to_string_lossy().to_string())
                .unwrap_or_default(),
            type_,
            cas_read,
            cas_write,
        })
    }

    /// All memory controller PMUs matching `pattern`.
    pub fn discover(pattern: &str) -> io::Result<Vec<Self>> {
        let paths: Vec<PathBuf> = glob(pattern)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{}", &e)))?
            .filter_map(|x| x.ok())
            .collect();
        let mut pmus = vec![];
        for path in paths {
            pmus.push(Self::load(&path)?);
        }
        if pmus.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no memory controller PMU matches {:?}", pattern),
            ));
        }
        Ok(pmus)
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_event_config, ImcPmu, PerfEventAttr};
    use std::fs;

    #[test]
    fn test_attr_layout() {
        assert_eq!(std::mem::size_of::<PerfEventAttr>(), 112);
        let attr = PerfEventAttr::task_hw(super::PERF_COUNT_HW_CACHE_MISSES);
        assert_eq!(attr.size, 112);
        assert_eq!(attr.flags, 0x63);
    }

    #[test]
    fn test_parse_event_config() {
        assert_eq!(parse_event_config("event=0x04,umask=0x03"), Some(0x0304));
        assert_eq!(parse_event_config("event=0x04,umask=0x0c\n"), Some(0x0c04));
        assert_eq!(parse_event_config("event=0xff"), Some(0xff));
        assert_eq!(parse_event_config("umask=0x03"), None);
        assert_eq!(parse_event_config("bogus"), None);
    }

    #[test]
    fn test_discover() {
        let dir = tempfile::tempdir().unwrap();
        for (idx, name) in ["uncore_imc_0", "uncore_imc_1"].iter().enumerate() {
            let pmu = dir.path().join(name);
            fs::create_dir_all(pmu.join("events")).unwrap();
            fs::write(pmu.join("type"), format!("{}\n", 14 + idx)).unwrap();
            fs::write(pmu.join("events/cas_count_read"), "event=0x04,umask=0x03\n").unwrap();
            fs::write(pmu.join("events/cas_count_write"), "event=0x04,umask=0x0c\n").unwrap();
        }

        let pattern = format!("{}/uncore_imc_*", dir.path().display());
        let pmus = ImcPmu::discover(&pattern).unwrap();
        assert_eq!(pmus.len(), 2);
        assert_eq!(pmus[0].name, "uncore_imc_0");
        assert_eq!(pmus[1].type_, 15);
        assert_eq!((pmus[1].cas_read, pmus[1].cas_write), (0x0304, 0x0c04));

        let pattern = format!("{}/nothing_*", dir.path().display());
        assert!(ImcPmu::discover(&pattern).is_err());
    }
}
