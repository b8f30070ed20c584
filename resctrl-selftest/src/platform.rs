// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::{debug, warn};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

use super::resctrlfs::ResctrlFs;
use resctrl_util::*;

const CPUINFO_PATH: &str = "/proc/cpuinfo";
const SYSFS_CPU_PATH: &str = "/sys/devices/system/cpu";

#[derive(Debug, Error)]
#[error("{0}")]
pub struct PrivilegeError(pub String);

/// resctrl writes and perf uncore events both need root.
pub fn check_privilege() -> Result<(), PrivilegeError> {
    if !nix::unistd::geteuid().is_root() {
        return Err(PrivilegeError(
            "must be run as root to write resctrl and open perf events".into(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Intel,
    Amd,
    Unknown,
}

impl Vendor {
    pub fn from_cpuinfo(cpuinfo: &str) -> Self {
        for line in cpuinfo.lines() {
            if let Some((key, val)) = line.split_once(':') {
                if key.trim() == "vendor_id" {
                    return match val.trim() {
                        "GenuineIntel" => Self::Intel,
                        "AuthenticAMD" => Self::Amd,
                        _ => Self::Unknown,
                    };
                }
            }
        }
        Self::Unknown
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Intel => write!(f, "Intel"),
            Self::Amd => write!(f, "AMD"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    pub cat_l3: bool,
    pub mba: bool,
    pub cqm: bool,
    pub mbm_total: bool,
    pub mbm_local: bool,
}

impl Features {
    pub fn probe(fs: &ResctrlFs) -> Self {
        let mon = match fs.mon_features() {
            Ok(v) => v,
            Err(e) => {
                debug!("resctrl: no monitoring features ({})", &e);
                vec![]
            }
        };
        let has_mon = |name: &str| mon.iter().any(|x| x == name);
        Self {
            cat_l3: fs.has_resource("L3"),
            mba: fs.has_resource("MB"),
            cqm: has_mon("llc_occupancy"),
            mbm_total: has_mon("mbm_total_bytes"),
            mbm_local: has_mon("mbm_local_bytes"),
        }
    }
}

/// The L3 cache a CPU sits behind. `id` is the resctrl domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L3Cache {
    pub id: u32,
    pub size: u64,
}

pub trait PlatformCapabilities {
    fn vendor(&self) -> Vendor;
    fn features(&self) -> Features;
    fn l3_cache(&self, cpu: u32) -> Result<L3Cache>;
}

pub struct SystemPlatform {
    vendor: Vendor,
    features: Features,
    sysfs_cpu: PathBuf,
}

impl SystemPlatform {
    pub fn probe(fs: &ResctrlFs) -> Self {
        let vendor = match fs::read_to_string(CPUINFO_PATH) {
            Ok(v) => Vendor::from_cpuinfo(&v),
            Err(e) => {
                warn!("platform: failed to read {} ({})", CPUINFO_PATH, &e);
                Vendor::Unknown
            }
        };
        let features = Features::probe(fs);
        debug!("platform: vendor={} features={:?}", vendor, &features);
        Self {
            vendor,
            features,
            sysfs_cpu: PathBuf::from(SYSFS_CPU_PATH),
        }
    }
}

impl PlatformCapabilities for SystemPlatform {
    fn vendor(&self) -> Vendor {
        self.vendor
    }

    fn features(&self) -> Features {
        self.features
    }

    fn l3_cache(&self, cpu: u32) -> Result<L3Cache> {
        let dir = self
            .sysfs_cpu
            .join(format!("cpu{}", cpu))
            .join("cache/index3");
        let id = read_u64(dir.join("id"))? as u32;
        let size_path = dir.join("size");
        let size = parse_size(&read_one_line(&size_path)?)
            .with_context(|| format!("parsing {:?}", &size_path))?;
        Ok(L3Cache { id, size })
    }
}
