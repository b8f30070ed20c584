// Copyright (c) Facebook, Inc. and its affiliates.
use log::{debug, error, info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::schema::Limit;
use resctrl_util::*;

/// A failed operation on the resctrl tree. Never swallowed: a write that
/// didn't land means the kernel never applied the configuration.
#[derive(Debug, Error)]
#[error("resctrl: {op} {path:?} failed ({source})")]
pub struct FsError {
    pub op: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl FsError {
    pub fn new(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self {
            op,
            path: path.to_owned(),
            source,
        }
    }

    pub fn invalid(op: &'static str, path: &Path, msg: String) -> Self {
        Self::new(op, path, io::Error::new(io::ErrorKind::InvalidData, msg))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// The resctrl filesystem proper.
    Kernel,
    /// An ordinary directory. Creating a group lays out the entries the
    /// kernel would have populated. Used for dry runs and tests.
    Plain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupRef {
    Control(String),
    Monitor { parent: Option<String>, name: String },
}

impl GroupRef {
    pub fn control(name: &str) -> Self {
        Self::Control(name.into())
    }

    pub fn monitor(parent: Option<&str>, name: &str) -> Self {
        Self::Monitor {
            parent: parent.map(|x| x.to_string()),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Control(name) => name,
            Self::Monitor { name, .. } => name,
        }
    }

    pub fn path(&self, root: &Path) -> PathBuf {
        match self {
            Self::Control(name) => root.join(name),
            Self::Monitor { parent, name } => {
                let mut path = root.to_owned();
                if let Some(parent) = parent {
                    path.push(parent);
                }
                path.push("mon_groups");
                path.push(name);
                path
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonCounter {
    LlcOccupancy,
    MbmTotal,
}

impl MonCounter {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::LlcOccupancy => "llc_occupancy",
            Self::MbmTotal => "mbm_total_bytes",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResctrlFs {
    root: PathBuf,
    backing: Backing,
}

impl ResctrlFs {
    pub fn new<P: AsRef<Path>>(root: P, backing: Backing) -> Self {
        Self {
            root: root.as_ref().to_owned(),
            backing,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_mounted(&self) -> Result<bool, FsError> {
        match self.backing {
            Backing::Plain => Ok(self.root.is_dir()),
            Backing::Kernel => {
                let mounts = proc_mounts::MountIter::new()
                    .map_err(|e| FsError::new("scan mounts for", &self.root, e))?;
                for mount in mounts {
                    let mount = mount.map_err(|e| FsError::new("scan mounts for", &self.root, e))?;
                    if mount.fstype == "resctrl" && mount.dest == self.root {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Mounts resctrl at the root. An existing mount is reused unless
    /// `remount` is set, in which case it's torn down first so that no stale
    /// groups from an earlier run survive.
    pub fn mount(&self, remount: bool) -> Result<(), FsError> {
        if self.backing == Backing::Plain {
            return fs::create_dir_all(&self.root).map_err(|e| FsError::new("create", &self.root, e));
        }

        if self.is_mounted()? {
            if !remount {
                debug!("resctrl: reusing existing mount at {:?}", &self.root);
                return Ok(());
            }
            self.unmount()?;
        }

        nix::mount::mount(
            Some("resctrl"),
            &self.root,
            Some("resctrl"),
            nix::mount::MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|e| FsError::new("mount", &self.root, e.into()))?;
        info!("resctrl: mounted at {:?}", &self.root);
        Ok(())
    }

    /// Like `mount()` but unmounts again when the returned guard goes out of
    /// scope, unless `keep` is set.
    pub fn mount_scoped(&self, remount: bool, keep: bool) -> Result<MountGuard<'_>, FsError> {
        self.mount(remount)?;
        Ok(MountGuard { rfs: self, keep })
    }

    pub fn unmount(&self) -> Result<(), FsError> {
        if !self.is_mounted()? {
            return Ok(());
        }
        if self.backing == Backing::Plain {
            return fs::remove_dir_all(&self.root)
                .map_err(|e| FsError::new("remove", &self.root, e));
        }
        nix::mount::umount(&self.root).map_err(|e| FsError::new("unmount", &self.root, e.into()))?;
        info!("resctrl: unmounted {:?}", &self.root);
        Ok(())
    }

    fn populate_plain(&self, group: &GroupRef, path: &Path) -> Result<(), FsError> {
        let mut files = vec!["tasks"];
        let mut dirs = vec!["mon_data"];
        if let GroupRef::Control(_) = group {
            files.push("schemata");
            dirs.push("mon_groups");
        }
        for dir in dirs {
            let p = path.join(dir);
            fs::create_dir_all(&p).map_err(|e| FsError::new("create", &p, e))?;
        }
        for file in files {
            let p = path.join(file);
            if !p.exists() {
                fs::write(&p, "").map_err(|e| FsError::new("create", &p, e))?;
            }
        }
        Ok(())
    }

    /// Creates the group directory. A left-over directory from an earlier
    /// crashed run is reused.
    pub fn create_group(&self, group: &GroupRef) -> Result<PathBuf, FsError> {
        let path = group.path(&self.root);
        match fs::create_dir(&path) {
            Ok(()) => debug!("resctrl: created {:?}", &path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn!("resctrl: {:?} already exists, reusing", &path)
            }
            Err(e) => return Err(FsError::new("create", &path, e)),
        }
        if self.backing == Backing::Plain {
            self.populate_plain(group, &path)?;
        }
        Ok(path)
    }

    /// Removing a group which is already gone is not an error.
    pub fn remove_group(&self, group: &GroupRef) -> Result<(), FsError> {
        let path = group.path(&self.root);
        let started_at = Instant::now();

        loop {
            let res = match self.backing {
                Backing::Kernel => fs::remove_dir(&path),
                Backing::Plain => fs::remove_dir_all(&path),
            };
            let e = match res {
                Ok(()) => {
                    debug!("resctrl: removed {:?}", &path);
                    return Ok(());
                }
                Err(e) => e,
            };

            match e.raw_os_error() {
                Some(libc::ENOENT) => return Ok(()),
                Some(libc::EBUSY) | Some(libc::ENOTEMPTY)
                    if started_at.elapsed() < Duration::from_secs(1) =>
                {
                    debug!("resctrl: {:?} busy, trying to remove again", &path);
                    sleep(Duration::from_millis(10));
                }
                _ => return Err(FsError::new("remove", &path, e)),
            }
        }
    }

    pub fn write_schema(&self, group: &GroupRef, line: &str) -> Result<(), FsError> {
        let path = group.path(&self.root).join("schemata");
        debug!("resctrl: writing {:?} to {:?}", line, &path);
        write_one_line(&path, &format!("{}\n", line))
            .map_err(|e| FsError::new("write schemata", &path, e))
    }

    pub fn read_schema(&self, group: &GroupRef) -> Result<Vec<String>, FsError> {
        let path = group.path(&self.root).join("schemata");
        let body = fs::read_to_string(&path).map_err(|e| FsError::new("read", &path, e))?;
        Ok(body
            .lines()
            .map(|x| x.trim().to_string())
            .filter(|x| !x.is_empty())
            .collect())
    }

    pub fn assign_process(&self, group: &GroupRef, pid: u32) -> Result<(), FsError> {
        let path = group.path(&self.root).join("tasks");
        write_one_line(&path, &format!("{}\n", pid))
            .map_err(|e| FsError::new("assign pid to", &path, e))
    }

    pub fn counter_path(&self, group: &GroupRef, domain: u32, counter: MonCounter) -> PathBuf {
        group
            .path(&self.root)
            .join("mon_data")
            .join(format!("mon_L3_{:02}", domain))
            .join(counter.file_name())
    }

    /// The kernel reports "Unavailable" until the counter has valid data,
    /// which surfaces as an error here and is retried by the sampler.
    pub fn read_counter(
        &self,
        group: &GroupRef,
        domain: u32,
        counter: MonCounter,
    ) -> Result<u64, FsError> {
        let path = self.counter_path(group, domain, counter);
        let line = read_one_line(&path).map_err(|e| match e.downcast::<io::Error>() {
            Ok(e) => FsError::new("read", &path, e),
            Err(e) => FsError::invalid("read", &path, format!("{}", e)),
        })?;
        let line = line.trim();
        line.parse::<u64>()
            .map_err(|_| FsError::invalid("read", &path, format!("counter reads {:?}", line)))
    }

    fn info_path(&self, resource: &str, file: &str) -> PathBuf {
        self.root.join("info").join(resource).join(file)
    }

    fn read_info(&self, resource: &str, file: &str) -> Result<String, FsError> {
        let path = self.info_path(resource, file);
        read_one_line(&path)
            .map(|x| x.trim().to_string())
            .map_err(|e| FsError::invalid("read", &path, format!("{:#}", e)))
    }

    fn read_info_u32(&self, resource: &str, file: &str) -> Result<u32, FsError> {
        let line = self.read_info(resource, file)?;
        line.parse::<u32>().map_err(|_| {
            FsError::invalid(
                "parse",
                &self.info_path(resource, file),
                format!("{:?} is not a number", line),
            )
        })
    }

    pub fn has_resource(&self, resource: &str) -> bool {
        self.root.join("info").join(resource).is_dir()
    }

    pub fn cbm_mask(&self, resource: &str) -> Result<u64, FsError> {
        let line = self.read_info(resource, "cbm_mask")?;
        u64::from_str_radix(&line, 16).map_err(|_| {
            FsError::invalid(
                "parse",
                &self.info_path(resource, "cbm_mask"),
                format!("{:?} is not a hex mask", line),
            )
        })
    }

    pub fn min_cbm_bits(&self, resource: &str) -> Result<u32, FsError> {
        self.read_info_u32(resource, "min_cbm_bits")
    }

    pub fn bandwidth_gran(&self) -> Result<u32, FsError> {
        self.read_info_u32("MB", "bandwidth_gran")
    }

    pub fn min_bandwidth(&self) -> Result<u32, FsError> {
        self.read_info_u32("MB", "min_bandwidth")
    }

    pub fn mon_features(&self) -> Result<Vec<String>, FsError> {
        let path = self.info_path("L3_MON", "mon_features");
        let body = fs::read_to_string(&path).map_err(|e| FsError::new("read", &path, e))?;
        Ok(body
            .lines()
            .map(|x| x.trim().to_string())
            .filter(|x| !x.is_empty())
            .collect())
    }
}

/// A control group and its monitor group, owned by one run. The directories
/// are removed on `teardown()` or, failing that, on drop, so that no group
/// survives the run that created it.
#[derive(Debug)]
pub struct ResourceGroup {
    fs: ResctrlFs,
    ctrl: GroupRef,
    mon: GroupRef,
    core: u32,
    domain: u32,
    limit: Option<Limit>,
    pid: Option<u32>,
    torn_down: bool,
}

impl ResourceGroup {
    pub fn create(
        fs: &ResctrlFs,
        ctrl_name: &str,
        mon_name: &str,
        core: u32,
        domain: u32,
    ) -> Result<Self, FsError> {
        let mut grp = Self {
            fs: fs.clone(),
            ctrl: GroupRef::control(ctrl_name),
            mon: GroupRef::monitor(Some(ctrl_name), mon_name),
            core,
            domain,
            limit: None,
            pid: None,
            // Nothing to remove until the control group exists.
            torn_down: true,
        };
        fs.create_group(&grp.ctrl)?;
        grp.torn_down = false;
        fs.create_group(&grp.mon)?;
        Ok(grp)
    }

    pub fn ctrl(&self) -> &GroupRef {
        &self.ctrl
    }

    pub fn mon(&self) -> &GroupRef {
        &self.mon
    }

    pub fn core(&self) -> u32 {
        self.core
    }

    pub fn domain(&self) -> u32 {
        self.domain
    }

    pub fn limit(&self) -> Option<&Limit> {
        self.limit.as_ref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Writes the limit and reads the schemata back to confirm that the
    /// kernel took it.
    pub fn apply_limit(&mut self, limit: &Limit) -> Result<(), FsError> {
        let line = limit.schema_line(self.domain);
        self.fs.write_schema(&self.ctrl, &line)?;

        let lines = self.fs.read_schema(&self.ctrl)?;
        if !limit.is_applied(&lines, self.domain) {
            return Err(FsError::invalid(
                "verify",
                &self.ctrl.path(self.fs.root()).join("schemata"),
                format!("{:?} not reflected in {:?}", &line, &lines),
            ));
        }
        info!("resctrl: {} set to {:?}", self.ctrl.name(), &line);
        self.limit = Some(limit.clone());
        Ok(())
    }

    pub fn assign(&mut self, pid: u32) -> Result<(), FsError> {
        self.fs.assign_process(&self.ctrl, pid)?;
        self.fs.assign_process(&self.mon, pid)?;
        self.pid = Some(pid);
        Ok(())
    }

    fn remove(&mut self) -> Result<(), FsError> {
        if self.torn_down {
            return Ok(());
        }
        let res = self
            .fs
            .remove_group(&self.mon)
            .and(self.fs.remove_group(&self.ctrl));
        self.torn_down = res.is_ok();
        res
    }

    pub fn teardown(mut self) -> Result<(), FsError> {
        self.remove()
    }
}

pub struct MountGuard<'a> {
    rfs: &'a ResctrlFs,
    keep: bool,
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if self.keep {
            debug!("resctrl: leaving {:?} mounted", self.rfs.root());
            return;
        }
        if let Err(e) = self.rfs.unmount() {
            warn!("resctrl: Failed to unmount ({})", &e);
        }
    }
}

impl Drop for ResourceGroup {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            error!(
                "resctrl: Failed to tear down group {:?} ({})",
                self.ctrl.name(),
                &e
            );
        }
    }
}
