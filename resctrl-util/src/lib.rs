// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Context, Result};
use crossbeam::channel::Sender;
use log::{info, warn};
use simplelog as sl;
use std::collections::HashMap;
use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::prelude::*;
use std::io::BufReader;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

pub mod json_file;

pub use json_file::{JsonArgs, JsonArgsHelper, JsonConfigFile, JsonLoad, JsonSave};

pub const TO_PCT: f64 = 100.0;
pub const PCT: f64 = 0.01;
pub const MB: u64 = 1 << 20;

pub fn format_size<T>(size: T) -> String
where
    T: num::ToPrimitive,
{
    let format_size_helper = |size: u64, shift: u32, suffix: &str| -> Option<String> {
        let unit: u64 = 1 << shift;
        let v = size as f64 / unit as f64;

        if v < 99.95 {
            Some(format!("{:.1}{}", v.max(0.1), suffix))
        } else if v < 1024.0 {
            Some(format!("{:.0}{}", v, suffix))
        } else {
            None
        }
    };

    let size = size.to_u64().unwrap_or(0);

    if size == 0 {
        "0".to_string()
    } else if size < 9999 {
        format!("{}", size)
    } else {
        format_size_helper(size, 10, "K")
            .or_else(|| format_size_helper(size, 20, "M"))
            .or_else(|| format_size_helper(size, 30, "G"))
            .or_else(|| format_size_helper(size, 40, "P"))
            .or_else(|| format_size_helper(size, 50, "E"))
            .unwrap_or_else(|| "INF".into())
    }
}

/// Bytes per second, e.g. "1.2G/s".
pub fn format_bandwidth(bps: f64) -> String {
    if bps.is_finite() && bps >= 0.0 {
        format_size(bps.round() as u64) + "/s"
    } else {
        "-".into()
    }
}

pub fn format_pct(ratio: f64) -> String {
    let pct = ratio * TO_PCT;
    if !pct.is_finite() {
        "INF".into()
    } else if pct == 0.0 {
        "0".into()
    } else if pct.abs() < 99.995 {
        format!("{:.02}", pct)
    } else if pct.abs() < 999.95 {
        format!("{:.01}", pct)
    } else {
        format!("{:.0}", pct)
    }
}

pub fn parse_size(input: &str) -> Result<u64> {
    lazy_static::lazy_static! {
        static ref UNITS: HashMap<char, u32> = [
            ('B', 0),
            ('K', 10),
            ('M', 20),
            ('G', 30),
            ('T', 40),
        ].iter().cloned().collect();
    }

    let parse_num = |num: &str, shift: u32| -> Result<u64> {
        Ok(if num.contains('.') {
            (num.parse::<f64>()? * (2u64.pow(shift) as f64)).round() as u64
        } else {
            num.parse::<u64>()? << shift
        })
    };

    let mut num = String::new();
    let mut sum = 0;
    for ch in input.chars() {
        let ch = ch.to_ascii_uppercase();
        match ch {
            '_' => continue,
            ch if UNITS.contains_key(&ch) => {
                sum += parse_num(num.trim(), UNITS[&ch])
                    .with_context(|| format!("invalid size {:?}", input))?;
                num.clear();
            }
            ch => num.push(ch),
        }
    }
    if !num.trim().is_empty() {
        sum += parse_num(num.trim(), 0).with_context(|| format!("invalid size {:?}", input))?;
    }
    Ok(sum)
}

fn is_executable<P: AsRef<Path>>(path_in: P) -> bool {
    match path_in.as_ref().metadata() {
        Ok(md) => md.is_file() && md.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

pub fn exe_dir() -> Result<PathBuf> {
    let mut path = env::current_exe()?;
    path.pop();
    Ok(path)
}

pub fn find_bin<N: AsRef<OsStr>, P: AsRef<OsStr>>(
    name_in: N,
    prepend_in: Option<P>,
) -> Option<PathBuf> {
    let name = name_in.as_ref();
    let mut search = OsString::new();
    if let Some(prepend) = prepend_in.as_ref() {
        search.push(prepend);
        search.push(":");
    }
    if let Some(dirs) = env::var_os("PATH") {
        search.push(dirs);
    }
    for dir in env::split_paths(&search) {
        let mut path = dir.to_owned();
        path.push(name);
        if let Ok(path) = path.canonicalize() {
            if is_executable(&path) {
                return Some(path);
            }
        }
    }
    None
}

pub fn read_one_line<P: AsRef<Path>>(path: P) -> Result<String> {
    let f = fs::OpenOptions::new().read(true).open(path)?;
    let r = BufReader::new(f);
    Ok(r.lines().next().ok_or(anyhow!("File empty"))??)
}

/// Reads a sysfs-style file holding a single unsigned integer.
pub fn read_u64<P: AsRef<Path>>(path: P) -> Result<u64> {
    let path = path.as_ref();
    let line = read_one_line(path)?;
    line.trim()
        .parse::<u64>()
        .with_context(|| format!("parsing {:?} from {:?}", &line, path))
}

/// Kernel interface files apply the whole write at once, so a short or failed
/// write means the setting was rejected.
pub fn write_one_line<P: AsRef<Path>>(path: P, line: &str) -> std::io::Result<()> {
    let mut f = fs::OpenOptions::new().write(true).open(path)?;
    f.write_all(line.as_ref())?;
    f.flush()
}

pub fn unix_now() -> u64 {
    UNIX_EPOCH.elapsed().map(|d| d.as_secs()).unwrap_or(0)
}

pub fn init_logging(verbosity: u32) {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    } else {
        let sl_level = match verbosity {
            0 | 1 => sl::LevelFilter::Info,
            2 => sl::LevelFilter::Debug,
            _ => sl::LevelFilter::Trace,
        };
        let mut lcfg = sl::ConfigBuilder::new();
        lcfg.set_time_level(sl::LevelFilter::Off)
            .set_location_level(sl::LevelFilter::Off)
            .set_target_level(sl::LevelFilter::Off)
            .set_thread_level(sl::LevelFilter::Off);
        if !console::user_attended_stderr()
            || sl::TermLogger::init(
                sl_level,
                lcfg.build(),
                sl::TerminalMode::Stderr,
                sl::ColorChoice::Auto,
            )
            .is_err()
        {
            let _ = sl::SimpleLogger::init(sl_level, lcfg.build());
        }
    }
}

/// Forwards the lines a child writes on stdout to `tx` until either side goes
/// away.
pub fn child_reader_thread(name: String, stdout: process::ChildStdout, tx: Sender<String>) {
    let reader = BufReader::new(stdout);
    for line in reader.lines() {
        match line {
            Ok(line) => {
                if let Err(e) = tx.send(line) {
                    info!("{}: Reader thread terminating ({:?})", &name, &e);
                    break;
                }
            }
            Err(e) => {
                warn!("{}: Failed to read child stdout ({:?})", &name, &e);
                break;
            }
        }
    }
}

lazy_static::lazy_static! {
    static ref PROG_EXITING: Mutex<bool> = Mutex::new(false);
}

pub fn setup_prog_state() -> Result<()> {
    if let Err(e) = ctrlc::set_handler(move || {
        info!("SIGINT/TERM received, exiting...");
        set_prog_exiting();
    }) {
        bail!("failed to set up termination handler ({})", &e);
    }
    Ok(())
}

pub fn set_prog_exiting() {
    if let Ok(mut exiting) = PROG_EXITING.lock() {
        *exiting = true;
    }
}

pub fn prog_exiting() -> bool {
    PROG_EXITING.lock().map(|x| *x).unwrap_or(true)
}
