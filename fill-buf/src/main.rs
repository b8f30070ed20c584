// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Result};
use clap::{App, AppSettings, ArgMatches};
use log::{debug, error, info};
use nix::sys::signal::{SigSet, Signal};
use std::io::{BufRead, Write};
use std::os::unix::process::CommandExt;
use std::process::{exit, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::spawn;

use resctrl_selftest_intf::{FillOp, EXEC_FAILED_CODE, GO_AHEAD};
use resctrl_util::*;

mod buffer;

use buffer::FillBuf;

const DFL_SPAN: u64 = 250 * MB;

const ARGS_STR: &str = "\
--span=[SIZE]  'Size of the buffer to stream through (default: 250M)'
--op=[OP]      'Access pattern, read or write (default: read)'
-v...          'Sets the level of verbosity'
[CMD]...       'Command to exec on start instead of filling the buffer'";

const AFTER_HELP: &str = "\
Waits for a \"go\" line on stdin, prepares the buffer and prints \"ready\" on
stdout. Starts on SIGUSR1 and exits on SIGUSR2. With CMD, it's exec'd on
SIGUSR1 instead. SIGINT and SIGTERM are ignored, the controller stops it.
";

fn parse_op(input: &str) -> Result<FillOp> {
    match input {
        "read" => Ok(FillOp::Read),
        "write" => Ok(FillOp::Write),
        _ => bail!("unknown op {:?}", input),
    }
}

struct Config {
    span: u64,
    op: FillOp,
    cmd: Option<Vec<String>>,
}

impl Config {
    fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let span = match matches.value_of("span") {
            Some(v) => parse_size(v)?,
            None => DFL_SPAN,
        };
        if span == 0 {
            bail!("span must be positive");
        }
        let op = parse_op(matches.value_of("op").unwrap_or("read"))?;
        let cmd = matches
            .values_of("CMD")
            .map(|vals| vals.map(|x| x.to_string()).collect::<Vec<String>>());
        Ok(Self { span, op, cmd })
    }
}

fn phase_sigset() -> SigSet {
    let mut sigs = SigSet::empty();
    for sig in [
        Signal::SIGUSR1,
        Signal::SIGUSR2,
        Signal::SIGINT,
        Signal::SIGTERM,
    ] {
        sigs.add(sig);
    }
    sigs
}

/// Blocks until the controller sends the go-ahead line.
fn wait_go_ahead<R: BufRead>(mut input: R) -> Result<()> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        bail!("stdin closed before the go-ahead");
    }
    if line.trim() != GO_AHEAD {
        bail!("expected {:?} on stdin, got {:?}", GO_AHEAD, line.trim());
    }
    Ok(())
}

fn is_phase(sig: Signal) -> bool {
    matches!(sig, Signal::SIGUSR1 | Signal::SIGUSR2)
}

/// Waits for the next phase signal, swallowing the others in `sigs`.
fn wait_phase(sigs: &SigSet) -> Result<Signal> {
    loop {
        let sig = sigs.wait()?;
        if is_phase(sig) {
            return Ok(sig);
        }
        debug!("fill-buf: ignoring {}", sig);
    }
}

fn exec_cmd(cmd: &[String], sigs: &SigSet) -> ! {
    // The blocked mask survives exec.
    if let Err(e) = sigs.thread_unblock() {
        error!("fill-buf: failed to unblock signals ({})", &e);
        exit(EXEC_FAILED_CODE);
    }
    let e = Command::new(&cmd[0]).args(&cmd[1..]).exec();
    error!("fill-buf: failed to exec {:?} ({})", cmd, &e);
    exit(EXEC_FAILED_CODE);
}

fn run(cfg: Config) -> Result<()> {
    let sigs = phase_sigset();
    // Block before any thread gets spawned so that all of them inherit it.
    sigs.thread_block()?;

    // Nothing may be touched before we're pinned and in the group.
    wait_go_ahead(std::io::stdin().lock())?;

    let buf = match cfg.cmd.as_ref() {
        Some(cmd) => {
            if cmd.is_empty() {
                bail!("empty command");
            }
            None
        }
        None => {
            let buf = FillBuf::new(cfg.span);
            debug!(
                "fill-buf: initialized {} for {}",
                format_size(buf.len()),
                cfg.op.as_str()
            );
            Some(buf)
        }
    };

    println!("ready");
    std::io::stdout().flush()?;

    if wait_phase(&sigs)? == Signal::SIGUSR2 {
        info!("fill-buf: stopped before start");
        return Ok(());
    }

    let mut buf = match (buf, cfg.cmd.as_ref()) {
        (Some(buf), _) => buf,
        (None, Some(cmd)) => exec_cmd(cmd, &sigs),
        (None, None) => bail!("nothing to run"),
    };

    let stop = Arc::new(AtomicBool::new(false));
    let stop_copy = stop.clone();
    let op = cfg.op;
    let worker = spawn(move || buf.run(op, &stop_copy));

    while wait_phase(&sigs)? != Signal::SIGUSR2 {
        debug!("fill-buf: already running");
    }
    stop.store(true, Ordering::Relaxed);

    let (nr_passes, sum) = worker
        .join()
        .map_err(|_| anyhow!("worker thread panicked"))?;
    debug!("fill-buf: {} passes, sum={:x}", nr_passes, sum);
    Ok(())
}

#[allow(dangerous_implicit_autorefs)]
fn main() {
    let matches = App::new("fill-buf")
        .version(*resctrl_selftest_intf::VERSION)
        .author(clap::crate_authors!("\n"))
        .about("Streams through a buffer to generate memory traffic and cache pressure")
        .after_help(AFTER_HELP)
        .args_from_usage(ARGS_STR)
        .setting(AppSettings::TrailingVarArg)
        .setting(AppSettings::UnifiedHelpMessage)
        .get_matches();

    init_logging(matches.occurrences_of("v") as u32);

    let cfg = match Config::from_matches(&matches) {
        Ok(v) => v,
        Err(e) => {
            error!("fill-buf: invalid arguments ({:#})", &e);
            exit(1);
        }
    };

    if let Err(e) = run(cfg) {
        error!("fill-buf: {:#}", &e);
        exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::{is_phase, parse_op, phase_sigset, wait_go_ahead};
    use nix::sys::signal::Signal;
    use resctrl_selftest_intf::FillOp;
    use std::io::Cursor;

    #[test]
    fn test_parse_op() {
        assert_eq!(parse_op("read").unwrap(), FillOp::Read);
        assert_eq!(parse_op("write").unwrap(), FillOp::Write);
        assert!(parse_op("copy").is_err());
    }

    #[test]
    fn test_go_ahead() {
        assert!(wait_go_ahead(Cursor::new("go\n")).is_ok());
        assert!(wait_go_ahead(Cursor::new("go")).is_ok());
        assert!(wait_go_ahead(Cursor::new("")).is_err());
        assert!(wait_go_ahead(Cursor::new("stop\n")).is_err());
    }

    #[test]
    fn test_phase_sigset() {
        let sigs = phase_sigset();
        for sig in [Signal::SIGINT, Signal::SIGTERM] {
            assert!(sigs.contains(sig));
            assert!(!is_phase(sig));
        }
        assert!(sigs.contains(Signal::SIGUSR1) && is_phase(Signal::SIGUSR1));
        assert!(sigs.contains(Signal::SIGUSR2) && is_phase(Signal::SIGUSR2));
        assert!(!sigs.contains(Signal::SIGHUP));
    }
}
