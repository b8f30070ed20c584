// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::anyhow;
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use log::{debug, info, trace, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::io::{self, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::{sleep, spawn};
use std::time::{Duration, Instant};
use thiserror::Error;

use super::resctrlfs::{FsError, ResourceGroup};
use resctrl_selftest_intf::{FillOp, EXEC_FAILED_CODE, GO_AHEAD};
use resctrl_util::*;

const POLL_INTV: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
#[error("{what} timed out after {}s", .timeout.as_secs_f64())]
pub struct TimeoutError {
    pub what: String,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("bench: failed to exec {cmd:?} ({msg})")]
    Exec { cmd: String, msg: String },
    #[error("bench: {op} failed ({source})")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("bench: failed to deliver {phase} ({source})")]
    Signal {
        phase: Phase,
        #[source]
        source: io::Error,
    },
    #[error("bench: {0}")]
    Timeout(#[from] TimeoutError),
    #[error("bench: {0}")]
    Fatal(String),
    #[error("bench: {op} invalid in state {state:?}")]
    State { op: &'static str, state: BenchState },
    #[error(transparent)]
    Assign(#[from] FsError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Stop,
}

impl Phase {
    pub fn signal(&self) -> Signal {
        match self {
            Self::Start => Signal::SIGUSR1,
            Self::Stop => Signal::SIGUSR2,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "Start"),
            Self::Stop => write!(f, "Stop"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchState {
    Created,
    Pinned,
    GroupAssigned,
    Running,
    Signaled,
    Exited,
    Reaped,
}

/// What the benchmark child should do.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchCmd {
    pub span: u64,
    pub op: FillOp,
    /// Replacement benchmark exec'd by fill-buf on Start.
    pub exec: Option<Vec<String>>,
}

impl BenchCmd {
    pub fn describe(&self) -> String {
        match self.exec.as_ref() {
            Some(cmd) => cmd.join(" "),
            None => format!("fill-buf {} {}", format_size(self.span), self.op.as_str()),
        }
    }
}

/// A live benchmark child as seen by the controller.
pub trait BenchProcess {
    fn pid(&self) -> u32;
    fn pin_to_core(&mut self, core: u32) -> io::Result<()>;
    /// Lets the child set up. Nothing it touches before this is charged to
    /// the group, so it must not report ready until released.
    fn release(&mut self) -> io::Result<()>;
    /// Ok(false) on timeout. An error means the child went away first.
    fn wait_ready(&mut self, timeout: Duration) -> io::Result<bool>;
    fn send_signal(&mut self, phase: Phase) -> io::Result<()>;
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;
    fn kill(&mut self) -> io::Result<()>;
}

pub trait Spawner {
    fn spawn(&self, cmd: &BenchCmd) -> Result<Box<dyn BenchProcess>, BenchError>;
}

pub struct ChildProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    out_rx: Receiver<String>,
}

impl BenchProcess for ChildProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn pin_to_core(&mut self, core: u32) -> io::Result<()> {
        let mut cpus = nix::sched::CpuSet::new();
        cpus.set(core as usize)?;
        nix::sched::sched_setaffinity(Pid::from_raw(self.pid() as i32), &cpus)?;
        Ok(())
    }

    fn release(&mut self) -> io::Result<()> {
        let mut stdin = self.stdin.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "benchmark already released")
        })?;
        stdin.write_all(GO_AHEAD.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()
    }

    fn wait_ready(&mut self, timeout: Duration) -> io::Result<bool> {
        let started_at = Instant::now();
        loop {
            let left = match timeout.checked_sub(started_at.elapsed()) {
                Some(v) => v,
                None => return Ok(false),
            };
            match self.out_rx.recv_timeout(left) {
                Ok(line) if line.trim() == "ready" => return Ok(true),
                Ok(line) => debug!("bench: {:?}", &line),
                Err(RecvTimeoutError::Timeout) => return Ok(false),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "benchmark closed stdout before becoming ready",
                    ))
                }
            }
        }
    }

    fn send_signal(&mut self, phase: Phase) -> io::Result<()> {
        signal::kill(Pid::from_raw(self.pid() as i32), phase.signal())?;
        Ok(())
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        // Keep the pipe drained so that a chatty benchmark never blocks.
        while let Ok(line) = self.out_rx.try_recv() {
            trace!("bench: {:?}", &line);
        }
        self.child.try_wait()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }
}

pub struct FillBufSpawner {
    bin: PathBuf,
}

impl FillBufSpawner {
    pub fn new() -> anyhow::Result<Self> {
        let bin = find_bin("fill-buf", exe_dir().ok())
            .ok_or_else(|| anyhow!("can't find fill-buf next to the executable or in $PATH"))?;
        debug!("bench: using {:?}", &bin);
        Ok(Self { bin })
    }

    pub fn args(cmd: &BenchCmd) -> Vec<String> {
        let mut args = vec![
            format!("--span={}", cmd.span),
            format!("--op={}", cmd.op.as_str()),
        ];
        if let Some(exec) = cmd.exec.as_ref() {
            args.push("--".into());
            args.extend(exec.iter().cloned());
        }
        args
    }
}

impl Spawner for FillBufSpawner {
    fn spawn(&self, cmd: &BenchCmd) -> Result<Box<dyn BenchProcess>, BenchError> {
        // Own process group, a terminal ^C only reaches us.
        let mut child = Command::new(&self.bin)
            .args(Self::args(cmd))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| BenchError::Exec {
                cmd: format!("{:?}", &self.bin),
                msg: format!("{}", &e),
            })?;

        let stdout = match child.stdout.take() {
            Some(v) => v,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(BenchError::Fatal("benchmark stdout unavailable".into()));
            }
        };
        let stdin = child.stdin.take();
        let (tx, rx) = channel::unbounded::<String>();
        spawn(move || child_reader_thread("fill-buf".into(), stdout, tx));

        Ok(Box::new(ChildProcess {
            child,
            stdin,
            out_rx: rx,
        }))
    }
}

/// Drives one benchmark child through its phases. Each transition is only
/// valid from the preceding state; the child is reaped exactly once, either
/// through `reap()` or on drop.
pub struct BenchCtl {
    proc: Box<dyn BenchProcess>,
    desc: String,
    state: BenchState,
    ready: bool,
    status: Option<ExitStatus>,
}

impl BenchCtl {
    pub fn spawn(spawner: &dyn Spawner, cmd: &BenchCmd) -> Result<Self, BenchError> {
        let proc = spawner.spawn(cmd)?;
        info!("bench: spawned {:?} pid={}", cmd.describe(), proc.pid());
        Ok(Self {
            proc,
            desc: cmd.describe(),
            state: BenchState::Created,
            ready: false,
            status: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.proc.pid()
    }

    pub fn state(&self) -> BenchState {
        self.state
    }

    fn check_state(&self, op: &'static str, state: BenchState) -> Result<(), BenchError> {
        if self.state != state {
            return Err(BenchError::State {
                op,
                state: self.state,
            });
        }
        Ok(())
    }

    fn exited(&mut self, status: ExitStatus) -> BenchError {
        self.state = BenchState::Exited;
        self.status = Some(status);
        if status.code() == Some(EXEC_FAILED_CODE) {
            BenchError::Exec {
                cmd: self.desc.clone(),
                msg: "exec failed in the benchmark wrapper".into(),
            }
        } else {
            BenchError::Fatal(format!("{:?} exited unexpectedly ({})", &self.desc, status))
        }
    }

    pub fn pin_to_core(&mut self, core: u32) -> Result<(), BenchError> {
        self.check_state("pin_to_core", BenchState::Created)?;
        self.proc
            .pin_to_core(core)
            .map_err(|e| BenchError::Os {
                op: "pinning to core",
                source: e,
            })?;
        debug!("bench: pid {} pinned to cpu {}", self.pid(), core);
        self.state = BenchState::Pinned;
        Ok(())
    }

    pub fn assign_to(&mut self, group: &mut ResourceGroup) -> Result<(), BenchError> {
        self.check_state("assign_to", BenchState::Pinned)?;
        group.assign(self.pid())?;
        self.state = BenchState::GroupAssigned;
        self.proc.release().map_err(|e| BenchError::Os {
            op: "releasing benchmark",
            source: e,
        })?;
        debug!("bench: pid {} released in {}", self.pid(), group.mon().name());
        Ok(())
    }

    pub fn wait_ready(&mut self, timeout: Duration) -> Result<(), BenchError> {
        self.check_state("wait_ready", BenchState::GroupAssigned)?;
        match self.proc.wait_ready(timeout) {
            Ok(true) => {
                debug!("bench: pid {} ready", self.pid());
                self.ready = true;
                Ok(())
            }
            Ok(false) => Err(TimeoutError {
                what: format!("waiting for {:?} to become ready", &self.desc),
                timeout,
            }
            .into()),
            Err(e) => match self.proc.try_wait() {
                Ok(Some(status)) => Err(self.exited(status)),
                _ => Err(BenchError::Fatal(format!("{:?}: {}", &self.desc, &e))),
            },
        }
    }

    fn send_with_retry(&mut self, phase: Phase) -> Result<(), BenchError> {
        if let Err(e) = self.proc.send_signal(phase) {
            warn!("bench: failed to send {} to pid {} ({}), retrying", phase, self.pid(), &e);
            self.proc
                .send_signal(phase)
                .map_err(|e| BenchError::Signal { phase, source: e })?;
        }
        Ok(())
    }

    pub fn signal_phase(&mut self, phase: Phase) -> Result<(), BenchError> {
        match phase {
            Phase::Start => {
                self.check_state("signal_phase(Start)", BenchState::GroupAssigned)?;
                if !self.ready {
                    return Err(BenchError::State {
                        op: "signal_phase(Start) before ready",
                        state: self.state,
                    });
                }
                self.send_with_retry(phase)?;
                self.state = BenchState::Running;
            }
            Phase::Stop => {
                self.ensure_running()?;
                self.send_with_retry(phase)?;
                self.state = BenchState::Signaled;
            }
        }
        debug!("bench: pid {} <- {}", self.pid(), phase);
        Ok(())
    }

    /// Fails if the child is gone while it should still be running.
    pub fn ensure_running(&mut self) -> Result<(), BenchError> {
        self.check_state("ensure_running", BenchState::Running)?;
        match self.proc.try_wait() {
            Ok(Some(status)) => Err(self.exited(status)),
            Ok(None) => Ok(()),
            Err(e) => Err(BenchError::Os {
                op: "checking benchmark status",
                source: e,
            }),
        }
    }

    fn wait_exit(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        let started_at = Instant::now();
        loop {
            if let Some(status) = self.proc.try_wait()? {
                return Ok(Some(status));
            }
            if started_at.elapsed() >= timeout {
                return Ok(None);
            }
            sleep(POLL_INTV);
        }
    }

    fn kill_and_wait(&mut self) -> Option<ExitStatus> {
        if let Err(e) = self.proc.kill() {
            debug!("bench: failed to kill pid {} ({})", self.pid(), &e);
        }
        self.wait_exit(Duration::from_secs(1)).ok().flatten()
    }

    /// Waits for the child to exit after Stop, or collects the status of a
    /// child which already exited. A child which doesn't exit in time is
    /// killed.
    pub fn reap(&mut self, timeout: Duration) -> Result<ExitStatus, BenchError> {
        match self.state {
            BenchState::Signaled => {}
            BenchState::Exited => {
                self.state = BenchState::Reaped;
                return Ok(self.status.unwrap_or_else(|| ExitStatus::from_raw(0)));
            }
            state => return Err(BenchError::State { op: "reap", state }),
        }

        let res = self.wait_exit(timeout);
        self.state = BenchState::Reaped;
        match res {
            Ok(Some(status)) => {
                debug!("bench: pid {} exited ({})", self.pid(), status);
                self.status = Some(status);
                Ok(status)
            }
            Ok(None) => {
                warn!("bench: pid {} didn't exit after Stop, killing", self.pid());
                self.status = self.kill_and_wait();
                Err(TimeoutError {
                    what: format!("waiting for {:?} to exit", &self.desc),
                    timeout,
                }
                .into())
            }
            Err(e) => {
                self.status = self.kill_and_wait();
                Err(BenchError::Os {
                    op: "waiting for benchmark",
                    source: e,
                })
            }
        }
    }
}

impl Drop for BenchCtl {
    fn drop(&mut self) {
        if self.state == BenchState::Reaped {
            return;
        }
        if self.status.is_none() {
            debug!("bench: killing unreaped pid {}", self.pid());
            self.status = self.kill_and_wait();
        }
        self.state = BenchState::Reaped;
    }
}
