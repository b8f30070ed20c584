// Copyright (c) Facebook, Inc. and its affiliates.
use serde::{Deserialize, Serialize};
use std::fmt;

use resctrl_util::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerdictPolicy {
    All,
    Majority,
    AtLeast(u32),
}

impl VerdictPolicy {
    pub fn passes(&self, nr_passed: u32, nr_runs: u32) -> bool {
        match self {
            Self::All => nr_runs > 0 && nr_passed == nr_runs,
            Self::Majority => nr_passed * 2 > nr_runs,
            Self::AtLeast(nr) => nr_passed >= (*nr).max(1),
        }
    }
}

impl fmt::Display for VerdictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Majority => write!(f, "majority"),
            Self::AtLeast(nr) => write!(f, "at-least-{}", nr),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Pass,
    Fail,
    Skip,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
            Self::Skip => write!(f, "SKIP"),
        }
    }
}

/// Outcome of one repetition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub rep: u32,
    pub measured: f64,
    pub expected: f64,
    pub ratio: f64,
    pub passed: bool,
    pub nr_samples: usize,
    pub nr_skipped: u32,
    pub error: Option<String>,
}

impl RunResult {
    pub fn aborted(rep: u32, error: String) -> Self {
        Self {
            rep,
            error: Some(error),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictReport {
    pub kind: String,
    pub policy: VerdictPolicy,
    pub started_at: u64,
    pub ended_at: u64,
    pub runs: Vec<RunResult>,
    pub verdict: Verdict,
    pub error: Option<String>,
}

impl VerdictReport {
    pub fn new(kind: &str, policy: VerdictPolicy) -> Self {
        Self {
            kind: kind.into(),
            policy,
            started_at: unix_now(),
            ended_at: 0,
            runs: vec![],
            verdict: Verdict::Fail,
            error: None,
        }
    }

    pub fn skipped(kind: &str, policy: VerdictPolicy, why: &str) -> Self {
        let mut rep = Self::new(kind, policy);
        rep.ended_at = rep.started_at;
        rep.verdict = Verdict::Skip;
        rep.error = Some(why.into());
        rep
    }

    pub fn nr_passed(&self) -> u32 {
        self.runs.iter().filter(|r| r.passed).count() as u32
    }

    /// An error recorded on the report itself (fatal or category level)
    /// fails the verdict regardless of how many runs passed before it.
    pub fn conclude(&mut self, nr_planned: u32) {
        self.ended_at = unix_now();
        self.verdict = if self.error.is_none() && self.policy.passes(self.nr_passed(), nr_planned)
        {
            Verdict::Pass
        } else {
            Verdict::Fail
        };
    }

    pub fn passed(&self) -> bool {
        self.verdict != Verdict::Fail
    }

    pub fn summary(&self) -> String {
        let mut buf = format!("[resctrl-selftest] {}: {}", self.kind, self.verdict);
        if self.verdict != Verdict::Skip {
            buf += &format!(
                " ({}/{} runs passed, policy={}",
                self.nr_passed(),
                self.runs.len(),
                self.policy
            );
            let ratios: Vec<f64> = self
                .runs
                .iter()
                .filter(|r| r.error.is_none())
                .map(|r| r.ratio)
                .collect();
            if !ratios.is_empty() {
                buf += &format!(
                    ", mean ratio={}%",
                    format_pct(ratios.iter().sum::<f64>() / ratios.len() as f64)
                );
            }
            buf += ")";
        }
        if let Some(e) = self.error.as_ref() {
            buf += &format!(": {}", e);
        }
        buf
    }
}
