// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Args, VerdictPolicy};
use resctrl_util::*;

const PARAMS_DOC: &str = "\
//
// resctrl-selftest tunables
//
// Each test category runs `repetitions` times and the per-run results are
// reduced with `policy` which is one of \"all\", \"majority\" or
// {\"at-least\": N}.
//
// During a run, counters are sampled every `interval` seconds for
// `duration` seconds. The first sample of a run is the baseline. A failed
// counter read skips the tick; more than `skip_budget` skipped ticks abort
// the run.
//
// All durations are in seconds, up to a day. Tolerances are fractions.
//
//  repetitions: Number of runs per test category
//  policy: How per-run results are reduced into the category verdict
//  interval: Sampling interval
//  duration: Sampling duration per run
//  skip_budget: Maximum number of skipped ticks per run
//  ready_timeout: How long to wait for the benchmark to become ready
//  exit_timeout: How long to wait for the benchmark to exit after stop
//  bw_report: Memory controller traffic to compare against, reads|writes|total
//  fill_op: fill-buf access pattern, read|write
//  mba_percent: Throttle level for the MBA test
//  mbm_tolerance: Allowed deviation of resctrl MBM from memory controller counts
//  mba_tolerance: Allowed absolute deviation of the throttled/unthrottled ratio
//  cqm_tolerance: Allowed deviation of llc_occupancy from the allocated cache size
//  cat_tolerance: Allowed shortfall of the LLC miss rate reduction from 1.0
//
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BwReport {
    Reads,
    Writes,
    Total,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillOp {
    Read,
    Write,
}

impl FillOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    pub repetitions: u32,
    pub policy: VerdictPolicy,
    pub interval: f64,
    pub duration: f64,
    pub skip_budget: u32,
    pub ready_timeout: f64,
    pub exit_timeout: f64,
    pub bw_report: BwReport,
    pub fill_op: FillOp,
    pub mba_percent: u32,
    pub mbm_tolerance: f64,
    pub mba_tolerance: f64,
    pub cqm_tolerance: f64,
    pub cat_tolerance: f64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            repetitions: 5,
            policy: VerdictPolicy::Majority,
            interval: 1.0,
            duration: 5.0,
            skip_budget: 3,
            ready_timeout: 10.0,
            exit_timeout: 5.0,
            bw_report: BwReport::Reads,
            fill_op: FillOp::Read,
            mba_percent: 20,
            mbm_tolerance: 5.0 * PCT,
            mba_tolerance: 5.0 * PCT,
            cqm_tolerance: 15.0 * PCT,
            cat_tolerance: 30.0 * PCT,
        }
    }
}

impl JsonLoad for Params {}

impl JsonSave for Params {
    fn preamble() -> Option<String> {
        Some(PARAMS_DOC.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerances {
    pub mbm: f64,
    pub mba: f64,
    pub cqm: f64,
    pub cat: f64,
}

/// Everything a test run needs, fixed before the first group is created.
#[derive(Debug, Clone, PartialEq)]
pub struct RunParameters {
    pub benchmark: Option<Vec<String>>,
    pub cpu: u32,
    pub span: u64,
    pub nr_bits: u32,
    pub repetitions: u32,
    pub policy: VerdictPolicy,
    pub interval: Duration,
    pub duration: Duration,
    pub skip_budget: u32,
    pub ready_timeout: Duration,
    pub exit_timeout: Duration,
    pub bw_report: BwReport,
    pub fill_op: FillOp,
    pub mba_percent: u32,
    pub tolerances: Tolerances,
}

const MAX_SECS: f64 = 24.0 * 3600.0;

fn secs(key: &str, v: f64) -> Result<Duration> {
    if !v.is_finite() || v <= 0.0 {
        bail!("{} must be positive, got {}", key, v);
    }
    if v > MAX_SECS {
        bail!("{} must be at most {}s, got {}", key, MAX_SECS, v);
    }
    Ok(Duration::from_secs_f64(v))
}

fn frac(key: &str, v: f64) -> Result<f64> {
    if !v.is_finite() || v < 0.0 {
        bail!("{} must be a non-negative fraction, got {}", key, v);
    }
    Ok(v)
}

impl RunParameters {
    pub fn new(args: &Args, params: &Params) -> Result<Self> {
        if params.repetitions == 0 {
            bail!("repetitions must be at least 1");
        }
        if let VerdictPolicy::AtLeast(nr) = params.policy {
            if nr > params.repetitions {
                bail!(
                    "policy requires {} passing runs but only {} repetitions are configured",
                    nr,
                    params.repetitions
                );
            }
        }
        if params.duration < params.interval {
            bail!(
                "duration {}s is shorter than the sampling interval {}s",
                params.duration,
                params.interval
            );
        }
        if let Some(cmd) = args.benchmark.as_ref() {
            if cmd.is_empty() {
                bail!("empty benchmark command line");
            }
        }
        if args.span == 0 {
            bail!("span must be positive");
        }

        Ok(Self {
            benchmark: args.benchmark.clone(),
            cpu: args.cpu,
            span: args.span,
            nr_bits: args.nr_bits,
            repetitions: params.repetitions,
            policy: params.policy,
            interval: secs("interval", params.interval)?,
            duration: secs("duration", params.duration)?,
            skip_budget: params.skip_budget,
            ready_timeout: secs("ready_timeout", params.ready_timeout)?,
            exit_timeout: secs("exit_timeout", params.exit_timeout)?,
            bw_report: params.bw_report,
            fill_op: params.fill_op,
            mba_percent: params.mba_percent,
            tolerances: Tolerances {
                mbm: frac("mbm_tolerance", params.mbm_tolerance)?,
                mba: frac("mba_tolerance", params.mba_tolerance)?,
                cqm: frac("cqm_tolerance", params.cqm_tolerance)?,
                cat: frac("cat_tolerance", params.cat_tolerance)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Args, Params, RunParameters, VerdictPolicy};

    #[test]
    fn test_run_params_validation() {
        let args = Args::default();
        let params = Params::default();
        let rp = RunParameters::new(&args, &params).unwrap();
        assert_eq!(rp.repetitions, 5);
        assert_eq!(rp.interval.as_millis(), 1000);
        assert!((rp.tolerances.cqm - 0.15).abs() < 1e-9);

        let mut bad = params.clone();
        bad.duration = 0.5;
        assert!(RunParameters::new(&args, &bad).is_err());

        let mut bad = params.clone();
        bad.duration = 1e30;
        assert!(RunParameters::new(&args, &bad).is_err());

        let mut bad = params.clone();
        bad.exit_timeout = f64::MAX;
        assert!(RunParameters::new(&args, &bad).is_err());

        let mut bad = params.clone();
        bad.policy = VerdictPolicy::AtLeast(6);
        assert!(RunParameters::new(&args, &bad).is_err());

        let mut bad_args = args.clone();
        bad_args.benchmark = Some(vec![]);
        assert!(RunParameters::new(&bad_args, &params).is_err());
    }

    #[test]
    fn test_params_policy_serde() {
        let params: Params =
            serde_json::from_str(r#"{ "policy": { "at-least": 3 }, "bw_report": "total" }"#)
                .unwrap();
        assert_eq!(params.policy, VerdictPolicy::AtLeast(3));
        assert_eq!(params.bw_report, super::BwReport::Total);
        assert_eq!(params.repetitions, 5);
    }
}
