// Copyright (c) Facebook, Inc. and its affiliates.
use log::{debug, error, info, warn};
use thiserror::Error;

use super::bench::{BenchCmd, BenchCtl, BenchError, Phase, Spawner};
use super::counter::{Counter, CounterFactory, CounterSpec};
use super::platform::PrivilegeError;
use super::resctrlfs::{FsError, ResctrlFs, ResourceGroup};
use super::sampler::{derive_rates, start_sampling, Clock, MeasurementError, Sample, SamplerConfig};
use super::schema::{ConfigError, Limit};
use resctrl_selftest_intf::{RunParameters, RunResult, VerdictPolicy, VerdictReport};
use resctrl_util::*;

pub const CTRL_GRP: &str = "c1";
pub const MON_GRP: &str = "m1";

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bench(#[from] BenchError),
    #[error(transparent)]
    Measurement(#[from] MeasurementError),
    #[error("privilege: {0}")]
    Privilege(#[from] PrivilegeError),
    #[error("counter: {0:#}")]
    Counter(anyhow::Error),
    #[error("interrupted")]
    Interrupted,
}

/// How far a failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Only the current repetition fails.
    Repetition,
    /// The benchmark can't run at all; further repetitions are pointless.
    Fatal,
    /// The category can't be tested on this setup.
    Category,
}

impl RunError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Fs(_) | Self::Measurement(_) => Severity::Repetition,
            Self::Bench(e) => match e {
                BenchError::Fatal(_) | BenchError::Exec { .. } | BenchError::State { .. } => {
                    Severity::Fatal
                }
                _ => Severity::Repetition,
            },
            Self::Interrupted => Severity::Fatal,
            Self::Config(_) | Self::Privilege(_) | Self::Counter(_) => Severity::Category,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Metric {
    /// Mean of the per-interval rates of the primary counter.
    MeanRate,
    /// The last value of the primary counter.
    Final,
    /// Misses over accesses between the baseline and the last sample.
    MissRate,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Expected {
    Fixed(f64),
    /// Mean rate of the reference counter over the same ticks.
    ReferenceRate,
    /// Measurement only, always passes.
    Unchecked,
}

/// Closed interval the measured/expected ratio must fall in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub lo: f64,
    pub hi: f64,
}

impl Band {
    pub fn around(center: f64, tolerance: f64) -> Self {
        Self {
            lo: center - tolerance,
            hi: center + tolerance,
        }
    }

    pub fn at_least(lo: f64) -> Self {
        Self {
            lo,
            hi: std::f64::INFINITY,
        }
    }

    pub fn contains(&self, v: f64) -> bool {
        v.is_finite() && v >= self.lo && v <= self.hi
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub name: String,
    pub limit: Option<Limit>,
    pub bench: BenchCmd,
    pub primary: CounterSpec,
    pub reference: Option<CounterSpec>,
    pub metric: Metric,
    pub expected: Expected,
    pub band: Band,
}

fn mean(data: &[f64]) -> Result<f64, MeasurementError> {
    match data.len() {
        0 => Err(MeasurementError("no usable samples".into())),
        1 => Ok(data[0]),
        _ => Ok(statistical::mean(data)),
    }
}

fn miss_rate(samples: &[Sample]) -> Result<f64, MeasurementError> {
    let delta = |pick: fn(&Sample) -> Option<u64>| -> Option<u64> {
        let first = pick(samples.first()?)?;
        let last = pick(samples.last()?)?;
        last.checked_sub(first)
    };
    match (delta(|s| s.misses), delta(|s| s.hits)) {
        (Some(misses), Some(hits)) if misses + hits > 0 => {
            Ok(misses as f64 / (misses + hits) as f64)
        }
        _ => Err(MeasurementError("no LLC accesses recorded".into())),
    }
}

/// Reduces the samples of one run into a RunResult.
pub fn evaluate(
    cfg: &RunConfig,
    samples: &[Sample],
    nr_skipped: u32,
) -> Result<RunResult, MeasurementError> {
    let measured = match cfg.metric {
        Metric::MeanRate => mean(&derive_rates(samples, |s| Some(s.value)))?,
        Metric::Final => match samples.last() {
            Some(s) => s.value as f64,
            None => return Err(MeasurementError("no samples".into())),
        },
        Metric::MissRate => miss_rate(samples)?,
    };

    let mut res = RunResult {
        measured,
        nr_samples: samples.len(),
        nr_skipped,
        ..Default::default()
    };

    let expected = match cfg.expected {
        Expected::Fixed(v) => v,
        Expected::ReferenceRate => mean(&derive_rates(samples, |s| s.reference))?,
        Expected::Unchecked => {
            res.passed = true;
            return Ok(res);
        }
    };
    if expected <= 0.0 {
        return Err(MeasurementError(format!(
            "{}: expected value {} isn't positive",
            &cfg.name, expected
        )));
    }

    res.expected = expected;
    res.ratio = measured / expected;
    res.passed = cfg.band.contains(res.ratio);
    Ok(res)
}

/// Runs `f` `nr` times and reduces the results with `policy`. A failed
/// repetition counts as a failed run unless the error says that repeating is
/// pointless, in which case the verdict fails right away.
pub fn repeat<F>(kind: &str, nr: u32, policy: VerdictPolicy, mut f: F) -> VerdictReport
where
    F: FnMut(u32) -> Result<RunResult, RunError>,
{
    let mut report = VerdictReport::new(kind, policy);

    for rep in 0..nr {
        if prog_exiting() {
            report.error = Some(format!("{}", RunError::Interrupted));
            break;
        }
        debug!("validate: {} run {}/{}", kind, rep + 1, nr);

        match f(rep) {
            Ok(mut res) => {
                res.rep = rep;
                report.runs.push(res);
            }
            Err(e) => {
                let msg = format!("{:#}", &e);
                match e.severity() {
                    Severity::Repetition => {
                        warn!("validate: {} run {} failed ({})", kind, rep, &msg);
                        report.runs.push(RunResult::aborted(rep, msg));
                    }
                    Severity::Fatal => {
                        error!("validate: {} run {} failed fatally ({})", kind, rep, &msg);
                        report.runs.push(RunResult::aborted(rep, msg.clone()));
                        report.error = Some(msg);
                        break;
                    }
                    Severity::Category => {
                        error!("validate: {} can't be tested ({})", kind, &msg);
                        report.error = Some(msg);
                        break;
                    }
                }
            }
        }
    }

    report.conclude(nr);
    report
}

pub struct Validator<'a> {
    pub fs: &'a ResctrlFs,
    pub spawner: &'a dyn Spawner,
    pub counters: &'a dyn CounterFactory,
    pub clock: &'a dyn Clock,
    pub params: &'a RunParameters,
    pub domain: u32,
}

impl<'a> Validator<'a> {
    pub fn bench_cmd(&self, span: u64) -> BenchCmd {
        BenchCmd {
            span,
            op: self.params.fill_op,
            exec: self.params.benchmark.clone(),
        }
    }

    fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            interval: self.params.interval,
            duration: self.params.duration,
            skip_budget: self.params.skip_budget,
        }
    }

    fn open_counter(
        &self,
        spec: CounterSpec,
        group: &ResourceGroup,
    ) -> Result<Box<dyn Counter>, RunError> {
        self.counters.open(spec, group).map_err(RunError::Counter)
    }

    fn collect<'b>(
        &self,
        bench: &mut BenchCtl,
        primary: &'b mut dyn Counter,
        reference: Option<&'b mut dyn Counter>,
    ) -> Result<(Vec<Sample>, u32), RunError>
    where
        'a: 'b,
    {
        let mut samples = vec![];
        let mut stream = start_sampling(primary, reference, self.sampler_config(), self.clock);
        while let Some(sample) = stream.next() {
            samples.push(sample?);
            bench.ensure_running()?;
            if prog_exiting() {
                return Err(RunError::Interrupted);
            }
        }
        Ok((samples, stream.skipped()))
    }

    /// One repetition. The group is removed and the benchmark reaped or
    /// killed on every path out of here.
    pub fn run_once(&self, cfg: &RunConfig) -> Result<RunResult, RunError> {
        let mut group = ResourceGroup::create(self.fs, CTRL_GRP, MON_GRP, self.params.cpu, self.domain)?;
        if let Some(limit) = cfg.limit.as_ref() {
            group.apply_limit(limit)?;
        }

        // Declared after the group so that an early return kills the
        // benchmark before the group goes away.
        let mut bench = BenchCtl::spawn(self.spawner, &cfg.bench)?;
        bench.pin_to_core(self.params.cpu)?;
        bench.assign_to(&mut group)?;
        bench.wait_ready(self.params.ready_timeout)?;

        let mut primary = self.open_counter(cfg.primary, &group)?;
        let mut reference = match cfg.reference {
            Some(spec) => Some(self.open_counter(spec, &group)?),
            None => None,
        };

        info!(
            "validate: {} pid {} running in {} ({})",
            &cfg.name,
            bench.pid(),
            group.ctrl().name(),
            match group.limit() {
                Some(limit) => limit.schema_line(group.domain()),
                None => "unlimited".into(),
            }
        );
        bench.signal_phase(Phase::Start)?;
        let ref_ctr = match reference.as_mut() {
            Some(ctr) => Some(ctr.as_mut() as &mut dyn Counter),
            None => None,
        };
        let (samples, nr_skipped) = self.collect(&mut bench, primary.as_mut(), ref_ctr)?;
        bench.signal_phase(Phase::Stop)?;
        let status = bench.reap(self.params.exit_timeout)?;
        if !status.success() {
            debug!(
                "validate: {} benchmark exited with {} ({:?})",
                &cfg.name,
                status,
                bench.state()
            );
        }

        drop(reference);
        drop(primary);
        drop(bench);
        group.teardown()?;

        let res = evaluate(cfg, &samples, nr_skipped)?;
        match cfg.expected {
            Expected::Unchecked => info!(
                "validate: {} measured={:.3} ({} samples, {} skipped)",
                &cfg.name, res.measured, res.nr_samples, res.nr_skipped
            ),
            _ => info!(
                "validate: {} measured={:.3} expected={:.3} ratio={}% {}",
                &cfg.name,
                res.measured,
                res.expected,
                format_pct(res.ratio),
                if res.passed { "ok" } else { "out of band" }
            ),
        }
        Ok(res)
    }

    pub fn run_repeated(&self, cfg: &RunConfig) -> VerdictReport {
        repeat(
            &cfg.name,
            self.params.repetitions,
            self.params.policy,
            |_| self.run_once(cfg),
        )
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::bench::tests::{MockSpawner, MockState};
    use crate::resctrlfs::tests::fake_resctrl;
    use crate::resctrlfs::MonCounter;
    use crate::sampler::tests::{RateCounter, VirtualClock};
    use resctrl_selftest_intf::{Args, BwReport, Params, Verdict};

    type MakeCounter =
        dyn Fn(CounterSpec, &ResourceGroup, &VirtualClock) -> anyhow::Result<Box<dyn Counter>>;

    pub struct MockCounters {
        pub clock: VirtualClock,
        pub make: Box<MakeCounter>,
    }

    impl CounterFactory for MockCounters {
        fn open(&self, spec: CounterSpec, group: &ResourceGroup) -> anyhow::Result<Box<dyn Counter>> {
            (self.make)(spec, group, &self.clock)
        }
    }

    pub fn test_params(repetitions: u32) -> RunParameters {
        let params = Params {
            repetitions,
            ..Default::default()
        };
        RunParameters::new(&Args::default(), &params).unwrap()
    }

    /// resctrl reads 2% above the memory controller.
    fn mbm_counters(clock: &VirtualClock, fail_primary: bool) -> MockCounters {
        MockCounters {
            clock: clock.clone(),
            make: Box::new(
                move |spec: CounterSpec,
                      _grp: &ResourceGroup,
                      clock: &VirtualClock|
                      -> anyhow::Result<Box<dyn Counter>> {
                    let mut ctr = match spec {
                        CounterSpec::Resctrl(_) => RateCounter::new(clock, 1020.0 * MB as f64),
                        _ => RateCounter::new(clock, 1000.0 * MB as f64),
                    };
                    if fail_primary {
                        if let CounterSpec::Resctrl(_) = spec {
                            ctr.fail_at = (0..100).collect();
                        }
                    }
                    Ok(Box::new(ctr))
                },
            ),
        }
    }

    fn mbm_config() -> RunConfig {
        RunConfig {
            name: "mbm".into(),
            limit: None,
            bench: BenchCmd {
                span: 250 * MB,
                op: resctrl_selftest_intf::FillOp::Read,
                exec: None,
            },
            primary: CounterSpec::Resctrl(MonCounter::MbmTotal),
            reference: Some(CounterSpec::Imc(BwReport::Reads)),
            metric: Metric::MeanRate,
            expected: Expected::ReferenceRate,
            band: Band::around(1.0, 0.05),
        }
    }

    fn ready_spawner() -> MockSpawner {
        MockSpawner::new(MockState {
            ready: true,
            ..Default::default()
        })
    }

    #[test]
    fn test_run_deterministic() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let rfs = fake_resctrl(dir.path(), "fff");
        let params = test_params(3);
        let spawner = ready_spawner();

        let mut reports = vec![];
        for _ in 0..2 {
            let clock = VirtualClock::default();
            let counters = mbm_counters(&clock, false);
            let v = Validator {
                fs: &rfs,
                spawner: &spawner,
                counters: &counters,
                clock: &clock,
                params: &params,
                domain: 0,
            };
            reports.push(v.run_repeated(&mbm_config()));
        }

        assert_eq!(reports[0].runs, reports[1].runs);
        let rep = &reports[0];
        assert_eq!(rep.verdict, Verdict::Pass);
        assert_eq!(rep.runs.len(), 3);
        for run in rep.runs.iter() {
            assert_eq!(run.nr_samples, 6);
            assert!((run.ratio - 1.02).abs() < 1e-6);
        }
        assert!(!dir.path().join(CTRL_GRP).exists());
        assert_eq!(spawner.spawned.lock().unwrap().len(), 6);
    }

    #[test]
    fn test_benchmark_dies_mid_run() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let rfs = fake_resctrl(dir.path(), "fff");
        let params = test_params(5);
        let spawner = MockSpawner::new(MockState {
            ready: true,
            die_after_polls: Some((2, 139)),
            ..Default::default()
        });
        let clock = VirtualClock::default();
        let counters = mbm_counters(&clock, false);
        let v = Validator {
            fs: &rfs,
            spawner: &spawner,
            counters: &counters,
            clock: &clock,
            params: &params,
            domain: 0,
        };

        let rep = v.run_repeated(&mbm_config());
        assert_eq!(rep.verdict, Verdict::Fail);
        assert_eq!(rep.runs.len(), 1);
        assert!(rep.error.as_ref().unwrap().contains("exited unexpectedly"));
        assert!(!dir.path().join(CTRL_GRP).exists());
        assert_eq!(spawner.spawned.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_measurement_failure_fails_repetition_only() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let rfs = fake_resctrl(dir.path(), "fff");
        let params = test_params(3);
        let spawner = ready_spawner();
        let clock = VirtualClock::default();
        let counters = mbm_counters(&clock, true);
        let v = Validator {
            fs: &rfs,
            spawner: &spawner,
            counters: &counters,
            clock: &clock,
            params: &params,
            domain: 0,
        };

        let rep = v.run_repeated(&mbm_config());
        assert_eq!(rep.verdict, Verdict::Fail);
        assert_eq!(rep.runs.len(), 3);
        assert!(rep.error.is_none());
        assert!(rep.runs.iter().all(|r| !r.passed && r.error.is_some()));
        assert!(!dir.path().join(CTRL_GRP).exists());
        // Every child got killed as the runs were abandoned.
        assert!(spawner.state.lock().unwrap().killed);
    }

    #[test]
    fn test_repeat_policy_and_severity() {
        let _ = ::env_logger::try_init();
        let run = |passed: bool| RunResult {
            ratio: 1.0,
            passed,
            ..Default::default()
        };

        let pattern = [true, false, true, false, true];
        let rep = repeat("cqm", 5, VerdictPolicy::Majority, |i| Ok(run(pattern[i as usize])));
        assert_eq!(rep.verdict, Verdict::Pass);
        assert_eq!(rep.runs.iter().map(|r| r.rep).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        let rep = repeat("cqm", 5, VerdictPolicy::All, |i| Ok(run(pattern[i as usize])));
        assert_eq!(rep.verdict, Verdict::Fail);

        let rep = repeat("cat", 5, VerdictPolicy::AtLeast(1), |i| {
            if i == 0 {
                Err(RunError::Measurement(MeasurementError("flaky".into())))
            } else {
                Ok(run(true))
            }
        });
        assert_eq!(rep.verdict, Verdict::Pass);
        assert_eq!(rep.runs.len(), 5);

        let mut calls = 0;
        let rep = repeat("cat", 5, VerdictPolicy::AtLeast(1), |_| {
            calls += 1;
            Err(RunError::Config(ConfigError::EmptyMask))
        });
        assert_eq!(calls, 1);
        assert_eq!(rep.verdict, Verdict::Fail);
        assert!(rep.runs.is_empty());
    }

    #[test]
    fn test_evaluate() {
        let s = |at: f64, value: u64, misses: u64, hits: u64| Sample {
            at,
            value,
            reference: None,
            misses: Some(misses),
            hits: Some(hits),
        };
        let samples = vec![s(0.0, 100, 10, 90), s(1.0, 200, 30, 170), s(2.0, 400, 60, 240)];
        let mut cfg = mbm_config();

        cfg.metric = Metric::Final;
        cfg.expected = Expected::Fixed(500.0);
        cfg.band = Band::around(1.0, 0.15);
        let res = evaluate(&cfg, &samples, 0).unwrap();
        assert_eq!(res.measured, 400.0);
        assert!(!res.passed);

        cfg.metric = Metric::MissRate;
        cfg.expected = Expected::Unchecked;
        let res = evaluate(&cfg, &samples, 0).unwrap();
        assert!((res.measured - 50.0 / 200.0).abs() < 1e-9);
        assert!(res.passed);

        cfg.metric = Metric::MeanRate;
        cfg.expected = Expected::ReferenceRate;
        assert!(evaluate(&cfg, &samples, 0).is_err());
        assert!(evaluate(&cfg, &[], 0).is_err());
    }

    #[test]
    fn test_band() {
        assert!(Band::around(1.0, 0.05).contains(0.95));
        assert!(!Band::around(1.0, 0.05).contains(1.06));
        assert!(Band::at_least(0.7).contains(0.9));
        assert!(!Band::at_least(0.7).contains(std::f64::NAN));
    }
}
