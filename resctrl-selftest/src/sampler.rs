// Copyright (c) Facebook, Inc. and its affiliates.
use log::{debug, warn};
use std::thread::sleep;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::counter::Counter;

#[derive(Debug, Error)]
#[error("sampler: {0}")]
pub struct MeasurementError(pub String);

pub trait Clock {
    /// Monotonic time since an arbitrary fixed point.
    fn now(&self) -> Duration;
    fn sleep_until(&self, at: Duration);
}

pub struct SystemClock {
    base: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.base.elapsed()
    }

    fn sleep_until(&self, at: Duration) {
        if let Some(dur) = at.checked_sub(self.now()) {
            sleep(dur);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerConfig {
    pub interval: Duration,
    pub duration: Duration,
    pub skip_budget: u32,
}

impl SamplerConfig {
    /// Number of ticks including the baseline.
    pub fn nr_ticks(&self) -> u32 {
        let intv = self.interval.as_secs_f64();
        if intv <= 0.0 {
            return 1;
        }
        let nr = (self.duration.as_secs_f64() / intv + 1e-9).floor();
        nr.min((u32::MAX - 1) as f64) as u32 + 1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    /// Seconds since the stream started.
    pub at: f64,
    pub value: u64,
    pub reference: Option<u64>,
    pub misses: Option<u64>,
    pub hits: Option<u64>,
}

/// Samples `primary` and optionally `reference` once per tick. The first
/// tick is taken immediately and serves as the baseline. A tick where either
/// read fails is skipped; once more than `skip_budget` ticks have been
/// skipped, the stream yields a single error and ends.
pub struct SampleStream<'a> {
    primary: &'a mut dyn Counter,
    reference: Option<&'a mut dyn Counter>,
    clock: &'a dyn Clock,
    cfg: SamplerConfig,
    started_at: Duration,
    tick: u32,
    nr_ticks: u32,
    skipped: u32,
    done: bool,
}

pub fn start_sampling<'a>(
    primary: &'a mut dyn Counter,
    reference: Option<&'a mut dyn Counter>,
    cfg: SamplerConfig,
    clock: &'a dyn Clock,
) -> SampleStream<'a> {
    debug!(
        "sampler: {} every {:.3}s for {:.3}s",
        primary.name(),
        cfg.interval.as_secs_f64(),
        cfg.duration.as_secs_f64()
    );
    SampleStream {
        primary,
        reference,
        started_at: clock.now(),
        clock,
        nr_ticks: cfg.nr_ticks(),
        cfg,
        tick: 0,
        skipped: 0,
        done: false,
    }
}

impl<'a> SampleStream<'a> {
    pub fn skipped(&self) -> u32 {
        self.skipped
    }

    fn read_tick(&mut self) -> anyhow::Result<Sample> {
        let r = self.primary.read()?;
        let reference = match self.reference.as_mut() {
            Some(ctr) => Some(ctr.read()?.value),
            None => None,
        };
        Ok(Sample {
            at: (self.clock.now() - self.started_at).as_secs_f64(),
            value: r.value,
            reference,
            misses: r.misses,
            hits: r.hits,
        })
    }
}

impl<'a> Iterator for SampleStream<'a> {
    type Item = Result<Sample, MeasurementError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done && self.tick < self.nr_ticks {
            self.clock
                .sleep_until(self.started_at + self.cfg.interval * self.tick);
            self.tick += 1;

            match self.read_tick() {
                Ok(sample) => return Some(Ok(sample)),
                Err(e) => {
                    self.skipped += 1;
                    warn!(
                        "sampler: tick {} skipped ({}/{}) ({:#})",
                        self.tick - 1,
                        self.skipped,
                        self.cfg.skip_budget,
                        &e
                    );
                    if self.skipped > self.cfg.skip_budget {
                        self.done = true;
                        return Some(Err(MeasurementError(format!(
                            "{} of {} ticks skipped reading {} ({:#})",
                            self.skipped,
                            self.tick,
                            self.primary.name(),
                            &e
                        ))));
                    }
                }
            }
        }
        None
    }
}

/// Per-second rates between consecutive samples of the values `val` picks.
/// Pairs which go backwards in either time or value are dropped.
pub fn derive_rates<F>(samples: &[Sample], val: F) -> Vec<f64>
where
    F: Fn(&Sample) -> Option<u64>,
{
    let mut rates = vec![];
    for pair in samples.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        let (va, vb) = match (val(a), val(b)) {
            (Some(va), Some(vb)) => (va, vb),
            _ => continue,
        };
        if b.at <= a.at || vb < va {
            debug!(
                "sampler: dropping pair ({:.3}, {}) -> ({:.3}, {})",
                a.at, va, b.at, vb
            );
            continue;
        }
        rates.push((vb - va) as f64 / (b.at - a.at));
    }
    rates
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::counter::Reading;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct VirtualClock {
        now: Arc<Mutex<Duration>>,
    }

    impl Clock for VirtualClock {
        fn now(&self) -> Duration {
            *self.now.lock().unwrap()
        }

        fn sleep_until(&self, at: Duration) {
            let mut now = self.now.lock().unwrap();
            if at > *now {
                *now = at;
            }
        }
    }

    /// Grows at `rate` per virtual second. Reads listed in `fail_at` fail.
    pub struct RateCounter {
        pub clock: VirtualClock,
        pub rate: f64,
        pub fail_at: Vec<u32>,
        pub nr_reads: u32,
    }

    impl RateCounter {
        pub fn new(clock: &VirtualClock, rate: f64) -> Self {
            Self {
                clock: clock.clone(),
                rate,
                fail_at: vec![],
                nr_reads: 0,
            }
        }
    }

    impl Counter for RateCounter {
        fn name(&self) -> &str {
            "rate"
        }

        fn read(&mut self) -> anyhow::Result<Reading> {
            let idx = self.nr_reads;
            self.nr_reads += 1;
            if self.fail_at.contains(&idx) {
                anyhow::bail!("Unavailable");
            }
            Ok(Reading::value(
                (self.clock.now().as_secs_f64() * self.rate) as u64,
            ))
        }
    }

    fn cfg(skip_budget: u32) -> SamplerConfig {
        SamplerConfig {
            interval: Duration::from_secs(1),
            duration: Duration::from_secs(5),
            skip_budget,
        }
    }

    #[test]
    fn test_ticks_and_rates() {
        let _ = ::env_logger::try_init();
        let clock = VirtualClock::default();
        let mut ctr = RateCounter::new(&clock, 1000.0);
        let mut reference = RateCounter::new(&clock, 2000.0);

        let samples: Vec<Sample> = start_sampling(&mut ctr, Some(&mut reference), cfg(0), &clock)
            .map(|x| x.unwrap())
            .collect();
        assert_eq!(samples.len(), 6);
        assert_eq!(samples[0].at, 0.0);
        assert_eq!(samples[5].at, 5.0);

        let rates = derive_rates(&samples, |s| Some(s.value));
        assert_eq!(rates, vec![1000.0; 5]);
        let rates = derive_rates(&samples, |s| s.reference);
        assert_eq!(rates, vec![2000.0; 5]);
    }

    #[test]
    fn test_skip_budget() {
        let _ = ::env_logger::try_init();
        let clock = VirtualClock::default();
        let mut ctr = RateCounter::new(&clock, 1000.0);
        ctr.fail_at = vec![0, 3];

        let mut stream = start_sampling(&mut ctr, None, cfg(2), &clock);
        let samples: Vec<Sample> = stream.by_ref().map(|x| x.unwrap()).collect();
        assert_eq!(samples.len(), 4);
        assert_eq!(stream.skipped(), 2);
        assert_eq!(samples[0].at, 1.0);

        let clock = VirtualClock::default();
        let mut ctr = RateCounter::new(&clock, 1000.0);
        ctr.fail_at = vec![1, 2, 4];
        let res: Vec<_> = start_sampling(&mut ctr, None, cfg(2), &clock).collect();
        assert_eq!(res.len(), 3);
        assert!(res[0].is_ok() && res[1].is_ok());
        assert!(res[2].is_err());
    }

    #[test]
    fn test_rates_never_negative() {
        let s = |at: f64, value: u64| Sample {
            at,
            value,
            ..Default::default()
        };
        let samples = vec![s(0.0, 100), s(1.0, 300), s(1.0, 400), s(2.0, 50), s(3.0, 150)];
        let rates = derive_rates(&samples, |s| Some(s.value));
        assert_eq!(rates, vec![200.0, 100.0]);
        assert!(rates.iter().all(|r| *r >= 0.0));
        assert!(derive_rates(&samples[..1], |s| Some(s.value)).is_empty());
    }

    #[test]
    fn test_nr_ticks() {
        assert_eq!(cfg(0).nr_ticks(), 6);
        let c = SamplerConfig {
            interval: Duration::from_millis(300),
            duration: Duration::from_secs(1),
            skip_budget: 0,
        };
        assert_eq!(c.nr_ticks(), 4);

        let c = SamplerConfig {
            interval: Duration::from_nanos(1),
            duration: Duration::from_secs(1 << 40),
            skip_budget: 0,
        };
        assert_eq!(c.nr_ticks(), u32::MAX);
    }
}
