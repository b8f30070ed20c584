// Copyright (c) Facebook, Inc. and its affiliates.
//
// Cache occupancy monitoring: a benchmark confined to N cache ways and
// touching exactly that much memory should fill its allocation.
use super::*;

pub struct CqmCategory {}

impl Category for CqmCategory {
    fn kind(&self) -> &'static str {
        "cqm"
    }

    fn check_support(&self, plat: &dyn PlatformCapabilities) -> std::result::Result<(), String> {
        let features = plat.features();
        if !features.cat_l3 {
            return Err("L3 allocation not available".into());
        }
        if !features.cqm {
            return Err("llc_occupancy monitoring not available".into());
        }
        Ok(())
    }

    fn run(&self, ctx: &CategoryCtx) -> std::result::Result<VerdictReport, RunError> {
        let params = ctx.v.params;
        let geom = ctx.cache_geometry()?;
        let mask = geom.low_mask(params.nr_bits)?;
        let size = bitmask_to_cache_size(mask.value(), &geom)?;
        info!(
            "validate: cqm mask={} ({} of {}) tolerance={}%",
            &mask,
            format_size(size),
            format_size(geom.cache_size),
            format_pct(params.tolerances.cqm)
        );

        let cfg = RunConfig {
            name: self.kind().into(),
            limit: Some(Limit::Cache(mask)),
            bench: ctx.v.bench_cmd(size),
            primary: CounterSpec::Resctrl(MonCounter::LlcOccupancy),
            reference: None,
            metric: Metric::Final,
            expected: Expected::Fixed(size as f64),
            band: Band::around(1.0, params.tolerances.cqm),
        };
        Ok(ctx.v.run_repeated(&cfg))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::ready_spawner;
    use super::*;
    use crate::counter::{Counter, Reading};
    use crate::platform::tests::FakePlatform;
    use crate::resctrlfs::tests::fake_resctrl;
    use crate::resctrlfs::ResourceGroup;
    use crate::sampler::tests::VirtualClock;
    use crate::validate::tests::{test_params, MockCounters};
    use resctrl_selftest_intf::Verdict;

    struct Occupancy(u64);

    impl Counter for Occupancy {
        fn name(&self) -> &str {
            "occupancy"
        }

        fn read(&mut self) -> anyhow::Result<Reading> {
            Ok(Reading::value(self.0))
        }
    }

    /// Occupancy settles at `frac` of the allocated ways.
    fn run_cqm(frac: f64) -> (VerdictReport, Vec<u64>) {
        let dir = tempfile::tempdir().unwrap();
        let rfs = fake_resctrl(dir.path(), "fff");
        let params = test_params(3);
        let spawner = ready_spawner();
        let clock = VirtualClock::default();
        let counters = MockCounters {
            clock: clock.clone(),
            make: Box::new(
                move |_spec: CounterSpec,
                      grp: &ResourceGroup,
                      _clock: &VirtualClock|
                      -> anyhow::Result<Box<dyn Counter>> {
                    let bits = match grp.limit() {
                        Some(Limit::Cache(mask)) => mask.nr_bits() as f64,
                        _ => 12.0,
                    };
                    Ok(Box::new(Occupancy((bits * frac * MB as f64) as u64)))
                },
            ),
        };
        let plat = FakePlatform::intel_all();
        let ctx = CategoryCtx {
            v: Validator {
                fs: &rfs,
                spawner: &spawner,
                counters: &counters,
                clock: &clock,
                params: &params,
                domain: 0,
            },
            l3: plat.l3,
        };
        let rep = run_category(&CqmCategory {}, &ctx, &plat);
        let spans = spawner
            .spawned
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.span)
            .collect();
        (rep, spans)
    }

    #[test]
    fn test_cqm() {
        let _ = ::env_logger::try_init();
        let (rep, spans) = run_cqm(0.9);
        assert_eq!(rep.verdict, Verdict::Pass);
        // 5 of 12 ways of a 12M cache.
        assert!(spans.iter().all(|s| *s == 5 << 20));
        for run in rep.runs.iter() {
            assert_eq!(run.expected, (5u64 << 20) as f64);
            assert!((run.ratio - 0.9).abs() < 1e-6);
        }

        let (rep, _) = run_cqm(0.5);
        assert_eq!(rep.verdict, Verdict::Fail);
    }
}
