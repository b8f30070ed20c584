// Copyright (c) Facebook, Inc. and its affiliates.
//
// Memory bandwidth allocation: throttling the group to N% should cut its
// bandwidth to about N% of what it gets unthrottled.
use super::*;

pub struct MbaCategory {}

impl MbaCategory {
    fn run_config(ctx: &CategoryCtx, name: &str, limit: Limit) -> RunConfig {
        RunConfig {
            name: name.into(),
            limit: Some(limit),
            bench: ctx.v.bench_cmd(ctx.v.params.span),
            primary: CounterSpec::Resctrl(MonCounter::MbmTotal),
            reference: None,
            metric: Metric::MeanRate,
            expected: Expected::Unchecked,
            band: Band::at_least(0.0),
        }
    }
}

impl Category for MbaCategory {
    fn kind(&self) -> &'static str {
        "mba"
    }

    fn check_support(&self, plat: &dyn PlatformCapabilities) -> std::result::Result<(), String> {
        if plat.vendor() != Vendor::Intel {
            return Err(format!("MBA test not supported on {} CPUs", plat.vendor()));
        }
        let features = plat.features();
        if !features.mba {
            return Err("memory bandwidth allocation not available".into());
        }
        if !features.mbm_total {
            return Err("mbm_total_bytes monitoring not available".into());
        }
        Ok(())
    }

    fn run(&self, ctx: &CategoryCtx) -> std::result::Result<VerdictReport, RunError> {
        let params = ctx.v.params;
        let bw_info = BandwidthInfo::probe(ctx.v.fs)?;
        let full = bw_info.apply(100)?;
        let throttled = bw_info.apply(params.mba_percent)?;
        let band = Band::around(throttled.ratio(), params.tolerances.mba);

        let base_cfg = Self::run_config(ctx, "mba-unthrottled", Limit::Bandwidth(full));
        let thr_cfg = Self::run_config(
            ctx,
            &format!("mba-{}%", throttled.applied),
            Limit::Bandwidth(throttled),
        );
        info!(
            "validate: mba throttling to {}% (requested {}%), expecting {:.2}-{:.2} of unthrottled",
            throttled.applied, throttled.requested, band.lo, band.hi
        );

        Ok(repeat(self.kind(), params.repetitions, params.policy, |_| {
            let base = ctx.v.run_once(&base_cfg)?;
            let thr = ctx.v.run_once(&thr_cfg)?;
            if base.measured <= 0.0 {
                return Err(MeasurementError("no unthrottled bandwidth".into()).into());
            }
            let measured = thr.measured / base.measured;
            let expected = throttled.ratio();
            let passed = band.contains(measured);
            info!(
                "validate: mba {} -> {} ({}% of unthrottled, expected {}%) {}",
                format_bandwidth(base.measured),
                format_bandwidth(thr.measured),
                format_pct(measured),
                format_pct(expected),
                if passed { "ok" } else { "out of band" }
            );
            Ok(RunResult {
                measured,
                expected,
                ratio: measured / expected,
                passed,
                nr_samples: base.nr_samples + thr.nr_samples,
                nr_skipped: base.nr_skipped + thr.nr_skipped,
                ..Default::default()
            })
        }))
    }
}
