// Copyright (c) Facebook, Inc. and its affiliates.
//
// Cache allocation: with a working set sized to N ways, confining the
// benchmark to the N ways should take most LLC misses away compared to
// squeezing it into the minimum allocation next to them.
use super::*;

pub struct CatCategory {}

impl CatCategory {
    /// The smallest allocation which doesn't overlap `allowed`.
    fn restricted_mask(
        geom: &CacheGeometry,
        allowed: &CacheBitmask,
    ) -> std::result::Result<CacheBitmask, ConfigError> {
        let too_many = ConfigError::TooManyBits {
            req: allowed.nr_bits(),
            avail: geom.nr_bits().saturating_sub(geom.min_cbm_bits.max(1)),
        };
        let rest = allowed
            .complement_within(geom.full_mask)
            .map_err(|_| too_many.clone())?;
        let nr = geom.min_cbm_bits.max(1);
        if rest.nr_bits() < nr {
            return Err(too_many);
        }
        let mask = CacheBitmask::low_bits(nr)?.shifted_to(rest.value().trailing_zeros())?;
        geom.validate(&mask)?;
        Ok(mask)
    }

    fn run_config(ctx: &CategoryCtx, name: &str, mask: CacheBitmask, span: u64) -> RunConfig {
        RunConfig {
            name: name.into(),
            limit: Some(Limit::Cache(mask)),
            bench: ctx.v.bench_cmd(span),
            primary: CounterSpec::Llc,
            reference: None,
            metric: Metric::MissRate,
            expected: Expected::Unchecked,
            band: Band::at_least(0.0),
        }
    }
}

impl Category for CatCategory {
    fn kind(&self) -> &'static str {
        "cat"
    }

    fn check_support(&self, plat: &dyn PlatformCapabilities) -> std::result::Result<(), String> {
        if !plat.features().cat_l3 {
            return Err("L3 allocation not available".into());
        }
        Ok(())
    }

    fn run(&self, ctx: &CategoryCtx) -> std::result::Result<VerdictReport, RunError> {
        let params = ctx.v.params;
        let geom = ctx.cache_geometry()?;
        let allowed = geom.low_mask(params.nr_bits)?;
        let restricted = Self::restricted_mask(&geom, &allowed)?;
        let span = bitmask_to_cache_size(allowed.value(), &geom)?;
        let band = Band::at_least(1.0 - params.tolerances.cat);
        info!(
            "validate: cat span={} allowed={} restricted={} min reduction={}%",
            format_size(span),
            &allowed,
            &restricted,
            format_pct(band.lo)
        );

        let allowed_cfg = Self::run_config(ctx, "cat-allowed", allowed, span);
        let restricted_cfg = Self::run_config(ctx, "cat-restricted", restricted, span);

        Ok(repeat(self.kind(), params.repetitions, params.policy, |_| {
            let a = ctx.v.run_once(&allowed_cfg)?;
            let r = ctx.v.run_once(&restricted_cfg)?;
            if r.measured <= 0.0 {
                return Err(MeasurementError("no misses with the restricted mask".into()).into());
            }
            let reduction = 1.0 - a.measured / r.measured;
            let passed = band.contains(reduction);
            info!(
                "validate: cat miss rate {}% allowed vs {}% restricted, reduction {}% {}",
                format_pct(a.measured),
                format_pct(r.measured),
                format_pct(reduction),
                if passed { "ok" } else { "out of band" }
            );
            Ok(RunResult {
                measured: reduction,
                expected: 1.0,
                ratio: reduction,
                passed,
                nr_samples: a.nr_samples + r.nr_samples,
                nr_skipped: a.nr_skipped + r.nr_skipped,
                ..Default::default()
            })
        }))
    }
}
