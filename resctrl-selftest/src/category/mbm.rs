// Copyright (c) Facebook, Inc. and its affiliates.
//
// Memory bandwidth monitoring: the group's mbm_total_bytes must track what
// the memory controllers saw while the benchmark streamed through its buffer.
use super::*;

pub struct MbmCategory {}

impl Category for MbmCategory {
    fn kind(&self) -> &'static str {
        "mbm"
    }

    fn check_support(&self, plat: &dyn PlatformCapabilities) -> std::result::Result<(), String> {
        if plat.vendor() != Vendor::Intel {
            return Err(format!(
                "memory controller counters not supported on {} CPUs",
                plat.vendor()
            ));
        }
        if !plat.features().mbm_total {
            return Err("mbm_total_bytes monitoring not available".into());
        }
        Ok(())
    }

    fn run(&self, ctx: &CategoryCtx) -> std::result::Result<VerdictReport, RunError> {
        let params = ctx.v.params;
        let cfg = RunConfig {
            name: self.kind().into(),
            limit: None,
            bench: ctx.v.bench_cmd(params.span),
            primary: CounterSpec::Resctrl(MonCounter::MbmTotal),
            reference: Some(CounterSpec::Imc(params.bw_report)),
            metric: Metric::MeanRate,
            expected: Expected::ReferenceRate,
            band: Band::around(1.0, params.tolerances.mbm),
        };
        info!(
            "validate: mbm span={} bw_report={:?} tolerance={}%",
            format_size(params.span),
            params.bw_report,
            format_pct(params.tolerances.mbm)
        );
        Ok(ctx.v.run_repeated(&cfg))
    }
}
