// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::{error, info, warn};
use std::fs;
use std::io::Write;
use std::process::exit;

use resctrl_selftest_intf::{Args, Params, RunParameters, VerdictReport};
use resctrl_util::*;

mod bench;
mod category;
mod counter;
mod perf;
mod platform;
mod resctrlfs;
mod sampler;
mod schema;
mod validate;

use bench::FillBufSpawner;
use category::{find_category, run_category, CategoryCtx};
use counter::SystemCounters;
use platform::{check_privilege, PlatformCapabilities, SystemPlatform};
use resctrlfs::{Backing, ResctrlFs};
use sampler::SystemClock;
use validate::Validator;

fn write_result_file(path: &str, reports: &[VerdictReport]) -> Result<()> {
    let serialized = serde_json::to_string_pretty(reports)?;
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("opening {:?}", path))?;
    f.write_all(serialized.as_ref())?;
    Ok(())
}

/// Runs the selected categories in order. Fails only if the environment
/// can't be set up at all; category failures are in the reports.
fn run_tests(args: &Args, rp: &RunParameters) -> Result<Vec<VerdictReport>> {
    check_privilege()?;

    let rfs = ResctrlFs::new(&args.resctrl, Backing::Kernel);
    // Unmounted on every return path below unless --keep-mounted.
    let _mount = rfs.mount_scoped(args.remount, args.keep_mounted)?;

    let plat = SystemPlatform::probe(&rfs);
    let l3 = plat
        .l3_cache(rp.cpu)
        .with_context(|| format!("looking up the L3 cache of cpu {}", rp.cpu))?;
    info!(
        "selftest: {} cpu {} L3 domain {} ({})",
        plat.vendor(),
        rp.cpu,
        l3.id,
        format_size(l3.size)
    );

    let spawner = FillBufSpawner::new()?;
    let counters = SystemCounters::new(&rfs);
    let clock = SystemClock::new();
    let ctx = CategoryCtx {
        v: Validator {
            fs: &rfs,
            spawner: &spawner,
            counters: &counters,
            clock: &clock,
            params: rp,
            domain: l3.id,
        },
        l3,
    };

    let mut reports = vec![];
    for kind in args.tests.iter() {
        if prog_exiting() {
            warn!("selftest: interrupted, skipping the remaining tests");
            break;
        }
        let cat = find_category(kind)?;
        let report = run_category(&**cat, &ctx, &plat);
        println!("{}", report.summary());
        reports.push(report);
    }
    Ok(reports)
}

fn main() {
    let argv: Vec<String> = std::env::args().collect();
    let (argv, benchmark) = Args::split_benchmark_cmd(argv);

    let mut args_file = Args::init_args_and_logging(&argv).unwrap_or_else(|e| {
        error!("Failed to process args file ({:#})", &e);
        exit(1);
    });
    if benchmark.is_some() {
        args_file.data.benchmark = benchmark;
    }
    let args = &args_file.data;

    if let Err(e) = setup_prog_state() {
        error!("{:#}", &e);
        exit(1);
    }
    category::init_categories();

    let params_file = JsonConfigFile::<Params>::load_or_create(args.params.as_ref())
        .unwrap_or_else(|e| {
            error!("Failed to process params file ({:#})", &e);
            exit(1);
        });
    let rp = RunParameters::new(args, &params_file.data).unwrap_or_else(|e| {
        error!("Invalid parameters ({:#})", &e);
        exit(1);
    });

    let reports = match run_tests(args, &rp) {
        Ok(v) => v,
        Err(e) => {
            error!("Failed to set up ({:#})", &e);
            exit(1);
        }
    };

    if let Some(path) = args.result.as_ref() {
        if let Err(e) = write_result_file(path, &reports) {
            error!("Failed to write result file ({:#})", &e);
            exit(1);
        }
    }

    let nr_failed = reports.iter().filter(|r| !r.passed()).count();
    if nr_failed > 0 || reports.len() < args.tests.len() {
        error!(
            "selftest: {} of {} tests failed",
            nr_failed + args.tests.len() - reports.len(),
            args.tests.len()
        );
        exit(1);
    }
    info!("selftest: all {} tests passed", reports.len());
}
