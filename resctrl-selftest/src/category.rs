// Copyright (c) Facebook, Inc. and its affiliates.

// The individual test categories under category/ inherit all uses from this
// file. Make common stuff available.
use anyhow::{bail, Result};
use log::{info, warn};
use std::sync::{Arc, Mutex};

use super::counter::CounterSpec;
use super::platform::{L3Cache, PlatformCapabilities, Vendor};
use super::resctrlfs::MonCounter;
use super::sampler::MeasurementError;
use super::schema::{
    bitmask_to_cache_size, BandwidthInfo, CacheBitmask, CacheGeometry, ConfigError, Limit,
};
use super::validate::{repeat, Band, Expected, Metric, RunConfig, RunError, Validator};
use resctrl_selftest_intf::{RunResult, VerdictReport};

use resctrl_util::*;

lazy_static::lazy_static! {
    static ref CATEGORIES: Mutex<Vec<Arc<Box<dyn Category>>>> = Mutex::new(vec![]);
}

pub fn find_category(kind: &str) -> Result<Arc<Box<dyn Category>>> {
    let cats = match CATEGORIES.lock() {
        Ok(v) => v,
        Err(e) => bail!("category registry poisoned ({})", &e),
    };
    for cat in cats.iter() {
        if cat.kind() == kind {
            return Ok(cat.clone());
        }
    }
    bail!("unknown test category {:?}", kind);
}

/// What a category runs against.
pub struct CategoryCtx<'a> {
    pub v: Validator<'a>,
    pub l3: L3Cache,
}

impl<'a> CategoryCtx<'a> {
    pub fn cache_geometry(&self) -> Result<CacheGeometry, RunError> {
        Ok(CacheGeometry::probe(self.v.fs, self.l3.size)?)
    }
}

pub trait Category: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Err(why) if this platform can't run the category.
    fn check_support(&self, plat: &dyn PlatformCapabilities) -> std::result::Result<(), String>;

    fn run(&self, ctx: &CategoryCtx) -> std::result::Result<VerdictReport, RunError>;
}

fn register_category(cat: Box<dyn Category>) {
    if let Ok(mut cats) = CATEGORIES.lock() {
        if !cats.iter().any(|x| x.kind() == cat.kind()) {
            cats.push(Arc::new(cat));
        }
    }
}

mod cat;
mod cqm;
mod mba;
mod mbm;

pub fn init_categories() {
    register_category(Box::new(mbm::MbmCategory {}));
    register_category(Box::new(mba::MbaCategory {}));
    register_category(Box::new(cqm::CqmCategory {}));
    register_category(Box::new(cat::CatCategory {}));
}

/// Runs `cat` or explains why it can't be.
pub fn run_category(
    cat: &dyn Category,
    ctx: &CategoryCtx,
    plat: &dyn PlatformCapabilities,
) -> VerdictReport {
    let params = ctx.v.params;

    if let Err(why) = cat.check_support(plat) {
        warn!("validate: skipping {} ({})", cat.kind(), &why);
        return VerdictReport::skipped(cat.kind(), params.policy, &why);
    }

    info!("validate: {} starting", cat.kind());
    match cat.run(ctx) {
        Ok(report) => report,
        Err(e) => {
            warn!("validate: {} failed to set up ({})", cat.kind(), &e);
            let mut report = VerdictReport::new(cat.kind(), params.policy);
            report.error = Some(format!("{:#}", &e));
            report.conclude(params.repetitions);
            report
        }
    }
}
