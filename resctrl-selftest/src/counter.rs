// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::debug;

use super::perf::{
    ImcPmu, PerfEvent, PerfEventAttr, CAS_LINE_SIZE, PERF_COUNT_HW_CACHE_MISSES,
    PERF_COUNT_HW_CACHE_REFERENCES, UNCORE_IMC_GLOB,
};
use super::resctrlfs::{GroupRef, MonCounter, ResctrlFs, ResourceGroup};
use resctrl_selftest_intf::BwReport;

/// One read of a counter. `value` is cumulative: bytes for bandwidth
/// counters, bytes resident for occupancy, misses for LLC events.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Reading {
    pub value: u64,
    pub misses: Option<u64>,
    pub hits: Option<u64>,
}

impl Reading {
    pub fn value(value: u64) -> Self {
        Self {
            value,
            ..Default::default()
        }
    }
}

pub trait Counter {
    fn name(&self) -> &str;
    fn read(&mut self) -> Result<Reading>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterSpec {
    Resctrl(MonCounter),
    Imc(BwReport),
    Llc,
}

/// Opens counters which are live once returned.
pub trait CounterFactory {
    fn open(&self, spec: CounterSpec, group: &ResourceGroup) -> Result<Box<dyn Counter>>;
}

pub struct ResctrlCounter {
    name: String,
    fs: ResctrlFs,
    group: GroupRef,
    domain: u32,
    counter: MonCounter,
}

impl ResctrlCounter {
    pub fn new(fs: &ResctrlFs, group: &GroupRef, domain: u32, counter: MonCounter) -> Self {
        Self {
            name: format!("{}/{}", group.name(), counter.file_name()),
            fs: fs.clone(),
            group: group.clone(),
            domain,
            counter,
        }
    }
}

impl Counter for ResctrlCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self) -> Result<Reading> {
        Ok(Reading::value(self.fs.read_counter(
            &self.group,
            self.domain,
            self.counter,
        )?))
    }
}

/// Memory controller traffic of the socket `cpu` belongs to, summed over all
/// of its IMCs.
pub struct ImcCounter {
    name: String,
    reads: Vec<PerfEvent>,
    writes: Vec<PerfEvent>,
}

impl ImcCounter {
    pub fn open(pmus: &[ImcPmu], cpu: u32, report: BwReport) -> Result<Self> {
        let mut reads = vec![];
        let mut writes = vec![];
        for pmu in pmus {
            if report != BwReport::Writes {
                let attr = PerfEventAttr::new(pmu.type_, pmu.cas_read);
                let name = format!("{}/cas_count_read", &pmu.name);
                reads.push(
                    PerfEvent::open(&attr, -1, cpu as i32, &name)
                        .with_context(|| format!("opening {}", &name))?,
                );
            }
            if report != BwReport::Reads {
                let attr = PerfEventAttr::new(pmu.type_, pmu.cas_write);
                let name = format!("{}/cas_count_write", &pmu.name);
                writes.push(
                    PerfEvent::open(&attr, -1, cpu as i32, &name)
                        .with_context(|| format!("opening {}", &name))?,
                );
            }
        }
        for ev in reads.iter().chain(writes.iter()) {
            ev.reset_and_enable()?;
        }
        debug!(
            "sampler: IMC counting on cpu {} across {} controllers ({:?})",
            cpu,
            pmus.len(),
            report
        );
        Ok(Self {
            name: format!("imc/{:?}", report).to_lowercase(),
            reads,
            writes,
        })
    }
}

impl Counter for ImcCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self) -> Result<Reading> {
        let mut cas = 0;
        for ev in self.reads.iter().chain(self.writes.iter()) {
            cas += ev.read()?;
        }
        Ok(Reading::value(cas * CAS_LINE_SIZE))
    }
}

/// LLC misses and references of a task and its descendants.
pub struct LlcCounter {
    name: String,
    misses: PerfEvent,
    refs: PerfEvent,
}

impl LlcCounter {
    pub fn open(pid: u32) -> Result<Self> {
        let name = format!("llc/{}", pid);
        let misses = PerfEvent::open(
            &PerfEventAttr::task_hw(PERF_COUNT_HW_CACHE_MISSES),
            pid as i32,
            -1,
            "cache-misses",
        )
        .context("opening cache-misses")?;
        let refs = PerfEvent::open(
            &PerfEventAttr::task_hw(PERF_COUNT_HW_CACHE_REFERENCES),
            pid as i32,
            -1,
            "cache-references",
        )
        .context("opening cache-references")?;
        misses.reset_and_enable()?;
        refs.reset_and_enable()?;
        Ok(Self { name, misses, refs })
    }
}

impl Counter for LlcCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self) -> Result<Reading> {
        let misses = self.misses.read()?;
        let refs = self.refs.read()?;
        Ok(Reading {
            value: misses,
            misses: Some(misses),
            hits: Some(refs.saturating_sub(misses)),
        })
    }
}

pub struct SystemCounters {
    fs: ResctrlFs,
    imc_glob: String,
}

impl SystemCounters {
    pub fn new(fs: &ResctrlFs) -> Self {
        Self {
            fs: fs.clone(),
            imc_glob: UNCORE_IMC_GLOB.into(),
        }
    }
}

impl CounterFactory for SystemCounters {
    fn open(&self, spec: CounterSpec, group: &ResourceGroup) -> Result<Box<dyn Counter>> {
        Ok(match spec {
            CounterSpec::Resctrl(counter) => Box::new(ResctrlCounter::new(
                &self.fs,
                group.mon(),
                group.domain(),
                counter,
            )),
            CounterSpec::Imc(report) => {
                let pmus = ImcPmu::discover(&self.imc_glob)?;
                Box::new(ImcCounter::open(&pmus, group.core(), report)?)
            }
            CounterSpec::Llc => {
                let pid = group
                    .pid()
                    .ok_or_else(|| anyhow::anyhow!("no task assigned to {}", group.mon().name()))?;
                Box::new(LlcCounter::open(pid)?)
            }
        })
    }
}
