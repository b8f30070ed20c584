// Copyright (c) Facebook, Inc. and its affiliates.
use log::warn;
use std::fmt;
use thiserror::Error;

use super::resctrlfs::{FsError, ResctrlFs};

pub const CACHE_RESOURCE: &str = "L3";
pub const BANDWIDTH_RESOURCE: &str = "MB";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("cache bitmask is empty")]
    EmptyMask,
    #[error("cache bitmask {0:#x} is not contiguous")]
    NonContiguous(u64),
    #[error("cache bitmask {mask:#x} is outside the full mask {full:#x}")]
    OutOfRange { mask: u64, full: u64 },
    #[error("cache bitmask {mask:#x} has fewer than the minimum {min} bits")]
    TooShort { mask: u64, min: u32 },
    #[error("{req} cache bits requested but only {avail} available")]
    TooManyBits { req: u32, avail: u32 },
    #[error("bandwidth {0}% out of range (1-100)")]
    BandwidthRange(u32),
    #[error("invalid cache geometry ({0})")]
    Geometry(String),
}

/// A set of cache ways. The kernel only accepts a single contiguous run of
/// set bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheBitmask(u64);

impl CacheBitmask {
    pub fn is_contiguous(mask: u64) -> bool {
        if mask == 0 {
            return false;
        }
        let shifted = mask >> mask.trailing_zeros();
        shifted & shifted.wrapping_add(1) == 0
    }

    pub fn new(mask: u64) -> Result<Self, ConfigError> {
        if mask == 0 {
            Err(ConfigError::EmptyMask)
        } else if !Self::is_contiguous(mask) {
            Err(ConfigError::NonContiguous(mask))
        } else {
            Ok(Self(mask))
        }
    }

    /// The lowest `nr` bits.
    pub fn low_bits(nr: u32) -> Result<Self, ConfigError> {
        match nr {
            0 => Err(ConfigError::EmptyMask),
            1..=63 => Ok(Self((1u64 << nr) - 1)),
            64 => Ok(Self(u64::MAX)),
            _ => Err(ConfigError::TooManyBits { req: nr, avail: 64 }),
        }
    }

    /// The bits of `full` not in this mask, if they're contiguous.
    pub fn complement_within(&self, full: u64) -> Result<Self, ConfigError> {
        Self::new(full & !self.0)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn nr_bits(&self) -> u32 {
        self.0.count_ones()
    }

    /// Moves the mask up so that its lowest set bit is `bit`.
    pub fn shifted_to(&self, bit: u32) -> Result<Self, ConfigError> {
        let base = self.0 >> self.0.trailing_zeros();
        match base.checked_shl(bit) {
            Some(v) if v >> bit == base => Ok(Self(v)),
            _ => Err(ConfigError::TooManyBits {
                req: bit + self.nr_bits(),
                avail: 64,
            }),
        }
    }
}

impl fmt::Display for CacheBitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// L3 allocation geometry of the domain the benchmark runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheGeometry {
    pub full_mask: u64,
    pub min_cbm_bits: u32,
    pub cache_size: u64,
}

impl CacheGeometry {
    pub fn probe(fs: &ResctrlFs, cache_size: u64) -> Result<Self, FsError> {
        Ok(Self {
            full_mask: fs.cbm_mask(CACHE_RESOURCE)?,
            min_cbm_bits: fs.min_cbm_bits(CACHE_RESOURCE)?,
            cache_size,
        })
    }

    pub fn nr_bits(&self) -> u32 {
        self.full_mask.count_ones()
    }

    pub fn per_bit_size(&self) -> Result<u64, ConfigError> {
        if self.full_mask == 0 || self.cache_size == 0 {
            return Err(ConfigError::Geometry(format!(
                "full mask {:#x}, cache size {}",
                self.full_mask, self.cache_size
            )));
        }
        Ok(self.cache_size / self.nr_bits() as u64)
    }

    pub fn validate(&self, mask: &CacheBitmask) -> Result<(), ConfigError> {
        if mask.value() & !self.full_mask != 0 {
            return Err(ConfigError::OutOfRange {
                mask: mask.value(),
                full: self.full_mask,
            });
        }
        if mask.nr_bits() < self.min_cbm_bits {
            return Err(ConfigError::TooShort {
                mask: mask.value(),
                min: self.min_cbm_bits,
            });
        }
        Ok(())
    }

    /// The lowest `nr` bits of the full mask.
    pub fn low_mask(&self, nr: u32) -> Result<CacheBitmask, ConfigError> {
        if nr > self.nr_bits() {
            return Err(ConfigError::TooManyBits {
                req: nr,
                avail: self.nr_bits(),
            });
        }
        let mask = CacheBitmask::low_bits(nr)?.shifted_to(self.full_mask.trailing_zeros())?;
        self.validate(&mask)?;
        Ok(mask)
    }
}

pub fn bitmask_to_cache_size(mask: u64, geom: &CacheGeometry) -> Result<u64, ConfigError> {
    let mask = CacheBitmask::new(mask)?;
    geom.validate(&mask)?;
    Ok(mask.nr_bits() as u64 * geom.per_bit_size()?)
}

pub fn build_cache_schema(resource: &str, domain: u32, mask: &CacheBitmask) -> String {
    format!("{}:{}={}", resource, domain, mask)
}

pub fn build_bandwidth_schema(domain: u32, bw: &AppliedBandwidth) -> String {
    format!("{}:{}={}", BANDWIDTH_RESOURCE, domain, bw.applied)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedBandwidth {
    pub requested: u32,
    pub applied: u32,
    pub rounded: bool,
}

impl AppliedBandwidth {
    pub fn ratio(&self) -> f64 {
        self.applied as f64 / 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthInfo {
    pub gran: u32,
    pub min: u32,
}

impl BandwidthInfo {
    pub fn probe(fs: &ResctrlFs) -> Result<Self, FsError> {
        Ok(Self {
            gran: fs.bandwidth_gran()?,
            min: fs.min_bandwidth()?,
        })
    }

    /// The kernel rounds a throttle value up to its granularity. Do the same
    /// here so that the expected value matches what's actually enforced.
    pub fn apply(&self, requested: u32) -> Result<AppliedBandwidth, ConfigError> {
        if requested == 0 || requested > 100 {
            return Err(ConfigError::BandwidthRange(requested));
        }
        let gran = self.gran.max(1);
        let v = requested.max(self.min);
        let applied = ((v + gran - 1) / gran * gran).min(100);
        let rounded = applied != requested;
        if rounded {
            warn!(
                "resctrl: bandwidth {}% adjusted to {}% (granularity {}%, minimum {}%)",
                requested, applied, self.gran, self.min
            );
        }
        Ok(AppliedBandwidth {
            requested,
            applied,
            rounded,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Limit {
    Cache(CacheBitmask),
    Bandwidth(AppliedBandwidth),
}

impl Limit {
    pub fn resource(&self) -> &'static str {
        match self {
            Self::Cache(_) => CACHE_RESOURCE,
            Self::Bandwidth(_) => BANDWIDTH_RESOURCE,
        }
    }

    pub fn schema_line(&self, domain: u32) -> String {
        match self {
            Self::Cache(mask) => build_cache_schema(CACHE_RESOURCE, domain, mask),
            Self::Bandwidth(bw) => build_bandwidth_schema(domain, bw),
        }
    }

    fn parse_value(&self, v: &str) -> Option<u64> {
        match self {
            Self::Cache(_) => u64::from_str_radix(v, 16).ok(),
            Self::Bandwidth(_) => v.parse::<u64>().ok(),
        }
    }

    fn value(&self) -> u64 {
        match self {
            Self::Cache(mask) => mask.value(),
            Self::Bandwidth(bw) => bw.applied as u64,
        }
    }

    /// Whether the schemata read back from the group carries this limit for
    /// `domain`.
    pub fn is_applied(&self, lines: &[String], domain: u32) -> bool {
        for line in lines {
            if let Some((res, doms)) = parse_schema_line(line) {
                if res != self.resource() {
                    continue;
                }
                return doms
                    .iter()
                    .any(|(d, v)| *d == domain && self.parse_value(v) == Some(self.value()));
            }
        }
        false
    }
}

/// Parses `RES:dom=val;dom=val`. Values are returned trimmed but otherwise
/// verbatim as the kernel pads them differently per resource.
pub fn parse_schema_line(line: &str) -> Option<(String, Vec<(u32, String)>)> {
    let (res, rest) = line.trim().split_once(':')?;
    let mut doms = vec![];
    for tok in rest.split(';').map(|x| x.trim()).filter(|x| !x.is_empty()) {
        let (dom, val) = tok.split_once('=')?;
        doms.push((dom.trim().parse::<u32>().ok()?, val.trim().to_string()));
    }
    Some((res.trim().to_string(), doms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geom_12m() -> CacheGeometry {
        CacheGeometry {
            full_mask: 0xfff,
            min_cbm_bits: 1,
            cache_size: 12 << 20,
        }
    }

    #[test]
    fn test_contiguity() {
        for (mask, ok) in &[
            (0x1u64, true),
            (0xf0, true),
            (0xfff, true),
            (u64::MAX, true),
            (0x0, false),
            (0x5, false),
            (0xf0f, false),
        ] {
            assert_eq!(CacheBitmask::is_contiguous(*mask), *ok, "mask={:#x}", mask);
        }
        assert_eq!(CacheBitmask::new(0x5), Err(ConfigError::NonContiguous(0x5)));
        assert_eq!(CacheBitmask::new(0), Err(ConfigError::EmptyMask));
    }

    #[test]
    fn test_bitmask_to_cache_size() {
        let geom = geom_12m();
        assert_eq!(bitmask_to_cache_size(0x1, &geom).unwrap(), 1 << 20);
        assert_eq!(bitmask_to_cache_size(0x1f, &geom).unwrap(), 5 << 20);
        assert_eq!(bitmask_to_cache_size(0xfff, &geom).unwrap(), 12 << 20);
        assert_eq!(
            bitmask_to_cache_size(0x5, &geom),
            Err(ConfigError::NonContiguous(0x5))
        );
        assert_eq!(
            bitmask_to_cache_size(0x1000, &geom),
            Err(ConfigError::OutOfRange {
                mask: 0x1000,
                full: 0xfff
            })
        );

        let mut geom2 = geom;
        geom2.min_cbm_bits = 2;
        assert!(matches!(
            bitmask_to_cache_size(0x1, &geom2),
            Err(ConfigError::TooShort { .. })
        ));
    }

    #[test]
    fn test_size_monotonic_in_popcount() {
        let geom = geom_12m();
        let mut last = 0;
        for nr in 1..=12 {
            let size = bitmask_to_cache_size(CacheBitmask::low_bits(nr).unwrap().value(), &geom)
                .unwrap();
            assert!(size > last);
            last = size;
        }
    }

    #[test]
    fn test_masks() {
        let geom = CacheGeometry {
            full_mask: 0x7f0,
            min_cbm_bits: 1,
            cache_size: 7 << 20,
        };
        let mask = geom.low_mask(3).unwrap();
        assert_eq!(mask.value(), 0x70);
        assert_eq!(mask.complement_within(geom.full_mask).unwrap().value(), 0x780);
        assert!(geom.low_mask(8).is_err());

        let mid = CacheBitmask::new(0x38).unwrap();
        assert!(mid.complement_within(0xff).is_err());
    }

    #[test]
    fn test_schema_lines() {
        let mask = CacheBitmask::new(0x3f).unwrap();
        assert_eq!(build_cache_schema("L3", 1, &mask), "L3:1=3f");

        let bw = BandwidthInfo { gran: 10, min: 10 }.apply(20).unwrap();
        assert_eq!(build_bandwidth_schema(0, &bw), "MB:0=20");
        assert!(!bw.rounded);

        assert_eq!(
            parse_schema_line("  L3:0=0ff;1=fff").unwrap(),
            ("L3".to_string(), vec![(0, "0ff".to_string()), (1, "fff".to_string())])
        );
        assert!(parse_schema_line("garbage").is_none());

        // Kernel readback pads values.
        let lines = vec!["L3:0=0003f;1=fffff".to_string(), "MB:0= 20;1=100".to_string()];
        assert!(Limit::Cache(mask).is_applied(&lines, 0));
        assert!(!Limit::Cache(mask).is_applied(&lines, 1));
        assert!(Limit::Bandwidth(bw).is_applied(&lines, 0));
        assert!(!Limit::Bandwidth(bw).is_applied(&lines, 2));
    }

    #[test]
    fn test_bandwidth_rounding() {
        let info = BandwidthInfo { gran: 10, min: 10 };
        let bw = info.apply(15).unwrap();
        assert_eq!((bw.applied, bw.rounded), (20, true));
        let bw = info.apply(5).unwrap();
        assert_eq!((bw.applied, bw.rounded), (10, true));
        let bw = info.apply(100).unwrap();
        assert_eq!((bw.applied, bw.rounded), (100, false));
        assert!((info.apply(20).unwrap().ratio() - 0.2).abs() < 1e-9);

        let info = BandwidthInfo { gran: 30, min: 10 };
        assert_eq!(info.apply(95).unwrap().applied, 100);

        assert_eq!(info.apply(0), Err(ConfigError::BandwidthRange(0)));
        assert_eq!(info.apply(101), Err(ConfigError::BandwidthRange(101)));
    }
}
