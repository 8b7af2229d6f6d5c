//! Resource vectors: CPUs, memory and named generic resources (GRES).
//!
//! Every comparison is component-wise. A vector `a` fits in `b` when every
//! dimension of `a` is at most the same dimension of `b`; GRES names absent
//! from a vector count as zero.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One dimension of a [`ResourceVector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Dimension<'a> {
    Cpus,
    Memory,
    Gres(&'a str),
}

impl fmt::Display for Dimension<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Cpus => write!(f, "cpus"),
            Dimension::Memory => write!(f, "memory_mb"),
            Dimension::Gres(name) => write!(f, "gres:{}", name),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceVector {
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub gres: BTreeMap<String, u64>,
}

impl ResourceVector {
    pub fn new(cpus: u32, memory_mb: u64) -> Self {
        Self {
            cpus,
            memory_mb,
            gres: BTreeMap::new(),
        }
    }

    pub fn with_gres(mut self, name: impl Into<String>, count: u64) -> Self {
        let name = name.into();
        if count == 0 {
            self.gres.remove(&name);
        } else {
            self.gres.insert(name, count);
        }
        self
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.cpus == 0 && self.memory_mb == 0 && self.gres.values().all(|&c| c == 0)
    }

    pub fn amount(&self, dim: Dimension<'_>) -> u64 {
        match dim {
            Dimension::Cpus => u64::from(self.cpus),
            Dimension::Memory => self.memory_mb,
            Dimension::Gres(name) => self.gres.get(name).copied().unwrap_or(0),
        }
    }

    /// Dimensions present in either vector, in a stable order.
    pub fn dimensions<'a>(&'a self, other: &'a ResourceVector) -> Vec<Dimension<'a>> {
        let mut dims = vec![Dimension::Cpus, Dimension::Memory];
        let mut names: Vec<&str> = self
            .gres
            .keys()
            .chain(other.gres.keys())
            .map(|s| s.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        dims.extend(names.into_iter().map(Dimension::Gres));
        dims
    }

    /// True when every dimension of `self` is at most the same dimension of `capacity`.
    pub fn fits_within(&self, capacity: &ResourceVector) -> bool {
        self.cpus <= capacity.cpus
            && self.memory_mb <= capacity.memory_mb
            && self
                .gres
                .iter()
                .all(|(name, &count)| count <= capacity.gres.get(name).copied().unwrap_or(0))
    }

    /// `self - other`, or `None` if any dimension would go negative.
    pub fn checked_sub(&self, other: &ResourceVector) -> Option<ResourceVector> {
        if !other.fits_within(self) {
            return None;
        }
        Some(self.saturating_sub(other))
    }

    pub fn saturating_sub(&self, other: &ResourceVector) -> ResourceVector {
        let mut gres = self.gres.clone();
        for (name, &count) in &other.gres {
            if let Some(have) = gres.get_mut(name) {
                *have = have.saturating_sub(count);
            }
        }
        gres.retain(|_, c| *c > 0);
        ResourceVector {
            cpus: self.cpus.saturating_sub(other.cpus),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            gres,
        }
    }

    pub fn saturating_add(&self, other: &ResourceVector) -> ResourceVector {
        let mut gres = self.gres.clone();
        for (name, &count) in &other.gres {
            let entry = gres.entry(name.clone()).or_insert(0);
            *entry = entry.saturating_add(count);
        }
        gres.retain(|_, c| *c > 0);
        ResourceVector {
            cpus: self.cpus.saturating_add(other.cpus),
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
            gres,
        }
    }

    /// `self + other` clamped to `cap`. The flag reports whether clamping happened.
    pub fn add_capped(&self, other: &ResourceVector, cap: &ResourceVector) -> (ResourceVector, bool) {
        let sum = self.saturating_add(other);
        if sum.fits_within(cap) {
            return (sum, false);
        }
        (sum.component_min(cap), true)
    }

    pub fn component_min(&self, other: &ResourceVector) -> ResourceVector {
        let mut gres = BTreeMap::new();
        for (name, &count) in &self.gres {
            let m = count.min(other.gres.get(name).copied().unwrap_or(0));
            if m > 0 {
                gres.insert(name.clone(), m);
            }
        }
        ResourceVector {
            cpus: self.cpus.min(other.cpus),
            memory_mb: self.memory_mb.min(other.memory_mb),
            gres,
        }
    }

    pub fn scaled(&self, factor: u32) -> ResourceVector {
        ResourceVector {
            cpus: self.cpus.saturating_mul(factor),
            memory_mb: self.memory_mb.saturating_mul(u64::from(factor)),
            gres: self
                .gres
                .iter()
                .map(|(n, &c)| (n.clone(), c.saturating_mul(u64::from(factor))))
                .collect(),
        }
    }

    /// Split into `parts` shares whose sum is `self`. Remainders go to the
    /// first shares, so shares are in non-increasing order.
    pub fn split(&self, parts: u32) -> Vec<ResourceVector> {
        if parts == 0 {
            return Vec::new();
        }
        let p = u64::from(parts);
        (0..p)
            .map(|i| {
                let share = |total: u64| total / p + u64::from(i < total % p);
                ResourceVector {
                    cpus: share(u64::from(self.cpus)) as u32,
                    memory_mb: share(self.memory_mb),
                    gres: self
                        .gres
                        .iter()
                        .map(|(n, &c)| (n.clone(), share(c)))
                        .filter(|(_, c)| *c > 0)
                        .collect(),
                }
            })
            .collect()
    }

    /// Normalized leftover of `capacity - self` relative to `total`, in parts
    /// per million summed over the dimensions `total` carries. Lower means a
    /// tighter fit.
    pub fn leftover_score(&self, available: &ResourceVector, total: &ResourceVector) -> u64 {
        let leftover = available.saturating_sub(self);
        total
            .dimensions(&leftover)
            .into_iter()
            .map(|dim| {
                let t = total.amount(dim);
                if t == 0 {
                    0
                } else {
                    leftover.amount(dim).saturating_mul(1_000_000) / t
                }
            })
            .sum()
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpus={},mem={}M", self.cpus, self.memory_mb)?;
        for (name, count) in &self.gres {
            write!(f, ",gres/{}={}", name, count)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_within_checks_every_dimension() {
        let node = ResourceVector::new(4, 8192).with_gres("gpu", 2);
        assert!(ResourceVector::new(4, 8192).fits_within(&node));
        assert!(ResourceVector::new(1, 1).with_gres("gpu", 2).fits_within(&node));
        assert!(!ResourceVector::new(5, 1).fits_within(&node));
        assert!(!ResourceVector::new(1, 1).with_gres("gpu", 3).fits_within(&node));
        assert!(!ResourceVector::new(1, 1).with_gres("fpga", 1).fits_within(&node));
    }

    #[test]
    fn checked_sub_refuses_negative() {
        let a = ResourceVector::new(2, 100);
        assert_eq!(a.checked_sub(&ResourceVector::new(3, 1)), None);
        assert_eq!(
            a.checked_sub(&ResourceVector::new(2, 50)),
            Some(ResourceVector::new(0, 50))
        );
    }

    #[test]
    fn add_capped_clamps_to_total() {
        let total = ResourceVector::new(4, 1000).with_gres("gpu", 1);
        let avail = ResourceVector::new(3, 900);
        let (sum, clamped) = avail.add_capped(&ResourceVector::new(2, 50).with_gres("gpu", 4), &total);
        assert!(clamped);
        assert_eq!(sum, ResourceVector::new(4, 950).with_gres("gpu", 1));

        let (sum, clamped) = avail.add_capped(&ResourceVector::new(1, 100), &total);
        assert!(!clamped);
        assert_eq!(sum, ResourceVector::new(4, 1000));
    }

    #[test]
    fn split_distributes_remainder_to_first_shares() {
        let shares = ResourceVector::new(10, 1000).with_gres("gpu", 3).split(4);
        assert_eq!(shares.len(), 4);
        assert_eq!(shares[0], ResourceVector::new(3, 250).with_gres("gpu", 1));
        assert_eq!(shares[1], ResourceVector::new(3, 250).with_gres("gpu", 1));
        assert_eq!(shares[2], ResourceVector::new(2, 250).with_gres("gpu", 1));
        assert_eq!(shares[3], ResourceVector::new(2, 250));
        let sum = shares
            .iter()
            .fold(ResourceVector::zero(), |acc, s| acc.saturating_add(s));
        assert_eq!(sum, ResourceVector::new(10, 1000).with_gres("gpu", 3));
    }

    #[test]
    fn tighter_fit_scores_lower() {
        let total = ResourceVector::new(8, 8000);
        let share = ResourceVector::new(2, 2000);
        let tight = share.leftover_score(&ResourceVector::new(2, 2000), &total);
        let loose = share.leftover_score(&ResourceVector::new(8, 8000), &total);
        assert_eq!(tight, 0);
        assert!(loose > tight);
    }
}
