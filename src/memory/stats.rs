use std::io::{self, Write};

use serde::Serialize;

use super::dram_directory_cntlr::DirectorySummary;
use super::l1_cache_cntlr::L1Stats;
use super::l2_cache_cntlr::L2Stats;
use super::TileId;

/// Counts samples by power of two: bucket 0 holds zero, bucket k holds [2^(k-1), 2^k).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Pow2Histogram {
    buckets: Vec<u64>,
    samples: u64,
    total: u64,
}

impl Pow2Histogram {
    pub fn record(&mut self, value: u64) {
        let bucket = (u64::BITS - value.leading_zeros()) as usize;
        if self.buckets.len() <= bucket {
            self.buckets.resize(bucket + 1, 0);
        }
        self.buckets[bucket] += 1;
        self.samples += 1;
        self.total = self.total.saturating_add(value);
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    pub fn mean(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.total as f64 / self.samples as f64)
    }

    pub fn output(&self, out: &mut impl Write, title: &str) -> io::Result<()> {
        writeln!(out, "    {} ({} samples):", title, self.samples)?;
        for (bucket, count) in self.buckets.iter().enumerate().filter(|&(_, &n)| n > 0) {
            let low = if bucket == 0 { 0 } else { 1u64 << (bucket - 1) };
            writeln!(out, "      >= {}: {}", low, count)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TileSummary {
    pub tile: TileId,
    pub user_cycles: u64,
    pub network_cycles: u64,
    pub l1: L1Stats,
    pub l2: L2Stats,
    pub directory: Option<DirectorySummary>,
}
