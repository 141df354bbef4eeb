use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, ensure};
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use toml::*;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Workload {
    #[default]
    Random,
    Counter,
}

impl FromStr for Workload {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "random" => Ok(Self::Random),
            "counter" => Ok(Self::Counter),
            _ => Err(format!(
                "unsupported workload '{}', expected one of: random, counter",
                value
            )),
        }
    }
}

/// Sharer-tracking scheme used by every directory entry.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryType {
    #[default]
    FullMap,
    LimitedNoBroadcast,
    LimitedBroadcast,
    Limitless,
}

impl FromStr for DirectoryType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "full_map" => Ok(Self::FullMap),
            "limited_no_broadcast" => Ok(Self::LimitedNoBroadcast),
            "limited_broadcast" => Ok(Self::LimitedBroadcast),
            "limitless" => Ok(Self::Limitless),
            _ => Err(format!(
                "unsupported directory type '{}', expected one of: \
                 full_map, limited_no_broadcast, limited_broadcast, limitless",
                value
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub num_tiles: usize,
    pub active_tiles: Option<usize>,
    pub seed: u64,
    pub workload: Workload,
    pub ops_per_tile: usize,
    pub footprint_lines: usize,
    pub write_ratio: f64,
    pub log_level: u64,
    pub summary_json: Option<PathBuf>,
}

pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> Self {
        match section {
            Some(value) => value.clone().try_into().expect("cannot deserialize config"),
            None => {
                warn!("config section not found");
                Self::default()
            }
        }
    }
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            num_tiles: 4,
            active_tiles: None,
            seed: 0,
            workload: Workload::Random,
            ops_per_tile: 1000,
            footprint_lines: 64,
            write_ratio: 0.3,
            log_level: 0,
            summary_json: None,
        }
    }
}

impl SimConfig {
    pub fn active_tiles(&self) -> usize {
        self.active_tiles.unwrap_or(self.num_tiles)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.num_tiles > 0, "num_tiles must be > 0");
        ensure!(
            self.active_tiles() <= self.num_tiles,
            "active_tiles ({}) exceeds num_tiles ({})",
            self.active_tiles(),
            self.num_tiles
        );
        ensure!(
            (0.0..=1.0).contains(&self.write_ratio),
            "write_ratio must be within [0, 1], got {}",
            self.write_ratio
        );
        ensure!(self.footprint_lines > 0, "footprint_lines must be > 0");
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub size_kb: usize,
    pub associativity: usize,
    pub data_access_cycles: u64,
    pub tags_access_cycles: u64,
}

impl CacheConfig {
    pub fn num_sets(&self, block_size: usize) -> usize {
        (self.size_kb * 1024) / (block_size * self.associativity)
    }

    fn validate(&self, name: &str, block_size: usize) -> anyhow::Result<()> {
        ensure!(self.associativity > 0, "{}: associativity must be > 0", name);
        ensure!(
            (self.size_kb * 1024) % (block_size * self.associativity) == 0,
            "{}: {} KB is not a whole number of {}-way sets of {} B lines",
            name,
            self.size_kb,
            self.associativity,
            block_size
        );
        let sets = self.num_sets(block_size);
        ensure!(sets.is_power_of_two(), "{}: set count {} must be a power of two", name, sets);
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size_kb: 16,
            associativity: 4,
            data_access_cycles: 1,
            tags_access_cycles: 1,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Entries per DRAM directory controller.
    pub total_entries: usize,
    pub associativity: usize,
    pub max_hw_sharers: usize,
    pub directory_type: DirectoryType,
    pub access_cycles: u64,
    pub software_trap_penalty: u64,
}

impl DirectoryConfig {
    pub fn num_sets(&self) -> usize {
        self.total_entries / self.associativity
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            total_entries: 4096,
            associativity: 16,
            max_hw_sharers: 64,
            directory_type: DirectoryType::FullMap,
            access_cycles: 10,
            software_trap_penalty: 200,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct DramConfig {
    pub num_controllers: usize,
    pub latency: u64,
    pub bytes_per_cycle: u32,
}

impl Default for DramConfig {
    fn default() -> Self {
        Self {
            num_controllers: 1,
            latency: 100,
            bytes_per_cycle: 8,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub hop_latency: u64,
    pub flit_bytes: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            hop_latency: 2,
            flit_bytes: 8,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryConfig {
    pub block_size: usize,
    pub l1_icache: CacheConfig,
    pub l1_dcache: CacheConfig,
    pub l2_cache: CacheConfig,
    pub dram_directory: DirectoryConfig,
    pub dram: DramConfig,
    pub network: NetworkConfig,
}

impl Config for MemoryConfig {}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            block_size: 64,
            l1_icache: CacheConfig::default(),
            l1_dcache: CacheConfig::default(),
            l2_cache: CacheConfig {
                size_kb: 256,
                associativity: 8,
                data_access_cycles: 8,
                tags_access_cycles: 3,
            },
            dram_directory: DirectoryConfig::default(),
            dram: DramConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self, num_tiles: usize) -> anyhow::Result<()> {
        ensure!(
            self.block_size.is_power_of_two() && self.block_size >= 8,
            "block_size {} must be a power of two >= 8",
            self.block_size
        );
        self.l1_icache.validate("l1_icache", self.block_size)?;
        self.l1_dcache.validate("l1_dcache", self.block_size)?;
        self.l2_cache.validate("l2_cache", self.block_size)?;

        let dir = &self.dram_directory;
        ensure!(dir.associativity > 0, "dram_directory: associativity must be > 0");
        ensure!(
            dir.total_entries % dir.associativity == 0 && dir.num_sets().is_power_of_two(),
            "dram_directory: {} entries / {} ways must give a power-of-two set count",
            dir.total_entries,
            dir.associativity
        );
        ensure!(dir.max_hw_sharers >= 1, "dram_directory: max_hw_sharers must be >= 1");

        let dram = &self.dram;
        ensure!(
            dram.num_controllers.is_power_of_two(),
            "dram: num_controllers ({}) must be a power of two",
            dram.num_controllers
        );
        if dram.num_controllers > num_tiles {
            bail!(
                "dram: {} controllers do not fit on {} tiles",
                dram.num_controllers,
                num_tiles
            );
        }
        ensure!(dram.bytes_per_cycle > 0, "dram: bytes_per_cycle must be > 0");
        ensure!(self.network.flit_bytes > 0, "network: flit_bytes must be > 0");
        Ok(())
    }

    pub fn log_block_size(&self) -> u32 {
        self.block_size.trailing_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_section_falls_back_to_default() {
        let cfg = MemoryConfig::from_section(None);
        assert_eq!(cfg, MemoryConfig::default());
        assert!(cfg.validate(4).is_ok());
    }

    #[test]
    fn nested_sections_deserialize() {
        let table: Table = toml::from_str(
            r#"
            [mem]
            block_size = 32
            [mem.l2_cache]
            size_kb = 8
            associativity = 2
            [mem.dram_directory]
            total_entries = 64
            associativity = 4
            max_hw_sharers = 2
            directory_type = "limited_broadcast"
            "#,
        )
        .unwrap();
        let cfg = MemoryConfig::from_section(table.get("mem"));
        assert_eq!(cfg.block_size, 32);
        assert_eq!(cfg.l2_cache.num_sets(cfg.block_size), 128);
        assert_eq!(cfg.dram_directory.directory_type, DirectoryType::LimitedBroadcast);
        assert_eq!(cfg.dram_directory.num_sets(), 16);
        // untouched sections keep their defaults
        assert_eq!(cfg.dram, DramConfig::default());
        assert!(cfg.validate(4).is_ok());
    }

    #[test]
    fn directory_type_from_str() {
        assert_eq!("limitless".parse::<DirectoryType>(), Ok(DirectoryType::Limitless));
        assert!("ackwise".parse::<DirectoryType>().is_err());
    }

    #[test]
    fn validate_rejects_bad_geometry() {
        let mut cfg = MemoryConfig::default();
        cfg.block_size = 48;
        assert!(cfg.validate(4).is_err());

        let mut cfg = MemoryConfig::default();
        cfg.dram.num_controllers = 8;
        assert!(cfg.validate(4).is_err());

        let mut cfg = MemoryConfig::default();
        cfg.dram_directory.total_entries = 96;
        cfg.dram_directory.associativity = 32;
        assert!(cfg.validate(4).is_err());

        let mut cfg = MemoryConfig::default();
        cfg.dram_directory.max_hw_sharers = 0;
        assert!(cfg.validate(4).is_err());
    }

    #[test]
    fn sim_config_checks_active_tiles() {
        let mut cfg = SimConfig::default();
        cfg.active_tiles = Some(cfg.num_tiles + 1);
        assert!(cfg.validate().is_err());
        cfg.active_tiles = Some(1);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.active_tiles(), 1);
    }
}
