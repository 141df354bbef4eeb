use std::io::{self, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{bail, ensure, Context};
use log::{info, warn};
use serde::Serialize;

use crate::memory::address_home::AddressHomeLookup;
use crate::memory::directory_entry::DirectoryState;
use crate::memory::network::{Network, NetworkStats, Transport};
use crate::memory::stats::TileSummary;
use crate::memory::{Address, CacheState, MemoryManager, TileId};
use crate::sim::config::{MemoryConfig, SimConfig};

#[derive(Debug, Clone, Serialize)]
pub struct SystemSummary {
    pub num_tiles: usize,
    pub tiles: Vec<TileSummary>,
    pub network: NetworkStats,
}

/// N tiles joined by a network, each with its own network context thread.  The caller supplies
/// the user contexts by calling into `tile(i)` from its own threads.
pub struct System {
    config: SimConfig,
    mem_config: MemoryConfig,
    network: Arc<Network>,
    homes: Arc<AddressHomeLookup>,
    tiles: Vec<Arc<MemoryManager>>,
    threads: Vec<JoinHandle<()>>,
}

impl System {
    pub fn new(config: SimConfig, mem_config: MemoryConfig) -> anyhow::Result<System> {
        config.validate()?;
        mem_config.validate(config.num_tiles)?;
        let num_tiles = config.num_tiles;

        let (network, inboxes) = Network::new(num_tiles, mem_config.network);
        let homes = Arc::new(AddressHomeLookup::new(
            mem_config.block_size,
            mem_config.dram.num_controllers,
            num_tiles,
        ));
        let transport: Arc<dyn Transport> = network.clone();

        let mut tiles = Vec::with_capacity(num_tiles);
        let mut threads = Vec::new();
        for (tile_id, inbox) in inboxes.into_iter().enumerate() {
            let mm = Arc::new(MemoryManager::new(
                tile_id,
                num_tiles,
                &mem_config,
                homes.clone(),
                transport.clone(),
                network.halt().clone(),
            ));
            tiles.push(mm.clone());
            if tile_id >= config.active_tiles() && !homes.is_home(tile_id) {
                continue;
            }
            network.set_running(tile_id, true);
            let net = network.clone();
            let handle = thread::Builder::new()
                .name(format!("tile-{}", tile_id))
                .spawn(move || mm.serve(inbox, &net))
                .with_context(|| format!("failed to spawn network context of tile {}", tile_id))?;
            threads.push(handle);
        }
        info!(
            "system up: {} tiles ({} active), homes {:?}, {:?} directory",
            num_tiles,
            config.active_tiles(),
            homes.controller_tiles(),
            mem_config.dram_directory.directory_type
        );

        Ok(System {
            config,
            mem_config,
            network,
            homes,
            tiles,
            threads,
        })
    }

    pub fn num_tiles(&self) -> usize {
        self.tiles.len()
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn mem_config(&self) -> &MemoryConfig {
        &self.mem_config
    }

    /// Memory system of a running tile.
    pub fn tile(&self, tile_id: TileId) -> &MemoryManager {
        assert!(
            self.network.is_running(tile_id),
            "tile {} is idle and cannot issue accesses",
            tile_id
        );
        &self.tiles[tile_id]
    }

    pub fn home(&self, address: Address) -> TileId {
        self.homes.home(address)
    }

    /// Diagnostic of the fatal error that stopped the run, if any.
    pub fn halt_reason(&self) -> Option<String> {
        self.network.halt().reason()
    }

    /// Blocks until every message sent so far has been handled.  Panics if the run halted.
    pub fn quiesce(&self) {
        self.network.quiesce();
    }

    /// Checks the copies of one line across all L2s against each other and the home directory.
    pub fn check_coherence(&self, address: Address) -> anyhow::Result<()> {
        self.quiesce();
        let copies: Vec<(TileId, CacheState)> = self
            .tiles
            .iter()
            .map(|mm| (mm.tile_id(), mm.l2().state(address)))
            .filter(|&(_, state)| state != CacheState::Invalid)
            .collect();
        let count = |wanted: CacheState| copies.iter().filter(|&&(_, s)| s == wanted).count();

        let modified = count(CacheState::Modified);
        ensure!(modified <= 1, "{:#x}: {} modified copies in {:?}", address, modified, copies);
        ensure!(
            modified == 0 || copies.len() == 1,
            "{:#x}: modified copy alongside others in {:?}",
            address,
            copies
        );
        let owned = count(CacheState::Owned);
        ensure!(owned <= 1, "{:#x}: {} owned copies in {:?}", address, owned, copies);
        if copies.is_empty() {
            return Ok(());
        }

        let home = self.home(address);
        let dir = match self.tiles[home].dram_directory() {
            Some(dir) => dir,
            None => bail!("{:#x}: home tile {} has no directory", address, home),
        };
        let Some(entry) = dir.entry(address) else {
            bail!("{:#x}: cached in {:?} but untracked by tile {}", address, copies, home);
        };
        for &(tile, state) in &copies {
            ensure!(
                entry.in_broadcast_mode() || entry.has_sharer(tile),
                "{:#x}: tile {} holds the line ({:?}) but is not a sharer: {}",
                address,
                tile,
                state,
                entry.describe()
            );
            if state == CacheState::Modified {
                ensure!(
                    entry.state() == DirectoryState::Modified && entry.owner() == Some(tile),
                    "{:#x}: tile {} holds the line modified: {}",
                    address,
                    tile,
                    entry.describe()
                );
            }
        }
        Ok(())
    }

    /// Block holding `address` as stored in its home DRAM.  Never-written blocks read as zeros.
    pub fn read_dram(&self, address: Address) -> Vec<u8> {
        let block_size = self.mem_config.block_size;
        let block = address & !(block_size as Address - 1);
        let home = self.home(address);
        self.tiles[home]
            .dram_directory()
            .and_then(|dir| dir.dram().peek(block).map(<[u8]>::to_vec))
            .unwrap_or_else(|| vec![0; block_size])
    }

    pub fn summary(&self) -> SystemSummary {
        SystemSummary {
            num_tiles: self.num_tiles(),
            tiles: self
                .tiles
                .iter()
                .filter(|mm| self.network.is_running(mm.tile_id()))
                .map(|mm| mm.summary())
                .collect(),
            network: self.network.stats(),
        }
    }

    pub fn output_summary(&self, out: &mut impl Write) -> io::Result<()> {
        for mm in self.tiles.iter().filter(|mm| self.network.is_running(mm.tile_id())) {
            mm.output_summary(out)?;
        }
        self.network.output_summary(out)
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.network.shutdown();
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("tile").to_string();
            if handle.join().is_err() {
                warn!("{} network context panicked", name);
            }
        }
        info!("system down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_geometry_is_reported() {
        let mut mem_config = MemoryConfig::default();
        mem_config.dram.num_controllers = 8;
        let config = SimConfig {
            num_tiles: 4,
            ..SimConfig::default()
        };
        let err = System::new(config, mem_config).err().unwrap();
        assert!(err.to_string().contains("8 controllers do not fit on 4 tiles"));
    }

    #[test]
    #[should_panic(expected = "tile 3 is idle")]
    fn idle_tiles_cannot_issue_accesses() {
        let config = SimConfig {
            num_tiles: 4,
            active_tiles: Some(2),
            ..SimConfig::default()
        };
        let sys = System::new(config, MemoryConfig::default()).unwrap();
        assert_eq!(sys.summary().tiles.len(), 2);
        sys.tile(3);
    }
}
