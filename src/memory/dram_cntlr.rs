use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;

use log::debug;
use serde::Serialize;

use super::{Address, TileId};
use crate::base::mem::HasMemory;
use crate::sim::config::DramConfig;
use crate::timeq::{ServerConfig, ShmemPerfModel, TimedServer};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DramStats {
    pub reads: u64,
    pub writes: u64,
    pub total_access_latency: u64,
}

/// Backing store standing in for DRAM at a home tile.  Blocks spring into existence zero-filled.
pub struct DramCntlr {
    tile_id: TileId,
    block_size: usize,
    blocks: HashMap<Address, Box<[u8]>>,
    server: TimedServer,
    perf: Arc<ShmemPerfModel>,
    access_counts: HashMap<Address, u64>,
    stats: DramStats,
}

impl HasMemory for DramCntlr {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_impl(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), anyhow::Error> {
        let block_size = self.block_size;
        let block = self
            .blocks
            .entry(addr)
            .or_insert_with(|| vec![0u8; block_size].into_boxed_slice());
        buf.copy_from_slice(block);
        Ok(())
    }

    fn write_impl(&mut self, addr: u64, data: &[u8]) -> Result<(), anyhow::Error> {
        self.blocks.insert(addr, data.into());
        Ok(())
    }
}

impl DramCntlr {
    pub fn new(tile_id: TileId, block_size: usize, config: &DramConfig, perf: Arc<ShmemPerfModel>) -> Self {
        Self {
            tile_id,
            block_size,
            blocks: HashMap::new(),
            server: TimedServer::new(ServerConfig {
                base_latency: config.latency,
                bytes_per_cycle: config.bytes_per_cycle,
            }),
            perf,
            access_counts: HashMap::new(),
            stats: DramStats::default(),
        }
    }

    pub fn get_data_from_dram(&mut self, address: Address, requester: TileId, buf: &mut [u8]) {
        if let Err(err) = self.read_block(address, buf) {
            panic!("dram cntlr {}: read for tile {} failed: {:#}", self.tile_id, requester, err);
        }
        self.stats.reads += 1;
        self.charge_access(address);
        debug!("dram {}: read {:#x} for tile {}", self.tile_id, address, requester);
    }

    pub fn put_data_to_dram(&mut self, address: Address, requester: TileId, data: &[u8]) {
        if let Err(err) = self.write_block(address, data) {
            panic!("dram cntlr {}: write for tile {} failed: {:#}", self.tile_id, requester, err);
        }
        self.stats.writes += 1;
        self.charge_access(address);
        debug!("dram {}: write {:#x} for tile {}", self.tile_id, address, requester);
    }

    // the access occupies the network context of the home tile until the DRAM responds
    fn charge_access(&mut self, address: Address) {
        let clock = self.perf.network();
        let ticket = self.server.service(clock.now(), self.block_size as u32);
        clock.update(ticket.ready_at());
        self.stats.total_access_latency += ticket.latency();
        *self.access_counts.entry(address).or_default() += 1;
    }

    /// Block contents without side effects; `None` if never touched.
    pub fn peek(&self, address: Address) -> Option<&[u8]> {
        self.blocks.get(&address).map(|b| &b[..])
    }

    pub fn stats(&self) -> DramStats {
        self.stats
    }

    /// Blocks accessed at least `threshold` times, most accessed first.
    pub fn hot_blocks(&self, threshold: u64) -> Vec<(Address, u64)> {
        let mut hot: Vec<_> = self
            .access_counts
            .iter()
            .filter(|&(_, &n)| n >= threshold)
            .map(|(&a, &n)| (a, n))
            .collect();
        hot.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        hot
    }

    pub fn output_summary(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "  Dram Cntlr:")?;
        writeln!(out, "    Reads: {}", self.stats.reads)?;
        writeln!(out, "    Writes: {}", self.stats.writes)?;
        let accesses = self.stats.reads + self.stats.writes;
        if accesses > 0 {
            writeln!(
                out,
                "    Average Access Latency: {:.2}",
                self.stats.total_access_latency as f64 / accesses as f64
            )?;
        }
        for (address, count) in self.hot_blocks(100).into_iter().take(8) {
            writeln!(out, "    Hot Block {:#x}: {} accesses", address, count)?;
        }
        Ok(())
    }
}
