use std::io::{self, Write};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info};

use super::address_home::AddressHomeLookup;
use super::dram_directory_cntlr::DramDirectoryCntlr;
use super::l1_cache_cntlr::L1CacheCntlr;
use super::l2_cache_cntlr::{L2CacheCntlr, ShmemHome};
use super::network::{Dest, NetEvent, Network, ShmemSender, Transport};
use super::shmem_msg::{MemComponent, ShmemMsg};
use super::stats::TileSummary;
use super::sync::{Halt, Signal};
use super::{Address, TileId};
use crate::sim::config::MemoryConfig;
use crate::timeq::{Cycle, ShmemPerfModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockSignal {
    #[default]
    None,
    /// First half of an atomic pair: keep the L1 lock after the access.
    Lock,
    /// Second half: the lock is already held.
    Unlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOp {
    Read,
    ReadEx,
    Write,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessSummary {
    pub misses: u32,
    pub latency: Cycle,
}

/// Memory system of one tile: both L1s, the L2 and, on home tiles, a directory with its DRAM.
pub struct MemoryManager {
    tile_id: TileId,
    block_size: usize,
    l1: L1CacheCntlr,
    l2: L2CacheCntlr,
    dram_directory: Option<Mutex<DramDirectoryCntlr>>,
    homes: Arc<AddressHomeLookup>,
    transport: Arc<dyn Transport>,
    perf: Arc<ShmemPerfModel>,
    halt: Arc<Halt>,
    // network -> user: the outstanding miss was served
    user_wake: Signal,
    // user -> network: the served line is in use
    network_wake: Signal,
}

impl MemoryManager {
    pub fn new(
        tile_id: TileId,
        num_tiles: usize,
        config: &MemoryConfig,
        homes: Arc<AddressHomeLookup>,
        transport: Arc<dyn Transport>,
        halt: Arc<Halt>,
    ) -> Self {
        let perf = Arc::new(ShmemPerfModel::default());
        let dram_directory = homes
            .is_home(tile_id)
            .then(|| Mutex::new(DramDirectoryCntlr::new(tile_id, num_tiles, config, perf.clone())));
        Self {
            tile_id,
            block_size: config.block_size,
            l1: L1CacheCntlr::new(tile_id, config, perf.clone(), &halt),
            l2: L2CacheCntlr::new(tile_id, config, perf.clone(), &halt),
            dram_directory,
            homes,
            transport,
            perf,
            user_wake: Signal::new(halt.clone()),
            network_wake: Signal::new(halt.clone()),
            halt,
        }
    }

    pub fn tile_id(&self) -> TileId {
        self.tile_id
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn l2(&self) -> &L2CacheCntlr {
        &self.l2
    }

    pub fn perf(&self) -> &ShmemPerfModel {
        &self.perf
    }

    pub fn dram_directory(&self) -> Option<MutexGuard<'_, DramDirectoryCntlr>> {
        self.dram_directory
            .as_ref()
            .map(|dir| dir.lock().expect("lock poisoned"))
    }

    /// Performs a core access of `buf.len()` bytes at `address`, one line at a time.  Reads fill
    /// `buf`; writes store it.  A fatal error halts the whole memory system.
    pub fn core_initiate_memory_access(
        &self,
        component: MemComponent,
        lock_signal: LockSignal,
        op: MemOp,
        address: Address,
        buf: &mut [u8],
    ) -> AccessSummary {
        self.halt
            .guard(|| self.access_lines(component, lock_signal, op, address, buf))
    }

    fn access_lines(
        &self,
        component: MemComponent,
        lock_signal: LockSignal,
        op: MemOp,
        address: Address,
        buf: &mut [u8],
    ) -> AccessSummary {
        assert!(
            component.is_l1(),
            "tile {}: core access through {:?}",
            self.tile_id,
            component
        );
        let start = self.perf.user().now();
        let block_size = self.block_size as Address;
        let end = match address.checked_add(buf.len() as Address) {
            Some(end) => end,
            None => panic!(
                "tile {}: {}-byte access at {:#x} wraps the address space",
                self.tile_id,
                buf.len(),
                address
            ),
        };
        let mut misses = 0;
        let mut cursor = address;
        while cursor < end {
            let line = cursor & !(block_size - 1);
            let offset = (cursor - line) as usize;
            let len = ((line + block_size).min(end) - cursor) as usize;
            if lock_signal != LockSignal::None {
                assert!(
                    cursor == address && cursor + len as Address == end,
                    "tile {}: atomic access at {:#x} spans lines",
                    self.tile_id,
                    address
                );
            }
            let chunk = &mut buf[(cursor - address) as usize..][..len];
            let hit = self
                .l1
                .process_mem_op_from_core(self, component, lock_signal, op, line, offset, chunk);
            if !hit {
                misses += 1;
            }
            cursor += len as Address;
        }
        AccessSummary {
            misses,
            latency: self.perf.user().now() - start,
        }
    }

    /// Entry point of the network context for every delivered protocol message.
    pub fn handle_msg_from_network(&self, sender: TileId, time: Cycle, msg: ShmemMsg) {
        self.perf.network().update(time);
        match (msg.sender_component, msg.receiver_component) {
            (from, MemComponent::L2Cache) if from.is_l1() => {
                assert_eq!(sender, self.tile_id, "tile {}: L1 request from tile {}", self.tile_id, sender);
                self.l2.handle_msg_from_l1(self, msg);
            }
            (MemComponent::DramDirectory, MemComponent::L2Cache) => {
                self.l2.handle_msg_from_dram_directory(self, sender, msg);
            }
            (MemComponent::L2Cache, MemComponent::DramDirectory) => match &self.dram_directory {
                Some(dir) => dir.lock().expect("lock poisoned").handle_msg_from_l2(sender, msg, self),
                None => panic!(
                    "tile {}: {:?} @ {:#x} from tile {} but no directory lives here",
                    self.tile_id, msg.msg_type, msg.address, sender
                ),
            },
            (from, to) => panic!(
                "tile {}: unrecognized route {:?} -> {:?} for {:?}",
                self.tile_id, from, to, msg.msg_type
            ),
        }
    }

    /// Runs the network context until the network shuts down.  A fatal error while handling a
    /// packet halts the whole memory system.
    pub fn serve(&self, inbox: Receiver<NetEvent>, network: &Network) {
        info!("tile {}: network context up", self.tile_id);
        while let Ok(NetEvent::Packet(packet)) = inbox.recv() {
            self.halt.guard(|| {
                let msg = match ShmemMsg::decode(&packet.payload) {
                    Ok(msg) => msg,
                    Err(err) => panic!("tile {}: bad packet from tile {}: {:#}", self.tile_id, packet.sender, err),
                };
                self.handle_msg_from_network(packet.sender, packet.time, msg);
            });
            network.delivered();
        }
        debug!("tile {}: network context down", self.tile_id);
    }

    /// Sends a message stamped with the user clock.
    pub fn send_from_user(&self, msg: ShmemMsg) {
        self.transport
            .send(self.tile_id, Dest::Tile(self.tile_id), self.perf.user().now(), &msg);
    }

    pub fn wake_user(&self) {
        self.user_wake.signal();
    }

    pub fn wait_for_network(&self) {
        self.user_wake.wait();
    }

    pub fn wake_network(&self) {
        self.network_wake.signal();
    }

    pub fn wait_for_user(&self) {
        self.network_wake.wait();
    }

    pub fn summary(&self) -> TileSummary {
        TileSummary {
            tile: self.tile_id,
            user_cycles: self.perf.user().now(),
            network_cycles: self.perf.network().now(),
            l1: self.l1.stats(),
            l2: self.l2.stats(),
            directory: self.dram_directory().map(|dir| dir.summary()),
        }
    }

    pub fn output_summary(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "Tile {}:", self.tile_id)?;
        writeln!(out, "  User Cycles: {}", self.perf.user().now())?;
        writeln!(out, "  Network Cycles: {}", self.perf.network().now())?;
        self.l1.output_summary(out)?;
        self.l2.output_summary(out)?;
        if let Some(dir) = self.dram_directory() {
            dir.output_summary(out)?;
        }
        Ok(())
    }
}

impl ShmemSender for MemoryManager {
    fn send_msg(&self, receiver: TileId, msg: ShmemMsg) {
        self.transport
            .send(self.tile_id, Dest::Tile(receiver), self.perf.network().now(), &msg);
    }

    fn broadcast_msg(&self, msg: ShmemMsg) {
        self.transport
            .send(self.tile_id, Dest::Broadcast, self.perf.network().now(), &msg);
    }
}

impl ShmemHome for MemoryManager {
    fn l1(&self) -> &L1CacheCntlr {
        &self.l1
    }

    fn home(&self, address: Address) -> TileId {
        self.homes.home(address)
    }
}
