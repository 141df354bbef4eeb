use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use serde::Serialize;

use super::cache::{Cache, CacheLine, CacheStats};
use super::cache_state::CacheState;
use super::l1_cache_cntlr::{L1CacheCntlr, L1Meta};
use super::memory_manager::MemoryManager;
use super::network::ShmemSender;
use super::shmem_msg::{MemComponent, ShmemMsg, ShmemMsgType};
use super::stats::Pow2Histogram;
use super::sync::{ComponentLock, Halt};
use super::{Address, TileId};
use crate::sim::config::{CacheConfig, MemoryConfig};
use crate::timeq::{Cycle, ShmemPerfModel};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct L2Meta {
    /// L1 component holding a copy of the line, if any.
    pub cached_loc: Option<MemComponent>,
    pub birth: Cycle,
    pub reads: u64,
    pub writes: u64,
}

impl L2Meta {
    fn fold(&mut self, l1: &L1Meta) {
        self.reads += l1.reads;
        self.writes += l1.writes;
    }
}

/// The single miss a tile may have outstanding at the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutstandingTransaction {
    pub address: Address,
    pub component: MemComponent,
    pub msg_type: ShmemMsgType,
    pub issued_at: Cycle,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct L2Stats {
    pub ex_misses: u64,
    pub sh_misses: u64,
    pub upgrades: u64,
    pub total_miss_latency: u64,
    pub ex_clean_evictions: u64,
    pub ex_dirty_evictions: u64,
    pub sh_clean_evictions: u64,
    pub sh_dirty_evictions: u64,
    pub invalidations: u64,
    pub flushes: u64,
    pub writebacks: u64,
    pub utilization: Pow2Histogram,
    pub lifetime: Pow2Histogram,
    pub cache: CacheStats,
}

/// Shared cache of one tile.  Sits between the two L1s and the home directories and tracks the
/// one outstanding directory transaction of the tile.
pub struct L2CacheCntlr {
    tile_id: TileId,
    cache: Mutex<Cache<L2Meta>>,
    lock: ComponentLock,
    config: CacheConfig,
    outstanding: Mutex<Option<OutstandingTransaction>>,
    stats: Mutex<L2Stats>,
    perf: Arc<ShmemPerfModel>,
}

impl L2CacheCntlr {
    pub fn new(tile_id: TileId, config: &MemoryConfig, perf: Arc<ShmemPerfModel>, halt: &Arc<Halt>) -> Self {
        let l2 = config.l2_cache;
        Self {
            tile_id,
            cache: Mutex::new(Cache::new(
                format!("L2 {}", tile_id),
                l2.num_sets(config.block_size),
                l2.associativity,
                config.block_size,
            )),
            lock: ComponentLock::new(halt.clone()),
            config: l2,
            outstanding: Mutex::new(None),
            stats: Mutex::new(L2Stats::default()),
            perf,
        }
    }

    fn cache(&self) -> MutexGuard<'_, Cache<L2Meta>> {
        self.cache.lock().expect("lock poisoned")
    }

    fn with_stats(&self, f: impl FnOnce(&mut L2Stats)) {
        f(&mut self.stats.lock().expect("lock poisoned"));
    }

    pub fn lock(&self) -> &ComponentLock {
        &self.lock
    }

    pub fn state(&self, address: Address) -> CacheState {
        self.cache().state(address)
    }

    pub fn cached_loc(&self, address: Address) -> Option<MemComponent> {
        self.cache().peek(address).and_then(|line| line.meta.cached_loc)
    }

    pub fn line_data(&self, address: Address) -> Option<Vec<u8>> {
        self.cache().peek(address).map(|line| line.data.to_vec())
    }

    pub fn outstanding(&self) -> Option<OutstandingTransaction> {
        *self.outstanding.lock().expect("lock poisoned")
    }

    /// Addresses and states of every valid line.
    pub fn resident_lines(&self) -> Vec<(Address, CacheState)> {
        self.cache().lines().map(|line| (line.address, line.state)).collect()
    }

    /// Tries to satisfy an L1 miss from this cache.  Caller holds the L1 and L2 locks.
    pub fn process_shmem_req_from_l1(
        &self,
        l1: &L1CacheCntlr,
        component: MemComponent,
        msg_type: ShmemMsgType,
        address: Address,
    ) -> bool {
        self.perf.user().advance(self.config.tags_access_cycles);
        let state = self.state(address);
        let permitted = match msg_type {
            ShmemMsgType::ExReq => state.writable(),
            ShmemMsgType::ShReq => state.readable(),
            other => panic!("L2 cntlr {}: unrecognized request {:?} from {:?}", self.tile_id, other, component),
        };
        if !permitted {
            return false;
        }
        self.perf.user().advance(self.config.data_access_cycles);
        self.insert_into_l1(l1, component, address, state);
        true
    }

    /// Keeps the L2 copy of a line written in L1 current.
    pub fn write_through(&self, address: Address, offset: usize, data: &[u8]) {
        let mut cache = self.cache();
        let state = cache.state(address);
        assert_eq!(
            state,
            CacheState::Modified,
            "L2 cntlr {}: write-through to {:#x} in state {:?}",
            self.tile_id,
            address,
            state
        );
        cache.write(address, offset, data);
    }

    pub fn handle_msg_from_l1(&self, mm: &impl ShmemHome, msg: ShmemMsg) {
        let address = msg.address;
        self.lock.acquire();
        {
            let mut outstanding = self.outstanding.lock().expect("lock poisoned");
            assert!(
                outstanding.is_none(),
                "L2 cntlr {}: {:?} @ {:#x} while {:?} is outstanding",
                self.tile_id,
                msg.msg_type,
                address,
                *outstanding
            );
            *outstanding = Some(OutstandingTransaction {
                address,
                component: msg.sender_component,
                msg_type: msg.msg_type,
                issued_at: self.perf.network().now(),
            });
        }
        match msg.msg_type {
            ShmemMsgType::ExReq => self.with_stats(|s| s.ex_misses += 1),
            ShmemMsgType::ShReq => self.with_stats(|s| s.sh_misses += 1),
            other => panic!("L2 cntlr {}: unrecognized msg type {:?} from L1", self.tile_id, other),
        }
        let request = ShmemMsg::new(msg.msg_type, MemComponent::L2Cache, MemComponent::DramDirectory, self.tile_id, address);
        mm.send_msg(mm.home(address), request);
        self.lock.release();
    }

    pub fn handle_msg_from_dram_directory(&self, mm: &MemoryManager, sender: TileId, msg: ShmemMsg) {
        debug!(
            "L2 cntlr {}: {:?} @ {:#x} from tile {} (requester {})",
            self.tile_id, msg.msg_type, msg.address, sender, msg.requester
        );
        if msg.msg_type.is_terminal_reply() {
            self.handle_terminal_reply(mm, msg);
            return;
        }

        let l1 = mm.l1();
        let address = msg.address;
        // the copy may move between L1s until the L2 lock is held
        let cached_loc = loop {
            let cached_loc = self.cached_loc(address);
            if let Some(component) = cached_loc {
                l1.lock(component).acquire();
            }
            self.lock.acquire();
            if self.cached_loc(address) == cached_loc {
                break cached_loc;
            }
            self.lock.release();
            if let Some(component) = cached_loc {
                l1.lock(component).release();
            }
        };

        self.dispatch_request(mm, sender, &msg);

        self.lock.release();
        if let Some(component) = cached_loc {
            l1.lock(component).release();
        }
    }

    pub(crate) fn dispatch_request(&self, mm: &impl ShmemHome, sender: TileId, msg: &ShmemMsg) {
        let l1 = mm.l1();
        self.perf.network().advance(self.config.tags_access_cycles);
        match msg.msg_type {
            ShmemMsgType::InvReq => self.process_inv_req(l1, mm, sender, msg),
            ShmemMsgType::FlushReq => self.process_flush_req(l1, mm, sender, msg),
            ShmemMsgType::WbReq => self.process_wb_req(l1, mm, sender, msg),
            ShmemMsgType::InvFlushCombinedReq => {
                if msg.single_receiver == Some(self.tile_id) {
                    self.process_flush_req(l1, mm, sender, msg)
                } else {
                    self.process_inv_req(l1, mm, sender, msg)
                }
            }
            other => panic!(
                "L2 cntlr {}: unrecognized msg type {:?} @ {:#x} from tile {}",
                self.tile_id, other, msg.address, sender
            ),
        }
    }

    fn handle_terminal_reply(&self, mm: &MemoryManager, msg: ShmemMsg) {
        let outstanding = match self.outstanding() {
            Some(o) => o,
            None => panic!(
                "L2 cntlr {}: {:?} @ {:#x} with nothing outstanding",
                self.tile_id, msg.msg_type, msg.address
            ),
        };
        let expected = match msg.msg_type {
            ShmemMsgType::ShRep => ShmemMsgType::ShReq,
            _ => ShmemMsgType::ExReq,
        };
        assert!(
            outstanding.address == msg.address && outstanding.msg_type == expected,
            "L2 cntlr {}: {:?} @ {:#x} does not answer {:?}",
            self.tile_id,
            msg.msg_type,
            msg.address,
            outstanding
        );

        let l1 = mm.l1();
        let component = outstanding.component;
        l1.lock(component).acquire();
        self.lock.acquire();

        self.perf.network().advance(self.config.data_access_cycles);
        self.install_reply(mm, &msg, component);

        self.lock.release();
        l1.lock(component).release();

        let now = self.perf.network().now();
        self.with_stats(|s| s.total_miss_latency += now.saturating_sub(outstanding.issued_at));
        self.perf.sync_user_to_network();

        // hand the line to the user context and wait until it holds the L1 lock
        mm.wake_user();
        mm.wait_for_user();
        *self.outstanding.lock().expect("lock poisoned") = None;
    }

    pub(crate) fn install_reply(&self, mm: &impl ShmemHome, msg: &ShmemMsg, component: MemComponent) {
        let l1 = mm.l1();
        let address = msg.address;
        match msg.msg_type {
            ShmemMsgType::ExRep | ShmemMsgType::ShRep => {
                let state = if msg.msg_type == ShmemMsgType::ExRep {
                    CacheState::Modified
                } else {
                    CacheState::Shared
                };
                let data = match msg.data() {
                    Some(data) => data.to_vec(),
                    None => panic!("L2 cntlr {}: {:?} @ {:#x} without data", self.tile_id, msg.msg_type, address),
                };
                self.insert_cache_line(mm, address, state, data);
                self.insert_into_l1(l1, component, address, state);
            }
            ShmemMsgType::UpgradeRep => {
                let state = self.state(address);
                assert!(
                    matches!(state, CacheState::Shared | CacheState::Owned),
                    "L2 cntlr {}: UPGRADE_REP @ {:#x} in state {:?}",
                    self.tile_id,
                    address,
                    state
                );
                self.cache().set_state(address, CacheState::Modified);
                self.with_stats(|s| s.upgrades += 1);
                self.insert_into_l1(l1, component, address, CacheState::Modified);
            }
            other => panic!("L2 cntlr {}: {:?} is not a terminal reply", self.tile_id, other),
        }
    }

    fn process_inv_req(&self, l1: &L1CacheCntlr, mm: &impl ShmemHome, sender: TileId, msg: &ShmemMsg) {
        let address = msg.address;
        let state = self.state(address);
        if state != CacheState::Invalid {
            assert_eq!(
                state,
                CacheState::Shared,
                "L2 cntlr {}: INV_REQ @ {:#x} in state {:?}",
                self.tile_id,
                address,
                state
            );
            self.invalidate_line(l1, address);
            self.with_stats(|s| s.invalidations += 1);
        } else if !msg.reply_expected {
            return;
        }
        let reply = ShmemMsg::new(ShmemMsgType::InvRep, MemComponent::L2Cache, MemComponent::DramDirectory, msg.requester, address)
            .with_reply_expected(msg.reply_expected);
        mm.send_msg(sender, reply);
    }

    fn process_flush_req(&self, l1: &L1CacheCntlr, mm: &impl ShmemHome, sender: TileId, msg: &ShmemMsg) {
        let address = msg.address;
        let reply = match self.invalidate_line(l1, address) {
            Some(line) => {
                self.perf.network().advance(self.config.data_access_cycles);
                self.with_stats(|s| s.flushes += 1);
                ShmemMsg::new(ShmemMsgType::FlushRep, MemComponent::L2Cache, MemComponent::DramDirectory, msg.requester, address)
                    .with_data(line.data.into_vec())
            }
            None if msg.reply_expected => {
                ShmemMsg::new(ShmemMsgType::InvRep, MemComponent::L2Cache, MemComponent::DramDirectory, msg.requester, address)
            }
            None => return,
        };
        mm.send_msg(sender, reply.with_reply_expected(msg.reply_expected));
    }

    fn process_wb_req(&self, l1: &L1CacheCntlr, mm: &impl ShmemHome, sender: TileId, msg: &ShmemMsg) {
        let address = msg.address;
        assert!(
            !msg.reply_expected,
            "L2 cntlr {}: WB_REQ @ {:#x} expects a broadcast reply",
            self.tile_id, address
        );
        let (state, cached_loc, data) = {
            let mut cache = self.cache();
            let Some(line) = cache.peek_mut(address) else {
                return;
            };
            if line.state == CacheState::Modified {
                line.state = CacheState::Owned;
            }
            (line.state, line.meta.cached_loc, line.data.to_vec())
        };
        if let Some(component) = cached_loc {
            l1.set_state(component, address, state);
        }
        self.perf.network().advance(self.config.data_access_cycles);
        self.with_stats(|s| s.writebacks += 1);
        let reply = ShmemMsg::new(ShmemMsgType::WbRep, MemComponent::L2Cache, MemComponent::DramDirectory, msg.requester, address)
            .with_data(data);
        mm.send_msg(sender, reply);
    }

    /// Copies an L2 line into `component`, moving it out of the other L1 if needed.
    fn insert_into_l1(&self, l1: &L1CacheCntlr, component: MemComponent, address: Address, state: CacheState) {
        let (data, previous) = match self.cache().peek(address) {
            Some(line) => (line.data.to_vec(), line.meta.cached_loc),
            None => panic!("L2 cntlr {}: L1 fill of {:#x}, which L2 does not hold", self.tile_id, address),
        };
        if let Some(other) = previous.filter(|&c| c != component) {
            if let Some(line) = l1.invalidate(other, address) {
                if let Some(l2_line) = self.cache().peek_mut(address) {
                    l2_line.meta.fold(&line.meta);
                }
            }
        }

        let evicted = l1.install(component, address, state, &data);
        let mut cache = self.cache();
        if let Some(victim) = evicted {
            match cache.peek_mut(victim.address) {
                Some(line) => {
                    line.meta.cached_loc = None;
                    line.meta.fold(&victim.meta);
                }
                None => panic!("L2 cntlr {}: L1 victim {:#x} is not in L2", self.tile_id, victim.address),
            }
        }
        if let Some(line) = cache.peek_mut(address) {
            line.meta.cached_loc = Some(component);
        }
    }

    fn insert_cache_line(&self, mm: &impl ShmemHome, address: Address, state: CacheState, data: Vec<u8>) {
        let meta = L2Meta {
            birth: self.perf.network().now(),
            ..L2Meta::default()
        };
        let evicted = self.cache().insert(address, state, meta, data);
        if let Some(victim) = evicted {
            self.evict_line(mm, victim);
        }
    }

    fn evict_line(&self, mm: &impl ShmemHome, mut victim: CacheLine<L2Meta>) {
        if let Some(component) = victim.meta.cached_loc {
            if let Some(line) = mm.l1().invalidate(component, victim.address) {
                victim.meta.fold(&line.meta);
            }
        }
        self.retire(&victim.meta);

        let dirty = victim.state.dirty();
        let cause = self.outstanding().map(|o| o.msg_type);
        self.with_stats(|s| match (cause, dirty) {
            (Some(ShmemMsgType::ShReq), false) => s.sh_clean_evictions += 1,
            (Some(ShmemMsgType::ShReq), true) => s.sh_dirty_evictions += 1,
            (_, false) => s.ex_clean_evictions += 1,
            (_, true) => s.ex_dirty_evictions += 1,
        });

        debug!("L2 cntlr {}: evicting {:#x} ({:?})", self.tile_id, victim.address, victim.state);
        let home = mm.home(victim.address);
        let msg_type = match victim.state {
            CacheState::Invalid => return,
            _ if dirty => ShmemMsgType::FlushRep,
            _ => ShmemMsgType::InvRep,
        };
        let mut msg = ShmemMsg::new(msg_type, MemComponent::L2Cache, MemComponent::DramDirectory, self.tile_id, victim.address);
        if msg_type == ShmemMsgType::FlushRep {
            msg = msg.with_data(victim.data.into_vec());
        }
        mm.send_msg(home, msg);
    }

    // drops the line from L1 and L2
    fn invalidate_line(&self, l1: &L1CacheCntlr, address: Address) -> Option<CacheLine<L2Meta>> {
        let mut line = self.cache().invalidate(address)?;
        if let Some(component) = line.meta.cached_loc {
            if let Some(l1_line) = l1.invalidate(component, address) {
                line.meta.fold(&l1_line.meta);
            }
        }
        self.retire(&line.meta);
        Some(line)
    }

    fn retire(&self, meta: &L2Meta) {
        let now = self.perf.network().now();
        self.with_stats(|s| {
            s.utilization.record(meta.reads + meta.writes);
            s.lifetime.record(now.saturating_sub(meta.birth));
        });
    }

    pub fn stats(&self) -> L2Stats {
        let mut stats = self.stats.lock().expect("lock poisoned").clone();
        stats.cache = self.cache().stats();
        stats
    }

    pub fn output_summary(&self, out: &mut impl Write) -> io::Result<()> {
        let s = self.stats();
        writeln!(out, "  L2 Cache:")?;
        writeln!(out, "    Misses: ex {} sh {}", s.ex_misses, s.sh_misses)?;
        writeln!(out, "    Upgrades: {}", s.upgrades)?;
        let misses = s.ex_misses + s.sh_misses;
        if misses > 0 {
            writeln!(out, "    Average Miss Latency: {:.2}", s.total_miss_latency as f64 / misses as f64)?;
        }
        writeln!(out, "    Evictions on EX_REQ: clean {} dirty {}", s.ex_clean_evictions, s.ex_dirty_evictions)?;
        writeln!(out, "    Evictions on SH_REQ: clean {} dirty {}", s.sh_clean_evictions, s.sh_dirty_evictions)?;
        writeln!(out, "    Invalidations: {}", s.invalidations)?;
        writeln!(out, "    Flushes: {}", s.flushes)?;
        writeln!(out, "    Writebacks: {}", s.writebacks)?;
        s.utilization.output(out, "Utilization")?;
        s.lifetime.output(out, "Lifetime")?;
        Ok(())
    }
}

/// What the L2 needs from its tile beyond the caches themselves.
pub trait ShmemHome: ShmemSender {
    fn l1(&self) -> &L1CacheCntlr;
    fn home(&self, address: Address) -> TileId;
}
