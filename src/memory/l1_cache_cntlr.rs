use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use serde::Serialize;

use super::cache::{Cache, CacheLine, CacheStats};
use super::cache_state::CacheState;
use super::memory_manager::{LockSignal, MemOp, MemoryManager};
use super::shmem_msg::{MemComponent, ShmemMsg, ShmemMsgType};
use super::sync::{ComponentLock, Halt};
use super::{Address, TileId};
use crate::sim::config::{CacheConfig, MemoryConfig};
use crate::timeq::ShmemPerfModel;

/// Per-line use counts, folded into the L2 line when the L1 copy goes away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct L1Meta {
    pub reads: u64,
    pub writes: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct L1ComponentStats {
    pub hits: u64,
    pub misses: u64,
    pub cache: CacheStats,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct L1Stats {
    pub icache: L1ComponentStats,
    pub dcache: L1ComponentStats,
}

struct L1Component {
    cache: Mutex<Cache<L1Meta>>,
    lock: ComponentLock,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl L1Component {
    fn new(name: String, config: CacheConfig, block_size: usize, halt: Arc<Halt>) -> Self {
        Self {
            cache: Mutex::new(Cache::new(
                name,
                config.num_sets(block_size),
                config.associativity,
                block_size,
            )),
            lock: ComponentLock::new(halt),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn stats(&self) -> L1ComponentStats {
        L1ComponentStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            cache: self.cache.lock().expect("lock poisoned").stats(),
        }
    }
}

/// Private instruction and data caches of one tile.
pub struct L1CacheCntlr {
    tile_id: TileId,
    icache: L1Component,
    dcache: L1Component,
    perf: Arc<ShmemPerfModel>,
}

impl L1CacheCntlr {
    pub fn new(tile_id: TileId, config: &MemoryConfig, perf: Arc<ShmemPerfModel>, halt: &Arc<Halt>) -> Self {
        let block_size = config.block_size;
        Self {
            tile_id,
            icache: L1Component::new(format!("L1-I {}", tile_id), config.l1_icache, block_size, halt.clone()),
            dcache: L1Component::new(format!("L1-D {}", tile_id), config.l1_dcache, block_size, halt.clone()),
            perf,
        }
    }

    fn component(&self, component: MemComponent) -> &L1Component {
        match component {
            MemComponent::L1ICache => &self.icache,
            MemComponent::L1DCache => &self.dcache,
            other => panic!("L1 cntlr {}: unrecognized mem component {:?}", self.tile_id, other),
        }
    }

    fn cache(&self, component: MemComponent) -> MutexGuard<'_, Cache<L1Meta>> {
        self.component(component).cache.lock().expect("lock poisoned")
    }

    pub fn lock(&self, component: MemComponent) -> &ComponentLock {
        &self.component(component).lock
    }

    pub fn state(&self, component: MemComponent, address: Address) -> CacheState {
        self.cache(component).state(address)
    }

    /// Serves a single-line core access.  Returns true on an L1 hit.
    #[allow(clippy::too_many_arguments)]
    pub fn process_mem_op_from_core(
        &self,
        mm: &MemoryManager,
        component: MemComponent,
        lock_signal: LockSignal,
        op: MemOp,
        address: Address,
        offset: usize,
        buf: &mut [u8],
    ) -> bool {
        let l1 = self.component(component);
        let l2 = mm.l2();
        for access_num in 1..=2 {
            if lock_signal != LockSignal::Unlock {
                l1.lock.acquire();
            }
            if access_num == 2 {
                // the miss was just served: the network context waits until we hold the line
                mm.wake_network();
            }

            self.perf.user().advance(l1.config.tags_access_cycles);
            if self.try_access(mm, component, op, address, offset, buf) {
                if lock_signal != LockSignal::Lock {
                    l1.lock.release();
                }
                if access_num == 1 {
                    l1.hits.fetch_add(1, Ordering::Relaxed);
                }
                return access_num == 1;
            }

            assert_eq!(
                access_num, 1,
                "L1 cntlr {}: {:?} @ {:#x} still misses after the directory replied",
                self.tile_id, op, address
            );
            if lock_signal == LockSignal::Unlock {
                panic!("L1 cntlr {}: unlock access to {:#x} missed", self.tile_id, address);
            }
            l1.misses.fetch_add(1, Ordering::Relaxed);

            let msg_type = match op {
                MemOp::Read => ShmemMsgType::ShReq,
                MemOp::ReadEx | MemOp::Write => ShmemMsgType::ExReq,
            };
            l2.lock().acquire();
            let served = l2.process_shmem_req_from_l1(self, component, msg_type, address);
            l2.lock().release();
            if served {
                let hit = self.try_access(mm, component, op, address, offset, buf);
                assert!(hit, "L1 cntlr {}: line {:#x} not usable after L2 fill", self.tile_id, address);
                if lock_signal != LockSignal::Lock {
                    l1.lock.release();
                }
                return false;
            }

            l1.lock.release();
            debug!("L1 cntlr {}: {:?} @ {:#x} goes to the directory", self.tile_id, msg_type, address);
            let msg = ShmemMsg::new(msg_type, component, MemComponent::L2Cache, self.tile_id, address);
            mm.send_from_user(msg);
            mm.wait_for_network();
        }
        unreachable!("the second access always completes")
    }

    // permission check and access under one critical section
    fn try_access(
        &self,
        mm: &MemoryManager,
        component: MemComponent,
        op: MemOp,
        address: Address,
        offset: usize,
        buf: &mut [u8],
    ) -> bool {
        let l1 = self.component(component);
        {
            let mut cache = self.cache(component);
            let state = cache.state(address);
            let permitted = match op {
                MemOp::Read => state.readable(),
                MemOp::ReadEx | MemOp::Write => state.writable(),
            };
            if !permitted {
                return false;
            }
            match op {
                MemOp::Read | MemOp::ReadEx => cache.read(address, offset, buf).meta.reads += 1,
                MemOp::Write => cache.write(address, offset, buf).meta.writes += 1,
            }
        }
        self.perf.user().advance(l1.config.data_access_cycles);

        if op == MemOp::Write {
            let l2 = mm.l2();
            l2.lock().acquire();
            l2.write_through(address, offset, buf);
            l2.lock().release();
        }
        true
    }

    /// Installs or re-states a line.  Returns the line pushed out to make room, if any.
    pub(crate) fn install(
        &self,
        component: MemComponent,
        address: Address,
        state: CacheState,
        data: &[u8],
    ) -> Option<CacheLine<L1Meta>> {
        let mut cache = self.cache(component);
        if let Some(line) = cache.peek_mut(address) {
            line.state = state;
            return None;
        }
        cache.insert(address, state, L1Meta::default(), data.to_vec())
    }

    pub(crate) fn set_state(&self, component: MemComponent, address: Address, state: CacheState) {
        if let Some(line) = self.cache(component).peek_mut(address) {
            line.state = state;
        }
    }

    pub(crate) fn invalidate(&self, component: MemComponent, address: Address) -> Option<CacheLine<L1Meta>> {
        self.cache(component).invalidate(address)
    }

    pub fn stats(&self) -> L1Stats {
        L1Stats {
            icache: self.icache.stats(),
            dcache: self.dcache.stats(),
        }
    }

    pub fn output_summary(&self, out: &mut impl Write) -> io::Result<()> {
        let stats = self.stats();
        for (name, s) in [("L1-I", stats.icache), ("L1-D", stats.dcache)] {
            writeln!(out, "  {} Cache:", name)?;
            writeln!(out, "    Hits: {}", s.hits)?;
            writeln!(out, "    Misses: {}", s.misses)?;
            let accesses = s.hits + s.misses;
            if accesses > 0 {
                writeln!(out, "    Miss Rate: {:.2}%", 100.0 * s.misses as f64 / accesses as f64)?;
            }
            writeln!(out, "    Evictions: {}", s.cache.evictions)?;
        }
        Ok(())
    }
}
