use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;

use log::debug;
use serde::Serialize;

use super::directory_cache::{DirectoryCacheStats, DramDirectoryCache, EntryId};
use super::directory_entry::{
    plan_ex_req, plan_nullify, plan_sh_req, DirectoryEntry, DirectoryState, ExReqPlan, NullifyPlan,
    ShReqPlan, SharerScheme,
};
use super::dram_cntlr::{DramCntlr, DramStats};
use super::network::ShmemSender;
use super::req_queue_list::{ReqQueueList, ShmemReq};
use super::shmem_msg::{MemComponent, ShmemMsg, ShmemMsgType};
use super::{Address, TileId};
use crate::sim::config::{DirectoryType, MemoryConfig};
use crate::timeq::{Cycle, ShmemPerfModel};

/// Cycles completed requests of one type spent queued behind earlier requests for the same line
/// (serialization) and being serviced (processing).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReqLatency {
    pub completed: u64,
    pub total_serialization: u64,
    pub total_processing: u64,
}

impl ReqLatency {
    fn record(&mut self, serialization: Cycle, processing: Cycle) {
        self.completed += 1;
        self.total_serialization += serialization;
        self.total_processing += processing;
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DirectoryCntlrStats {
    /// Requests by the directory state they found, indexed by `DirectoryState::index`.
    pub ex_reqs: [u64; 4],
    pub sh_reqs: [u64; 4],
    pub nullify_reqs: [u64; 4],
    pub upgrade_replies: u64,
    pub unicast_invalidations: u64,
    pub unicast_invalidated_sharers: u64,
    pub broadcast_invalidations: u64,
    pub ex_latency: ReqLatency,
    pub sh_latency: ReqLatency,
    pub nullify_latency: ReqLatency,
    /// Processing cycles of requests that had to invalidate an OWNED or SHARED line, split by
    /// whether the entry started out in broadcast mode.
    pub unicast_invalidation_latency: u64,
    pub broadcast_invalidation_latency: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectorySummary {
    pub tile: TileId,
    pub cntlr: DirectoryCntlrStats,
    pub cache: DirectoryCacheStats,
    pub dram: DramStats,
}

/// Home-tile side of the protocol: serializes requests per address and drives directory entries
/// through the MOSI transitions.
pub struct DramDirectoryCntlr {
    tile_id: TileId,
    block_size: usize,
    scheme: SharerScheme,
    access_cycles: Cycle,
    directory: DramDirectoryCache,
    dram: DramCntlr,
    queues: ReqQueueList,
    // block bytes returned by an intermediate FLUSH_REP/WB_REP, waiting to be forwarded
    data_list: HashMap<Address, Vec<u8>>,
    // victim address -> address whose request waits for the victim's nullify
    blocked_on_nullify: HashMap<Address, Address>,
    perf: Arc<ShmemPerfModel>,
    stats: DirectoryCntlrStats,
}

impl DramDirectoryCntlr {
    pub fn new(tile_id: TileId, total_tiles: usize, config: &MemoryConfig, perf: Arc<ShmemPerfModel>) -> Self {
        let dir_config = &config.dram_directory;
        let scheme = SharerScheme::new(dir_config, total_tiles);
        Self {
            tile_id,
            block_size: config.block_size,
            scheme,
            access_cycles: dir_config.access_cycles,
            directory: DramDirectoryCache::new(
                dir_config.total_entries,
                dir_config.associativity,
                config.block_size,
                config.dram.num_controllers,
                scheme,
            ),
            dram: DramCntlr::new(tile_id, config.block_size, &config.dram, perf.clone()),
            queues: ReqQueueList::default(),
            data_list: HashMap::new(),
            blocked_on_nullify: HashMap::new(),
            perf,
            stats: DirectoryCntlrStats::default(),
        }
    }

    pub fn handle_msg_from_l2(&mut self, sender: TileId, msg: ShmemMsg, out: &impl ShmemSender) {
        debug!(
            "dram dir {}: {:?} @ {:#x} from tile {} (requester {})",
            self.tile_id, msg.msg_type, msg.address, sender, msg.requester
        );
        match msg.msg_type {
            ShmemMsgType::ExReq | ShmemMsgType::ShReq => {
                let address = msg.address;
                let now = self.perf.network().now();
                if self.queues.enqueue(address, ShmemReq::new(msg, now)) == 1 {
                    self.start_request(address, out);
                }
            }
            ShmemMsgType::InvRep => self.process_inv_rep(sender, &msg, out),
            ShmemMsgType::FlushRep => self.process_flush_rep(sender, &msg, out),
            ShmemMsgType::WbRep => self.process_wb_rep(sender, &msg, out),
            other => panic!(
                "dram dir {}: unrecognized msg type {:?} @ {:#x} from tile {}",
                self.tile_id, other, msg.address, sender
            ),
        }
    }

    fn start_request(&mut self, address: Address, out: &impl ShmemSender) {
        let msg_type = match self.queues.front(address) {
            Some(req) => req.msg.msg_type,
            None => panic!("dram dir {}: no request queued for {:#x}", self.tile_id, address),
        };
        let id = match msg_type {
            ShmemMsgType::ExReq | ShmemMsgType::ShReq => match self.allocate_entry(address, out) {
                Some(id) => id,
                None => return,
            },
            ShmemMsgType::NullifyReq => self.entry_id(address),
            other => panic!("dram dir {}: cannot start {:?} @ {:#x}", self.tile_id, other, address),
        };
        self.record_start(address, id);
        self.dispatch(address, id, out);
    }

    fn dispatch(&mut self, address: Address, id: EntryId, out: &impl ShmemSender) {
        self.charge_access(id);
        let head = match self.queues.front(address) {
            Some(req) => req.msg.msg_type,
            None => panic!("dram dir {}: no request queued for {:#x}", self.tile_id, address),
        };
        match head {
            ShmemMsgType::ExReq => self.process_ex_req(address, id, out),
            ShmemMsgType::ShReq => self.process_sh_req(address, id, out),
            ShmemMsgType::NullifyReq => self.process_nullify_req(address, id, out),
            other => panic!("dram dir {}: unexpected head {:?} @ {:#x}", self.tile_id, other, address),
        }
    }

    /// Directory entry for `address`, allocating one if needed.  Returns `None` when a victim had
    /// to be nullified first; the request is then started once the nullify completes.
    fn allocate_entry(&mut self, address: Address, out: &impl ShmemSender) -> Option<EntryId> {
        if let Some(id) = self.directory.get_directory_entry(address) {
            return Some(id);
        }

        let victim = self.select_victim(address);
        let victim_address = match self.directory.entry(victim).address() {
            Some(a) => a,
            None => panic!("dram dir {}: replacement candidate without an address", self.tile_id),
        };
        debug!(
            "dram dir {}: replacing {:#x} ({:?}) with {:#x}",
            self.tile_id,
            victim_address,
            self.directory.entry(victim).state(),
            address
        );
        self.directory.replace_directory_entry(victim_address, address);

        let nullify = ShmemMsg::new(
            ShmemMsgType::NullifyReq,
            MemComponent::DramDirectory,
            MemComponent::DramDirectory,
            self.tile_id,
            victim_address,
        );
        let now = self.perf.network().now();
        let count = self.queues.enqueue(victim_address, ShmemReq::new(nullify, now));
        assert_eq!(count, 1, "dram dir {}: nullify of {:#x} behind other requests", self.tile_id, victim_address);
        self.blocked_on_nullify.insert(victim_address, address);
        self.start_request(victim_address, out);
        None
    }

    // fewest sharers among entries with no pending request, first in set order on ties
    fn select_victim(&self, address: Address) -> EntryId {
        let victim = self
            .directory
            .replacement_candidates(address)
            .into_iter()
            .filter(|&id| {
                let entry = self.directory.entry(id);
                entry.address().is_some_and(|a| self.queues.is_empty(a))
            })
            .min_by_key(|&id| self.directory.entry(id).num_sharers());
        match victim {
            Some(id) => id,
            None => panic!(
                "dram dir {}: no replacement candidate for {:#x}, every entry in set {} is busy",
                self.tile_id,
                address,
                self.directory.set_index(address)
            ),
        }
    }

    fn record_start(&mut self, address: Address, id: EntryId) {
        let now = self.perf.network().now();
        let entry = self.directory.entry(id);
        let (state, broadcast) = (entry.state(), entry.in_broadcast_mode());
        let Some(req) = self.queues.front_mut(address) else {
            return;
        };
        if req.start_time.is_some() {
            return;
        }
        req.start_time = Some(now);
        req.initial_state = Some(state);
        req.initial_broadcast_mode = broadcast;
        let counters = match req.msg.msg_type {
            ShmemMsgType::ExReq => &mut self.stats.ex_reqs,
            ShmemMsgType::ShReq => &mut self.stats.sh_reqs,
            _ => &mut self.stats.nullify_reqs,
        };
        counters[state.index()] += 1;
    }

    fn charge_access(&self, id: EntryId) {
        let cycles = self.access_cycles + self.directory.entry(id).latency();
        self.perf.network().advance(cycles);
    }

    fn head(&self, address: Address) -> &ShmemReq {
        match self.queues.front(address) {
            Some(req) => req,
            None => panic!("dram dir {}: no request queued for {:#x}", self.tile_id, address),
        }
    }

    fn entry_id(&self, address: Address) -> EntryId {
        match self.directory.find(address) {
            Some(id) => id,
            None => panic!("dram dir {}: no directory entry for {:#x}", self.tile_id, address),
        }
    }

    fn process_ex_req(&mut self, address: Address, id: EntryId, out: &impl ShmemSender) {
        let requester = self.head(address).requester();
        match plan_ex_req(self.directory.entry(id), requester) {
            ExReqPlan::FlushOwner(owner) => {
                out.send_msg(owner, self.request(ShmemMsgType::FlushReq, requester, address));
            }
            ExReqPlan::Upgrade => {
                self.directory.entry_mut(id).upgrade(requester);
                self.stats.upgrade_replies += 1;
                if let Some(req) = self.queues.front_mut(address) {
                    req.upgraded = true;
                }
                out.send_msg(requester, self.reply(ShmemMsgType::UpgradeRep, requester, address));
                self.process_next(address, out);
            }
            ExReqPlan::InvFlushCombined { single_receiver } => {
                self.send_shmem_msg(id, ShmemMsgType::InvFlushCombinedReq, requester, address, single_receiver, out);
            }
            ExReqPlan::Grant => {
                self.directory.entry_mut(id).grant_exclusive(requester);
                let data = self.take_data(address, requester);
                out.send_msg(requester, self.reply(ShmemMsgType::ExRep, requester, address).with_data(data));
                self.process_next(address, out);
            }
        }
    }

    fn process_sh_req(&mut self, address: Address, id: EntryId, out: &impl ShmemSender) {
        let requester = self.head(address).requester();
        let staged = self.data_list.contains_key(&address);
        let (msg_type, waiting_on) = match plan_sh_req(self.directory.entry(id), requester, staged) {
            ShReqPlan::WbOwner(tile) | ShReqPlan::WbSharer(tile) => (ShmemMsgType::WbReq, tile),
            ShReqPlan::FlushSharer(tile) => (ShmemMsgType::FlushReq, tile),
            ShReqPlan::Grant => {
                self.directory.entry_mut(id).grant_shared(requester);
                let data = self.take_data(address, requester);
                out.send_msg(requester, self.reply(ShmemMsgType::ShRep, requester, address).with_data(data));
                self.process_next(address, out);
                return;
            }
        };
        if let Some(req) = self.queues.front_mut(address) {
            req.waiting_on = Some(waiting_on);
        }
        out.send_msg(waiting_on, self.request(msg_type, requester, address));
    }

    fn process_nullify_req(&mut self, address: Address, id: EntryId, out: &impl ShmemSender) {
        let requester = self.head(address).requester();
        match plan_nullify(self.directory.entry(id)) {
            NullifyPlan::FlushOwner(owner) => {
                out.send_msg(owner, self.request(ShmemMsgType::FlushReq, requester, address));
            }
            NullifyPlan::InvFlushCombined { owner } => {
                self.send_shmem_msg(id, ShmemMsgType::InvFlushCombinedReq, requester, address, Some(owner), out);
            }
            NullifyPlan::InvSharers => {
                self.send_shmem_msg(id, ShmemMsgType::InvReq, requester, address, None, out);
            }
            NullifyPlan::Complete => {
                if let Some(data) = self.data_list.remove(&address) {
                    self.dram.put_data_to_dram(address, requester, &data);
                }
                self.directory.invalidate_directory_entry(address);
                debug!("dram dir {}: nullified {:#x}", self.tile_id, address);
                self.process_next(address, out);
                if let Some(waiting) = self.blocked_on_nullify.remove(&address) {
                    self.start_request(waiting, out);
                }
            }
        }
    }

    fn process_inv_rep(&mut self, sender: TileId, msg: &ShmemMsg, out: &impl ShmemSender) {
        let address = msg.address;
        let id = self.entry_id(address);
        self.charge_access(id);
        self.directory.entry_mut(id).apply_inv_rep(sender, msg.reply_expected);
        if !self.queues.is_empty(address) {
            self.restart_shmem_req(sender, address, id, out);
        }
    }

    fn process_flush_rep(&mut self, sender: TileId, msg: &ShmemMsg, out: &impl ShmemSender) {
        let address = msg.address;
        let data = self.payload(sender, msg);
        let id = self.entry_id(address);
        self.charge_access(id);

        let before = self.directory.entry(id).state();
        self.directory.entry_mut(id).apply_flush_rep(sender, msg.reply_expected);
        let after = self.directory.entry(id).state();

        if self.queues.is_empty(address) {
            // eviction, nobody is waiting for the bytes
            self.dram.put_data_to_dram(address, sender, data);
            return;
        }

        self.stage_data(address, data);
        let head = self.head(address).msg.msg_type;
        let lost_owner = matches!(before, DirectoryState::Modified | DirectoryState::Owned)
            && matches!(after, DirectoryState::Shared | DirectoryState::Uncached);
        if head == ShmemMsgType::ShReq && lost_owner {
            // the line stays readable without an owner, so DRAM must hold the dirty bytes
            self.dram.put_data_to_dram(address, sender, data);
        }
        self.restart_shmem_req(sender, address, id, out);
    }

    fn process_wb_rep(&mut self, sender: TileId, msg: &ShmemMsg, out: &impl ShmemSender) {
        let address = msg.address;
        assert!(
            !msg.reply_expected,
            "dram dir {}: WB_REP @ {:#x} from tile {} expects a reply",
            self.tile_id, address, sender
        );
        let data = self.payload(sender, msg);
        let id = self.entry_id(address);
        self.charge_access(id);

        if self.queues.is_empty(address) {
            panic!(
                "dram dir {}: WB_REP @ {:#x} from tile {} with no pending request, {}",
                self.tile_id,
                address,
                sender,
                self.directory.entry(id).describe()
            );
        }
        self.directory.entry_mut(id).apply_wb_rep(sender);
        self.stage_data(address, data);
        self.restart_shmem_req(sender, address, id, out);
    }

    fn restart_shmem_req(&mut self, sender: TileId, address: Address, id: EntryId, out: &impl ShmemSender) {
        let state = self.directory.entry(id).state();
        let Some(req) = self.queues.front_mut(address) else {
            return;
        };
        let ready = match req.msg.msg_type {
            ShmemMsgType::ExReq | ShmemMsgType::NullifyReq => state == DirectoryState::Uncached,
            ShmemMsgType::ShReq => {
                if req.waiting_on == Some(sender) {
                    req.waiting_on = None;
                    true
                } else {
                    false
                }
            }
            other => panic!("dram dir {}: cannot restart {:?} @ {:#x}", self.tile_id, other, address),
        };
        if ready {
            self.dispatch(address, id, out);
        }
    }

    fn process_next(&mut self, address: Address, out: &impl ShmemSender) {
        let done = match self.queues.dequeue(address) {
            Some(req) => req,
            None => panic!("dram dir {}: completing {:#x} with nothing queued", self.tile_id, address),
        };
        assert!(
            !self.data_list.contains_key(&address),
            "dram dir {}: {:?} @ {:#x} completed with staged data left behind",
            self.tile_id,
            done.msg.msg_type,
            address
        );
        self.update_latency_counters(&done);
        if !self.queues.is_empty(address) {
            self.start_request(address, out);
        }
    }

    fn update_latency_counters(&mut self, done: &ShmemReq) {
        let (Some(start), Some(initial_state)) = (done.start_time, done.initial_state) else {
            return;
        };
        let serialization = start.saturating_sub(done.time);
        let processing = self.perf.network().now().saturating_sub(start);
        let invalidated = matches!(initial_state, DirectoryState::Owned | DirectoryState::Shared);
        let counted_as_invalidation = match done.msg.msg_type {
            ShmemMsgType::ExReq => {
                self.stats.ex_latency.record(serialization, processing);
                invalidated && !done.upgraded
            }
            ShmemMsgType::ShReq => {
                self.stats.sh_latency.record(serialization, processing);
                false
            }
            _ => {
                self.stats.nullify_latency.record(serialization, processing);
                invalidated
            }
        };
        if counted_as_invalidation {
            if done.initial_broadcast_mode {
                self.stats.broadcast_invalidation_latency += processing;
            } else {
                self.stats.unicast_invalidation_latency += processing;
            }
        }
    }

    /// Sends `msg_type` to every sharer of the entry: one broadcast when all tiles must be
    /// assumed to hold the line, one unicast per tracked sharer otherwise.
    fn send_shmem_msg(
        &mut self,
        id: EntryId,
        msg_type: ShmemMsgType,
        requester: TileId,
        address: Address,
        single_receiver: Option<TileId>,
        out: &impl ShmemSender,
    ) {
        let (all_tiles, sharers) = self.directory.entry(id).sharers_list();
        let msg = self.request(msg_type, requester, address).with_single_receiver(single_receiver);
        if all_tiles {
            self.stats.broadcast_invalidations += 1;
            let reply_expected = self.scheme.kind == DirectoryType::LimitedBroadcast;
            out.broadcast_msg(msg.with_reply_expected(reply_expected));
        } else {
            self.stats.unicast_invalidations += 1;
            self.stats.unicast_invalidated_sharers += sharers.len() as u64;
            for sharer in sharers {
                out.send_msg(sharer, msg.clone());
            }
        }
    }

    fn request(&self, msg_type: ShmemMsgType, requester: TileId, address: Address) -> ShmemMsg {
        ShmemMsg::new(msg_type, MemComponent::DramDirectory, MemComponent::L2Cache, requester, address)
    }

    fn reply(&self, msg_type: ShmemMsgType, requester: TileId, address: Address) -> ShmemMsg {
        self.request(msg_type, requester, address)
    }

    fn payload<'a>(&self, sender: TileId, msg: &'a ShmemMsg) -> &'a [u8] {
        match msg.data() {
            Some(data) if data.len() == self.block_size => data,
            other => panic!(
                "dram dir {}: {:?} @ {:#x} from tile {} carries {:?} bytes, expected {}",
                self.tile_id,
                msg.msg_type,
                msg.address,
                sender,
                other.map(<[u8]>::len),
                self.block_size
            ),
        }
    }

    fn stage_data(&mut self, address: Address, data: &[u8]) {
        match self.data_list.get(&address) {
            Some(staged) => assert!(
                staged.as_slice() == data,
                "dram dir {}: conflicting data staged for {:#x}",
                self.tile_id,
                address
            ),
            None => {
                self.data_list.insert(address, data.to_vec());
            }
        }
    }

    // staged bytes if a flush or writeback delivered them, DRAM otherwise
    fn take_data(&mut self, address: Address, requester: TileId) -> Vec<u8> {
        match self.data_list.remove(&address) {
            Some(data) => data,
            None => {
                let mut buf = vec![0u8; self.block_size];
                self.dram.get_data_from_dram(address, requester, &mut buf);
                buf
            }
        }
    }

    pub fn tile_id(&self) -> TileId {
        self.tile_id
    }

    /// Current directory entry for `address`, resident or mid-nullify.
    pub fn entry(&self, address: Address) -> Option<&DirectoryEntry> {
        self.directory.find(address).map(|id| self.directory.entry(id))
    }

    pub fn pending_requests(&self) -> usize {
        self.queues.total()
    }

    pub fn dram(&self) -> &DramCntlr {
        &self.dram
    }

    pub fn stats(&self) -> DirectoryCntlrStats {
        self.stats
    }

    pub fn summary(&self) -> DirectorySummary {
        DirectorySummary {
            tile: self.tile_id,
            cntlr: self.stats,
            cache: self.directory.stats(),
            dram: self.dram.stats(),
        }
    }

    pub fn output_summary(&self, out: &mut impl Write) -> io::Result<()> {
        let stats = &self.stats;
        writeln!(out, "Dram Directory Cntlr {}:", self.tile_id)?;
        for state in DirectoryState::ALL {
            let i = state.index();
            writeln!(
                out,
                "  {:?}: ex {} sh {} nullify {}",
                state, stats.ex_reqs[i], stats.sh_reqs[i], stats.nullify_reqs[i]
            )?;
        }
        writeln!(out, "  Upgrade Replies: {}", stats.upgrade_replies)?;
        writeln!(out, "  Unicast Invalidations: {}", stats.unicast_invalidations)?;
        if stats.unicast_invalidations > 0 {
            writeln!(
                out,
                "  Average Sharers Invalidated: {:.2}",
                stats.unicast_invalidated_sharers as f64 / stats.unicast_invalidations as f64
            )?;
        }
        writeln!(out, "  Broadcast Invalidations: {}", stats.broadcast_invalidations)?;
        for (name, latency) in [
            ("EX_REQ", stats.ex_latency),
            ("SH_REQ", stats.sh_latency),
            ("NULLIFY_REQ", stats.nullify_latency),
        ] {
            if latency.completed > 0 {
                let n = latency.completed as f64;
                writeln!(
                    out,
                    "  {} Average Serialization Time: {:.2}, Average Processing Time: {:.2}",
                    name,
                    latency.total_serialization as f64 / n,
                    latency.total_processing as f64 / n
                )?;
            }
        }
        if stats.unicast_invalidations > 0 {
            writeln!(
                out,
                "  Average Unicast Invalidation Processing Time: {:.2}",
                stats.unicast_invalidation_latency as f64 / stats.unicast_invalidations as f64
            )?;
        }
        if stats.broadcast_invalidations > 0 {
            writeln!(
                out,
                "  Average Broadcast Invalidation Processing Time: {:.2}",
                stats.broadcast_invalidation_latency as f64 / stats.broadcast_invalidations as f64
            )?;
        }
        self.directory.output_summary(out)?;
        self.dram.output_summary(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::network::testing::Outbox;
    use crate::memory::network::Dest;

    const BLOCK: usize = 64;

    fn cntlr_with(directory_type: DirectoryType, max_hw_sharers: usize, total_entries: usize) -> DramDirectoryCntlr {
        let mut config = MemoryConfig::default();
        config.dram_directory.directory_type = directory_type;
        config.dram_directory.max_hw_sharers = max_hw_sharers;
        config.dram_directory.total_entries = total_entries;
        config.dram_directory.associativity = 2;
        DramDirectoryCntlr::new(0, 4, &config, Arc::new(ShmemPerfModel::default()))
    }

    fn cntlr() -> DramDirectoryCntlr {
        cntlr_with(DirectoryType::FullMap, 4, 64)
    }

    fn from_l2(msg_type: ShmemMsgType, requester: TileId, address: Address) -> ShmemMsg {
        ShmemMsg::new(msg_type, MemComponent::L2Cache, MemComponent::DramDirectory, requester, address)
    }

    fn deliver(dir: &mut DramDirectoryCntlr, out: &Outbox, sender: TileId, msg: ShmemMsg) -> Vec<(Dest, ShmemMsg)> {
        dir.handle_msg_from_l2(sender, msg, out);
        out.take()
    }

    fn request(dir: &mut DramDirectoryCntlr, out: &Outbox, t: ShmemMsgType, tile: TileId, a: Address) -> Vec<(Dest, ShmemMsg)> {
        deliver(dir, out, tile, from_l2(t, tile, a))
    }

    fn reply(
        dir: &mut DramDirectoryCntlr,
        out: &Outbox,
        t: ShmemMsgType,
        tile: TileId,
        a: Address,
        data: Option<u8>,
    ) -> Vec<(Dest, ShmemMsg)> {
        let mut msg = from_l2(t, tile, a);
        if let Some(byte) = data {
            msg = msg.with_data(vec![byte; BLOCK]);
        }
        deliver(dir, out, tile, msg)
    }

    fn only(sent: Vec<(Dest, ShmemMsg)>) -> (Dest, ShmemMsg) {
        assert_eq!(sent.len(), 1, "expected exactly one message, got {:?}", sent);
        sent.into_iter().next().unwrap()
    }

    fn state(dir: &DramDirectoryCntlr, a: Address) -> DirectoryState {
        dir.entry(a).unwrap().state()
    }

    #[test]
    fn exclusive_request_on_uncached_line_is_served_from_dram() {
        let (mut dir, out) = (cntlr(), Outbox::default());
        let (dest, rep) = only(request(&mut dir, &out, ShmemMsgType::ExReq, 0, 0x1000));
        assert_eq!(dest, Dest::Tile(0));
        assert_eq!(rep.msg_type, ShmemMsgType::ExRep);
        assert_eq!(rep.data(), Some(&[0u8; BLOCK][..]));
        let entry = dir.entry(0x1000).unwrap();
        assert_eq!(entry.state(), DirectoryState::Modified);
        assert_eq!(entry.owner(), Some(0));
        assert_eq!(dir.pending_requests(), 0);
        assert_eq!(dir.stats().ex_reqs[DirectoryState::Uncached.index()], 1);
    }

    #[test]
    fn shared_request_on_modified_line_writes_back_owner() {
        let (mut dir, out) = (cntlr(), Outbox::default());
        request(&mut dir, &out, ShmemMsgType::ExReq, 0, 0x1000);

        let (dest, wb) = only(request(&mut dir, &out, ShmemMsgType::ShReq, 1, 0x1000));
        assert_eq!(dest, Dest::Tile(0));
        assert_eq!(wb.msg_type, ShmemMsgType::WbReq);
        assert_eq!(wb.requester, 1);

        let (dest, rep) = only(reply(&mut dir, &out, ShmemMsgType::WbRep, 0, 0x1000, Some(0x5A)));
        assert_eq!(dest, Dest::Tile(1));
        assert_eq!(rep.msg_type, ShmemMsgType::ShRep);
        assert_eq!(rep.data(), Some(&[0x5A; BLOCK][..]));

        let entry = dir.entry(0x1000).unwrap();
        assert_eq!(entry.state(), DirectoryState::Owned);
        assert_eq!(entry.owner(), Some(0));
        assert!(entry.has_sharer(0) && entry.has_sharer(1));
    }

    #[test]
    fn exclusive_request_on_owned_line_uses_combined_request() {
        let (mut dir, out) = (cntlr(), Outbox::default());
        request(&mut dir, &out, ShmemMsgType::ExReq, 0, 0x1000);
        request(&mut dir, &out, ShmemMsgType::ShReq, 1, 0x1000);
        reply(&mut dir, &out, ShmemMsgType::WbRep, 0, 0x1000, Some(1));

        let sent = request(&mut dir, &out, ShmemMsgType::ExReq, 2, 0x1000);
        assert_eq!(sent.len(), 2);
        for (i, (dest, msg)) in sent.iter().enumerate() {
            assert_eq!(*dest, Dest::Tile(i));
            assert_eq!(msg.msg_type, ShmemMsgType::InvFlushCombinedReq);
            assert_eq!(msg.single_receiver, Some(0));
            assert!(!msg.reply_expected);
        }

        // owner flushes first; the line is not free until tile 1 answers too
        assert!(reply(&mut dir, &out, ShmemMsgType::FlushRep, 0, 0x1000, Some(0x77)).is_empty());
        assert_eq!(state(&dir, 0x1000), DirectoryState::Shared);

        let (dest, rep) = only(reply(&mut dir, &out, ShmemMsgType::InvRep, 1, 0x1000, None));
        assert_eq!(dest, Dest::Tile(2));
        assert_eq!(rep.msg_type, ShmemMsgType::ExRep);
        assert_eq!(rep.data(), Some(&[0x77; BLOCK][..]));
        assert_eq!(dir.entry(0x1000).unwrap().owner(), Some(2));
        assert_eq!(state(&dir, 0x1000), DirectoryState::Modified);
        // the dirty bytes moved to tile 2 without touching DRAM
        assert_eq!(dir.dram().stats().writes, 0);
    }

    #[test]
    fn sole_sharer_upgrades_in_place() {
        let (mut dir, out) = (cntlr(), Outbox::default());
        request(&mut dir, &out, ShmemMsgType::ShReq, 3, 0x40);
        let (dest, rep) = only(request(&mut dir, &out, ShmemMsgType::ExReq, 3, 0x40));
        assert_eq!(dest, Dest::Tile(3));
        assert_eq!(rep.msg_type, ShmemMsgType::UpgradeRep);
        assert!(rep.data.is_none());
        assert_eq!(state(&dir, 0x40), DirectoryState::Modified);
        assert_eq!(dir.stats().upgrade_replies, 1);
    }

    #[test]
    fn latency_counters_split_by_request_type() {
        let (mut dir, out) = (cntlr(), Outbox::default());
        // three writers of one line; the third queues behind the second
        request(&mut dir, &out, ShmemMsgType::ExReq, 0, 0x80);
        request(&mut dir, &out, ShmemMsgType::ExReq, 1, 0x80);
        request(&mut dir, &out, ShmemMsgType::ExReq, 2, 0x80);
        reply(&mut dir, &out, ShmemMsgType::FlushRep, 0, 0x80, Some(1));
        reply(&mut dir, &out, ShmemMsgType::FlushRep, 1, 0x80, Some(2));
        let ex = dir.stats().ex_latency;
        assert_eq!(ex.completed, 3);
        assert!(ex.total_serialization > 0);
        assert!(ex.total_processing > ex.total_serialization);
        assert_eq!(dir.stats().unicast_invalidation_latency, 0);

        // a sole sharer upgrading invalidates nobody
        request(&mut dir, &out, ShmemMsgType::ShReq, 3, 0x200);
        request(&mut dir, &out, ShmemMsgType::ExReq, 3, 0x200);
        assert_eq!(dir.stats().unicast_invalidation_latency, 0);

        request(&mut dir, &out, ShmemMsgType::ShReq, 1, 0x40);
        request(&mut dir, &out, ShmemMsgType::ShReq, 2, 0x40);
        reply(&mut dir, &out, ShmemMsgType::WbRep, 1, 0x40, Some(3));
        assert_eq!(request(&mut dir, &out, ShmemMsgType::ExReq, 3, 0x40).len(), 2);
        reply(&mut dir, &out, ShmemMsgType::FlushRep, 1, 0x40, Some(3));
        let (_, rep) = only(reply(&mut dir, &out, ShmemMsgType::InvRep, 2, 0x40, None));
        assert_eq!(rep.msg_type, ShmemMsgType::ExRep);

        let stats = dir.stats();
        assert_eq!(stats.sh_latency.completed, 3);
        assert_eq!(stats.ex_latency.completed, 5);
        assert!(stats.unicast_invalidation_latency > 0);
        assert_eq!(stats.broadcast_invalidation_latency, 0);
        assert_eq!(stats.nullify_latency.completed, 0);

        let mut text = Vec::new();
        dir.output_summary(&mut text).unwrap();
        let text = String::from_utf8(text).unwrap();
        assert!(text.contains("EX_REQ Average Serialization Time"));
        assert!(text.contains("Average Unicast Invalidation Processing Time"));
    }

    #[test]
    fn requests_for_one_line_are_served_in_arrival_order() {
        let (mut dir, out) = (cntlr(), Outbox::default());
        request(&mut dir, &out, ShmemMsgType::ExReq, 0, 0x80);
        // both wait behind the flush of tile 0
        let (_, flush) = only(request(&mut dir, &out, ShmemMsgType::ExReq, 1, 0x80));
        assert_eq!(flush.msg_type, ShmemMsgType::FlushReq);
        assert!(request(&mut dir, &out, ShmemMsgType::ExReq, 2, 0x80).is_empty());
        assert_eq!(dir.pending_requests(), 2);

        let sent = reply(&mut dir, &out, ShmemMsgType::FlushRep, 0, 0x80, Some(9));
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, Dest::Tile(1));
        assert_eq!(sent[0].1.msg_type, ShmemMsgType::ExRep);
        // tile 2 now finds tile 1 as the owner
        assert_eq!(sent[1].0, Dest::Tile(1));
        assert_eq!(sent[1].1.msg_type, ShmemMsgType::FlushReq);
        assert_eq!(sent[1].1.requester, 2);
    }

    #[test]
    fn shared_request_restarts_only_for_the_awaited_tile() {
        let (mut dir, out) = (cntlr(), Outbox::default());
        request(&mut dir, &out, ShmemMsgType::ShReq, 1, 0x40);
        let (dest, wb) = only(request(&mut dir, &out, ShmemMsgType::ShReq, 2, 0x40));
        assert_eq!((dest, wb.msg_type), (Dest::Tile(1), ShmemMsgType::WbReq));
        only(reply(&mut dir, &out, ShmemMsgType::WbRep, 1, 0x40, Some(3)));

        // sharers {1, 2}; tile 3 waits on tile 1
        let (dest, _) = only(request(&mut dir, &out, ShmemMsgType::ShReq, 3, 0x40));
        assert_eq!(dest, Dest::Tile(1));
        // tile 2 evicting its copy is not what tile 3 waits for
        assert!(reply(&mut dir, &out, ShmemMsgType::InvRep, 2, 0x40, None).is_empty());

        let (dest, rep) = only(reply(&mut dir, &out, ShmemMsgType::WbRep, 1, 0x40, Some(3)));
        assert_eq!((dest, rep.msg_type), (Dest::Tile(3), ShmemMsgType::ShRep));
        let entry = dir.entry(0x40).unwrap();
        assert!(entry.has_sharer(1) && entry.has_sharer(3) && !entry.has_sharer(2));
    }

    #[test]
    fn eviction_flush_without_pending_request_goes_to_dram() {
        let (mut dir, out) = (cntlr(), Outbox::default());
        request(&mut dir, &out, ShmemMsgType::ExReq, 2, 0xC0);
        assert!(reply(&mut dir, &out, ShmemMsgType::FlushRep, 2, 0xC0, Some(0xEE)).is_empty());
        assert_eq!(state(&dir, 0xC0), DirectoryState::Uncached);
        assert_eq!(dir.dram().peek(0xC0), Some(&[0xEE; BLOCK][..]));
    }

    #[test]
    fn full_set_nullifies_the_least_shared_idle_entry_first() {
        // 2 sets x 2 ways; 0x000, 0x080 and 0x100 all land in set 0
        let (mut dir, out) = (cntlr_with(DirectoryType::FullMap, 4, 4), Outbox::default());
        request(&mut dir, &out, ShmemMsgType::ExReq, 1, 0x000);
        request(&mut dir, &out, ShmemMsgType::ShReq, 2, 0x080);
        request(&mut dir, &out, ShmemMsgType::ShReq, 3, 0x080);
        only(reply(&mut dir, &out, ShmemMsgType::WbRep, 2, 0x080, Some(0)));

        let (dest, flush) = only(request(&mut dir, &out, ShmemMsgType::ExReq, 0, 0x100));
        assert_eq!(dest, Dest::Tile(1));
        assert_eq!((flush.msg_type, flush.address), (ShmemMsgType::FlushReq, 0x000));
        assert_eq!(state(&dir, 0x100), DirectoryState::Uncached);

        let (dest, rep) = only(reply(&mut dir, &out, ShmemMsgType::FlushRep, 1, 0x000, Some(0x42)));
        assert_eq!((dest, rep.msg_type, rep.address), (Dest::Tile(0), ShmemMsgType::ExRep, 0x100));
        assert!(dir.entry(0x000).is_none());
        assert_eq!(dir.dram().peek(0x000), Some(&[0x42; BLOCK][..]));
        assert_eq!(dir.stats().nullify_reqs[DirectoryState::Modified.index()], 1);
        assert_eq!(dir.pending_requests(), 0);
    }

    #[test]
    fn uncached_victim_is_nullified_synchronously() {
        let (mut dir, out) = (cntlr_with(DirectoryType::FullMap, 4, 4), Outbox::default());
        request(&mut dir, &out, ShmemMsgType::ExReq, 1, 0x000);
        reply(&mut dir, &out, ShmemMsgType::FlushRep, 1, 0x000, Some(1));
        request(&mut dir, &out, ShmemMsgType::ShReq, 2, 0x080);

        let (dest, rep) = only(request(&mut dir, &out, ShmemMsgType::ShReq, 3, 0x100));
        assert_eq!((dest, rep.msg_type), (Dest::Tile(3), ShmemMsgType::ShRep));
        assert!(dir.entry(0x000).is_none());
        assert_eq!(state(&dir, 0x080), DirectoryState::Shared);
    }

    #[test]
    #[should_panic(expected = "no replacement candidate")]
    fn set_with_every_entry_busy_is_fatal() {
        let (mut dir, out) = (cntlr_with(DirectoryType::FullMap, 4, 4), Outbox::default());
        for address in [0x000, 0x080] {
            request(&mut dir, &out, ShmemMsgType::ExReq, 1, address);
            request(&mut dir, &out, ShmemMsgType::ExReq, 2, address);
        }
        request(&mut dir, &out, ShmemMsgType::ExReq, 3, 0x100);
    }

    #[test]
    fn limited_broadcast_waits_for_every_tile() {
        let (mut dir, out) = (cntlr_with(DirectoryType::LimitedBroadcast, 1, 64), Outbox::default());
        request(&mut dir, &out, ShmemMsgType::ShReq, 0, 0x200);
        request(&mut dir, &out, ShmemMsgType::ShReq, 1, 0x200);
        only(reply(&mut dir, &out, ShmemMsgType::WbRep, 0, 0x200, Some(6)));
        assert!(dir.entry(0x200).unwrap().in_broadcast_mode());

        let (dest, inv) = only(request(&mut dir, &out, ShmemMsgType::ExReq, 2, 0x200));
        assert_eq!(dest, Dest::Broadcast);
        assert_eq!(inv.msg_type, ShmemMsgType::InvFlushCombinedReq);
        assert_eq!(inv.single_receiver, Some(0));
        assert!(inv.reply_expected);

        let mut flush = from_l2(ShmemMsgType::FlushRep, 0, 0x200).with_data(vec![6; BLOCK]);
        flush.reply_expected = true;
        assert!(deliver(&mut dir, &out, 0, flush).is_empty());
        for tile in 1..3 {
            let inv_rep = from_l2(ShmemMsgType::InvRep, tile, 0x200).with_reply_expected(true);
            assert!(deliver(&mut dir, &out, tile, inv_rep).is_empty());
        }
        let inv_rep = from_l2(ShmemMsgType::InvRep, 3, 0x200).with_reply_expected(true);
        let (dest, rep) = only(deliver(&mut dir, &out, 3, inv_rep));
        assert_eq!((dest, rep.msg_type), (Dest::Tile(2), ShmemMsgType::ExRep));
        assert_eq!(rep.data(), Some(&[6; BLOCK][..]));
        assert!(!dir.entry(0x200).unwrap().in_broadcast_mode());
        assert_eq!(dir.stats().broadcast_invalidations, 1);
    }

    #[test]
    fn limited_no_broadcast_flushes_a_sharer_to_make_room() {
        let (mut dir, out) = (cntlr_with(DirectoryType::LimitedNoBroadcast, 1, 64), Outbox::default());
        request(&mut dir, &out, ShmemMsgType::ShReq, 2, 0x300);
        let (dest, flush) = only(request(&mut dir, &out, ShmemMsgType::ShReq, 0, 0x300));
        assert_eq!((dest, flush.msg_type), (Dest::Tile(2), ShmemMsgType::FlushReq));

        let (dest, rep) = only(reply(&mut dir, &out, ShmemMsgType::FlushRep, 2, 0x300, Some(0)));
        assert_eq!((dest, rep.msg_type), (Dest::Tile(0), ShmemMsgType::ShRep));
        let entry = dir.entry(0x300).unwrap();
        assert!(entry.has_sharer(0) && !entry.has_sharer(2));
    }

    #[test]
    fn limitless_entries_cost_the_trap_penalty() {
        let (mut dir, out) = (cntlr_with(DirectoryType::Limitless, 1, 64), Outbox::default());
        request(&mut dir, &out, ShmemMsgType::ShReq, 0, 0x40);
        request(&mut dir, &out, ShmemMsgType::ShReq, 1, 0x40);
        reply(&mut dir, &out, ShmemMsgType::WbRep, 0, 0x40, Some(0));
        assert_eq!(dir.entry(0x40).unwrap().latency(), 200);

        let before = dir.perf.network().now();
        request(&mut dir, &out, ShmemMsgType::ShReq, 2, 0x40);
        assert!(dir.perf.network().now() >= before + 10 + 200);
    }

    #[test]
    #[should_panic(expected = "INV_REP from tile 0")]
    fn inv_rep_for_modified_line_is_fatal() {
        let (mut dir, out) = (cntlr(), Outbox::default());
        request(&mut dir, &out, ShmemMsgType::ExReq, 0, 0x40);
        reply(&mut dir, &out, ShmemMsgType::InvRep, 0, 0x40, None);
    }

    #[test]
    #[should_panic(expected = "unrecognized msg type")]
    fn directory_rejects_replies_meant_for_caches() {
        let (mut dir, out) = (cntlr(), Outbox::default());
        reply(&mut dir, &out, ShmemMsgType::ExRep, 0, 0x40, None);
    }
}
