//! Per-line directory metadata and the pure state transitions of the MOSI directory.
//!
//! The `plan_*` functions decide what a request needs given the current entry, without touching
//! anything; the `grant_*`/`upgrade`/`apply_*` methods are the only places an entry changes state.
//! The directory controller executes plans and layers data movement and counters on top.

use std::collections::BTreeSet;

use serde::Serialize;
use smallvec::SmallVec;

use super::{Address, TileId};
use crate::sim::config::{DirectoryConfig, DirectoryType};
use crate::timeq::Cycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum DirectoryState {
    #[default]
    Uncached,
    Shared,
    Owned,
    Modified,
}

impl DirectoryState {
    pub const ALL: [DirectoryState; 4] = [
        DirectoryState::Modified,
        DirectoryState::Owned,
        DirectoryState::Shared,
        DirectoryState::Uncached,
    ];

    pub fn index(self) -> usize {
        match self {
            DirectoryState::Modified => 0,
            DirectoryState::Owned => 1,
            DirectoryState::Shared => 2,
            DirectoryState::Uncached => 3,
        }
    }
}

pub type SharerList = SmallVec<[TileId; 8]>;

/// How an entry tracks its sharers.  Shared by every entry of a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharerScheme {
    pub kind: DirectoryType,
    pub max_hw_sharers: usize,
    pub total_tiles: usize,
    pub software_trap_penalty: Cycle,
}

impl SharerScheme {
    pub fn new(config: &DirectoryConfig, total_tiles: usize) -> Self {
        Self {
            kind: config.directory_type,
            max_hw_sharers: config.max_hw_sharers.min(total_tiles),
            total_tiles,
            software_trap_penalty: config.software_trap_penalty,
        }
    }

    pub fn full_map(total_tiles: usize) -> Self {
        Self {
            kind: DirectoryType::FullMap,
            max_hw_sharers: total_tiles,
            total_tiles,
            software_trap_penalty: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    address: Option<Address>,
    state: DirectoryState,
    owner: Option<TileId>,
    sharers: BTreeSet<TileId>,
    scheme: SharerScheme,
    // limited broadcast: replies still owed while every tile counts as a sharer
    global_sharers: Option<usize>,
    // limitless: sharer set has spilled past the hardware pointers
    software_trap: bool,
}

impl DirectoryEntry {
    pub fn new(scheme: SharerScheme) -> Self {
        Self {
            address: None,
            state: DirectoryState::Uncached,
            owner: None,
            sharers: BTreeSet::new(),
            scheme,
            global_sharers: None,
            software_trap: false,
        }
    }

    pub fn reset(&mut self, address: Option<Address>) {
        *self = Self::new(self.scheme);
        self.address = address;
    }

    pub fn address(&self) -> Option<Address> {
        self.address
    }

    pub fn state(&self) -> DirectoryState {
        self.state
    }

    pub fn owner(&self) -> Option<TileId> {
        self.owner
    }

    pub fn has_sharer(&self, tile: TileId) -> bool {
        self.sharers.contains(&tile)
    }

    pub fn in_broadcast_mode(&self) -> bool {
        self.global_sharers.is_some()
    }

    pub fn num_sharers(&self) -> usize {
        if self.in_broadcast_mode() {
            self.scheme.total_tiles
        } else {
            self.sharers.len()
        }
    }

    /// Extra cycles spent consulting this entry.
    pub fn latency(&self) -> Cycle {
        if self.software_trap {
            self.scheme.software_trap_penalty
        } else {
            0
        }
    }

    /// Lowest tracked sharer, if any is tracked explicitly.
    pub fn one_sharer(&self) -> Option<TileId> {
        self.sharers.iter().next().copied()
    }

    /// Returns whether every tile must be treated as a sharer, plus the tracked sharers.
    pub fn sharers_list(&self) -> (bool, SharerList) {
        let all_tiles = match self.scheme.kind {
            DirectoryType::LimitedBroadcast => self.in_broadcast_mode(),
            DirectoryType::FullMap => self.sharers.len() == self.scheme.total_tiles,
            DirectoryType::LimitedNoBroadcast | DirectoryType::Limitless => false,
        };
        (all_tiles, self.sharers.iter().copied().collect())
    }

    pub fn can_add_sharer(&self) -> bool {
        match self.scheme.kind {
            DirectoryType::LimitedNoBroadcast => self.sharers.len() < self.scheme.max_hw_sharers,
            _ => true,
        }
    }

    /// Returns false if the sharer cannot be tracked without evicting another one first.
    pub fn add_sharer(&mut self, tile: TileId) -> bool {
        match self.scheme.kind {
            DirectoryType::LimitedBroadcast if self.in_broadcast_mode() => {
                assert_eq!(self.global_sharers, Some(self.scheme.total_tiles));
                return true;
            }
            _ => {}
        }

        assert!(!self.has_sharer(tile), "{}: tile {} is already a sharer", self.describe(), tile);
        match self.scheme.kind {
            DirectoryType::FullMap => {
                self.sharers.insert(tile);
            }
            DirectoryType::LimitedNoBroadcast => {
                if self.sharers.len() == self.scheme.max_hw_sharers {
                    return false;
                }
                self.sharers.insert(tile);
            }
            DirectoryType::LimitedBroadcast => {
                if self.sharers.len() == self.scheme.max_hw_sharers {
                    self.global_sharers = Some(self.scheme.total_tiles);
                } else {
                    self.sharers.insert(tile);
                }
            }
            DirectoryType::Limitless => {
                self.sharers.insert(tile);
                if self.sharers.len() > self.scheme.max_hw_sharers {
                    self.software_trap = true;
                }
            }
        }
        true
    }

    pub fn remove_sharer(&mut self, tile: TileId, reply_expected: bool) {
        if self.in_broadcast_mode() {
            self.sharers.remove(&tile);
        } else {
            assert!(self.sharers.remove(&tile), "{}: tile {} is not a sharer", self.describe(), tile);
        }

        if reply_expected {
            assert!(
                self.in_broadcast_mode(),
                "{}: reply-expected removal of tile {} outside broadcast mode",
                self.describe(),
                tile
            );
            let remaining = self.global_sharers.map_or(0, |n| n - 1);
            if remaining == 0 {
                self.global_sharers = None;
                assert!(self.sharers.is_empty(), "{}: sharers left after broadcast drained", self.describe());
            } else {
                self.global_sharers = Some(remaining);
            }
        }
    }

    pub fn set_owner(&mut self, owner: Option<TileId>) {
        if let Some(tile) = owner {
            assert!(
                self.has_sharer(tile),
                "{}: owner {} must be a sharer, one sharer {:?}",
                self.describe(),
                tile,
                self.one_sharer()
            );
        }
        self.owner = owner;
    }

    pub fn set_state(&mut self, state: DirectoryState) {
        self.state = state;
    }

    /// UNCACHED -> MODIFIED for the requester.
    pub fn grant_exclusive(&mut self, requester: TileId) {
        assert_eq!(self.state, DirectoryState::Uncached, "{}: exclusive grant", self.describe());
        assert_eq!(self.num_sharers(), 0, "{}: exclusive grant", self.describe());
        let added = self.add_sharer(requester);
        assert!(added, "{}: could not add tile {} to an empty entry", self.describe(), requester);
        self.set_owner(Some(requester));
        self.state = DirectoryState::Modified;
    }

    /// Requester already holds the only copy; make it writable in place.
    pub fn upgrade(&mut self, requester: TileId) {
        match self.state {
            DirectoryState::Owned => {
                assert_eq!(self.owner, Some(requester), "{}: upgrade", self.describe());
            }
            DirectoryState::Shared => {
                assert!(self.has_sharer(requester), "{}: upgrade by non-sharer {}", self.describe(), requester);
                self.set_owner(Some(requester));
            }
            _ => panic!("{}: upgrade by tile {}", self.describe(), requester),
        }
        assert_eq!(self.num_sharers(), 1, "{}: upgrade with other sharers", self.describe());
        self.state = DirectoryState::Modified;
    }

    /// Adds a reader; UNCACHED becomes SHARED, OWNED/SHARED stay as they are.
    pub fn grant_shared(&mut self, requester: TileId) {
        let added = self.add_sharer(requester);
        assert!(added, "{}: shared grant to tile {} overflowed", self.describe(), requester);
        match self.state {
            DirectoryState::Uncached => self.state = DirectoryState::Shared,
            DirectoryState::Owned | DirectoryState::Shared => {}
            DirectoryState::Modified => panic!("{}: shared grant to tile {}", self.describe(), requester),
        }
    }

    pub fn apply_inv_rep(&mut self, sender: TileId, reply_expected: bool) {
        match self.state {
            DirectoryState::Owned => {
                assert!(
                    self.owner != Some(sender) && self.num_sharers() > 0,
                    "{}: INV_REP from tile {}",
                    self.describe(),
                    sender
                );
                self.remove_sharer(sender, reply_expected);
                assert!(self.num_sharers() > 0, "{}: owner lost on INV_REP", self.describe());
            }
            DirectoryState::Shared => {
                assert!(
                    self.owner.is_none() && self.num_sharers() > 0,
                    "{}: INV_REP from tile {}",
                    self.describe(),
                    sender
                );
                self.remove_sharer(sender, reply_expected);
                if self.num_sharers() == 0 {
                    self.state = DirectoryState::Uncached;
                }
            }
            DirectoryState::Modified | DirectoryState::Uncached => {
                panic!("{}: INV_REP from tile {}", self.describe(), sender)
            }
        }
        self.check_consistency();
    }

    pub fn apply_flush_rep(&mut self, sender: TileId, reply_expected: bool) {
        match self.state {
            DirectoryState::Modified => {
                assert_eq!(self.owner, Some(sender), "{}: FLUSH_REP from non-owner", self.describe());
                assert!(!reply_expected, "{}: FLUSH_REP expects no reply accounting", self.describe());
                self.remove_sharer(sender, false);
                self.owner = None;
                self.state = DirectoryState::Uncached;
            }
            DirectoryState::Owned => {
                assert!(
                    self.owner.is_some() && self.num_sharers() > 0,
                    "{}: FLUSH_REP from tile {}",
                    self.describe(),
                    sender
                );
                self.remove_sharer(sender, reply_expected);
                if self.owner == Some(sender) {
                    self.owner = None;
                    self.state = if self.num_sharers() > 0 {
                        DirectoryState::Shared
                    } else {
                        DirectoryState::Uncached
                    };
                }
            }
            DirectoryState::Shared => {
                assert!(
                    self.owner.is_none() && self.num_sharers() > 0,
                    "{}: FLUSH_REP from tile {}",
                    self.describe(),
                    sender
                );
                self.remove_sharer(sender, reply_expected);
                if self.num_sharers() == 0 {
                    self.state = DirectoryState::Uncached;
                }
            }
            DirectoryState::Uncached => panic!("{}: FLUSH_REP from tile {}", self.describe(), sender),
        }
        self.check_consistency();
    }

    pub fn apply_wb_rep(&mut self, sender: TileId) {
        match self.state {
            DirectoryState::Modified => {
                assert_eq!(self.owner, Some(sender), "{}: WB_REP from non-owner", self.describe());
                self.state = DirectoryState::Owned;
            }
            DirectoryState::Owned => {
                assert!(self.has_sharer(sender), "{}: WB_REP from non-sharer {}", self.describe(), sender);
            }
            DirectoryState::Shared => {
                assert!(self.owner.is_none(), "{}: WB_REP with an owner", self.describe());
                assert!(self.has_sharer(sender), "{}: WB_REP from non-sharer {}", self.describe(), sender);
            }
            DirectoryState::Uncached => panic!("{}: WB_REP from tile {}", self.describe(), sender),
        }
        self.check_consistency();
    }

    pub fn check_consistency(&self) {
        let ok = match self.state {
            DirectoryState::Modified => {
                self.owner.is_some_and(|o| self.has_sharer(o)) && self.num_sharers() == 1
            }
            DirectoryState::Owned => self.owner.is_some_and(|o| self.has_sharer(o)) && self.num_sharers() > 0,
            DirectoryState::Shared => self.owner.is_none() && self.num_sharers() > 0,
            DirectoryState::Uncached => self.owner.is_none() && self.num_sharers() == 0,
        };
        assert!(ok, "{}: inconsistent directory entry", self.describe());
    }

    pub fn describe(&self) -> String {
        format!(
            "directory entry {:#x?} state {:?} owner {:?} sharers {:?}{}",
            self.address,
            self.state,
            self.owner,
            self.sharers,
            if self.in_broadcast_mode() { " (broadcast)" } else { "" }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExReqPlan {
    FlushOwner(TileId),
    Upgrade,
    InvFlushCombined { single_receiver: Option<TileId> },
    Grant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShReqPlan {
    WbOwner(TileId),
    FlushSharer(TileId),
    WbSharer(TileId),
    Grant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullifyPlan {
    FlushOwner(TileId),
    InvFlushCombined { owner: TileId },
    InvSharers,
    Complete,
}

fn owner_of(entry: &DirectoryEntry) -> TileId {
    match entry.owner() {
        Some(owner) => owner,
        None => panic!("{}: no owner", entry.describe()),
    }
}

pub fn plan_ex_req(entry: &DirectoryEntry, requester: TileId) -> ExReqPlan {
    match entry.state() {
        DirectoryState::Modified => ExReqPlan::FlushOwner(owner_of(entry)),
        DirectoryState::Owned => {
            let owner = owner_of(entry);
            if owner == requester && entry.num_sharers() == 1 {
                ExReqPlan::Upgrade
            } else {
                ExReqPlan::InvFlushCombined {
                    single_receiver: Some(owner),
                }
            }
        }
        DirectoryState::Shared => {
            assert!(entry.num_sharers() > 0, "{}: EX_REQ", entry.describe());
            if entry.has_sharer(requester) && entry.num_sharers() == 1 {
                ExReqPlan::Upgrade
            } else {
                ExReqPlan::InvFlushCombined {
                    single_receiver: entry.one_sharer(),
                }
            }
        }
        DirectoryState::Uncached => {
            assert_eq!(entry.num_sharers(), 0, "{}: EX_REQ", entry.describe());
            ExReqPlan::Grant
        }
    }
}

pub fn plan_sh_req(entry: &DirectoryEntry, requester: TileId, data_staged: bool) -> ShReqPlan {
    match entry.state() {
        DirectoryState::Modified => ShReqPlan::WbOwner(owner_of(entry)),
        DirectoryState::Owned | DirectoryState::Shared => {
            assert!(entry.num_sharers() > 0, "{}: SH_REQ from tile {}", entry.describe(), requester);
            // sharer may be the owner too
            let sharer = entry.one_sharer();
            if !entry.can_add_sharer() {
                match sharer {
                    Some(sharer) => ShReqPlan::FlushSharer(sharer),
                    None => panic!("{}: SH_REQ overflow with no tracked sharer", entry.describe()),
                }
            } else {
                match sharer {
                    Some(sharer) if !data_staged => ShReqPlan::WbSharer(sharer),
                    _ => ShReqPlan::Grant,
                }
            }
        }
        DirectoryState::Uncached => ShReqPlan::Grant,
    }
}

pub fn plan_nullify(entry: &DirectoryEntry) -> NullifyPlan {
    match entry.state() {
        DirectoryState::Modified => NullifyPlan::FlushOwner(owner_of(entry)),
        DirectoryState::Owned => NullifyPlan::InvFlushCombined {
            owner: owner_of(entry),
        },
        DirectoryState::Shared => {
            assert!(entry.owner().is_none(), "{}: NULLIFY", entry.describe());
            NullifyPlan::InvSharers
        }
        DirectoryState::Uncached => NullifyPlan::Complete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: DirectoryType, max_hw_sharers: usize, total_tiles: usize) -> DirectoryEntry {
        let mut e = DirectoryEntry::new(SharerScheme {
            kind,
            max_hw_sharers,
            total_tiles,
            software_trap_penalty: 50,
        });
        e.reset(Some(0x1000));
        e
    }

    fn shared_by(kind: DirectoryType, max_hw: usize, total: usize, tiles: &[TileId]) -> DirectoryEntry {
        let mut e = entry(kind, max_hw, total);
        for &t in tiles {
            e.grant_shared(t);
        }
        e
    }

    #[test]
    fn one_sharer_is_lowest_tile() {
        let e = shared_by(DirectoryType::FullMap, 8, 8, &[5, 2, 7]);
        assert_eq!(e.one_sharer(), Some(2));
        let (all, list) = e.sharers_list();
        assert!(!all);
        assert_eq!(list.as_slice(), &[2, 5, 7]);
    }

    #[test]
    fn full_map_reports_all_tiles() {
        let e = shared_by(DirectoryType::FullMap, 2, 2, &[0, 1]);
        assert!(e.sharers_list().0);
    }

    #[test]
    fn limited_no_broadcast_refuses_overflow() {
        let mut e = shared_by(DirectoryType::LimitedNoBroadcast, 2, 8, &[1, 3]);
        assert!(!e.can_add_sharer());
        assert!(!e.add_sharer(4));
        assert_eq!(e.num_sharers(), 2);
        assert_eq!(plan_sh_req(&e, 4, false), ShReqPlan::FlushSharer(1));
    }

    #[test]
    fn limited_broadcast_counts_down_replies() {
        let mut e = shared_by(DirectoryType::LimitedBroadcast, 2, 4, &[0, 1]);
        assert!(!e.in_broadcast_mode());
        e.grant_shared(2);
        assert!(e.in_broadcast_mode());
        assert_eq!(e.num_sharers(), 4);
        assert!(e.sharers_list().0);

        // every tile answers the broadcast once, sharer or not
        for tile in 0..3 {
            e.apply_inv_rep(tile, true);
            assert_eq!(e.state(), DirectoryState::Shared);
        }
        e.apply_inv_rep(3, true);
        assert!(!e.in_broadcast_mode());
        assert_eq!(e.state(), DirectoryState::Uncached);
        assert_eq!(e.num_sharers(), 0);
    }

    #[test]
    fn limitless_traps_to_software() {
        let mut e = shared_by(DirectoryType::Limitless, 1, 4, &[0]);
        assert_eq!(e.latency(), 0);
        e.grant_shared(1);
        assert_eq!(e.latency(), 50);
        assert_eq!(e.num_sharers(), 2);
        assert!(!e.sharers_list().0);
    }

    #[test]
    fn ex_req_plans_follow_state() {
        let mut e = entry(DirectoryType::FullMap, 4, 4);
        assert_eq!(plan_ex_req(&e, 0), ExReqPlan::Grant);
        e.grant_exclusive(0);
        assert_eq!(plan_ex_req(&e, 1), ExReqPlan::FlushOwner(0));

        e.apply_wb_rep(0);
        assert_eq!(e.state(), DirectoryState::Owned);
        assert_eq!(plan_ex_req(&e, 0), ExReqPlan::Upgrade);
        e.grant_shared(1);
        assert_eq!(
            plan_ex_req(&e, 2),
            ExReqPlan::InvFlushCombined { single_receiver: Some(0) }
        );

        let s = shared_by(DirectoryType::FullMap, 4, 4, &[3]);
        assert_eq!(plan_ex_req(&s, 3), ExReqPlan::Upgrade);
        assert_eq!(
            plan_ex_req(&s, 1),
            ExReqPlan::InvFlushCombined { single_receiver: Some(3) }
        );
    }

    #[test]
    fn sh_req_fetches_from_a_sharer_unless_staged() {
        let e = shared_by(DirectoryType::FullMap, 4, 4, &[2, 3]);
        assert_eq!(plan_sh_req(&e, 0, false), ShReqPlan::WbSharer(2));
        assert_eq!(plan_sh_req(&e, 0, true), ShReqPlan::Grant);
        let u = entry(DirectoryType::FullMap, 4, 4);
        assert_eq!(plan_sh_req(&u, 0, false), ShReqPlan::Grant);
    }

    #[test]
    fn nullify_plans() {
        let mut e = entry(DirectoryType::FullMap, 4, 4);
        assert_eq!(plan_nullify(&e), NullifyPlan::Complete);
        e.grant_exclusive(1);
        assert_eq!(plan_nullify(&e), NullifyPlan::FlushOwner(1));
        e.apply_wb_rep(1);
        assert_eq!(plan_nullify(&e), NullifyPlan::InvFlushCombined { owner: 1 });
        let s = shared_by(DirectoryType::FullMap, 4, 4, &[0, 2]);
        assert_eq!(plan_nullify(&s), NullifyPlan::InvSharers);
    }

    #[test]
    fn owner_flush_downgrades_owned_to_shared() {
        let mut e = entry(DirectoryType::FullMap, 4, 4);
        e.grant_exclusive(0);
        e.apply_wb_rep(0);
        e.grant_shared(1);
        e.apply_flush_rep(0, false);
        assert_eq!(e.state(), DirectoryState::Shared);
        assert_eq!(e.owner(), None);
        e.apply_inv_rep(1, false);
        assert_eq!(e.state(), DirectoryState::Uncached);
    }

    #[test]
    #[should_panic(expected = "INV_REP from tile 0")]
    fn inv_rep_while_modified_is_fatal() {
        let mut e = entry(DirectoryType::FullMap, 4, 4);
        e.grant_exclusive(0);
        e.apply_inv_rep(0, false);
    }

    #[test]
    #[should_panic(expected = "FLUSH_REP from non-owner")]
    fn flush_rep_from_stranger_is_fatal() {
        let mut e = entry(DirectoryType::FullMap, 4, 4);
        e.grant_exclusive(0);
        e.apply_flush_rep(2, false);
    }

    #[test]
    #[should_panic(expected = "WB_REP from tile 1")]
    fn wb_rep_while_uncached_is_fatal() {
        let mut e = entry(DirectoryType::FullMap, 4, 4);
        e.apply_wb_rep(1);
    }
}
