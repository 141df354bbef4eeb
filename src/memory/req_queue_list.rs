use std::collections::{HashMap, VecDeque};

use super::directory_entry::DirectoryState;
use super::shmem_msg::ShmemMsg;
use super::{Address, TileId};
use crate::timeq::Cycle;

/// A protocol request waiting for, or being serviced by, the home directory.
#[derive(Debug, Clone)]
pub struct ShmemReq {
    pub msg: ShmemMsg,
    pub time: Cycle,
    /// Tile whose reply lets this request make progress again.
    pub waiting_on: Option<TileId>,
    pub start_time: Option<Cycle>,
    /// Directory state and broadcast mode the request found when it started.
    pub initial_state: Option<DirectoryState>,
    pub initial_broadcast_mode: bool,
    /// Served by an UPGRADE_REP without invalidating anyone.
    pub upgraded: bool,
}

impl ShmemReq {
    pub fn new(msg: ShmemMsg, time: Cycle) -> Self {
        Self {
            msg,
            time,
            waiting_on: None,
            start_time: None,
            initial_state: None,
            initial_broadcast_mode: false,
            upgraded: false,
        }
    }

    pub fn requester(&self) -> TileId {
        self.msg.requester
    }
}

/// Per-address FIFO of pending requests.  Only the head of each queue is ever in flight.
#[derive(Debug, Default)]
pub struct ReqQueueList {
    queues: HashMap<Address, VecDeque<ShmemReq>>,
}

impl ReqQueueList {
    pub fn enqueue(&mut self, address: Address, req: ShmemReq) -> usize {
        let queue = self.queues.entry(address).or_default();
        queue.push_back(req);
        queue.len()
    }

    pub fn dequeue(&mut self, address: Address) -> Option<ShmemReq> {
        let queue = self.queues.get_mut(&address)?;
        let req = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&address);
        }
        req
    }

    pub fn front(&self, address: Address) -> Option<&ShmemReq> {
        self.queues.get(&address).and_then(VecDeque::front)
    }

    pub fn front_mut(&mut self, address: Address) -> Option<&mut ShmemReq> {
        self.queues.get_mut(&address).and_then(VecDeque::front_mut)
    }

    pub fn count(&self, address: Address) -> usize {
        self.queues.get(&address).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, address: Address) -> bool {
        self.count(address) == 0
    }

    /// Total requests across all addresses.
    pub fn total(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::shmem_msg::{MemComponent, ShmemMsgType};

    fn req(msg_type: ShmemMsgType, requester: TileId, address: Address) -> ShmemReq {
        let msg = ShmemMsg::new(msg_type, MemComponent::L2Cache, MemComponent::DramDirectory, requester, address);
        ShmemReq::new(msg, requester as Cycle)
    }

    #[test]
    fn fifo_per_address() {
        let mut list = ReqQueueList::default();
        assert_eq!(list.enqueue(0x40, req(ShmemMsgType::ExReq, 0, 0x40)), 1);
        assert_eq!(list.enqueue(0x40, req(ShmemMsgType::ShReq, 1, 0x40)), 2);
        assert_eq!(list.enqueue(0x80, req(ShmemMsgType::ShReq, 2, 0x80)), 1);
        assert_eq!(list.total(), 3);

        assert_eq!(list.front(0x40).map(ShmemReq::requester), Some(0));
        assert_eq!(list.dequeue(0x40).map(|r| r.requester()), Some(0));
        assert_eq!(list.front(0x40).map(|r| r.msg.msg_type), Some(ShmemMsgType::ShReq));
        assert_eq!(list.dequeue(0x40).map(|r| r.requester()), Some(1));
        assert!(list.is_empty(0x40));
        assert!(list.dequeue(0x40).is_none());
        assert_eq!(list.count(0x80), 1);
    }

    #[test]
    fn head_can_record_waiting_tile() {
        let mut list = ReqQueueList::default();
        list.enqueue(0x40, req(ShmemMsgType::ShReq, 3, 0x40));
        list.front_mut(0x40).unwrap().waiting_on = Some(1);
        assert_eq!(list.front(0x40).unwrap().waiting_on, Some(1));
    }
}
