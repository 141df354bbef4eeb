use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;

use super::shmem_msg::{MemComponent, ShmemMsg, ShmemMsgType};
use super::sync::Halt;
use super::TileId;
use crate::sim::config::NetworkConfig;
use crate::timeq::{transfer_cycles, Cycle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dest {
    Tile(TileId),
    Broadcast,
}

/// Wire-level message delivery between tiles.  Delivery is reliable and FIFO per ordered pair.
pub trait Transport: Send + Sync {
    fn send(&self, sender: TileId, dest: Dest, time: Cycle, msg: &ShmemMsg);
}

/// Protocol-level send side, as seen from one tile.
pub trait ShmemSender {
    fn send_msg(&self, receiver: TileId, msg: ShmemMsg);
    fn broadcast_msg(&self, msg: ShmemMsg);
}

#[derive(Debug)]
pub struct Packet {
    pub sender: TileId,
    pub receiver: TileId,
    pub time: Cycle,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub enum NetEvent {
    Packet(Packet),
    Shutdown,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NetworkStats {
    pub packets: u64,
    pub bytes: u64,
    pub broadcasts: u64,
    pub short_circuited: u64,
    pub by_type: [u64; 14],
}

/// In-process interconnect: one unbounded channel per tile.
pub struct Network {
    config: NetworkConfig,
    inboxes: Vec<Sender<NetEvent>>,
    running: Vec<AtomicBool>,
    in_flight: Mutex<usize>,
    idle: Condvar,
    stats: Mutex<NetworkStats>,
    halt: Arc<Halt>,
}

impl Network {
    pub fn new(num_tiles: usize, config: NetworkConfig) -> (Arc<Network>, Vec<Receiver<NetEvent>>) {
        let (inboxes, receivers): (Vec<_>, Vec<_>) = (0..num_tiles).map(|_| channel()).unzip();
        let network = Network {
            config,
            inboxes,
            running: (0..num_tiles).map(|_| AtomicBool::new(false)).collect(),
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
            stats: Mutex::new(NetworkStats::default()),
            halt: Arc::default(),
        };
        (Arc::new(network), receivers)
    }

    pub fn num_tiles(&self) -> usize {
        self.inboxes.len()
    }

    pub fn set_running(&self, tile: TileId, running: bool) {
        self.running[tile].store(running, Ordering::Release);
    }

    pub fn is_running(&self, tile: TileId) -> bool {
        self.running[tile].load(Ordering::Acquire)
    }

    fn arrival_time(&self, time: Cycle, bytes: usize) -> Cycle {
        time + self.config.hop_latency + transfer_cycles(bytes as u64, self.config.flit_bytes as u64)
    }

    fn deliver(&self, sender: TileId, receiver: TileId, time: Cycle, msg: &ShmemMsg) {
        if !self.is_running(receiver)
            && msg.receiver_component == MemComponent::L2Cache
            && msg.msg_type.is_directory_request()
        {
            // an idle tile caches nothing: answer the way its L2 would
            self.with_stats(|stats| stats.short_circuited += 1);
            if msg.reply_expected {
                let reply = ShmemMsg::new(
                    ShmemMsgType::InvRep,
                    MemComponent::L2Cache,
                    MemComponent::DramDirectory,
                    msg.requester,
                    msg.address,
                )
                .with_reply_expected(true);
                self.deliver(receiver, sender, time, &reply);
            }
            return;
        }

        let payload = msg.encode();
        let time = self.arrival_time(time, payload.len());
        self.with_stats(|stats| {
            stats.packets += 1;
            stats.bytes += payload.len() as u64;
            stats.by_type[msg.msg_type as usize - 1] += 1;
        });

        *self.in_flight.lock().expect("lock poisoned") += 1;
        let packet = Packet {
            sender,
            receiver,
            time,
            payload,
        };
        if self.inboxes[receiver].send(NetEvent::Packet(packet)).is_err() {
            warn!("tile {} is gone, dropping {:?} @ {:#x}", receiver, msg.msg_type, msg.address);
            self.delivered();
        }
    }

    /// Marks one packet as fully handled by its receiver.
    pub fn delivered(&self) {
        let mut in_flight = self.in_flight.lock().expect("lock poisoned");
        assert!(*in_flight > 0, "network: more deliveries than sends");
        *in_flight -= 1;
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }

    /// Blocks until every sent packet has been handled.  Panics instead if the memory system
    /// halted, since a halted tile never finishes its packet.
    pub fn quiesce(&self) {
        loop {
            {
                let in_flight = self.in_flight.lock().expect("lock poisoned");
                if *in_flight == 0 {
                    return;
                }
                let _ = self
                    .idle
                    .wait_timeout(in_flight, Duration::from_millis(20))
                    .expect("lock poisoned");
            }
            self.halt.check();
        }
    }

    /// Fatal-error flag shared by every tile on this network.
    pub fn halt(&self) -> &Arc<Halt> {
        &self.halt
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.lock().expect("lock poisoned")
    }

    pub fn shutdown(&self) {
        for inbox in &self.inboxes {
            let _ = inbox.send(NetEvent::Shutdown);
        }
    }

    fn with_stats(&self, f: impl FnOnce(&mut NetworkStats)) {
        f(&mut self.stats.lock().expect("lock poisoned"));
    }

    pub fn stats(&self) -> NetworkStats {
        *self.stats.lock().expect("lock poisoned")
    }

    pub fn output_summary(&self, out: &mut impl Write) -> io::Result<()> {
        let stats = self.stats();
        writeln!(out, "Network Summary:")?;
        writeln!(out, "  Packets: {}", stats.packets)?;
        writeln!(out, "  Bytes: {}", stats.bytes)?;
        writeln!(out, "  Broadcasts: {}", stats.broadcasts)?;
        writeln!(out, "  Short-circuited Requests: {}", stats.short_circuited)?;
        Ok(())
    }
}

impl Transport for Network {
    fn send(&self, sender: TileId, dest: Dest, time: Cycle, msg: &ShmemMsg) {
        debug!("net: {} -> {:?} {:?} @ {:#x} t={}", sender, dest, msg.msg_type, msg.address, time);
        match dest {
            Dest::Tile(receiver) => self.deliver(sender, receiver, time, msg),
            Dest::Broadcast => {
                self.with_stats(|stats| stats.broadcasts += 1);
                for receiver in 0..self.num_tiles() {
                    self.deliver(sender, receiver, time, msg);
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn packet(rx: &Receiver<NetEvent>) -> Packet {
        match rx.try_recv() {
            Ok(NetEvent::Packet(p)) => p,
            other => panic!("expected a packet, got {:?}", other),
        }
    }

    fn inv_req(reply_expected: bool) -> ShmemMsg {
        ShmemMsg::new(ShmemMsgType::InvReq, MemComponent::DramDirectory, MemComponent::L2Cache, 1, 0x80)
            .with_reply_expected(reply_expected)
    }

    #[test]
    fn packets_are_stamped_and_counted() {
        let (net, rx) = Network::new(2, NetworkConfig { hop_latency: 2, flit_bytes: 8 });
        net.set_running(1, true);
        net.send(0, Dest::Tile(1), 10, &inv_req(false));
        let p = packet(&rx[1]);
        assert_eq!((p.sender, p.receiver), (0, 1));
        // 24-byte header over 8-byte flits
        assert_eq!(p.time, 10 + 2 + 3);
        assert_eq!(ShmemMsg::decode(&p.payload).unwrap(), inv_req(false));
        assert_eq!(net.in_flight(), 1);
        net.delivered();
        net.quiesce();
        assert_eq!(net.stats().by_type[ShmemMsgType::InvReq as usize - 1], 1);
    }

    #[test]
    fn broadcast_reaches_every_tile() {
        let (net, rx) = Network::new(3, NetworkConfig::default());
        (0..3).for_each(|t| net.set_running(t, true));
        net.send(1, Dest::Broadcast, 0, &inv_req(true));
        for inbox in &rx {
            assert_eq!(packet(inbox).sender, 1);
        }
        assert_eq!(net.in_flight(), 3);
        assert_eq!(net.stats().broadcasts, 1);
    }

    #[test]
    fn idle_tiles_answer_requests_that_expect_a_reply() {
        let (net, rx) = Network::new(2, NetworkConfig::default());
        net.set_running(0, true);
        net.send(0, Dest::Tile(1), 0, &inv_req(true));
        assert!(rx[1].try_recv().is_err());
        let p = packet(&rx[0]);
        assert_eq!(p.sender, 1);
        let reply = ShmemMsg::decode(&p.payload).unwrap();
        assert_eq!(reply.msg_type, ShmemMsgType::InvRep);
        assert!(reply.reply_expected);
        assert!(reply.data.is_none());

        // nothing owed, nothing sent
        net.send(0, Dest::Tile(1), 0, &inv_req(false));
        assert!(rx[0].try_recv().is_err());
        assert_eq!(net.stats().short_circuited, 2);
    }

    #[test]
    #[should_panic(expected = "memory system halted: tile 1: bad packet")]
    fn quiesce_gives_up_once_halted() {
        let (net, _rx) = Network::new(2, NetworkConfig::default());
        net.set_running(1, true);
        net.send(0, Dest::Tile(1), 0, &inv_req(false));
        net.halt().raise("tile 1: bad packet".to_string());
        net.quiesce();
    }
}
