/*
Logical time for the coherence engine.

The protocol never owns time: it reads a per-context clock, bumps it by the cost of the work it
just did, and stamps outgoing messages with it.  Each tile keeps two clocks, one for the user
context that issues memory operations and one for the network context that processes incoming
protocol messages.  Both are monotonically non-decreasing.

Shared resources with a service law (DRAM) are wrapped by a TimedServer, which charges a base
latency plus a throughput component expressed in bytes-per-cycle and serializes back-to-back
requests.
*/

use std::sync::atomic::{AtomicU64, Ordering};

pub type Cycle = u64;

// Logical cycle counter that may be read and bumped from any thread.
#[derive(Debug, Default)]
pub struct Clock {
    cycle: AtomicU64,
}

impl Clock {
    pub fn new(cycle: Cycle) -> Self {
        Self {
            cycle: AtomicU64::new(cycle),
        }
    }

    pub fn now(&self) -> Cycle {
        self.cycle.load(Ordering::Acquire)
    }

    // Move the clock forward by `delta` cycles and return the new value.
    pub fn advance(&self, delta: Cycle) -> Cycle {
        self.cycle.fetch_add(delta, Ordering::AcqRel).saturating_add(delta)
    }

    // Raise the clock to `cycle`; never moves it backwards.
    pub fn update(&self, cycle: Cycle) -> Cycle {
        self.cycle.fetch_max(cycle, Ordering::AcqRel).max(cycle)
    }

    pub fn set(&self, cycle: Cycle) {
        let prev = self.cycle.swap(cycle, Ordering::AcqRel);
        assert!(prev <= cycle, "clock set backwards from {} to {}", prev, cycle);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    User,
    Network,
}

/// Per-tile pair of clocks, one for each execution context.
#[derive(Debug, Default)]
pub struct ShmemPerfModel {
    user: Clock,
    network: Clock,
}

impl ShmemPerfModel {
    pub fn clock(&self, kind: ThreadKind) -> &Clock {
        match kind {
            ThreadKind::User => &self.user,
            ThreadKind::Network => &self.network,
        }
    }

    pub fn user(&self) -> &Clock {
        &self.user
    }

    pub fn network(&self) -> &Clock {
        &self.network
    }

    // Hand the result of a completed transaction back to the user context.
    pub fn sync_user_to_network(&self) -> Cycle {
        self.user.update(self.network.now())
    }
}

// Result of queueing a request with a timed server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    issued_at: Cycle,
    ready_at: Cycle,
}

impl Ticket {
    // Cycle at which the request entered the server.
    pub fn issued_at(&self) -> Cycle {
        self.issued_at
    }

    // Cycle at which the server will make the payload available to downstream consumers.
    pub fn ready_at(&self) -> Cycle {
        self.ready_at
    }

    pub fn latency(&self) -> Cycle {
        self.ready_at - self.issued_at
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    // Fixed latency added to every request
    pub base_latency: Cycle,
    // Throughput
    pub bytes_per_cycle: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_latency: 0,
            bytes_per_cycle: 1,
        }
    }
}

// Single-lane server that enforces the configured latency/bandwidth budget.  Requests that arrive
// while the lane is busy start when it frees up.
#[derive(Debug)]
pub struct TimedServer {
    config: ServerConfig,
    busy_until: Cycle,
    served: u64,
}

impl TimedServer {
    pub fn new(config: ServerConfig) -> Self {
        assert!(config.bytes_per_cycle > 0, "bytes_per_cycle must be > 0");
        Self {
            config,
            busy_until: 0,
            served: 0,
        }
    }

    pub fn service(&mut self, now: Cycle, size_bytes: u32) -> Ticket {
        let start = self.busy_until.max(now);
        let ready_at = self.next_ready_cycle(start, size_bytes);
        self.busy_until = ready_at;
        self.served += 1;
        Ticket {
            issued_at: now,
            ready_at,
        }
    }

    pub fn served(&self) -> u64 {
        self.served
    }

    fn next_ready_cycle(&self, start: Cycle, size_bytes: u32) -> Cycle {
        let service_cycles = transfer_cycles(size_bytes as u64, self.config.bytes_per_cycle as u64);
        start
            .saturating_add(self.config.base_latency)
            .saturating_add(service_cycles)
    }
}

pub fn transfer_cycles(bytes: u64, bytes_per_cycle: u64) -> Cycle {
    debug_assert!(bytes_per_cycle > 0);
    num::integer::div_ceil(bytes, bytes_per_cycle)
}
