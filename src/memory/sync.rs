use std::any::Any;
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::error;

// how often a blocked context looks at the halt flag
const HALT_POLL: Duration = Duration::from_millis(20);

/// Run-wide stop raised by the first context that hits a fatal condition.  Every blocking wait in
/// the memory system polls it, so the remaining contexts unwind instead of sleeping forever.
#[derive(Debug, Default)]
pub struct Halt {
    reason: Mutex<Option<String>>,
}

impl Halt {
    /// Records `reason` unless an earlier fatal condition already did.
    pub fn raise(&self, reason: String) {
        let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            error!("memory system halted: {}", reason);
            *slot = Some(reason);
        }
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Panics if the run was halted.
    pub fn check(&self) {
        if let Some(reason) = self.reason() {
            panic!("memory system halted: {}", reason);
        }
    }

    /// Runs `f`; a panic inside it halts the run and keeps unwinding.
    pub fn guard<R>(&self, f: impl FnOnce() -> R) -> R {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
            Ok(r) => r,
            Err(cause) => {
                self.raise(panic_message(&*cause));
                std::panic::resume_unwind(cause)
            }
        }
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

/// Mutual exclusion for one cache component.  Acquire and release are separate calls because an
/// atomic LOCK/UNLOCK pair keeps the L1 lock held across two core accesses.
#[derive(Debug)]
pub struct ComponentLock {
    held: Mutex<bool>,
    freed: Condvar,
    halt: Arc<Halt>,
}

impl ComponentLock {
    pub fn new(halt: Arc<Halt>) -> Self {
        Self {
            held: Mutex::new(false),
            freed: Condvar::new(),
            halt,
        }
    }

    pub fn acquire(&self) {
        loop {
            {
                let mut held = self.held.lock().expect("lock poisoned");
                if !*held {
                    *held = true;
                    return;
                }
                let _ = self.freed.wait_timeout(held, HALT_POLL).expect("lock poisoned");
            }
            self.halt.check();
        }
    }

    pub fn release(&self) {
        let mut held = self.held.lock().expect("lock poisoned");
        assert!(*held, "releasing a component lock that is not held");
        *held = false;
        self.freed.notify_one();
    }
}

/// Single-slot rendezvous between the user and network contexts of a tile.
#[derive(Debug)]
pub struct Signal {
    tx: SyncSender<()>,
    rx: Mutex<Receiver<()>>,
    halt: Arc<Halt>,
}

impl Signal {
    pub fn new(halt: Arc<Halt>) -> Self {
        let (tx, rx) = sync_channel(1);
        Self {
            tx,
            rx: Mutex::new(rx),
            halt,
        }
    }

    pub fn signal(&self) {
        // the receiver lives as long as self
        let _ = self.tx.send(());
    }

    pub fn wait(&self) {
        loop {
            let received = self.rx.lock().expect("lock poisoned").recv_timeout(HALT_POLL);
            match received {
                Ok(()) => return,
                Err(RecvTimeoutError::Timeout) => self.halt.check(),
                Err(RecvTimeoutError::Disconnected) => panic!("signal sender dropped while waiting"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    fn lock() -> ComponentLock {
        ComponentLock::new(Arc::default())
    }

    #[test]
    fn lock_excludes_across_threads() {
        let lock = lock();
        let counter = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..100 {
                        lock.acquire();
                        let v = counter.load(Ordering::Relaxed);
                        thread::yield_now();
                        counter.store(v + 1, Ordering::Relaxed);
                        lock.release();
                    }
                });
            }
        });
        assert_eq!(counter.load(Ordering::Relaxed), 400);
    }

    #[test]
    fn lock_may_be_released_by_another_thread() {
        let lock = lock();
        lock.acquire();
        thread::scope(|s| {
            s.spawn(|| lock.release());
        });
        lock.acquire();
        lock.release();
    }

    #[test]
    #[should_panic(expected = "not held")]
    fn double_release_is_fatal() {
        let lock = lock();
        lock.acquire();
        lock.release();
        lock.release();
    }

    #[test]
    fn signals_pair_up() {
        let halt = Arc::new(Halt::default());
        let (ping, pong) = (Signal::new(halt.clone()), Signal::new(halt));
        thread::scope(|s| {
            s.spawn(|| {
                ping.wait();
                pong.signal();
            });
            ping.signal();
            pong.wait();
        });
    }

    #[test]
    fn halt_wakes_a_blocked_waiter() {
        let halt = Arc::new(Halt::default());
        let signal = Signal::new(halt.clone());
        let held = ComponentLock::new(halt.clone());
        held.acquire();
        thread::scope(|s| {
            let waiter = s.spawn(|| signal.wait());
            let locker = s.spawn(|| held.acquire());
            halt.raise("dram dir 0: out of entries".to_string());
            assert!(waiter.join().is_err());
            assert!(locker.join().is_err());
        });
        assert_eq!(halt.reason().as_deref(), Some("dram dir 0: out of entries"));
    }

    #[test]
    fn first_fatal_reason_wins() {
        let halt = Halt::default();
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            halt.guard(|| panic!("tile {}: protocol violation", 2))
        }));
        assert!(caught.is_err());
        halt.raise("later".to_string());
        assert_eq!(halt.reason().as_deref(), Some("tile 2: protocol violation"));
        assert_eq!(halt.guard(|| 7), 7);
    }
}
