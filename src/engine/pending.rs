//! Pending-command registry: result slots for in-flight probe commands.
//!
//! Every command sent to the probe gets an auto-incrementing id and a
//! single-assignment slot. The slot is registered *before* the command bytes
//! hit the wire, so a reply can never race past its waiter. Resolution
//! happens exactly once: with the probe's answer, or with a forced failure
//! when the session shuts down.

use crate::error::Error;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Mutex;
use std::time::Duration;

/// Outcome of one probe command.
pub type CommandOutcome = Result<Option<Value>, Error>;

/// Waiter side of a pending command.
pub struct PendingReply {
    pub id: u64,
    receiver: Receiver<CommandOutcome>,
}

impl PendingReply {
    /// Block until the slot resolves or the timeout expires.
    ///
    /// A timed-out wait leaves the slot registered; a late resolution (or
    /// the shutdown sweep) still consumes it without double-resolving.
    pub fn wait(self, timeout: Duration) -> CommandOutcome {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(Error::CommandTimeout(timeout)),
            // Resolver gone without a value: the registry was dropped.
            Err(RecvTimeoutError::Disconnected) => Err(Error::SessionShutDown),
        }
    }
}

/// Registry of unresolved command slots, keyed by command id.
#[derive(Default)]
pub struct PendingCommands {
    next_id: AtomicU64,
    slots: Mutex<HashMap<u64, SyncSender<CommandOutcome>>>,
}

impl PendingCommands {
    pub fn new() -> PendingCommands {
        PendingCommands {
            next_id: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate an id and register its slot. Call this before writing the
    /// command to the channel.
    pub fn register(&self) -> PendingReply {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        // Buffer of one: the resolver never blocks, even when the waiter has
        // already timed out and will never read the value.
        let (sender, receiver) = sync_channel(1);
        self.slots
            .lock()
            .expect("pending lock poisoned")
            .insert(id, sender);
        PendingReply { id, receiver }
    }

    /// Resolve a slot. Returns false when the id is unknown (already
    /// resolved, or never issued). Sending towards a waiter whose receiving
    /// context is gone is deliberately tolerated.
    pub fn resolve(&self, id: u64, outcome: CommandOutcome) -> bool {
        let sender = self.slots.lock().expect("pending lock poisoned").remove(&id);
        match sender {
            Some(sender) => {
                let _ = sender.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Forcibly fail every outstanding slot (shutdown path).
    pub fn fail_all(&self, error: impl Fn() -> Error) {
        let slots: Vec<_> = {
            let mut guard = self.slots.lock().expect("pending lock poisoned");
            guard.drain().collect()
        };
        for (id, sender) in slots {
            log::debug!(target: "engine", "failing pending command {id} on shutdown");
            let _ = sender.send(Err(error()));
        }
    }

    pub fn outstanding(&self) -> usize {
        self.slots.lock().expect("pending lock poisoned").len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn resolve_reaches_waiter() {
        let pending = Arc::new(PendingCommands::new());
        let reply = pending.register();
        let id = reply.id;

        let resolver = {
            let pending = pending.clone();
            std::thread::spawn(move || pending.resolve(id, Ok(Some(json!({"ok": true})))))
        };

        let outcome = reply.wait(Duration::from_secs(2)).unwrap();
        assert_eq!(outcome, Some(json!({"ok": true})));
        assert!(resolver.join().unwrap());
        assert_eq!(pending.outstanding(), 0);
    }

    #[test]
    fn each_slot_resolves_at_most_once() {
        let pending = PendingCommands::new();
        let reply = pending.register();
        let id = reply.id;
        assert!(pending.resolve(id, Ok(None)));
        assert!(!pending.resolve(id, Ok(Some(json!(2)))));
        assert_eq!(reply.wait(Duration::from_millis(100)).unwrap(), None);
    }

    #[test]
    fn timeout_then_late_resolution_does_not_panic() {
        let pending = PendingCommands::new();
        let reply = pending.register();
        let id = reply.id;
        let outcome = reply.wait(Duration::from_millis(10));
        assert!(matches!(outcome, Err(Error::CommandTimeout(_))));
        // Receiver is gone; the late resolution must be absorbed silently.
        assert!(pending.resolve(id, Ok(None)));
        assert_eq!(pending.outstanding(), 0);
    }

    #[test]
    fn shutdown_fails_slots_registered_on_other_threads() {
        let pending = Arc::new(PendingCommands::new());

        let waiter = {
            let pending = pending.clone();
            std::thread::spawn(move || {
                let reply = pending.register();
                reply.wait(Duration::from_secs(5))
            })
        };

        // Give the waiter time to register before sweeping.
        while pending.outstanding() == 0 {
            std::thread::yield_now();
        }
        pending.fail_all(|| Error::SessionShutDown);

        let outcome = waiter.join().unwrap();
        assert!(matches!(outcome, Err(Error::SessionShutDown)));
    }

    #[test]
    fn fail_all_tolerates_defunct_waiters() {
        let pending = PendingCommands::new();
        let reply = pending.register();
        drop(reply);
        pending.fail_all(|| Error::SessionShutDown);
        assert_eq!(pending.outstanding(), 0);
    }
}
