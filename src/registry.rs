//! Process-wide actor registry.
//!
//! Owned by the actor system and passed around as a handle — never a
//! global. Registered (non-hidden) actors are held strongly until their
//! cleanup deregisters them; the running-actor count covers every spawned
//! actor and backs `await_all_actors_done`.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

use crate::actor::{ActorAddr, ActorId, ActorRef};

struct RegistryState {
    by_id: HashMap<ActorId, ActorRef>,
    by_name: HashMap<String, ActorAddr>,
    running: usize,
}

pub struct Registry {
    state: Mutex<RegistryState>,
    cv: Condvar,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            state: Mutex::new(RegistryState {
                by_id: HashMap::new(),
                by_name: HashMap::new(),
                running: 0,
            }),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn put(&self, id: ActorId, actor: ActorRef) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.by_id.insert(id, actor);
    }

    pub(crate) fn erase(&self, id: ActorId) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.by_id.remove(&id);
    }

    /// Look up a live, registered actor by id.
    pub fn get(&self, id: ActorId) -> Option<ActorRef> {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.by_id.get(&id).cloned()
    }

    /// Bind a name to an actor address. Rebinding replaces the old entry.
    pub fn put_named(&self, name: impl Into<String>, addr: ActorAddr) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.by_name.insert(name.into(), addr);
    }

    /// Resolve a name to a live actor.
    pub fn get_named(&self, name: &str) -> Option<ActorRef> {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.by_name.get(name).and_then(ActorAddr::upgrade)
    }

    pub fn erase_named(&self, name: &str) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.by_name.remove(name);
    }

    pub(crate) fn inc_running(&self) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.running += 1;
    }

    pub(crate) fn dec_running(&self) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.running = st.running.saturating_sub(1);
        drop(st);
        self.cv.notify_all();
    }

    /// Actors spawned and not yet cleaned up.
    pub fn running_count(&self) -> usize {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.running
    }

    /// Block until the running count drops to `n` or below.
    pub fn await_running_count_le(&self, n: usize) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while st.running > n {
            st = self.cv.wait(st).unwrap_or_else(|e| e.into_inner());
        }
    }
}
