//! Local listener registry
//!
//! Channel name -> ordered list of callbacks. Callbacks are invoked
//! synchronously, in list order, for each event on their channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::event::IpcBusEvent;

/// Listener callback
pub type Listener = Arc<dyn Fn(&IpcBusEvent, &[Value]) + Send + Sync>;

/// Identifies one registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

struct Entry {
    id: ListenerId,
    callback: Listener,
    once: bool,
}

/// Callbacks selected for one event
pub(crate) struct Emission {
    /// Callbacks to invoke, in order
    pub callbacks: Vec<Listener>,
    /// How many of them were `once` listeners, now removed
    pub once_fired: usize,
}

/// Per-channel ordered callback lists
#[derive(Default)]
pub struct ListenerRegistry {
    channels: HashMap<String, Vec<Entry>>,
    next_id: u64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback; `prepend` puts it ahead of existing ones
    pub fn add(
        &mut self,
        channel: &str,
        callback: Listener,
        once: bool,
        prepend: bool,
    ) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        let entry = Entry { id, callback, once };

        let list = self.channels.entry(channel.to_string()).or_default();
        if prepend {
            list.insert(0, entry);
        } else {
            list.push(entry);
        }
        id
    }

    /// Remove one listener; returns whether it was registered on `channel`
    pub fn remove(&mut self, channel: &str, id: ListenerId) -> bool {
        let Some(list) = self.channels.get_mut(channel) else {
            return false;
        };
        let before = list.len();
        list.retain(|entry| entry.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.channels.remove(channel);
        }
        removed
    }

    /// Remove every listener on `channel`, returning how many there were
    pub fn remove_all(&mut self, channel: &str) -> usize {
        self.channels.remove(channel).map_or(0, |list| list.len())
    }

    /// Number of listeners on `channel`
    pub fn count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, Vec::len)
    }

    /// Select the callbacks for an event on `channel`
    ///
    /// `once` listeners are removed here, before any callback runs, so a
    /// re-entrant emit cannot fire them twice.
    pub(crate) fn take_for_emit(&mut self, channel: &str) -> Emission {
        let Some(list) = self.channels.get_mut(channel) else {
            return Emission {
                callbacks: Vec::new(),
                once_fired: 0,
            };
        };

        let callbacks = list.iter().map(|entry| Arc::clone(&entry.callback)).collect();
        let before = list.len();
        list.retain(|entry| !entry.once);
        let once_fired = before - list.len();
        if list.is_empty() {
            self.channels.remove(channel);
        }

        Emission {
            callbacks,
            once_fired,
        }
    }
}
