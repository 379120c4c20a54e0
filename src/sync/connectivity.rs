//! Connectivity state and dispatch gating
//!
//! Tracks the single online/offline boolean observed from an external
//! network-status source and decides which actions may dispatch. Storage
//! mutations are local and always admitted; retrieval and transmission wait
//! for the network.

use tracing::info;

use super::action::Action;

/// A state change worth reacting to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    WentOnline,
    WentOffline,
}

/// Online/offline gate for the action queue.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    online: bool,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        Self { online }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Record the observed state. Returns the transition when the state
    /// actually changed, `None` for repeated reports.
    pub fn set_online(&mut self, online: bool) -> Option<Transition> {
        if self.online == online {
            return None;
        }
        self.online = online;
        let transition = if online {
            Transition::WentOnline
        } else {
            Transition::WentOffline
        };
        info!("network state changed: {:?}", transition);
        Some(transition)
    }

    /// Whether the action may dispatch under the current state.
    pub fn admits(&self, action: &Action) -> bool {
        self.online || !action.needs_network()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::action::ActionKind;
    use crate::types::{AccountId, ActionId, FolderId, MessageId};

    #[test]
    fn test_transitions_fire_once() {
        let mut monitor = ConnectivityMonitor::new(true);
        assert_eq!(monitor.set_online(false), Some(Transition::WentOffline));
        assert_eq!(monitor.set_online(false), None);
        assert_eq!(monitor.set_online(true), Some(Transition::WentOnline));
        assert_eq!(monitor.set_online(true), None);
    }

    #[test]
    fn test_offline_admits_only_storage() {
        let mut monitor = ConnectivityMonitor::new(true);
        monitor.set_online(false);

        let retrieval = Action::new(
            ActionId(1),
            ActionKind::RetrieveMessageList {
                account: AccountId(1),
                folder: FolderId(1),
                minimum: 20,
            },
        );
        let storage = Action::new(
            ActionId(2),
            ActionKind::DeleteMessages {
                ids: vec![MessageId(1)],
            },
        );

        assert!(!monitor.admits(&retrieval));
        assert!(monitor.admits(&storage));

        monitor.set_online(true);
        assert!(monitor.admits(&retrieval));
    }
}
