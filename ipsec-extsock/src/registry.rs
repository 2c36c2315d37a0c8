//! C2 — Config Registry.
//!
//! Owns the live `name -> PeerConfig` mapping the host daemon queries
//! during SA negotiation. A single `parking_lot::RwLock` backs the map:
//! readers (host-daemon backend queries, on the negotiation thread) never
//! block each other, and writers (install/remove, spec §5) are serialized
//! against both readers and each other.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{ConnName, Identity, PeerConfig, StartAction};

/// Predicate deciding whether a registered [`PeerConfig`] admits a given
/// local/remote identity pair. The matching policy itself belongs to the
/// host daemon (spec §4.2: "delegated to the IKE engine's
/// identity-matching predicate"); the registry only invokes it per entry.
pub type IdentityMatchFn<'a> = dyn Fn(&PeerConfig, Option<&Identity>, Option<&Identity>) -> bool + 'a;

#[derive(Default)]
pub struct ConfigRegistry {
    entries: RwLock<HashMap<ConnName, Arc<PeerConfig>>>,
}

impl ConfigRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace any existing entry with the same name (spec §4.2).
    ///
    /// If the prior entry had a child with `start_action = Start`, a new
    /// child of the same name inherits that trigger even if the incoming
    /// document set something weaker — the host daemon is the one that
    /// decides whether to actually re-negotiate.
    pub fn register(&self, mut config: PeerConfig) -> Arc<PeerConfig> {
        let mut entries = self.entries.write();

        if let Some(previous) = entries.get(&config.name) {
            let previously_started: std::collections::HashSet<&str> = previous
                .children
                .iter()
                .filter(|c| c.start_action == StartAction::Start)
                .map(|c| c.name.as_str())
                .collect();

            for child in &mut config.children {
                if previously_started.contains(child.name.as_str()) {
                    child.start_action = StartAction::Start;
                }
            }
        }

        let config = Arc::new(config);
        tracing::info!(name = %config.name, "registered peer configuration");
        entries.insert(config.name.clone(), Arc::clone(&config));
        config
    }

    /// Remove and destroy the entry. Returns `false` for an unknown name,
    /// without error (spec §4.2: "idempotent … no retries").
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.entries.write().remove(name).is_some();
        if removed {
            tracing::info!(name, "removed peer configuration");
        }
        removed
    }

    /// Exact-match lookup, constant-time expected.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<PeerConfig>> {
        self.entries.read().get(name).cloned()
    }

    /// All registered configs whose local/remote identity patterns admit
    /// the given pair. Tolerates `None` identities (host daemons may pass
    /// null during bootstrap, spec §4.3).
    pub fn enumerate(
        &self,
        local_id: Option<&Identity>,
        remote_id: Option<&Identity>,
        matcher: &IdentityMatchFn<'_>,
    ) -> Vec<Arc<PeerConfig>> {
        self.entries
            .read()
            .values()
            .filter(|config| matcher(config, local_id, remote_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChildAction, ChildConfig, ChildMode, ConnName, IkeConfig, Lifetime, PeerParams, TrafficSelector};

    fn sample_config(name: &str, start_action: StartAction) -> PeerConfig {
        PeerConfig {
            name: ConnName::new(name).unwrap(),
            ike: IkeConfig::default(),
            local_auths: Vec::new(),
            remote_auths: Vec::new(),
            children: vec![ChildConfig {
                name: ConnName::new("ch").unwrap(),
                mode: ChildMode::Tunnel,
                start_action,
                dpd_action: ChildAction::None,
                close_action: ChildAction::None,
                lifetime: Lifetime::default(),
                local_ts: vec![TrafficSelector::dynamic_wildcard()],
                remote_ts: vec![TrafficSelector::dynamic_wildcard()],
                esp_proposals: Vec::new(),
            }],
            peer_params: PeerParams::default(),
        }
    }

    #[test]
    fn register_then_find_roundtrip() {
        let registry = ConfigRegistry::new();
        registry.register(sample_config("c1", StartAction::None));
        assert!(registry.find_by_name("c1").is_some());
    }

    #[test]
    fn remove_unknown_returns_false() {
        let registry = ConfigRegistry::new();
        assert!(!registry.remove("nope"));
    }

    #[test]
    fn register_replaces_existing_atomically() {
        let registry = ConfigRegistry::new();
        registry.register(sample_config("c1", StartAction::None));
        registry.register(sample_config("c1", StartAction::Trap));
        assert_eq!(registry.len(), 1);
        let current = registry.find_by_name("c1").unwrap();
        assert_eq!(current.children[0].start_action, StartAction::Trap);
    }

    #[test]
    fn started_child_trigger_is_inherited_across_replace() {
        let registry = ConfigRegistry::new();
        registry.register(sample_config("c1", StartAction::Start));
        registry.register(sample_config("c1", StartAction::None));
        let current = registry.find_by_name("c1").unwrap();
        assert_eq!(current.children[0].start_action, StartAction::Start);
    }

    #[test]
    fn enumerate_tolerates_null_identities() {
        let registry = ConfigRegistry::new();
        registry.register(sample_config("c1", StartAction::None));
        let matches = registry.enumerate(None, None, &|_, _, _| true);
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn remove_then_readd_leaves_one_entry() {
        let registry = ConfigRegistry::new();
        registry.register(sample_config("c1", StartAction::None));
        registry.remove("c1");
        registry.register(sample_config("c1", StartAction::Trap));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find_by_name("c1").unwrap().children[0].start_action, StartAction::Trap);
    }
}
