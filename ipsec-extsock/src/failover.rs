//! C6 — Failover Controller.
//!
//! Deterministic round-robin across a connection's `remote_addrs` list,
//! bounded by a fixed retry budget (spec §4.6). Failover derivatives are
//! always freshly cloned from the base configuration and registered under
//! a derived name (spec §9) — the base entry in the registry is never
//! mutated.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{ConnName, CsvString, PeerConfig, StartAction};
use crate::error::Result;
use crate::host::{HostAdapter, IkeSaHandle};

/// Maximum number of failover attempts per connection before giving up
/// and waiting for the next externally triggered failure (spec §4.6).
pub const MAX_RETRY: u32 = 5;

struct FailoverState {
    current_addr: String,
    retry_count: u32,
}

/// Tracks, per base connection name, which SEGW address is currently
/// being pursued and how many attempts have been spent on it.
pub struct FailoverController {
    host: Arc<HostAdapter>,
    state: Mutex<HashMap<ConnName, FailoverState>>,
}

/// Pick the next address after `current` in `addresses`, wrapping around.
/// Falls back to the first address if `current` is not present in the
/// list at all (e.g. on the very first failure).
pub fn select_next_segw<'a>(addresses: &[&'a str], current: &str) -> Option<&'a str> {
    if addresses.is_empty() {
        return None;
    }
    match addresses.iter().position(|addr| *addr == current) {
        Some(pos) => Some(addresses[(pos + 1) % addresses.len()]),
        None => Some(addresses[0]),
    }
}

/// Produce a failover derivative of `src`, identical except for its name,
/// the single remote address it now targets, and `start_action` forced to
/// `Start` on every child so `HostAdapter::install` triggers immediate
/// negotiation for all of them (spec §4.6 step 6).
pub fn clone_peer_config_with_remote(src: &PeerConfig, next_addr: &str) -> PeerConfig {
    let mut derived = src.clone();
    derived.name = src.name.failover_derivative(next_addr);
    derived.ike.remote_addrs = CsvString(smol_str::SmolStr::new(next_addr));
    for child in &mut derived.children {
        child.start_action = StartAction::Start;
    }
    derived
}

impl FailoverController {
    pub fn new(host: Arc<HostAdapter>) -> Arc<Self> {
        Arc::new(Self {
            host,
            state: Mutex::new(HashMap::new()),
        })
    }

    /// Clear retry state for a connection, e.g. once its IKE SA reaches
    /// ESTABLISHED (spec §4.6: the retry budget only bounds a single
    /// failure episode).
    pub fn reset_retry_count(&self, name: &str) {
        self.state.lock().remove(name);
    }

    /// React to a connection failure: if `peer` has more than one SEGW
    /// address, advance to the next one and install a fresh derivative
    /// with every child re-triggered. Returns `None` for single-SEGW
    /// connections or once the retry budget is exhausted (spec §4.6).
    pub fn handle_connection_failure(&self, peer: &Arc<PeerConfig>, ike: &dyn IkeSaHandle) -> Result<Option<Arc<PeerConfig>>> {
        if !peer.is_multi_segw() {
            return Ok(None);
        }

        let addresses = peer.ike.remote_addrs.addresses();

        let next_addr = {
            let mut state = self.state.lock();
            // Step 2 (spec §4.6): seed from the SA's own current other-host
            // rather than assuming the failover sequence always starts at
            // `addresses[0]`.
            let entry = state.entry(peer.name.clone()).or_insert_with(|| FailoverState {
                current_addr: ike.remote_host().unwrap_or_else(|| addresses[0].to_owned()),
                retry_count: 0,
            });

            entry.retry_count += 1;
            if entry.retry_count > MAX_RETRY {
                tracing::warn!(name = %peer.name, "failover retry budget exhausted");
                state.remove(&peer.name);
                return Ok(None);
            }

            let next = select_next_segw(&addresses, &entry.current_addr)
                .unwrap_or(addresses[0])
                .to_owned();
            entry.current_addr = next.clone();
            next
        };

        let derivative = clone_peer_config_with_remote(peer, &next_addr);
        tracing::info!(base = %peer.name, next = %next_addr, "failing over to next SEGW");
        let installed = self.host.install(derivative, Vec::new())?;
        Ok(Some(installed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ChildAction, ChildConfig, ChildMode, ConnName as Name, IkeConfig, Lifetime, PeerParams, StartAction,
        TrafficSelector,
    };
    use crate::credential::CredentialStore;
    use crate::host::{Controller, HostHandles};
    use crate::registry::ConfigRegistry;
    use proptest::prelude::*;
    use std::sync::Mutex as StdMutex;

    /// A terminating IKE SA whose other-host is always `10.0.0.2`, the
    /// first address in [`multi_segw_peer`]'s `remote_addrs`.
    struct FakeIke;
    impl IkeSaHandle for FakeIke {
        fn name(&self) -> &str {
            "c1"
        }
        fn state(&self) -> i32 {
            0
        }
        fn local_host(&self) -> Option<String> {
            Some("10.0.0.1".to_owned())
        }
        fn remote_host(&self) -> Option<String> {
            Some("10.0.0.2".to_owned())
        }
        fn peer_config_name(&self) -> Option<String> {
            Some("c1".to_owned())
        }
        fn reached_established(&self) -> bool {
            false
        }
        fn trigger_dpd(&self) -> Result<()> {
            Ok(())
        }
    }

    struct RecordingController {
        calls: StdMutex<Vec<(String, String)>>,
    }

    impl Controller for RecordingController {
        fn initiate(&self, peer_cfg: &Arc<PeerConfig>, child_name: &str) -> Result<()> {
            self.calls.lock().unwrap().push((peer_cfg.name.to_string(), child_name.to_owned()));
            Ok(())
        }
        fn terminate_ike(&self, _sa_name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn multi_segw_peer() -> Arc<PeerConfig> {
        Arc::new(PeerConfig {
            name: Name::new("c1").unwrap(),
            ike: IkeConfig {
                remote_addrs: CsvString::new(&["10.0.0.2".into(), "10.0.0.3".into(), "10.0.0.4".into()]),
                ..IkeConfig::default()
            },
            local_auths: Vec::new(),
            remote_auths: Vec::new(),
            children: vec![ChildConfig {
                name: Name::new("ch").unwrap(),
                mode: ChildMode::Tunnel,
                start_action: StartAction::Start,
                dpd_action: ChildAction::None,
                close_action: ChildAction::None,
                lifetime: Lifetime::default(),
                local_ts: vec![TrafficSelector::dynamic_wildcard()],
                remote_ts: vec![TrafficSelector::dynamic_wildcard()],
                esp_proposals: Vec::new(),
            }],
            peer_params: PeerParams::default(),
        })
    }

    fn test_host(controller: Arc<RecordingController>) -> Arc<HostAdapter> {
        HostAdapter::new(
            ConfigRegistry::new(),
            CredentialStore::new(),
            HostHandles {
                backend_registrar: None,
                sa_manager: None,
                controller: Some(controller as Arc<dyn Controller>),
                credential_manager: None,
            },
            Box::new(|_, _, _| true),
        )
    }

    #[test]
    fn single_segw_is_not_failover_eligible() {
        let controller = Arc::new(RecordingController {
            calls: StdMutex::new(Vec::new()),
        });
        let host = test_host(controller);
        let failover = FailoverController::new(host);

        let peer = Arc::new(PeerConfig {
            name: Name::new("single").unwrap(),
            ike: IkeConfig::default(),
            local_auths: Vec::new(),
            remote_auths: Vec::new(),
            children: Vec::new(),
            peer_params: PeerParams::default(),
        });

        assert!(failover.handle_connection_failure(&peer, &FakeIke).unwrap().is_none());
    }

    #[test]
    fn failover_advances_through_addresses_in_order() {
        let controller = Arc::new(RecordingController {
            calls: StdMutex::new(Vec::new()),
        });
        let host = test_host(controller.clone());
        let failover = FailoverController::new(host);
        let peer = multi_segw_peer();

        let first = failover.handle_connection_failure(&peer, &FakeIke).unwrap().unwrap();
        assert_eq!(first.ike.remote_addrs.addresses(), vec!["10.0.0.3"]);

        let second = failover.handle_connection_failure(&peer, &FakeIke).unwrap().unwrap();
        assert_eq!(second.ike.remote_addrs.addresses(), vec!["10.0.0.4"]);

        let third = failover.handle_connection_failure(&peer, &FakeIke).unwrap().unwrap();
        assert_eq!(third.ike.remote_addrs.addresses(), vec!["10.0.0.2"]);

        assert_eq!(controller.calls.lock().unwrap().len(), 3);
    }

    #[test]
    fn retry_budget_is_exhausted_after_max_retry_attempts() {
        let controller = Arc::new(RecordingController {
            calls: StdMutex::new(Vec::new()),
        });
        let host = test_host(controller);
        let failover = FailoverController::new(host);
        let peer = multi_segw_peer();

        for _ in 0..MAX_RETRY {
            assert!(failover.handle_connection_failure(&peer, &FakeIke).unwrap().is_some());
        }
        assert!(failover.handle_connection_failure(&peer, &FakeIke).unwrap().is_none());
    }

    #[test]
    fn reset_retry_count_allows_a_fresh_budget() {
        let controller = Arc::new(RecordingController {
            calls: StdMutex::new(Vec::new()),
        });
        let host = test_host(controller);
        let failover = FailoverController::new(host);
        let peer = multi_segw_peer();

        for _ in 0..MAX_RETRY {
            failover.handle_connection_failure(&peer, &FakeIke).unwrap();
        }
        failover.reset_retry_count("c1");
        assert!(failover.handle_connection_failure(&peer, &FakeIke).unwrap().is_some());
    }

    proptest! {
        #[test]
        fn select_next_segw_cycles_through_every_address_exactly_once(
            addrs in prop::collection::hash_set("[a-z]{1,4}", 2..6),
            start_idx in 0usize..6,
        ) {
            let addresses: Vec<&str> = addrs.iter().map(String::as_str).collect();
            let start = addresses[start_idx % addresses.len()];

            let mut seen = vec![start.to_owned()];
            let mut current = start;
            for _ in 0..addresses.len() - 1 {
                let next = select_next_segw(&addresses, current).unwrap();
                seen.push(next.to_owned());
                current = next;
            }

            let mut sorted_seen = seen.clone();
            sorted_seen.sort();
            sorted_seen.dedup();
            prop_assert_eq!(sorted_seen.len(), addresses.len());

            let back_to_start = select_next_segw(&addresses, current).unwrap();
            prop_assert_eq!(back_to_start, start);
        }
    }
}
