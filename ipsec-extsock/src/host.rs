//! C3 — Host-Daemon Adapter.
//!
//! The only component that speaks to the host daemon's SA, credential,
//! and controller interfaces (spec §4.3). Every capability this crate
//! consumes from the host is modeled as a trait (spec §9's "capability-based
//! interface" redesign note) rather than a concrete library dependency —
//! the real implementation is provided by the host IKE engine and is out
//! of scope here (spec §1, §6.3).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{Identity, IkeConfig, PeerConfig, StartAction};
use crate::credential::{CredentialSet, CredentialStore, PendingCredential};
use crate::error::{ExtsockError, Result};
use crate::registry::{ConfigRegistry, IdentityMatchFn};

/// Transport-layer protocol of a child SA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaProtocol {
    Esp,
    Ah,
    Unknown,
}

/// Encapsulation mode as reported by the host for a live child SA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaMode {
    Tunnel,
    Transport,
    Unknown,
}

/// A live IKE SA, as exposed by the host daemon's SA manager.
///
/// Implementations are provided by the host; this crate only ever reads
/// through this trait.
pub trait IkeSaHandle: Send + Sync {
    fn name(&self) -> &str;
    fn state(&self) -> i32;
    fn local_host(&self) -> Option<String>;
    fn remote_host(&self) -> Option<String>;
    fn peer_config_name(&self) -> Option<String>;
    /// True once the SA has reached ESTABLISHED at least once in its
    /// lifetime (spec §4.5: failure is "a state that never transitioned
    /// through ESTABLISHED").
    fn reached_established(&self) -> bool;
    fn trigger_dpd(&self) -> Result<()>;
}

/// A live child SA, as exposed by the host daemon's SA manager.
pub trait ChildSaHandle: Send + Sync {
    fn name(&self) -> &str;
    fn state(&self) -> i32;
    fn inbound_spi(&self) -> u32;
    fn protocol(&self) -> SaProtocol;
    fn mode(&self) -> SaMode;
    fn enc_alg(&self) -> String;
    fn integ_alg(&self) -> String;
    fn local_ts(&self) -> Option<String>;
    fn remote_ts(&self) -> Option<String>;
}

/// `SA manager` capability (spec §6.3 item 2).
pub trait SaManager: Send + Sync {
    fn checkout_by_name(&self, name: &str) -> Option<Arc<dyn IkeSaHandle>>;
    fn enumerate_active_sas(&self) -> Vec<Arc<dyn IkeSaHandle>>;
}

/// `Controller` capability (spec §6.3 item 3).
pub trait Controller: Send + Sync {
    fn initiate(&self, peer_cfg: &Arc<PeerConfig>, child_name: &str) -> Result<()>;
    fn terminate_ike(&self, sa_name: &str) -> Result<()>;
}

/// `Credential manager` capability (spec §6.3 item 5).
pub trait CredentialManager: Send + Sync {
    fn add_set(&self, set: Arc<dyn CredentialSet>);
    fn remove_set(&self, set: &Arc<dyn CredentialSet>);
}

/// The SA lifecycle callbacks the event bus (host side) delivers to
/// whichever listener is subscribed (spec §6.3 item 4). Implemented by
/// [`crate::events::EventListener`].
pub trait HostEventListener: Send + Sync {
    fn on_ike_updown(&self, ike: &dyn IkeSaHandle, up: bool);
    fn on_child_updown(&self, ike: &dyn IkeSaHandle, child: &dyn ChildSaHandle, up: bool);
    fn on_ike_rekey(&self, old: &dyn IkeSaHandle, new: &dyn IkeSaHandle);
    fn on_child_rekey(&self, ike: &dyn IkeSaHandle, old: &dyn ChildSaHandle, new: &dyn ChildSaHandle);
}

/// `Event bus` capability (spec §6.3 item 4): lets this plugin attach its
/// listener to the host daemon's SA lifecycle notifications.
pub trait EventBus: Send + Sync {
    fn subscribe(&self, listener: Arc<dyn HostEventListener>);
    fn unsubscribe(&self, listener: &Arc<dyn HostEventListener>);
}

/// The backend this plugin contributes to the host daemon's backend
/// registry (spec §4.3, "Operations exposed to host daemon").
pub trait Backend: Send + Sync {
    fn create_peer_cfg_enumerator(&self, local_id: Option<&Identity>, remote_id: Option<&Identity>) -> Vec<Arc<PeerConfig>>;
    fn get_peer_cfg_by_name(&self, name: &str) -> Option<Arc<PeerConfig>>;
    /// This plugin contributes IKE configs only via peer configs, so the
    /// IKE-cfg enumerator the host daemon queries separately is always
    /// empty (spec §4.3).
    fn create_ike_cfg_enumerator(&self, local_host: Option<&str>, remote_host: Option<&str>) -> Vec<Arc<IkeConfig>>;
}

/// `Backend registration` capability (spec §6.3 item 1).
pub trait BackendRegistrar: Send + Sync {
    fn add_backend(&self, backend: Arc<dyn Backend>);
}

/// All host subsystems this plugin needs; used by the lazy-registration
/// check (spec §4.3: `host_daemon_fully_ready`).
pub struct HostHandles {
    pub backend_registrar: Option<Arc<dyn BackendRegistrar>>,
    pub sa_manager: Option<Arc<dyn SaManager>>,
    pub controller: Option<Arc<dyn Controller>>,
    pub credential_manager: Option<Arc<dyn CredentialManager>>,
}

impl HostHandles {
    fn fully_ready(&self) -> bool {
        self.backend_registrar.is_some()
            && self.sa_manager.is_some()
            && self.controller.is_some()
            && self.credential_manager.is_some()
    }
}

/// The host-daemon adapter: the sole component with access to the host's
/// SA, credential, and controller interfaces.
pub struct HostAdapter {
    registry: Arc<ConfigRegistry>,
    credentials: Arc<CredentialStore>,
    host: HostHandles,
    identity_matcher: Box<IdentityMatchFn<'static>>,
    backend_registered: AtomicBool,
}

impl HostAdapter {
    pub fn new(
        registry: Arc<ConfigRegistry>,
        credentials: Arc<CredentialStore>,
        host: HostHandles,
        identity_matcher: Box<IdentityMatchFn<'static>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            credentials,
            host,
            identity_matcher,
            backend_registered: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &Arc<ConfigRegistry> {
        &self.registry
    }

    /// The credential set this adapter installs into and tears down
    /// (spec §4.4: registered with the host's credential manager at
    /// plugin start, deregistered on shutdown).
    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Lazy registration algorithm (spec §4.3): runs on every `install`
    /// and should also be invoked on the first backend callback, since
    /// the host may call into this plugin before its own `install` fires.
    pub fn ensure_backend_registered(self: &Arc<Self>) {
        if self.backend_registered.load(Ordering::Acquire) {
            return;
        }
        if !self.host.fully_ready() {
            return;
        }
        if let Some(registrar) = &self.host.backend_registrar {
            registrar.add_backend(Arc::clone(self) as Arc<dyn Backend>);
            self.backend_registered.store(true, Ordering::Release);
            tracing::info!("backend registered with host daemon");
        }
    }

    /// Install a parsed connection: materialize into the registry,
    /// transfer its credentials, and initiate any `start_action = Start`
    /// children (spec §4.3).
    pub fn install(self: &Arc<Self>, config: PeerConfig, credentials: Vec<PendingCredential>) -> Result<Arc<PeerConfig>> {
        self.credentials.install(credentials);
        let installed = self.registry.register(config);

        if let Some(controller) = &self.host.controller {
            for child in &installed.children {
                if child.start_action == StartAction::Start {
                    if let Err(error) = controller.initiate(&installed, child.name.as_str()) {
                        tracing::warn!(%error, child = child.name.as_str(), "failed to initiate child SA on install");
                    }
                }
            }
        }

        self.ensure_backend_registered();

        Ok(installed)
    }

    /// Remove from the registry. Does not terminate live SAs — the host
    /// daemon decides that (spec §4.3). Also tears down every credential
    /// the removed connection's auth configs installed, since nothing
    /// else ever calls `CredentialStore::remove_identity` otherwise.
    pub fn remove(&self, name: &str) -> Result<bool> {
        if let Some(peer) = self.registry.find_by_name(name) {
            for auth in peer.local_auths.iter().chain(peer.remote_auths.iter()) {
                self.credentials.remove_identity(&auth.identity);
            }
        }
        Ok(self.registry.remove(name))
    }

    /// Check out the named IKE SA by exact identity match and trigger DPD.
    pub fn start_dpd(&self, ike_name: &str) -> Result<()> {
        let sa_manager = self
            .host
            .sa_manager
            .as_ref()
            .ok_or_else(|| ExtsockError::host_api_failure("SA manager unavailable"))?;

        let sa = sa_manager
            .checkout_by_name(ike_name)
            .ok_or_else(|| ExtsockError::host_api_failure(format!("no live IKE SA named '{ike_name}'")))?;

        sa.trigger_dpd()
    }

    /// Unconditional initiation, used by the failover controller (C6).
    pub fn initiate_child(&self, peer: &Arc<PeerConfig>, child_name: &str) -> Result<()> {
        let controller = self
            .host
            .controller
            .as_ref()
            .ok_or_else(|| ExtsockError::host_api_failure("controller unavailable"))?;
        controller.initiate(peer, child_name)
    }
}

impl Backend for HostAdapter {
    fn create_peer_cfg_enumerator(&self, local_id: Option<&Identity>, remote_id: Option<&Identity>) -> Vec<Arc<PeerConfig>> {
        self.registry.enumerate(local_id, remote_id, self.identity_matcher.as_ref())
    }

    fn get_peer_cfg_by_name(&self, name: &str) -> Option<Arc<PeerConfig>> {
        self.registry.find_by_name(name)
    }

    fn create_ike_cfg_enumerator(&self, _local_host: Option<&str>, _remote_host: Option<&str>) -> Vec<Arc<IkeConfig>> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChildAction, ChildConfig, ChildMode, ConnName, IkeConfig, Lifetime, PeerParams, TrafficSelector};
    use std::sync::Mutex;

    struct NoopController {
        initiated: Mutex<Vec<(String, String)>>,
    }

    impl Controller for NoopController {
        fn initiate(&self, peer_cfg: &Arc<PeerConfig>, child_name: &str) -> Result<()> {
            self.initiated.lock().unwrap().push((peer_cfg.name.to_string(), child_name.to_owned()));
            Ok(())
        }
        fn terminate_ike(&self, _sa_name: &str) -> Result<()> {
            Ok(())
        }
    }

    struct NoopRegistrar {
        called: AtomicBool,
    }
    impl BackendRegistrar for NoopRegistrar {
        fn add_backend(&self, _backend: Arc<dyn Backend>) {
            self.called.store(true, Ordering::SeqCst);
        }
    }

    struct NoopCredentialManager;
    impl CredentialManager for NoopCredentialManager {
        fn add_set(&self, _set: Arc<dyn CredentialSet>) {}
        fn remove_set(&self, _set: &Arc<dyn CredentialSet>) {}
    }

    struct NoopSaManager;
    impl SaManager for NoopSaManager {
        fn checkout_by_name(&self, _name: &str) -> Option<Arc<dyn IkeSaHandle>> {
            None
        }
        fn enumerate_active_sas(&self) -> Vec<Arc<dyn IkeSaHandle>> {
            Vec::new()
        }
    }

    fn sample_config(name: &str) -> PeerConfig {
        PeerConfig {
            name: ConnName::new(name).unwrap(),
            ike: IkeConfig::default(),
            local_auths: Vec::new(),
            remote_auths: Vec::new(),
            children: vec![ChildConfig {
                name: ConnName::new("ch").unwrap(),
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
        }
    }

    #[test]
    fn install_initiates_started_children_and_registers_backend() {
        let registry = ConfigRegistry::new();
        let credentials = CredentialStore::new();
        let registrar = Arc::new(NoopRegistrar {
            called: AtomicBool::new(false),
        });
        let controller = Arc::new(NoopController {
            initiated: Mutex::new(Vec::new()),
        });

        let adapter = HostAdapter::new(
            registry,
            credentials,
            HostHandles {
                backend_registrar: Some(registrar.clone() as Arc<dyn BackendRegistrar>),
                sa_manager: Some(Arc::new(NoopSaManager)),
                controller: Some(controller.clone() as Arc<dyn Controller>),
                credential_manager: Some(Arc::new(NoopCredentialManager)),
            },
            Box::new(|_, _, _| true),
        );

        adapter.install(sample_config("c1"), Vec::new()).unwrap();

        assert!(registrar.called.load(Ordering::SeqCst));
        assert_eq!(controller.initiated.lock().unwrap().len(), 1);
        assert!(adapter.get_peer_cfg_by_name("c1").is_some());
    }

    #[test]
    fn start_dpd_fails_without_sa_manager_handle() {
        let registry = ConfigRegistry::new();
        let credentials = CredentialStore::new();
        let adapter = HostAdapter::new(
            registry,
            credentials,
            HostHandles {
                backend_registrar: None,
                sa_manager: Some(Arc::new(NoopSaManager)),
                controller: None,
                credential_manager: None,
            },
            Box::new(|_, _, _| true),
        );

        let err = adapter.start_dpd("missing").unwrap_err();
        assert!(matches!(err, ExtsockError::HostApiFailure(_)));
    }
}
