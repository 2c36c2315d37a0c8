//! External control-plane plugin for an IKE/IPsec host daemon.
//!
//! Ingests JSON connection definitions over a local control socket,
//! installs them into the daemon's config registry, republishes SA
//! lifecycle events, and drives SEGW failover for multi-gateway
//! connections. See the module docs on [`channel`], [`command`],
//! [`config`], [`credential`], [`events`], [`failover`], [`host`], and
//! [`registry`] for the responsibilities each one owns.

pub mod channel;
pub mod command;
pub mod config;
pub mod credential;
pub mod error;
pub mod events;
pub mod failover;
pub mod host;
pub mod registry;
pub mod settings;

use std::sync::Arc;

use camino::Utf8PathBuf;
use devolutions_gateway_task::{ChildTask, ShutdownSignal};

use channel::{ControlChannel, DEFAULT_SOCKET_PATH};
use command::CommandRouter;
use credential::{CredentialSet, CredentialStore};
use events::EventListener;
use failover::FailoverController;
use host::{CredentialManager, HostAdapter, HostHandles};
use registry::{ConfigRegistry, IdentityMatchFn};

/// Everything needed to assemble the plugin: the host-daemon capability
/// handles and an identity-matching predicate supplied by the host.
pub struct PluginDeps {
    pub host: HostHandles,
    pub identity_matcher: Box<IdentityMatchFn<'static>>,
    pub socket_path: Utf8PathBuf,
}

impl Default for PluginDeps {
    fn default() -> Self {
        Self {
            host: HostHandles {
                backend_registrar: None,
                sa_manager: None,
                controller: None,
                credential_manager: None,
            },
            identity_matcher: Box::new(|_, _, _| true),
            socket_path: Utf8PathBuf::from(DEFAULT_SOCKET_PATH),
        }
    }
}

/// The fully wired-up plugin: everything needed to run the control
/// channel task and dispatch host-daemon callbacks into it.
pub struct Plugin {
    pub host_adapter: Arc<HostAdapter>,
    pub event_listener: Arc<EventListener>,
    pub failover: Arc<FailoverController>,
    channel: Option<ControlChannel>,
    credential_manager: Option<Arc<dyn CredentialManager>>,
}

impl Plugin {
    pub fn assemble(deps: PluginDeps) -> Self {
        let registry = ConfigRegistry::new();
        let credentials = CredentialStore::new();
        let credential_manager = deps.host.credential_manager.clone();
        let host_adapter = HostAdapter::new(registry, credentials, deps.host, deps.identity_matcher);

        // Register the credential store with the host daemon's credential
        // manager at plugin start (spec §4.4); deregistered in `shutdown`.
        if let Some(credential_manager) = &credential_manager {
            credential_manager.add_set(Arc::clone(host_adapter.credentials()) as Arc<dyn CredentialSet>);
        }

        let failover = FailoverController::new(Arc::clone(&host_adapter));
        let router = CommandRouter::new(Arc::clone(&host_adapter));
        let (channel, sink) = ControlChannel::new(deps.socket_path, router);
        let event_listener = EventListener::new(Arc::clone(&host_adapter), Arc::clone(&failover), Arc::new(sink));

        Self {
            host_adapter,
            event_listener,
            failover,
            channel: Some(channel),
            credential_manager,
        }
    }

    /// Spawn the control channel worker. Can only be called once; the
    /// task runs until `shutdown_signal` fires.
    pub fn spawn(&mut self, shutdown_signal: ShutdownSignal) -> ChildTask<crate::error::Result<()>> {
        let channel = self.channel.take().expect("spawn() called more than once");
        devolutions_gateway_task::spawn_task(channel, shutdown_signal)
    }

    /// Deregister the credential store from the host daemon's credential
    /// manager (spec §4.4: "deregistered on shutdown"). Call once the
    /// control channel task has been signalled to stop.
    pub fn shutdown(&self) {
        if let Some(credential_manager) = &self.credential_manager {
            let set = Arc::clone(self.host_adapter.credentials()) as Arc<dyn CredentialSet>;
            credential_manager.remove_set(&set);
        }
    }
}
