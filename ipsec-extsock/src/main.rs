//! Standalone entry point.
//!
//! The real host daemon is an external process (spec.md §1, §6.3); this
//! binary wires the plugin library to a minimal in-memory stub of that
//! daemon so the control channel can be exercised manually (`socat -
//! UNIX-CONNECT:/tmp/strongswan_extsock.sock`, for instance) without a
//! full IKE engine present.

use std::sync::Arc;

use devolutions_gateway_task::ShutdownHandle;
use ipsec_extsock::error::Result;
use ipsec_extsock::host::{BackendRegistrar, CredentialManager, HostHandles, SaManager};
use ipsec_extsock::{Plugin, PluginDeps};

mod stub_host {
    use std::sync::Arc;

    use ipsec_extsock::credential::CredentialSet;
    use ipsec_extsock::error::Result;
    use ipsec_extsock::host::{Backend, Controller, IkeSaHandle};

    pub struct LoggingRegistrar;
    impl super::BackendRegistrar for LoggingRegistrar {
        fn add_backend(&self, _backend: Arc<dyn Backend>) {
            tracing::info!("backend registered (standalone stub)");
        }
    }

    pub struct LoggingController;
    impl Controller for LoggingController {
        fn initiate(&self, peer_cfg: &Arc<ipsec_extsock::config::PeerConfig>, child_name: &str) -> Result<()> {
            tracing::info!(conn = %peer_cfg.name, child = child_name, "would initiate child SA (standalone stub)");
            Ok(())
        }
        fn terminate_ike(&self, sa_name: &str) -> Result<()> {
            tracing::info!(sa_name, "would terminate IKE SA (standalone stub)");
            Ok(())
        }
    }

    pub struct EmptySaManager;
    impl super::SaManager for EmptySaManager {
        fn checkout_by_name(&self, _name: &str) -> Option<Arc<dyn IkeSaHandle>> {
            None
        }
        fn enumerate_active_sas(&self) -> Vec<Arc<dyn IkeSaHandle>> {
            Vec::new()
        }
    }

    pub struct LoggingCredentialManager;
    impl super::CredentialManager for LoggingCredentialManager {
        fn add_set(&self, _set: Arc<dyn CredentialSet>) {
            tracing::info!("credential set registered (standalone stub)");
        }
        fn remove_set(&self, _set: &Arc<dyn CredentialSet>) {}
    }
}

fn main() -> anyhow::Result<()> {
    let settings = ipsec_extsock::settings::PluginSettings::from_env()?;
    let _logger_guard = devolutions_log::init::<ipsec_extsock::settings::LogConfig>(
        &settings.log_path,
        &settings.log_filter,
        None,
    )?;

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(settings))
}

async fn run(settings: ipsec_extsock::settings::PluginSettings) -> anyhow::Result<()> {
    let deps = PluginDeps {
        host: HostHandles {
            backend_registrar: Some(Arc::new(stub_host::LoggingRegistrar)),
            sa_manager: Some(Arc::new(stub_host::EmptySaManager)),
            controller: Some(Arc::new(stub_host::LoggingController)),
            credential_manager: Some(Arc::new(stub_host::LoggingCredentialManager)),
        },
        identity_matcher: Box::new(|_, _, _| true),
        socket_path: settings.socket_path,
    };

    let mut plugin = Plugin::assemble(deps);
    let (shutdown, signal) = ShutdownHandle::new();
    let channel_task = plugin.spawn(signal);

    tokio::signal::ctrl_c().await?;
    tracing::info!("ctrl-c received, shutting down");
    shutdown.signal();

    let result: Result<()> = channel_task.join().await?;
    plugin.shutdown();
    result?;
    Ok(())
}
