//! C4 — Credential Store.
//!
//! A thin in-memory façade over PSKs, private keys, certificates, and CA
//! certificates loaded from configuration. It holds no policy of its own:
//! the host daemon's credential manager decides when and how to use what
//! is stored here (spec §4.4).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use secrecy::{ExposeSecret as _, SecretString};

use crate::config::Identity;

/// A credential extracted by the JSON parser (C1) but not yet installed.
///
/// Kept out of [`crate::config::PeerConfig`] so the typed configuration
/// tree never carries secret bytes.
#[derive(Clone)]
pub enum PendingCredential {
    Psk { identity: Identity, secret: SecretString },
    PrivateKeyFile { identity: Identity, path: camino::Utf8PathBuf },
    CertFile { identity: Identity, path: camino::Utf8PathBuf },
    CaCertFile { path: camino::Utf8PathBuf },
}

impl std::fmt::Debug for PendingCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Psk { identity, .. } => f.debug_struct("Psk").field("identity", identity).finish_non_exhaustive(),
            Self::PrivateKeyFile { identity, path } => f
                .debug_struct("PrivateKeyFile")
                .field("identity", identity)
                .field("path", path)
                .finish(),
            Self::CertFile { identity, path } => {
                f.debug_struct("CertFile").field("identity", identity).field("path", path).finish()
            }
            Self::CaCertFile { path } => f.debug_struct("CaCertFile").field("path", path).finish(),
        }
    }
}

/// Capability exposed to the host daemon's credential manager (spec §6.3
/// item 5: `add_set`/`remove_set`). The host daemon queries this interface
/// during authentication; this crate never calls into it itself.
pub trait CredentialSet: Send + Sync {
    fn find_psk(&self, identity: &Identity) -> Option<SecretString>;
    fn find_private_key(&self, identity: &Identity) -> Option<camino::Utf8PathBuf>;
    fn find_cert(&self, identity: &Identity) -> Option<camino::Utf8PathBuf>;
    fn ca_certs(&self) -> Vec<camino::Utf8PathBuf>;
}

#[derive(Default)]
struct Inner {
    psks: HashMap<Identity, SecretString>,
    private_keys: HashMap<Identity, camino::Utf8PathBuf>,
    certs: HashMap<Identity, camino::Utf8PathBuf>,
    ca_certs: Vec<camino::Utf8PathBuf>,
}

pub struct CredentialStore {
    inner: Mutex<Inner>,
}

impl CredentialStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Install a batch of credentials extracted by the parser (C1). Any
    /// PSK bytes handed in here are the last copy outside this store: the
    /// JSON parse buffer they came from is dropped by the caller
    /// immediately after this call returns (spec §4.1: "PSK `secret` is
    /// copied into C4 and then zeroed from the parse buffer").
    pub fn install(&self, credentials: Vec<PendingCredential>) {
        let mut inner = self.inner.lock();
        for credential in credentials {
            match credential {
                PendingCredential::Psk { identity, secret } => {
                    tracing::debug!(%identity, "installing PSK credential");
                    inner.psks.insert(identity, secret);
                }
                PendingCredential::PrivateKeyFile { identity, path } => {
                    inner.private_keys.insert(identity, path);
                }
                PendingCredential::CertFile { identity, path } => {
                    inner.certs.insert(identity, path);
                }
                PendingCredential::CaCertFile { path } => {
                    inner.ca_certs.push(path);
                }
            }
        }
    }

    /// Remove every credential associated with `identity`. Called when a
    /// connection is removed (spec §4.4 implies C3 coordinates this via
    /// `remove`).
    pub fn remove_identity(&self, identity: &Identity) {
        let mut inner = self.inner.lock();
        inner.psks.remove(identity);
        inner.private_keys.remove(identity);
        inner.certs.remove(identity);
    }

    #[cfg(test)]
    fn psk_len(&self, identity: &Identity) -> Option<usize> {
        self.inner.lock().psks.get(identity).map(|s| s.expose_secret().len())
    }
}

impl CredentialSet for CredentialStore {
    fn find_psk(&self, identity: &Identity) -> Option<SecretString> {
        self.inner.lock().psks.get(identity).cloned()
    }

    fn find_private_key(&self, identity: &Identity) -> Option<camino::Utf8PathBuf> {
        self.inner.lock().private_keys.get(identity).cloned()
    }

    fn find_cert(&self, identity: &Identity) -> Option<camino::Utf8PathBuf> {
        self.inner.lock().certs.get(identity).cloned()
    }

    fn ca_certs(&self) -> Vec<camino::Utf8PathBuf> {
        self.inner.lock().ca_certs.clone()
    }
}
