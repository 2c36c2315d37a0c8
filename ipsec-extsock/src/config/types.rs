//! Owned peer-configuration tree (spec §3).
//!
//! Everything here is a plain value type: no trait objects, no shared
//! ownership. [`PeerConfig`] is cheap to deep-clone, which is exactly what
//! the failover controller needs (spec §9: "Failover derivatives are
//! freshly cloned — never aliased").

use smol_str::SmolStr;
use std::fmt;

use crate::error::{ExtsockError, Result};

/// Maximum length, in characters, for a connection name and for any
/// [`Identity`] value (spec §3, and the `Identity strings of length 65`
/// boundary case in spec §8).
pub const MAX_NAME_LEN: usize = 64;

/// Generic cap on string-valued JSON fields (spec §4.1).
pub const MAX_FIELD_LEN: usize = 1024;

/// A validated connection name: 1–64 characters from `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnName(SmolStr);

impl ConnName {
    pub fn new(raw: &str) -> Result<Self> {
        if raw.is_empty() || raw.chars().count() > MAX_NAME_LEN {
            return Err(ExtsockError::config_invalid(format!(
                "connection name must be 1-{MAX_NAME_LEN} characters, got {}",
                raw.chars().count()
            )));
        }
        if !raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(ExtsockError::config_invalid(format!(
                "connection name '{raw}' contains characters outside [A-Za-z0-9_-]"
            )));
        }
        Ok(Self(SmolStr::new(raw)))
    }

    /// Derive the name of a failover derivative: `"<base>-failover-<next_addr>"`.
    ///
    /// The derived name is not re-validated against the charset rule
    /// because IPv4/IPv6 literals always satisfy it; IPv6 addresses with
    /// `:` would not, but `next_addr` always comes from a parsed,
    /// comma-split address list which rejects such characters upstream.
    pub fn failover_derivative(&self, next_addr: &str) -> Self {
        Self(SmolStr::new(format!("{}-failover-{next_addr}", self.0)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::borrow::Borrow<str> for ConnName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A validated identity string (distinguished name, FQDN, email-style ID,
/// IP literal, or the wildcard `%any`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    DistinguishedName(SmolStr),
    Fqdn(SmolStr),
    Email(SmolStr),
    Ip(SmolStr),
    Any,
}

impl Identity {
    /// Parse a raw identity string, inferring its kind from shape.
    ///
    /// This is a best-effort heuristic classification; the authoritative
    /// matching predicate for SA negotiation lives in the host daemon
    /// (spec §4.2 `enumerate`), this is only used for display/storage.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.chars().count() > MAX_NAME_LEN {
            return Err(ExtsockError::config_invalid(format!(
                "identity '{raw}' exceeds {MAX_NAME_LEN} characters"
            )));
        }

        if raw == "%any" {
            return Ok(Self::Any);
        }
        if raw.starts_with("C=") || raw.starts_with("CN=") || raw.contains(',') {
            return Ok(Self::DistinguishedName(SmolStr::new(raw)));
        }
        if raw.contains('@') {
            return Ok(Self::Email(SmolStr::new(raw)));
        }
        if raw.parse::<std::net::IpAddr>().is_ok() {
            return Ok(Self::Ip(SmolStr::new(raw)));
        }
        Ok(Self::Fqdn(SmolStr::new(raw)))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DistinguishedName(s) | Self::Fqdn(s) | Self::Email(s) | Self::Ip(s) => f.write_str(s),
            Self::Any => f.write_str("%any"),
        }
    }
}

/// IKE protocol major version to negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IkeVersion {
    #[default]
    Any,
    V1,
    V2,
}

/// A comma-joined address list, e.g. `"10.0.0.2,10.0.0.3"` or `"%any"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvString(pub SmolStr);

impl CsvString {
    pub fn new(addrs: &[String]) -> Self {
        Self(SmolStr::new(addrs.join(",")))
    }

    /// Ordered, whitespace-trimmed address list.
    pub fn addresses(&self) -> Vec<&str> {
        self.0.split(',').map(str::trim).filter(|s| !s.is_empty()).collect()
    }

    /// A connection is failover-eligible when `remote_addrs` names at
    /// least two addresses (spec §3).
    pub fn is_multi_segw(&self) -> bool {
        self.addresses().len() >= 2
    }
}

impl fmt::Display for CsvString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An opaque ordered transform tuple, parsed verbatim by the IKE engine.
///
/// The plugin never interprets the contents; it only ever passes the
/// string through, or substitutes one of the two built-in defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal(pub SmolStr);

impl Proposal {
    pub fn parse(raw: &str) -> Self {
        Self(SmolStr::new(raw))
    }

    /// Default AEAD proposal, inserted first when a proposal list is empty.
    pub fn default_aead() -> Self {
        Self(SmolStr::new("aes256gcm16-prfsha384-ecp384"))
    }

    /// Default classical (non-AEAD) proposal, inserted second.
    pub fn default_classic() -> Self {
        Self(SmolStr::new("aes256-sha384-modp4096"))
    }

    /// Default ESP proposals, used when `esp_proposals` is empty
    /// (spec §3 invariant 2: "the child inherits default proposals
    /// provided by the IKE engine").
    pub fn default_esp() -> Vec<Self> {
        vec![Self(SmolStr::new("aes256gcm16")), Self(SmolStr::new("aes256-sha256"))]
    }
}

/// Authentication class for one side of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthClass {
    Psk,
    Pubkey,
    Eap,
    Any,
}

/// Reference to a credential file on disk; contents are opaque to this
/// crate and handed to the credential-loader interface (spec §1, out of
/// scope: "Certificate/key file parsing … treated as a credential-loader
/// interface").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertRef(pub camino::Utf8PathBuf);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub class: AuthClass,
    pub identity: Identity,
    pub ca_cert: Option<CertRef>,
    pub ocsp: bool,
    pub crl: bool,
}

/// IPsec encapsulation mode for a child SA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildMode {
    Tunnel,
    Transport,
}

/// What to do with a child SA at load time, on DPD, or on close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartAction {
    #[default]
    None,
    Trap,
    Start,
}

/// Action to take on dead-peer detection or connection close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChildAction {
    #[default]
    None,
    Trap,
    Restart,
}

/// A predicate over packet 5-tuples: a CIDR with optional protocol and
/// port range, or the dynamic wildcard `0.0.0.0/0[any]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSelector {
    pub cidr: SmolStr,
    pub protocol: Option<u8>,
    pub port_range: (u16, u16),
}

impl TrafficSelector {
    /// The dynamic wildcard selector inserted when a traffic-selector
    /// list is empty (spec §3 invariant 3).
    pub fn dynamic_wildcard() -> Self {
        Self {
            cidr: SmolStr::new("0.0.0.0/0"),
            protocol: None,
            port_range: (0, 65535),
        }
    }

    /// Parse and validate a CIDR traffic selector (spec §7: a malformed
    /// CIDR string is a `ConfigInvalid` error, not silently accepted).
    pub fn from_cidr(cidr: &str) -> Result<Self> {
        cidr.parse::<ipnetwork::IpNetwork>()
            .map_err(|_| ExtsockError::config_invalid(format!("'{cidr}' is not a valid CIDR")))?;
        Ok(Self {
            cidr: SmolStr::new(cidr),
            protocol: None,
            port_range: (0, 65535),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifetime {
    pub rekey_time: u64,
    pub life_time: u64,
}

impl Default for Lifetime {
    fn default() -> Self {
        Self {
            rekey_time: 3600,
            life_time: 7200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildConfig {
    pub name: ConnName,
    pub mode: ChildMode,
    pub start_action: StartAction,
    pub dpd_action: ChildAction,
    pub close_action: ChildAction,
    pub lifetime: Lifetime,
    pub local_ts: Vec<TrafficSelector>,
    pub remote_ts: Vec<TrafficSelector>,
    pub esp_proposals: Vec<Proposal>,
}

/// How strongly a peer config enforces "one SA per identity pair".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UniquePolicy {
    #[default]
    Replace,
    Keep,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerParams {
    pub unique: UniquePolicy,
    pub keyingtries: u32,
    pub rekey_time: u64,
    pub reauth_time: u64,
    pub over_time: u64,
    pub jitter_time: u64,
    pub dpd_delay: u64,
    pub dpd_timeout: u64,
}

impl Default for PeerParams {
    fn default() -> Self {
        Self {
            unique: UniquePolicy::default(),
            keyingtries: 0,
            rekey_time: 3600,
            reauth_time: 0,
            over_time: 600,
            jitter_time: 600,
            dpd_delay: 30,
            dpd_timeout: 150,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IkeConfig {
    pub version: IkeVersion,
    pub local_addrs: CsvString,
    pub remote_addrs: CsvString,
    pub local_port: u16,
    pub remote_port: u16,
    pub proposals: Vec<Proposal>,
    pub mobike: bool,
    pub fragmentation: bool,
    pub dscp: u8,
}

impl Default for IkeConfig {
    fn default() -> Self {
        Self {
            version: IkeVersion::Any,
            local_addrs: CsvString(SmolStr::new("%any")),
            remote_addrs: CsvString(SmolStr::new("%any")),
            local_port: 500,
            remote_port: 500,
            proposals: vec![Proposal::default_aead(), Proposal::default_classic()],
            // Open Question 2 (spec §9): defaults to disabled.
            mobike: false,
            fragmentation: false,
            dscp: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub name: ConnName,
    pub ike: IkeConfig,
    pub local_auths: Vec<AuthConfig>,
    pub remote_auths: Vec<AuthConfig>,
    pub children: Vec<ChildConfig>,
    pub peer_params: PeerParams,
}

impl PeerConfig {
    /// True when `ike.remote_addrs` names at least two addresses,
    /// i.e. this connection is a candidate for SEGW failover.
    pub fn is_multi_segw(&self) -> bool {
        self.ike.remote_addrs.is_multi_segw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_name_accepts_valid_charset() {
        assert!(ConnName::new("c1").is_ok());
        assert!(ConnName::new("my-conn_1").is_ok());
    }

    #[test]
    fn conn_name_rejects_bad_charset() {
        assert!(ConnName::new("bad name").is_err());
        assert!(ConnName::new("").is_err());
    }

    #[test]
    fn conn_name_rejects_too_long() {
        let name: String = "a".repeat(65);
        assert!(ConnName::new(&name).is_err());
        let name: String = "a".repeat(64);
        assert!(ConnName::new(&name).is_ok());
    }

    #[test]
    fn identity_rejects_too_long() {
        let raw: String = "a".repeat(65);
        assert!(Identity::parse(&raw).is_err());
    }

    #[test]
    fn traffic_selector_rejects_malformed_cidr() {
        assert!(TrafficSelector::from_cidr("not-a-cidr").is_err());
        assert!(TrafficSelector::from_cidr("10.0.0.0/24").is_ok());
    }

    #[test]
    fn csv_string_multi_segw() {
        let csv = CsvString::new(&["10.0.0.2".to_owned(), "10.0.0.3".to_owned()]);
        assert!(csv.is_multi_segw());
        assert_eq!(csv.addresses(), vec!["10.0.0.2", "10.0.0.3"]);

        let single = CsvString::new(&["10.0.0.2".to_owned()]);
        assert!(!single.is_multi_segw());
    }

    #[test]
    fn failover_derivative_name() {
        let name = ConnName::new("c1").unwrap();
        let derived = name.failover_derivative("10.0.0.3");
        assert_eq!(derived.as_str(), "c1-failover-10.0.0.3");
    }
}
