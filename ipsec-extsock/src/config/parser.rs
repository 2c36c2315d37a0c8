//! C1 — JSON Config Parser.
//!
//! Accepts either the multi-form `{"connections": [...]}` document or a
//! bare single-connection object (legacy form), and produces an owned
//! [`PeerConfig`] tree per connection. The parser is total: every
//! recognized-but-invalid field yields a specific [`ExtsockError`] variant,
//! never a panic.

use secrecy::SecretString;
use serde_json::Value;
use smol_str::SmolStr;

use super::types::{
    AuthClass, AuthConfig, CertRef, ChildAction, ChildConfig, ChildMode, ConnName, CsvString, Identity, IkeConfig,
    IkeVersion, Lifetime, PeerConfig, PeerParams, Proposal, StartAction, TrafficSelector, UniquePolicy, MAX_FIELD_LEN,
};
use crate::credential::PendingCredential;
use crate::error::{ExtsockError, Result};

/// A single parsed connection plus the credentials it carries, pulled out
/// of the JSON so the caller can hand them to the credential store (C4)
/// without keeping PSK bytes inside the [`PeerConfig`] tree itself.
pub struct ParsedConnection {
    pub config: PeerConfig,
    pub credentials: Vec<PendingCredential>,
}

/// Parse a JSON document into one or more connections.
///
/// Either all connections in the document are returned, or an error is
/// returned and nothing is produced (spec §7: "Parser errors abort the
/// current `APPLY_CONFIG` without partial commit").
pub fn parse_config_json(input: &str) -> Result<Vec<ParsedConnection>> {
    let value: Value = serde_json::from_str(input)?;

    let peer_objects: Vec<&Value> = match value.get("connections") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(_) => {
            return Err(ExtsockError::config_invalid("'connections' must be an array"));
        }
        None => vec![&value],
    };

    if peer_objects.is_empty() {
        return Err(ExtsockError::config_invalid("no connections in document"));
    }

    peer_objects.into_iter().map(parse_peer_object).collect()
}

fn check_len(field: &str, s: &str) -> Result<()> {
    if s.len() > MAX_FIELD_LEN {
        return Err(ExtsockError::config_invalid(format!(
            "field '{field}' exceeds {MAX_FIELD_LEN} bytes"
        )));
    }
    Ok(())
}

fn as_str_array(v: Option<&Value>, field: &str) -> Result<Vec<String>> {
    match v {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                let s = item
                    .as_str()
                    .ok_or_else(|| ExtsockError::config_invalid(format!("'{field}' must be an array of strings")))?;
                check_len(field, s)?;
                Ok(s.to_owned())
            })
            .collect(),
        Some(_) => Err(ExtsockError::config_invalid(format!("'{field}' must be an array"))),
    }
}

fn parse_peer_object(v: &Value) -> Result<ParsedConnection> {
    if !v.is_object() {
        return Err(ExtsockError::config_invalid("connection entry must be a JSON object"));
    }

    for key in v.as_object().into_iter().flat_map(|o| o.keys()) {
        if !RECOGNIZED_TOP_LEVEL_KEYS.contains(&key.as_str()) {
            tracing::debug!(key, "ignoring unknown top-level configuration key");
        }
    }

    let name_raw = v
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ExtsockError::config_invalid("'name' is required"))?;
    check_len("name", name_raw)?;
    let name = ConnName::new(name_raw)?;

    let mobike = v.get("mobike").and_then(Value::as_bool).unwrap_or(false);

    let mut ike = parse_ike_config(v.get("ike"))?;
    ike.mobike = mobike;

    let mut peer_params = PeerParams::default();
    if let Some(rekey) = v.pointer("/ike/lifetime/rekey_time").and_then(Value::as_u64) {
        peer_params.rekey_time = rekey;
    }

    let mut credentials = Vec::new();

    let local_auths = parse_auth_side(v.get("local_auth"), true, &mut credentials)?;
    let remote_auths = parse_auth_side(v.get("remote_auth"), false, &mut credentials)?;

    let children = match v.get("children") {
        Some(Value::Array(items)) => items.iter().map(parse_child_config).collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(ExtsockError::config_invalid("'children' must be an array")),
        None => Vec::new(),
    };

    let config = PeerConfig {
        name,
        ike,
        local_auths,
        remote_auths,
        children,
        peer_params,
    };

    Ok(ParsedConnection { config, credentials })
}

const RECOGNIZED_TOP_LEVEL_KEYS: &[&str] = &["name", "ike", "mobike", "local_auth", "remote_auth", "children"];

fn parse_ike_config(v: Option<&Value>) -> Result<IkeConfig> {
    let mut cfg = IkeConfig::default();

    let Some(v) = v else {
        return Ok(cfg);
    };

    if let Some(version) = v.get("version").and_then(Value::as_u64) {
        cfg.version = match version {
            0 => IkeVersion::Any,
            1 => IkeVersion::V1,
            2 => IkeVersion::V2,
            other => return Err(ExtsockError::config_invalid(format!("unsupported ike.version: {other}"))),
        };
    }

    let local_addrs = as_str_array(v.get("local_addrs"), "ike.local_addrs")?;
    if !local_addrs.is_empty() {
        cfg.local_addrs = CsvString::new(&local_addrs);
    }

    let remote_addrs = as_str_array(v.get("remote_addrs"), "ike.remote_addrs")?;
    if !remote_addrs.is_empty() {
        cfg.remote_addrs = CsvString::new(&remote_addrs);
    }

    let proposals = as_str_array(v.get("proposals"), "ike.proposals")?;
    cfg.proposals = if proposals.is_empty() {
        // Invariant 4 (spec §3): default-AEAD then default-classical.
        vec![Proposal::default_aead(), Proposal::default_classic()]
    } else {
        proposals.iter().map(|s| Proposal::parse(s)).collect()
    };

    if let Some(frag) = v.get("fragmentation").and_then(Value::as_bool) {
        cfg.fragmentation = frag;
    }
    if let Some(dscp) = v.get("dscp").and_then(Value::as_u64) {
        cfg.dscp = u8::try_from(dscp).map_err(|_| ExtsockError::config_invalid("dscp must fit in a u8"))?;
    }

    Ok(cfg)
}

fn parse_auth_side(
    v: Option<&Value>,
    is_local: bool,
    credentials: &mut Vec<PendingCredential>,
) -> Result<Vec<AuthConfig>> {
    let Some(v) = v else {
        return Ok(Vec::new());
    };

    let class_raw = v
        .get("auth")
        .and_then(Value::as_str)
        .ok_or_else(|| ExtsockError::config_invalid("'auth' class is required"))?;

    let class = match class_raw {
        "psk" => AuthClass::Psk,
        "pubkey" | "cert" => AuthClass::Pubkey,
        "eap" => AuthClass::Eap,
        other => return Err(ExtsockError::config_invalid(format!("unknown auth class '{other}'"))),
    };

    let cert_path = v.get("cert").and_then(Value::as_str);

    let identity = match v.get("id").and_then(Value::as_str) {
        Some(id) => {
            check_len("id", id)?;
            Identity::parse(id)?
        }
        // "`id` missing under `"cert"` auth ⇒ use certificate subject as identity" (spec §4.1).
        // Subject extraction happens in the credential-loader interface (out of scope, spec §1);
        // here we record a placeholder the adapter resolves once the certificate is loaded.
        None if class_raw == "cert" => {
            let path = cert_path.ok_or_else(|| ExtsockError::config_invalid("'cert' auth requires 'cert' or 'id'"))?;
            Identity::DistinguishedName(SmolStr::new(format!("subject-of:{path}")))
        }
        None => Identity::Any,
    };

    if let Some(secret) = v.get("secret").and_then(Value::as_str) {
        check_len("secret", secret)?;
        credentials.push(PendingCredential::Psk {
            identity: identity.clone(),
            secret: SecretString::from(secret.to_owned()),
        });
        // The caller owns the only copy from here on; the JSON `Value` is dropped
        // by the parser's caller once `parse_config_json` returns.
    }

    // Private key loading is local-only (spec §4.1: `.private_key` is
    // documented under `local_auth.*`; the original parser gates this the
    // same way since only the local side ever signs with it).
    if is_local {
        if let Some(path) = v.get("private_key").and_then(Value::as_str) {
            check_len("private_key", path)?;
            credentials.push(PendingCredential::PrivateKeyFile {
                identity: identity.clone(),
                path: camino::Utf8PathBuf::from(path),
            });
        }
    }

    let ca_cert = if let Some(path) = v.get("ca_cert").and_then(Value::as_str) {
        check_len("ca_cert", path)?;
        credentials.push(PendingCredential::CaCertFile {
            path: camino::Utf8PathBuf::from(path),
        });
        Some(CertRef(camino::Utf8PathBuf::from(path)))
    } else {
        None
    };

    if let Some(path) = cert_path {
        check_len("cert", path)?;
        credentials.push(PendingCredential::CertFile {
            identity: identity.clone(),
            path: camino::Utf8PathBuf::from(path),
        });
    }

    // OCSP/CRL toggles are local-only the same way (spec §4.1: `.enable_ocsp`,
    // `.enable_crl` documented under `local_auth.*`); the remote side always
    // gets the defaults.
    let (ocsp, crl) = if is_local {
        (
            v.get("enable_ocsp").and_then(Value::as_bool).unwrap_or(true),
            v.get("enable_crl").and_then(Value::as_bool).unwrap_or(true),
        )
    } else {
        (true, true)
    };

    Ok(vec![AuthConfig {
        class,
        identity,
        ca_cert,
        ocsp,
        crl,
    }])
}

fn parse_child_config(v: &Value) -> Result<ChildConfig> {
    let name_raw = v
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ExtsockError::config_invalid("child 'name' is required"))?;
    check_len("children[].name", name_raw)?;
    let name = ConnName::new(name_raw)?;

    let start_action = match v.get("start_action").and_then(Value::as_str).unwrap_or("none") {
        "trap" | "clear" | "hold" => StartAction::Trap,
        "start" | "restart" => StartAction::Start,
        "none" => StartAction::None,
        other => return Err(ExtsockError::config_invalid(format!("unknown start_action '{other}'"))),
    };

    let mode = match v.get("mode").and_then(Value::as_str).unwrap_or("tunnel") {
        "tunnel" => ChildMode::Tunnel,
        "transport" => ChildMode::Transport,
        other => return Err(ExtsockError::config_invalid(format!("unknown child mode '{other}'"))),
    };

    let local_ts = parse_ts_list(v.get("local_ts"), "local_ts")?;
    let remote_ts = parse_ts_list(v.get("remote_ts"), "remote_ts")?;

    let esp_raw = as_str_array(v.get("esp_proposals"), "esp_proposals")?;
    let esp_proposals = if esp_raw.is_empty() {
        Proposal::default_esp()
    } else {
        esp_raw.iter().map(|s| Proposal::parse(s)).collect()
    };

    let mut lifetime = Lifetime::default();
    if let Some(rekey) = v.pointer("/lifetime/rekey_time").and_then(Value::as_u64) {
        lifetime.rekey_time = rekey;
    }
    if let Some(life) = v.pointer("/lifetime/life_time").and_then(Value::as_u64) {
        lifetime.life_time = life;
    }

    Ok(ChildConfig {
        name,
        mode,
        start_action,
        dpd_action: ChildAction::default(),
        close_action: ChildAction::default(),
        lifetime,
        local_ts,
        remote_ts,
        esp_proposals,
    })
}

fn parse_ts_list(v: Option<&Value>, field: &str) -> Result<Vec<TrafficSelector>> {
    let raw = as_str_array(v, field)?;
    if raw.is_empty() {
        // Invariant 3 (spec §3): empty list ⇒ one dynamic wildcard selector.
        return Ok(vec![TrafficSelector::dynamic_wildcard()]);
    }
    raw.iter().map(|cidr| TrafficSelector::from_cidr(cidr)).collect()
}

// `unique` has no JSON knob in the recognized-options table; it stays at
// its default (`UniquePolicy::Replace`) unless a future field is added.
#[allow(dead_code)]
fn unused_unique_policy_reference() -> UniquePolicy {
    UniquePolicy::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_single_form() {
        let json = r#"{"name":"c1","ike":{"local_addrs":["10.0.0.1"],"remote_addrs":["10.0.0.2"]}}"#;
        let parsed = parse_config_json(json).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].config.name.as_str(), "c1");
    }

    #[test]
    fn multi_form_with_connections_array() {
        let json = r#"{"connections":[{"name":"c1"},{"name":"c2"}]}"#;
        let parsed = parse_config_json(json).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn malformed_json_is_json_parse_error() {
        let err = parse_config_json(r#"{"name":"#).unwrap_err();
        assert!(matches!(err, ExtsockError::JsonParse(_)));
    }

    #[test]
    fn missing_name_is_config_invalid() {
        let err = parse_config_json(r#"{"ike":{}}"#).unwrap_err();
        assert!(matches!(err, ExtsockError::ConfigInvalid(_)));
    }

    #[test]
    fn empty_proposals_get_defaults() {
        let json = r#"{"name":"c1","ike":{"proposals":[]}}"#;
        let parsed = parse_config_json(json).unwrap();
        assert_eq!(
            parsed[0].config.ike.proposals,
            vec![Proposal::default_aead(), Proposal::default_classic()]
        );
    }

    #[test]
    fn empty_ts_gets_dynamic_wildcard() {
        let json = r#"{"name":"c1","children":[{"name":"ch"}]}"#;
        let parsed = parse_config_json(json).unwrap();
        let child = &parsed[0].config.children[0];
        assert_eq!(child.local_ts, vec![TrafficSelector::dynamic_wildcard()]);
        assert_eq!(child.remote_ts, vec![TrafficSelector::dynamic_wildcard()]);
    }

    #[test]
    fn multi_segw_remote_addrs() {
        let json = r#"{"name":"c1","ike":{"remote_addrs":["10.0.0.2","10.0.0.3"]}}"#;
        let parsed = parse_config_json(json).unwrap();
        assert!(parsed[0].config.is_multi_segw());
    }

    #[test]
    fn psk_secret_extracted_as_pending_credential() {
        let json = r#"{"name":"c1","local_auth":{"auth":"psk","id":"a","secret":"S3cr3t"}}"#;
        let parsed = parse_config_json(json).unwrap();
        assert_eq!(parsed[0].credentials.len(), 1);
        assert!(matches!(parsed[0].credentials[0], PendingCredential::Psk { .. }));
        // The secret never lands in the typed config tree.
        assert_eq!(parsed[0].config.local_auths[0].class, AuthClass::Psk);
    }

    #[test]
    fn cert_auth_without_id_uses_subject_placeholder() {
        let json = r#"{"name":"c1","local_auth":{"auth":"cert","cert":"/etc/ipsec.d/certs/me.pem"}}"#;
        let parsed = parse_config_json(json).unwrap();
        match &parsed[0].config.local_auths[0].identity {
            Identity::DistinguishedName(s) => assert!(s.starts_with("subject-of:")),
            other => panic!("unexpected identity: {other:?}"),
        }
    }

    #[test]
    fn oversized_field_is_rejected() {
        let secret = "a".repeat(MAX_FIELD_LEN + 1);
        let json = format!(r#"{{"name":"c1","local_auth":{{"auth":"psk","secret":"{secret}"}}}}"#);
        let err = parse_config_json(&json).unwrap_err();
        assert!(matches!(err, ExtsockError::ConfigInvalid(_)));
    }

    #[test]
    fn malformed_cidr_is_config_invalid() {
        let json = r#"{"name":"c1","children":[{"name":"ch","local_ts":["not-a-cidr"]}]}"#;
        let err = parse_config_json(json).unwrap_err();
        assert!(matches!(err, ExtsockError::ConfigInvalid(_)));
    }

    #[test]
    fn private_key_is_only_extracted_for_local_auth() {
        let json = r#"{
            "name":"c1",
            "local_auth":{"auth":"cert","cert":"/c/local.pem","private_key":"/c/local.key"},
            "remote_auth":{"auth":"cert","cert":"/c/remote.pem","private_key":"/c/remote.key"}
        }"#;
        let parsed = parse_config_json(json).unwrap();
        let has_private_key = |path: &str| {
            parsed[0]
                .credentials
                .iter()
                .any(|c| matches!(c, PendingCredential::PrivateKeyFile { path: p, .. } if p.as_str() == path))
        };
        assert!(has_private_key("/c/local.key"));
        assert!(!has_private_key("/c/remote.key"));
    }
}
