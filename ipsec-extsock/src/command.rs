//! C8 — Command Router.
//!
//! Parses the one-line verb protocol received over the control channel
//! (spec §4.8) and dispatches to the host adapter (C3). Recognized verbs
//! are `APPLY_CONFIG `, `START_DPD `, and `REMOVE_CONFIG `, each followed
//! by exactly one space and an argument.

use std::sync::Arc;

use crate::channel::CommandHandler;
use crate::config::parse_config_json;
use crate::error::{ExtsockError, Result};
use crate::host::HostAdapter;

const APPLY_CONFIG: &str = "APPLY_CONFIG ";
const START_DPD: &str = "START_DPD ";
const REMOVE_CONFIG: &str = "REMOVE_CONFIG ";

/// The parsed form of one command line, before dispatch.
#[derive(Debug, PartialEq, Eq)]
enum Verb<'a> {
    ApplyConfig(&'a str),
    StartDpd(&'a str),
    RemoveConfig(&'a str),
}

fn parse_verb(line: &str) -> Result<Verb<'_>> {
    if let Some(rest) = line.strip_prefix(APPLY_CONFIG) {
        return Ok(Verb::ApplyConfig(rest));
    }
    if let Some(rest) = line.strip_prefix(START_DPD) {
        return Ok(Verb::StartDpd(rest));
    }
    if let Some(rest) = line.strip_prefix(REMOVE_CONFIG) {
        return Ok(Verb::RemoveConfig(rest));
    }
    Err(ExtsockError::invalid_command(format!("unrecognized command: '{line}'")))
}

/// Routes parsed commands to the host-daemon adapter. Any error is
/// returned to the caller (who turns it into an `ERR` ack over the
/// control channel, spec §4.8) and otherwise does not interrupt the
/// plugin — a bad command never brings anything else down.
pub struct CommandRouter {
    host: Arc<HostAdapter>,
}

impl CommandRouter {
    pub fn new(host: Arc<HostAdapter>) -> Arc<Self> {
        Arc::new(Self { host })
    }
}

impl CommandHandler for CommandRouter {
    fn handle(&self, line: &str) -> Result<()> {
        match parse_verb(line)? {
            Verb::ApplyConfig(json) => {
                // Spec §7: parser errors abort the whole APPLY_CONFIG with no
                // partial commit, so every connection is parsed up front
                // before any of them is installed.
                let connections = parse_config_json(json)?;
                for parsed in connections {
                    self.host.install(parsed.config, parsed.credentials)?;
                }
                Ok(())
            }
            Verb::StartDpd(ike_name) => self.host.start_dpd(ike_name.trim()),
            Verb::RemoveConfig(name) => {
                self.host.remove(name.trim())?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_verbs() {
        assert_eq!(parse_verb("APPLY_CONFIG {}").unwrap(), Verb::ApplyConfig("{}"));
        assert_eq!(parse_verb("START_DPD conn1").unwrap(), Verb::StartDpd("conn1"));
        assert_eq!(parse_verb("REMOVE_CONFIG conn1").unwrap(), Verb::RemoveConfig("conn1"));
    }

    #[test]
    fn rejects_unknown_verb() {
        let error = parse_verb("PING").unwrap_err();
        assert!(matches!(error, ExtsockError::InvalidCommand(_)));
    }

    #[test]
    fn rejects_verb_without_trailing_space() {
        // "APPLY_CONFIGxyz" must not be mistaken for "APPLY_CONFIG " + "xyz".
        let error = parse_verb("APPLY_CONFIGxyz").unwrap_err();
        assert!(matches!(error, ExtsockError::InvalidCommand(_)));
    }
}
