//! Plugin-level configuration: where the control socket lives, where logs
//! go, and at what verbosity. Not to be confused with the IPsec peer
//! configuration this plugin ingests (`config` module) — this is
//! configuration *of the plugin itself* (SPEC_FULL §3).

use anyhow::Context as _;
use camino::Utf8PathBuf;
use devolutions_log::StaticLogConfig;

use crate::channel::DEFAULT_SOCKET_PATH;

const ENV_SOCKET_PATH: &str = "EXTSOCK_SOCKET_PATH";
const ENV_LOG_PATH: &str = "EXTSOCK_LOG_PATH";
const ENV_LOG_FILTER: &str = "EXTSOCK_LOG_FILTER";

const DEFAULT_LOG_PATH: &str = "/var/log/ipsec-extsock";
const DEFAULT_LOG_FILTER: &str = "info";

pub struct LogConfig;

impl StaticLogConfig for LogConfig {
    const MAX_BYTES_PER_LOG_FILE: u64 = 10 * 1024 * 1024;
    const MAX_LOG_FILES: usize = 10;
    const LOG_FILE_PREFIX: &'static str = "ipsec-extsock";
}

pub struct PluginSettings {
    pub socket_path: Utf8PathBuf,
    pub log_path: Utf8PathBuf,
    pub log_filter: String,
}

impl PluginSettings {
    /// Load from environment variables, falling back to the documented
    /// defaults for anything unset (SPEC_FULL §3).
    pub fn from_env() -> anyhow::Result<Self> {
        let socket_path = match std::env::var(ENV_SOCKET_PATH) {
            Ok(raw) => Utf8PathBuf::from(raw),
            Err(std::env::VarError::NotPresent) => Utf8PathBuf::from(DEFAULT_SOCKET_PATH),
            Err(error) => return Err(error).context(ENV_SOCKET_PATH),
        };

        let log_path = match std::env::var(ENV_LOG_PATH) {
            Ok(raw) => Utf8PathBuf::from(raw),
            Err(std::env::VarError::NotPresent) => Utf8PathBuf::from(DEFAULT_LOG_PATH),
            Err(error) => return Err(error).context(ENV_LOG_PATH),
        };

        let log_filter = match std::env::var(ENV_LOG_FILTER) {
            Ok(raw) => raw,
            Err(std::env::VarError::NotPresent) => DEFAULT_LOG_FILTER.to_owned(),
            Err(error) => return Err(error).context(ENV_LOG_FILTER),
        };

        Ok(Self {
            socket_path,
            log_path,
            log_filter,
        })
    }
}
