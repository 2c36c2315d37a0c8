mod parser;
mod types;

pub use parser::{parse_config_json, ParsedConnection};
pub use types::{
    AuthClass, AuthConfig, CertRef, ChildAction, ChildConfig, ChildMode, ConnName, CsvString, Identity, IkeConfig,
    IkeVersion, Lifetime, PeerConfig, PeerParams, Proposal, StartAction, TrafficSelector, UniquePolicy, MAX_FIELD_LEN,
    MAX_NAME_LEN,
};
