use std::{env::var, path::PathBuf};

pub const DEFAULT_TYPE_A_BASE_URL: &str = "https://api.mstock.trade/openapi/typea";
pub const DEFAULT_TYPE_B_BASE_URL: &str = "https://api.mstock.trade/openapi/typeb";
pub const DEFAULT_SESSION_FILE: &str = "broker_session.json";
pub const DEFAULT_PROBE_SYMBOL: &str = "NSE:NIFTYBEES-EQ";

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub type_a_base_url: String,
    pub type_b_base_url: String,
    pub session_file: PathBuf,
    /// Repeat the quote cascade against the type B surface when type A misses.
    pub enable_type_b: bool,
    /// Instrument used by the session validity probe.
    pub probe_symbol: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            type_a_base_url: DEFAULT_TYPE_A_BASE_URL.to_string(),
            type_b_base_url: DEFAULT_TYPE_B_BASE_URL.to_string(),
            session_file: PathBuf::from(DEFAULT_SESSION_FILE),
            enable_type_b: true,
            probe_symbol: DEFAULT_PROBE_SYMBOL.to_string(),
        }
    }
}

impl BrokerConfig {
    /// Reads `BROKER_TYPE_A_URL`, `BROKER_TYPE_B_URL`, `BROKER_SESSION_FILE`,
    /// `BROKER_ENABLE_TYPE_B` and `BROKER_PROBE_SYMBOL`, defaulting anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            type_a_base_url: var("BROKER_TYPE_A_URL").unwrap_or(defaults.type_a_base_url),
            type_b_base_url: var("BROKER_TYPE_B_URL").unwrap_or(defaults.type_b_base_url),
            session_file: var("BROKER_SESSION_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.session_file),
            enable_type_b: var("BROKER_ENABLE_TYPE_B")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.enable_type_b),
            probe_symbol: var("BROKER_PROBE_SYMBOL").unwrap_or(defaults.probe_symbol),
        }
    }

    pub(crate) fn type_a_url(&self, path: &str) -> String {
        format!("{}/{}", self.type_a_base_url.trim_end_matches('/'), path)
    }

    pub(crate) fn type_b_url(&self, path: &str) -> String {
        format!("{}/{}", self.type_b_base_url.trim_end_matches('/'), path)
    }
}

fn parse_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}
