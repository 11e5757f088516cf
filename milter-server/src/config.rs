use config::{Config, File};
use miette::{IntoDiagnostic, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Cfg {
    #[serde(default)]
    pub log: CfgLog,
    pub server: CfgServer,
    pub storage: CfgStorage,
    #[serde(default)]
    pub rules: Vec<CfgRule>,
}

#[derive(Debug, Deserialize)]
pub struct CfgLog {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for CfgLog {
    fn default() -> Self {
        CfgLog {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
pub struct CfgServer {
    /// Address the milter listener binds, e.g. `127.0.0.1:10025`.
    pub addr: String,
    /// Address for the metrics and health endpoint; disabled when absent.
    pub http_addr: Option<String>,
    pub max_frame: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CfgStorage {
    pub base_path: String,
}

/// One envelope-domain rule, evaluated in file order. First match wins.
#[derive(Debug, Deserialize, Clone)]
pub struct CfgRule {
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub domain: Vec<String>,
    pub action: RuleAction,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    SenderDomain,
    RecipientDomain,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Reject,
    Tempfail,
}

impl Cfg {
    pub fn load(cfg_path: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(cfg_path))
            .build()
            .into_diagnostic()?;

        let cfg: Cfg = settings.try_deserialize().into_diagnostic()?;

        Ok(cfg)
    }
}
