use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::identity::expand_home;
use crate::record::DEFAULT_LEDGER_TYPE;

/// Runtime configuration: optional TOML file, then `SEEDCERT_*` env overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: String,
    pub peer_listen: String,
    pub channel: String,
    pub chaincode: String,
    pub msp_id: String,
    /// Remote peer base URL; `None` runs the peer in-process.
    pub peer_endpoint: Option<String>,
    pub ledger_dir: PathBuf,
    pub key_path: PathBuf,
    pub creators_toml: Option<PathBuf>,
    pub certifiers_toml: Option<PathBuf>,
    pub queue_path: PathBuf,
    pub reject_duplicates: bool,
    pub queue_delay_ms: u64,
    pub ledger_type: String,
}

impl Default for Config {
    fn default() -> Self {
        let base = home_base();
        Self {
            listen: "0.0.0.0:3000".into(),
            peer_listen: "0.0.0.0:7051".into(),
            channel: "mychannel".into(),
            chaincode: "seed".into(),
            msp_id: "Org1MSP".into(),
            peer_endpoint: None,
            ledger_dir: base.join("ledger"),
            key_path: base.join("signer.key"),
            creators_toml: Some(base.join("creators.toml")),
            certifiers_toml: Some(base.join("certifiers.toml")),
            queue_path: base.join("queue.json"),
            reject_duplicates: false,
            queue_delay_ms: 500,
            ledger_type: DEFAULT_LEDGER_TYPE.into(),
        }
    }
}

fn home_base() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".seedcert"))
        .unwrap_or_else(|| PathBuf::from(".seedcert"))
}

impl Config {
    /// Load `path` (or `SEEDCERT_CONFIG`) when present, then apply env overrides.
    ///
    /// # Errors
    /// Returns an error when the file cannot be parsed or an override is malformed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env_var("SEEDCERT_CONFIG").map(PathBuf::from));
        let mut cfg = match path {
            Some(p) => {
                let data =
                    fs::read_to_string(&p).with_context(|| format!("reading {}", p.display()))?;
                toml::from_str::<Self>(&data).with_context(|| format!("parsing {}", p.display()))?
            }
            None => Self::default(),
        };
        cfg.apply_env()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_var("SEEDCERT_LISTEN") {
            self.listen = v;
        }
        if let Some(v) = env_var("SEEDCERT_PEER_LISTEN") {
            self.peer_listen = v;
        }
        if let Some(v) = env_var("SEEDCERT_CHANNEL") {
            self.channel = v;
        }
        if let Some(v) = env_var("SEEDCERT_CHAINCODE") {
            self.chaincode = v;
        }
        if let Some(v) = env_var("SEEDCERT_MSP_ID") {
            self.msp_id = v;
        }
        if let Some(v) = env_var("SEEDCERT_PEER_ENDPOINT") {
            self.peer_endpoint = Some(v);
        }
        if let Some(v) = env_var("SEEDCERT_LEDGER_DIR") {
            self.ledger_dir = expand_home(&v)?;
        }
        if let Some(v) = env_var("SEEDCERT_KEY_PATH") {
            self.key_path = expand_home(&v)?;
        }
        if let Some(v) = env_var("SEEDCERT_CREATORS_TOML") {
            self.creators_toml = Some(expand_home(&v)?);
        }
        if let Some(v) = env_var("SEEDCERT_CERTIFIERS_TOML") {
            self.certifiers_toml = Some(expand_home(&v)?);
        }
        if let Some(v) = env_var("SEEDCERT_QUEUE_PATH") {
            self.queue_path = expand_home(&v)?;
        }
        if let Some(v) = env_var("SEEDCERT_REJECT_DUPLICATES") {
            self.reject_duplicates = parse_bool(&v)?;
        }
        if let Some(v) = env_var("SEEDCERT_QUEUE_DELAY_MS") {
            self.queue_delay_ms = v
                .parse()
                .map_err(|e| anyhow!("SEEDCERT_QUEUE_DELAY_MS: {e}"))?;
        }
        if let Some(v) = env_var("SEEDCERT_LEDGER_TYPE") {
            self.ledger_type = v;
        }
        Ok(())
    }
}

fn parse_bool(v: &str) -> Result<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("not a boolean: {other}")),
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|v| {
        let trimmed = v.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}
