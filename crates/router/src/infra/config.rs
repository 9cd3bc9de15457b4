//! Startup configuration files.
//!
//! Exchange connectors, the bidder transport and the initial agent set are
//! all declared in JSON documents named on the command line. There is no
//! dynamic plugin loading: the dispatch tables are built once at startup and
//! immutable afterwards.

use anyhow::{Context, Result};
use model::{agent::AgentConfig, ids::AgentId};
use serde::Deserialize;
use std::{collections::BTreeMap, path::Path};

/// One exchange connector declaration.
#[derive(Clone, Debug, Deserialize)]
pub struct ExchangeConfig {
    /// Connector name; also the `exchange` tag on normalized requests.
    pub name: String,
    /// Connector specific settings, decoded by the connector itself.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// The bidder transport declaration.
#[derive(Clone, Debug, Deserialize)]
pub struct BidderConfig {
    /// Transport kind, e.g. `channel` for the in-process transport.
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

pub fn load_exchanges(path: &Path) -> Result<Vec<ExchangeConfig>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading exchange configuration {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("parsing exchange configuration {}", path.display()))
}

pub fn load_bidder(path: &Path) -> Result<BidderConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading bidder configuration {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("parsing bidder configuration {}", path.display()))
}

/// Initial agent set: a map from agent name to configuration document.
pub fn load_agents(path: &Path) -> Result<Vec<(AgentId, AgentConfig)>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading agent configuration {}", path.display()))?;
    let documents: BTreeMap<String, AgentConfig> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing agent configuration {}", path.display()))?;
    Ok(documents
        .into_iter()
        .map(|(name, config)| (AgentId::new(name), config))
        .collect())
}
