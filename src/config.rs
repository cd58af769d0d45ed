use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use chain::ChainConfig;
use consensus::EngineKind;
use containers::Hash;
use metrics::server::MetricsServerConfig;
use networking::les::LesConfig;
use networking::sync::{NodeMode, SyncConfig};
use serde::Deserialize;

/// CHT or bloom trie root taken from a trusted checkpoint rather than built
/// locally.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct TrustedRoot {
    pub section: u64,
    pub root: Hash,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_mode: NodeMode,
    pub chain: ChainConfig,
    pub engine: EngineKind,
    pub sync: SyncConfig,
    pub les: LesConfig,
    pub metrics: MetricsServerConfig,
    /// Light server addresses to seed the server pool with.
    pub servers: Vec<String>,
    pub trusted_cht_roots: Vec<TrustedRoot>,
    /// Bloom trie sections are never indexed locally, so bloom bit
    /// retrieval only works for the sections listed here.
    pub trusted_bloom_roots: Vec<TrustedRoot>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_mode: NodeMode::Full,
            chain: ChainConfig::default(),
            engine: EngineKind::default(),
            sync: SyncConfig::default(),
            les: LesConfig::default(),
            metrics: MetricsServerConfig::default(),
            servers: Vec::new(),
            trusted_cht_roots: Vec::new(),
            trusted_bloom_roots: Vec::new(),
        }
    }
}

impl NodeConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
        let config = serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }
}
