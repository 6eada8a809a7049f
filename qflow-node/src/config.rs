//! CLI flags layered over `qflow_common::config::Config::default()` and an
//! optional config file, via a `clap::Parser`-derived CLI over a
//! compiled-in default config.

use clap::Parser;
use qflow_common::config::Config;

#[derive(Debug, Parser)]
#[command(name = "qflow-node", about = "Single-node Qflow execution engine")]
pub struct Cli {
    /// Path to a JSON config file; missing fields fall back to compiled
    /// defaults.
    #[arg(long)]
    pub config: Option<String>,

    #[arg(long)]
    pub node_id: Option<String>,

    #[arg(long)]
    pub listen_addr: Option<String>,

    #[arg(long)]
    pub max_concurrent_steps: Option<u32>,

    #[arg(long)]
    pub lease_ttl_ms: Option<u64>,

    #[arg(long)]
    pub log_level: Option<String>,

    #[arg(long)]
    pub log_file: Option<String>,

    /// On-disk path for the sled-backed ledger and isolation stores.
    #[arg(long, default_value = "./qflow-data")]
    pub data_dir: String,
}

impl Cli {
    /// Layers compiled defaults, then an optional config file, then
    /// explicit CLI flags, each overriding the previous.
    pub fn resolve(&self) -> anyhow::Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                Config::from_json_str(&text)?
            }
            None => Config::default(),
        };

        if let Some(v) = &self.node_id {
            cfg.node_id = v.clone();
        }
        if let Some(v) = &self.listen_addr {
            cfg.listen_addr = v.clone();
        }
        if let Some(v) = self.max_concurrent_steps {
            cfg.max_concurrent_steps = v;
        }
        if let Some(v) = self.lease_ttl_ms {
            cfg.lease_ttl_ms = v;
        }
        if let Some(v) = &self.log_level {
            cfg.log_level = v.clone();
        }
        if self.log_file.is_some() {
            cfg.log_file = self.log_file.clone();
        }

        Ok(cfg)
    }
}
