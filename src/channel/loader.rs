//! Scans the three `conf/channels/...` subtrees and parses each `*.yaml`
//! file into the matching config record, failing the individual file
//! rather than the whole scan when its shape is wrong — the load-time
//! `ConfigError` surfaces as a per-channel start failure in the manager.

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::channel::models::{
    InboundConfig, OutboundConfig, RawInboundConfig, RawOutboundConfig, RawTranslateConfig,
    TranslateConfig,
};
use crate::error::{EngineError, Result};

pub fn load_translate_configs(dir: &Path) -> Result<Vec<TranslateConfig>> {
    load_configs(dir, RawTranslateConfig::into_config)
}

pub fn load_inbound_configs(dir: &Path) -> Result<Vec<InboundConfig>> {
    load_configs(dir, RawInboundConfig::into_config)
}

pub fn load_outbound_configs(dir: &Path) -> Result<Vec<OutboundConfig>> {
    load_configs(dir, RawOutboundConfig::into_config)
}

fn load_configs<R, C>(dir: &Path, into_config: impl Fn(R) -> Result<C>) -> Result<Vec<C>>
where
    R: DeserializeOwned,
{
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let pattern = format!("{}/*.yaml", dir.display());
    let mut configs = Vec::new();

    for entry in glob::glob(&pattern).map_err(|e| EngineError::Config(e.to_string()))? {
        let path = entry.map_err(|e| EngineError::Config(e.to_string()))?;
        let text = std::fs::read_to_string(&path)?;
        let raw: R = serde_yaml::from_str(&text)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        let cfg = into_config(raw).map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        configs.push(cfg);
    }

    Ok(configs)
}
