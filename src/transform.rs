//! Resolves a channel's `transformer` config into a runnable transformer.
//!
//! `TransformerType::Java` is recognized at config-parse time for
//! forward-compatibility with Mirth-style YAML that names a `class`, but
//! fails fast here rather than silently skipping, since there is no
//! in-process JVM to delegate to.

use std::path::{Path, PathBuf};

use crate::channel::models::{TransformerConfig, TransformerType};
use crate::error::{EngineError, Result};
use crate::hl7;
use crate::wrapi::WrapiScript;

pub enum Transformer {
    Wrapi {
        script: WrapiScript,
        create_missing: bool,
    },
}

impl Transformer {
    pub fn apply(&self, msg: &hl7::Message) -> hl7::Message {
        match self {
            Transformer::Wrapi { script, create_missing } => script.apply(msg, *create_missing),
        }
    }
}

/// Loads and parses the script named by `config`, searching relative to
/// the channel's YAML directory, then `conf/transformers/`, then the
/// process's current directory — first match wins.
pub fn resolve(config: &TransformerConfig, yaml_dir: &Path, transformers_dir: &Path) -> Result<Transformer> {
    match config.kind {
        TransformerType::Java => Err(EngineError::Config(format!(
            "transformer type 'java' (class {:?}) has no in-process execution support",
            config.class
        ))),
        TransformerType::Wrapi => {
            let script_ref = config
                .script
                .as_ref()
                .ok_or_else(|| EngineError::Config("wrapi transformer requires a 'script' path".to_string()))?;
            let path = resolve_script_path(script_ref, yaml_dir, transformers_dir)?;
            let text = std::fs::read_to_string(&path)?;
            let script = WrapiScript::parse(&text)?;
            Ok(Transformer::Wrapi {
                script,
                create_missing: config.create_missing,
            })
        }
    }
}

fn resolve_script_path(script: &Path, yaml_dir: &Path, transformers_dir: &Path) -> Result<PathBuf> {
    let candidates = [
        yaml_dir.join(script),
        transformers_dir.join(script),
        script.to_path_buf(),
    ];

    for candidate in &candidates {
        if candidate.is_file() {
            return Ok(candidate.clone());
        }
    }

    Err(EngineError::Config(format!(
        "transformer script not found: {} (looked in {}, {}, and CWD)",
        script.display(),
        yaml_dir.display(),
        transformers_dir.display()
    )))
}
