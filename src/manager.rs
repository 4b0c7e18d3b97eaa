//! Runtime managers for the three channel kinds: each holds one
//! lock-guarded map of loaded configs and one of running handles, and
//! mirrors every start/stop into the introspection surface.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::channel::loader;
use crate::channel::models::{ChannelLifecycleState, InboundConfig, OutboundConfig, TranslateConfig};
use crate::channel::{inbound, outbound, translate};
use crate::error::Result;
use crate::stats::StatsStore;

/// The per-channel introspection view exposed to callers polling channel
/// health: a point-in-time snapshot of a channel's lifecycle state and
/// counters.
#[derive(Debug, Clone)]
pub struct ChannelStatusView {
    pub name: String,
    pub kind: &'static str,
    pub status: ChannelLifecycleState,
    pub processed: u64,
    pub errors: u64,
    pub input_or_source_dir: PathBuf,
    pub last_activity: Option<DateTime<Utc>>,
}

pub struct TranslateManager {
    yaml_dir: PathBuf,
    transformers_dir: PathBuf,
    stats: Arc<StatsStore>,
    configs: Mutex<HashMap<String, TranslateConfig>>,
    running: Mutex<HashMap<String, translate::TranslateHandle>>,
}

impl TranslateManager {
    pub fn new(yaml_dir: PathBuf, transformers_dir: PathBuf, stats: Arc<StatsStore>) -> Self {
        Self {
            yaml_dir,
            transformers_dir,
            stats,
            configs: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Loads every channel YAML in `yaml_dir` and starts the enabled ones.
    /// A single channel's config or bind failure is logged and skipped;
    /// the rest still start.
    pub async fn load_and_start(&self) -> Result<()> {
        self.stop_all().await;
        let configs = loader::load_translate_configs(&self.yaml_dir)?;
        let mut store = self.configs.lock().await;
        store.clear();
        for config in configs {
            let name = config.name.clone();
            let enabled = config.enabled;
            store.insert(name.clone(), config);
            if enabled {
                drop_and_start(self, &mut store, &name).await;
            }
        }
        Ok(())
    }

    pub async fn start_channel(&self, name: &str) -> Result<()> {
        let mut store = self.configs.lock().await;
        drop_and_start(self, &mut store, name).await;
        Ok(())
    }

    /// Idempotent: stopping an already-stopped channel is a no-op.
    pub async fn stop_channel(&self, name: &str) {
        let handle = self.running.lock().await.remove(name);
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    pub async fn stop_all(&self) {
        let handles: Vec<_> = self.running.lock().await.drain().collect();
        for (_, handle) in handles {
            handle.stop().await;
        }
    }

    pub async fn running_names(&self) -> Vec<String> {
        self.running.lock().await.keys().cloned().collect()
    }

    pub async fn all_names(&self) -> Vec<String> {
        self.configs.lock().await.keys().cloned().collect()
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.running.lock().await.contains_key(name)
    }

    pub async fn state(&self, name: &str) -> Option<ChannelLifecycleState> {
        let configs = self.configs.lock().await;
        let config = configs.get(name)?;
        if self.running.lock().await.contains_key(name) {
            return Some(ChannelLifecycleState::Running);
        }
        Some(if config.enabled {
            ChannelLifecycleState::Stopped
        } else {
            ChannelLifecycleState::Disabled
        })
    }

    pub fn processed(&self, name: &str) -> u64 {
        self.stats.get(name).processed
    }

    pub fn errors(&self, name: &str) -> u64 {
        self.stats.get(name).errors
    }

    pub async fn status_view(&self, name: &str) -> Option<ChannelStatusView> {
        let state = self.state(name).await?;
        let configs = self.configs.lock().await;
        let config = configs.get(name)?;
        let record = self.stats.get(name);
        Some(ChannelStatusView {
            name: name.to_string(),
            kind: "translate",
            status: state,
            processed: record.processed,
            errors: record.errors,
            input_or_source_dir: config.input_dir.clone(),
            last_activity: self.stats.last_activity(name),
        })
    }
}

async fn drop_and_start(manager: &TranslateManager, configs: &mut HashMap<String, TranslateConfig>, name: &str) {
    let Some(config) = configs.get(name).cloned() else {
        tracing::warn!(channel = name, "no such translate channel configured");
        return;
    };

    let mut running = manager.running.lock().await;
    if running.contains_key(name) {
        return;
    }

    match translate::start(config, manager.yaml_dir.clone(), manager.transformers_dir.clone(), manager.stats.clone()) {
        Ok(handle) => {
            running.insert(name.to_string(), handle);
        }
        Err(e) => {
            tracing::error!(channel = name, error = %e, "translate channel failed to start");
        }
    }
}

pub struct InboundManager {
    stats: Arc<StatsStore>,
    configs: Mutex<HashMap<String, InboundConfig>>,
    running: Mutex<HashMap<String, inbound::InboundHandle>>,
}

impl InboundManager {
    pub fn new(stats: Arc<StatsStore>) -> Self {
        Self {
            stats,
            configs: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub async fn load_and_start(&self, yaml_dir: &std::path::Path) -> Result<()> {
        self.stop_all().await;
        let configs = loader::load_inbound_configs(yaml_dir)?;
        let mut store = self.configs.lock().await;
        store.clear();
        for config in configs {
            let name = config.name.clone();
            let enabled = config.enabled;
            store.insert(name.clone(), config);
            if enabled {
                self.start_locked(&mut store, &name).await;
            }
        }
        Ok(())
    }

    pub async fn start_channel(&self, name: &str) -> Result<()> {
        let mut store = self.configs.lock().await;
        self.start_locked(&mut store, name).await;
        Ok(())
    }

    async fn start_locked(&self, configs: &mut HashMap<String, InboundConfig>, name: &str) {
        let Some(config) = configs.get(name).cloned() else {
            tracing::warn!(channel = name, "no such inbound channel configured");
            return;
        };

        let mut running = self.running.lock().await;
        if running.contains_key(name) {
            return;
        }

        match inbound::start(config, self.stats.clone()).await {
            Ok(handle) => {
                running.insert(name.to_string(), handle);
            }
            Err(e) => {
                tracing::error!(channel = name, error = %e, "inbound channel failed to start");
            }
        }
    }

    pub async fn stop_channel(&self, name: &str) {
        let handle = self.running.lock().await.remove(name);
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    pub async fn stop_all(&self) {
        let handles: Vec<_> = self.running.lock().await.drain().collect();
        for (_, handle) in handles {
            handle.stop().await;
        }
    }

    pub async fn running_names(&self) -> Vec<String> {
        self.running.lock().await.keys().cloned().collect()
    }

    pub async fn all_names(&self) -> Vec<String> {
        self.configs.lock().await.keys().cloned().collect()
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.running.lock().await.contains_key(name)
    }

    pub async fn state(&self, name: &str) -> Option<ChannelLifecycleState> {
        let configs = self.configs.lock().await;
        let config = configs.get(name)?;
        if self.running.lock().await.contains_key(name) {
            return Some(ChannelLifecycleState::Running);
        }
        Some(if config.enabled {
            ChannelLifecycleState::Stopped
        } else {
            ChannelLifecycleState::Disabled
        })
    }

    pub fn processed(&self, name: &str) -> u64 {
        self.stats.get(name).processed
    }

    pub fn errors(&self, name: &str) -> u64 {
        self.stats.get(name).errors
    }

    pub async fn status_view(&self, name: &str) -> Option<ChannelStatusView> {
        let state = self.state(name).await?;
        let configs = self.configs.lock().await;
        let config = configs.get(name)?;
        let record = self.stats.get(name);
        Some(ChannelStatusView {
            name: name.to_string(),
            kind: "inbound",
            status: state,
            processed: record.processed,
            errors: record.errors,
            input_or_source_dir: config.save_dir.clone(),
            last_activity: self.stats.last_activity(name),
        })
    }
}

pub struct OutboundManager {
    stats: Arc<StatsStore>,
    configs: Mutex<HashMap<String, OutboundConfig>>,
    running: Mutex<HashMap<String, outbound::OutboundHandle>>,
}

impl OutboundManager {
    pub fn new(stats: Arc<StatsStore>) -> Self {
        Self {
            stats,
            configs: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub async fn load_and_start(&self, yaml_dir: &std::path::Path) -> Result<()> {
        self.stop_all().await;
        let configs = loader::load_outbound_configs(yaml_dir)?;
        let mut store = self.configs.lock().await;
        store.clear();
        for config in configs {
            let name = config.name.clone();
            let enabled = config.enabled;
            store.insert(name.clone(), config);
            if enabled {
                self.start_locked(&mut store, &name).await;
            }
        }
        Ok(())
    }

    pub async fn start_channel(&self, name: &str) -> Result<()> {
        let mut store = self.configs.lock().await;
        self.start_locked(&mut store, name).await;
        Ok(())
    }

    async fn start_locked(&self, configs: &mut HashMap<String, OutboundConfig>, name: &str) {
        let Some(config) = configs.get(name).cloned() else {
            tracing::warn!(channel = name, "no such outbound channel configured");
            return;
        };

        let mut running = self.running.lock().await;
        if running.contains_key(name) {
            return;
        }

        match outbound::start(config, self.stats.clone()) {
            Ok(handle) => {
                running.insert(name.to_string(), handle);
            }
            Err(e) => {
                tracing::error!(channel = name, error = %e, "outbound channel failed to start");
            }
        }
    }

    pub async fn stop_channel(&self, name: &str) {
        let handle = self.running.lock().await.remove(name);
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    pub async fn stop_all(&self) {
        let handles: Vec<_> = self.running.lock().await.drain().collect();
        for (_, handle) in handles {
            handle.stop().await;
        }
    }

    pub async fn running_names(&self) -> Vec<String> {
        self.running.lock().await.keys().cloned().collect()
    }

    pub async fn all_names(&self) -> Vec<String> {
        self.configs.lock().await.keys().cloned().collect()
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.running.lock().await.contains_key(name)
    }

    pub async fn state(&self, name: &str) -> Option<ChannelLifecycleState> {
        let configs = self.configs.lock().await;
        let config = configs.get(name)?;
        if self.running.lock().await.contains_key(name) {
            return Some(ChannelLifecycleState::Running);
        }
        Some(if config.enabled {
            ChannelLifecycleState::Stopped
        } else {
            ChannelLifecycleState::Disabled
        })
    }

    pub fn processed(&self, name: &str) -> u64 {
        self.stats.get(name).processed
    }

    pub fn errors(&self, name: &str) -> u64 {
        self.stats.get(name).errors
    }

    pub async fn status_view(&self, name: &str) -> Option<ChannelStatusView> {
        let state = self.state(name).await?;
        let configs = self.configs.lock().await;
        let config = configs.get(name)?;
        let record = self.stats.get(name);
        Some(ChannelStatusView {
            name: name.to_string(),
            kind: "outbound",
            status: state,
            processed: record.processed,
            errors: record.errors,
            input_or_source_dir: config.source_dir.clone(),
            last_activity: self.stats.last_activity(name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("localbridge-manager-test-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn translate_manager_starts_enabled_channels_and_reports_names() {
        let yaml_dir = scratch_dir("translate-start");
        let transformers_dir = scratch_dir("translate-transformers");
        let in_dir = yaml_dir.join("in");
        let out_dir = yaml_dir.join("out");
        fs::write(
            yaml_dir.join("t1.yaml"),
            format!(
                "name: T1\ninputDir: {}\noutputDir: {}\ntransformer:\n  type: wrapi\n  script: pass.wrapi\n",
                in_dir.display(),
                out_dir.display()
            ),
        )
        .unwrap();
        fs::write(transformers_dir.join("pass.wrapi"), "SAVE\n").unwrap();

        let stats = Arc::new(StatsStore::load(yaml_dir.join("stats.json")));
        let manager = TranslateManager::new(yaml_dir.clone(), transformers_dir.clone(), stats);
        manager.load_and_start().await.unwrap();

        assert_eq!(manager.all_names().await, vec!["T1".to_string()]);
        assert!(manager.is_running("T1").await);

        let view = manager.status_view("T1").await.unwrap();
        assert_eq!(view.kind, "translate");
        assert_eq!(view.status, ChannelLifecycleState::Running);
        assert_eq!(view.input_or_source_dir, in_dir);
        assert!(view.last_activity.is_none());

        manager.stop_all().await;
        assert!(!manager.is_running("T1").await);
        assert_eq!(
            manager.status_view("T1").await.unwrap().status,
            ChannelLifecycleState::Stopped
        );

        fs::remove_dir_all(&yaml_dir).unwrap();
        fs::remove_dir_all(&transformers_dir).unwrap();
    }

    #[tokio::test]
    async fn stop_channel_is_idempotent() {
        let yaml_dir = scratch_dir("idempotent");
        let stats = Arc::new(StatsStore::load(yaml_dir.join("stats.json")));
        let manager = TranslateManager::new(yaml_dir.clone(), yaml_dir.clone(), stats);
        manager.stop_channel("nope").await;
        manager.stop_channel("nope").await;
        fs::remove_dir_all(&yaml_dir).unwrap();
    }
}
