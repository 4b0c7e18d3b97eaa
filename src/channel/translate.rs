//! Translate channel: polls a directory, parses and transforms each file,
//! writes the result to every destination, and archives/deletes/errors the
//! source file depending on the outcome.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::channel::models::TranslateConfig;
use crate::error::{EngineError, Result};
use crate::hl7;
use crate::stats::StatsStore;
use crate::transform::{self, Transformer};

pub struct TranslateHandle {
    name: String,
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
    join: tokio::task::JoinHandle<()>,
}

impl TranslateHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signals the worker to stop and waits up to 5s for it to notice.
    pub async fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
        if tokio::time::timeout(Duration::from_secs(5), self.join).await.is_err() {
            tracing::warn!(channel = %self.name, "translate worker did not stop within grace period");
        }
    }
}

pub fn start(
    config: TranslateConfig,
    yaml_dir: PathBuf,
    transformers_dir: PathBuf,
    stats: Arc<StatsStore>,
) -> Result<TranslateHandle> {
    let transformer = transform::resolve(&config.transformer, &yaml_dir, &transformers_dir)?;
    let name = config.name.clone();
    let running = Arc::new(AtomicBool::new(true));
    let notify = Arc::new(Notify::new());

    let running_worker = running.clone();
    let notify_worker = notify.clone();
    let join = tokio::spawn(async move {
        run_loop(config, transformer, stats, running_worker, notify_worker).await;
    });

    Ok(TranslateHandle { name, running, notify, join })
}

async fn run_loop(
    config: TranslateConfig,
    transformer: Transformer,
    stats: Arc<StatsStore>,
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
) {
    while running.load(Ordering::SeqCst) {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(config.poll_interval_ms)) => {}
            _ = notify.notified() => {}
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let entries = match enumerate(&config) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(channel = %config.name, error = %e, "translate poll enumeration failed");
                continue;
            }
        };

        for path in entries {
            process_one(&config, &transformer, &stats, &path).await;
            if !running.load(Ordering::SeqCst) {
                break;
            }
        }
    }
}

fn enumerate(config: &TranslateConfig) -> Result<Vec<PathBuf>> {
    let pattern = config.input_dir.join(&config.input_pattern);
    let pattern_str = pattern.to_string_lossy().to_string();
    let mut paths: Vec<PathBuf> = glob::glob(&pattern_str)
        .map_err(|e| EngineError::Config(e.to_string()))?
        .filter_map(|r| r.ok())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();
    paths.truncate(config.batch_size);
    Ok(paths)
}

async fn process_one(config: &TranslateConfig, transformer: &Transformer, stats: &StatsStore, path: &Path) {
    let attempts = config.error_handling.retry_count as usize + 1;
    let mut last_err = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(config.error_handling.retry_delay_ms)).await;
        }
        match try_process(config, transformer, path).await {
            Ok(()) => {
                stats.increment_processed(&config.name);
                return;
            }
            Err(e) => last_err = Some(e),
        }
    }

    stats.increment_errors(&config.name);
    let err = last_err.expect("at least one attempt runs");
    tracing::warn!(channel = %config.name, file = %path.display(), error = %err, "translate file failed after retries");
    dispose_failure(config, path, &err).await;
}

async fn try_process(config: &TranslateConfig, transformer: &Transformer, path: &Path) -> Result<()> {
    let original_filename = path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("unknown")
        .to_string();

    tracing::debug!(channel = %config.name, file = %original_filename, "translate: processing file");

    let bytes = tokio::fs::read(path).await?;
    let text = String::from_utf8(bytes).map_err(|e| EngineError::Parse(e.to_string()))?;
    let parsed = hl7::parse(&text)?;
    let transformed = transformer.apply(&parsed);
    let encoded = hl7::encode(&transformed);

    write_to_all_destinations(config, &original_filename, encoded.as_bytes()).await?;

    dispose_success(config, path).await
}

/// Writes `data` into every destination as a `.tmp` sibling first, then
/// renames all of them into place only once every write has succeeded.
/// A failure partway through removes any `.tmp` files already written and
/// returns before renaming anything, so the destination set never shows a
/// partial delivery.
async fn write_to_all_destinations(config: &TranslateConfig, filename: &str, data: &[u8]) -> Result<()> {
    let mut staged = Vec::with_capacity(config.destinations.len());

    for dest_dir in &config.destinations {
        let dest_path = dest_dir.join(filename);
        match stage_tmp(dest_dir, &dest_path, data).await {
            Ok(tmp_path) => staged.push((tmp_path, dest_path)),
            Err(e) => {
                for (tmp_path, _) in &staged {
                    let _ = tokio::fs::remove_file(tmp_path).await;
                }
                return Err(e);
            }
        }
    }

    for (tmp_path, dest_path) in &staged {
        tokio::fs::rename(tmp_path, dest_path)
            .await
            .map_err(|source| EngineError::IoWrite {
                path: dest_path.display().to_string(),
                source,
            })?;
    }

    Ok(())
}

async fn stage_tmp(dest_dir: &Path, dest_path: &Path, data: &[u8]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dest_dir).await?;

    let mut tmp_name = dest_path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    tokio::fs::write(&tmp_path, data)
        .await
        .map_err(|source| EngineError::IoWrite {
            path: tmp_path.display().to_string(),
            source,
        })?;

    Ok(tmp_path)
}

async fn dispose_success(config: &TranslateConfig, path: &Path) -> Result<()> {
    if config.archive.enabled {
        if let Some(archive_dir) = &config.archive_dir {
            tokio::fs::create_dir_all(archive_dir).await?;
            let filename = path.file_name().expect("polled entries always have a filename");
            let dest = archive_dir.join(filename);
            if config.archive.compress {
                compress_and_move(path, &dest).await?;
            } else {
                tokio::fs::rename(path, &dest)
                    .await
                    .map_err(|source| EngineError::IoWrite {
                        path: dest.display().to_string(),
                        source,
                    })?;
            }
            return Ok(());
        }
    }
    tokio::fs::remove_file(path).await?;
    Ok(())
}

async fn compress_and_move(src: &Path, dest: &Path) -> Result<()> {
    let mut gz_name = dest.as_os_str().to_os_string();
    gz_name.push(".gz");
    let dest_gz = PathBuf::from(gz_name);
    let src = src.to_path_buf();

    let result_path = dest_gz.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        use std::io::Write;
        let input = std::fs::read(&src)?;
        let file = std::fs::File::create(&result_path)?;
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        encoder.write_all(&input)?;
        encoder.finish()?;
        std::fs::remove_file(&src)?;
        Ok(())
    })
    .await
    .map_err(|join_err| EngineError::IoWrite {
        path: dest_gz.display().to_string(),
        source: std::io::Error::other(join_err.to_string()),
    })??;

    Ok(())
}

async fn dispose_failure(config: &TranslateConfig, path: &Path, err: &EngineError) {
    let filename = path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("unknown")
        .to_string();

    let Some(error_dir) = &config.error_dir else {
        let _ = tokio::fs::remove_file(path).await;
        return;
    };

    if let Err(e) = tokio::fs::create_dir_all(error_dir).await {
        tracing::error!(channel = %config.name, error = %e, "could not create errorDir");
        return;
    }

    let sidecar_path = error_dir.join(format!("{filename}.error.txt"));
    let sidecar = format!(
        "channel: {}\nfile: {}\ntimestamp: {}\nexceptionClass: {}\nmessage: {}\n",
        config.name,
        filename,
        chrono::Utc::now().to_rfc3339(),
        err.kind_name(),
        err,
    );
    if let Err(e) = tokio::fs::write(&sidecar_path, sidecar).await {
        tracing::error!(channel = %config.name, error = %e, "could not write error sidecar");
    }

    let dest = error_dir.join(&filename);
    let _ = tokio::fs::remove_file(&dest).await;
    if let Err(e) = tokio::fs::rename(path, &dest).await {
        tracing::error!(channel = %config.name, error = %e, "could not move failed file to errorDir");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::models::{ArchiveConfig, ErrorHandlingConfig, TransformerConfig, TransformerType};
    use std::fs;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "localbridge-translate-test-{name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn identity_transformer() -> Transformer {
        Transformer::Wrapi {
            script: crate::wrapi::WrapiScript::parse("SAVE").unwrap(),
            create_missing: false,
        }
    }

    fn base_config(input_dir: PathBuf, destinations: Vec<PathBuf>) -> TranslateConfig {
        TranslateConfig {
            name: "T1".to_string(),
            enabled: true,
            input_dir,
            error_dir: None,
            archive_dir: None,
            destinations,
            input_pattern: "*.hl7".to_string(),
            poll_interval_ms: 1000,
            batch_size: 10,
            transformer: TransformerConfig {
                kind: TransformerType::Wrapi,
                script: None,
                class: None,
                create_missing: false,
                validate_profile: false,
            },
            error_handling: ErrorHandlingConfig::default(),
            archive: ArchiveConfig::default(),
        }
    }

    #[tokio::test]
    async fn successful_file_is_written_to_all_destinations_and_deleted() {
        let root = scratch_dir("success");
        let input_dir = root.join("in");
        let dest_a = root.join("a");
        let dest_b = root.join("b");
        fs::create_dir_all(&input_dir).unwrap();

        let input_path = input_dir.join("msg.hl7");
        fs::write(&input_path, "MSH|^~\\&|A\rPID|1\r").unwrap();

        let config = base_config(input_dir.clone(), vec![dest_a.clone(), dest_b.clone()]);
        try_process(&config, &identity_transformer(), &input_path).await.unwrap();

        assert!(dest_a.join("msg.hl7").exists());
        assert!(dest_b.join("msg.hl7").exists());
        assert!(!input_path.exists());

        fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn scenario_three_destination_failure_leaves_no_partial_copies() {
        let root = scratch_dir("atomicity");
        let input_dir = root.join("in");
        let dest_a = root.join("a");
        let dest_b = root.join("b");
        fs::create_dir_all(&input_dir).unwrap();
        fs::create_dir_all(&dest_b).unwrap();

        let input_path = input_dir.join("msg.hl7");
        fs::write(&input_path, "MSH|^~\\&|A\rPID|1\r").unwrap();

        // Make dest_b unwritable by replacing it with a file of the same name
        // the engine will try to create_dir_all over, which fails.
        fs::remove_dir_all(&dest_b).unwrap();
        fs::write(&dest_b, b"not a directory").unwrap();

        let mut config = base_config(input_dir.clone(), vec![dest_a.clone(), dest_b.clone()]);
        config.error_dir = Some(root.join("errors"));

        let stats = Arc::new(crate::stats::StatsStore::load(root.join("stats.json")));
        process_one(&config, &identity_transformer(), &stats, &input_path).await;

        assert!(!dest_a.join("msg.hl7").exists());
        assert!(!input_path.exists());
        assert!(root.join("errors").join("msg.hl7").exists());
        assert!(root.join("errors").join("msg.hl7.error.txt").exists());
        assert_eq!(stats.get("T1").errors, 1);
        assert_eq!(stats.get("T1").processed, 0);

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn enumerate_caps_at_batch_size() {
        let root = scratch_dir("batch");
        for i in 0..5 {
            fs::write(root.join(format!("f{i}.hl7")), "x").unwrap();
        }
        let mut config = base_config(root.clone(), vec![root.join("out")]);
        config.batch_size = 3;

        let entries = enumerate(&config).unwrap();
        assert_eq!(entries.len(), 3);

        fs::remove_dir_all(&root).unwrap();
    }
}
