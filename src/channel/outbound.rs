//! Outbound channel: polls a directory, sends each file over MLLP, awaits
//! an ACK, and archives/deletes/errors the file depending on the outcome.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{Notify, Semaphore};

use crate::channel::models::OutboundConfig;
use crate::error::{EngineError, Result};
use crate::mllp::{self, ReadOutcome};
use crate::stats::StatsStore;

pub struct OutboundHandle {
    name: String,
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
    join: tokio::task::JoinHandle<()>,
}

impl OutboundHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
        if tokio::time::timeout(Duration::from_secs(5), self.join).await.is_err() {
            tracing::warn!(channel = %self.name, "outbound worker did not stop within grace period");
        }
    }
}

pub fn start(config: OutboundConfig, stats: Arc<StatsStore>) -> Result<OutboundHandle> {
    let name = config.name.clone();
    let running = Arc::new(AtomicBool::new(true));
    let notify = Arc::new(Notify::new());

    let running_worker = running.clone();
    let notify_worker = notify.clone();
    let join = tokio::spawn(async move {
        run_loop(config, stats, running_worker, notify_worker).await;
    });

    Ok(OutboundHandle { name, running, notify, join })
}

async fn run_loop(config: OutboundConfig, stats: Arc<StatsStore>, running: Arc<AtomicBool>, notify: Arc<Notify>) {
    let semaphore = Arc::new(Semaphore::new(config.concurrent_sends));
    let config = Arc::new(config);

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
                tracing::warn!(channel = %config.name, error = %e, "outbound poll enumeration failed");
                continue;
            }
        };

        let mut handles = Vec::new();
        for path in entries {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let config = config.clone();
            let stats = stats.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                process_one(&config, &stats, &path).await;
            }));
        }
        for h in handles {
            let _ = h.await;
        }
    }
}

fn enumerate(config: &OutboundConfig) -> Result<Vec<PathBuf>> {
    let pattern = config.source_dir.join(&config.pattern);
    let pattern_str = pattern.to_string_lossy().to_string();
    let mut paths: Vec<PathBuf> = glob::glob(&pattern_str)
        .map_err(|e| EngineError::Config(e.to_string()))?
        .filter_map(|r| r.ok())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();
    Ok(paths)
}

async fn process_one(config: &OutboundConfig, stats: &StatsStore, path: &Path) {
    match try_send(config, path).await {
        Ok(()) => {
            stats.increment_processed(&config.name);
            dispose_success(config, path).await;
        }
        Err(e) => {
            stats.increment_errors(&config.name);
            tracing::warn!(channel = %config.name, file = %path.display(), error = %e, "outbound send failed");
            dispose_failure(config, path, &e).await;
        }
    }
}

async fn try_send(config: &OutboundConfig, path: &Path) -> Result<()> {
    let bytes = tokio::fs::read(path).await?;
    if bytes.is_empty() {
        return Err(EngineError::Transform("Empty HL7 file".to_string()));
    }

    let addr = format!("{}:{}", config.host, config.port);
    let mut stream = tokio::time::timeout(
        Duration::from_millis(config.connect_timeout_ms),
        TcpStream::connect(&addr),
    )
    .await
    .map_err(|_| EngineError::Timeout(format!("connecting to {addr}")))?
    .map_err(|source| EngineError::Bind { addr: addr.clone(), source })?;

    mllp::write(&mut stream, &bytes).await?;

    if !config.wait_for_ack {
        return Ok(());
    }

    let deadline = Duration::from_millis(config.read_timeout_ms);
    match mllp::read_one(&mut stream, mllp::DEFAULT_MAX_BYTES, deadline).await? {
        ReadOutcome::Frame(_) => Ok(()),
        ReadOutcome::Timeout => Err(EngineError::Timeout(format!("waiting for ACK from {addr}"))),
        ReadOutcome::EndOfStream => Err(EngineError::Framing(format!(
            "connection to {addr} closed before ACK"
        ))),
    }
}

async fn dispose_success(config: &OutboundConfig, path: &Path) {
    let filename = path.file_name().expect("polled entries always have a filename");

    if let Some(archive_dir) = &config.archive_dir {
        if let Err(e) = tokio::fs::create_dir_all(archive_dir).await {
            tracing::error!(channel = %config.name, error = %e, "could not create archiveDir");
            return;
        }
        let dest = archive_dir.join(filename);
        if let Err(e) = tokio::fs::rename(path, &dest).await {
            tracing::error!(channel = %config.name, error = %e, "could not archive sent file");
        }
        return;
    }

    let _ = tokio::fs::remove_file(path).await;
}

async fn dispose_failure(config: &OutboundConfig, path: &Path, err: &EngineError) {
    let filename = path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("unknown")
        .to_string();

    let Some(error_dir) = &config.error_dir else {
        tracing::warn!(channel = %config.name, file = %filename, "outbound: no errorDir configured, leaving file in place");
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
    use std::fs;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "localbridge-outbound-test-{name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn base_config(source_dir: PathBuf) -> OutboundConfig {
        OutboundConfig {
            name: "TX1".to_string(),
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 1,
            source_dir,
            pattern: "*.hl7".to_string(),
            wait_for_ack: true,
            connect_timeout_ms: 200,
            read_timeout_ms: 200,
            poll_interval_ms: 1000,
            error_dir: None,
            archive_dir: None,
            concurrent_sends: 1,
        }
    }

    #[tokio::test]
    async fn empty_file_is_a_transform_error_without_connecting() {
        let dir = scratch_dir("empty");
        let path = dir.join("empty.hl7");
        fs::write(&path, b"").unwrap();

        let config = base_config(dir.clone());
        let err = try_send(&config, &path).await.unwrap_err();
        assert!(matches!(err, EngineError::Transform(_)));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn connect_failure_surfaces_as_bind_error() {
        let dir = scratch_dir("connectfail");
        let path = dir.join("msg.hl7");
        fs::write(&path, b"MSH|^~\\&|A\r").unwrap();

        // Port 1 is reserved/unlikely to be listening in any test sandbox.
        let config = base_config(dir.clone());
        let err = try_send(&config, &path).await.unwrap_err();
        assert!(matches!(err, EngineError::Bind { .. } | EngineError::Timeout(_)));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn failure_disposition_writes_sidecar_and_moves_file() {
        let dir = scratch_dir("disposition");
        let path = dir.join("msg.hl7");
        fs::write(&path, b"MSH|^~\\&|A\r").unwrap();

        let mut config = base_config(dir.clone());
        config.error_dir = Some(dir.join("errors"));

        let err = EngineError::Timeout("waiting for ACK".to_string());
        dispose_failure(&config, &path, &err).await;

        assert!(!path.exists());
        assert!(dir.join("errors").join("msg.hl7").exists());
        assert!(dir.join("errors").join("msg.hl7.error.txt").exists());
        let sidecar = fs::read_to_string(dir.join("errors").join("msg.hl7.error.txt")).unwrap();
        assert!(sidecar.contains("TimeoutError"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn enumerate_sorts_matching_files() {
        let dir = scratch_dir("enumerate");
        fs::write(dir.join("b.hl7"), "x").unwrap();
        fs::write(dir.join("a.hl7"), "x").unwrap();
        fs::write(dir.join("c.txt"), "x").unwrap();

        let config = base_config(dir.clone());
        let entries = enumerate(&config).unwrap();
        let names: Vec<_> = entries
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.hl7", "b.hl7"]);

        fs::remove_dir_all(&dir).unwrap();
    }
}
