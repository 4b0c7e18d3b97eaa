use std::path::PathBuf;

/// Process-level configuration: where `conf/` lives and where the stats
/// file and transformer scripts are resolved from.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub root: PathBuf,
}

impl AppConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn translate_dir(&self) -> PathBuf {
        self.root.join("conf/channels")
    }

    pub fn inbound_dir(&self) -> PathBuf {
        self.root.join("conf/channels/Inbound")
    }

    pub fn outbound_dir(&self) -> PathBuf {
        self.root.join("conf/channels/Outbound")
    }

    pub fn transformers_dir(&self) -> PathBuf {
        self.root.join("conf/transformers")
    }

    pub fn stats_path(&self) -> PathBuf {
        self.root.join("conf/channel-stats.json")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new(".")
    }
}

/// Bind address override for inbound listeners.
pub fn listener_bind_address() -> std::net::IpAddr {
    std::env::var("LOCALBRIDGE_BIND_ADDRESS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED))
}
