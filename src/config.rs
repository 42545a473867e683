use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;

use crate::retry::RetryPolicy;

pub const DEFAULT_OVERLAY_PROXY: &str = "socks5h://127.0.0.1:9050";
pub const OVERLAY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DIRECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub overlay_proxy: String,
    pub overlay_timeout: Duration,
    pub direct_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            overlay_proxy: DEFAULT_OVERLAY_PROXY.to_owned(),
            overlay_timeout: OVERLAY_TIMEOUT,
            direct_timeout: DIRECT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl FetchConfig {
    /// Reads `SITEWATCH_OVERLAY_PROXY`, keeping the local Tor default otherwise.
    pub fn from_env(retry: RetryPolicy) -> anyhow::Result<Self> {
        let overlay_proxy = match std::env::var("SITEWATCH_OVERLAY_PROXY") {
            Ok(raw) if !raw.trim().is_empty() => {
                let proxy = raw.trim().to_owned();
                url::Url::parse(&proxy).with_context(|| {
                    format!("invalid SITEWATCH_OVERLAY_PROXY={raw:?}. expected a socks5h:// url")
                })?;
                proxy
            }
            _ => DEFAULT_OVERLAY_PROXY.to_owned(),
        };
        Ok(Self {
            overlay_proxy,
            retry,
            ..Self::default()
        })
    }
}

/// On-disk layout of everything a monitor persists.
#[derive(Debug, Clone)]
pub struct DataLayout {
    pub data_dir: PathBuf,
}

impl DataLayout {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.data_dir.join("archive")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("monitor_log.json")
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub layout: DataLayout,
    pub fetch: FetchConfig,
    pub notify: bool,
    pub alert_webhook: Option<String>,
}

impl MonitorConfig {
    pub fn from_env(
        data_dir: impl Into<PathBuf>,
        retry: RetryPolicy,
        notify: bool,
    ) -> anyhow::Result<Self> {
        let alert_webhook = std::env::var("SITEWATCH_ALERT_WEBHOOK")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        Ok(Self {
            layout: DataLayout::new(data_dir),
            fetch: FetchConfig::from_env(retry).context("fetch config")?,
            notify,
            alert_webhook,
        })
    }
}
