use std::sync::Arc;

use anyhow::Context as _;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, USER_AGENT};
use url::Url;

use crate::config::FetchConfig;
use crate::extract::{ExtractionError, extract};
use crate::formats::{FetchResult, Transport};
use crate::retry::{RetryPolicy, Sleeper};
use crate::store::ArchiveStore;

pub const OVERLAY_SUFFIX: &str = ".onion";

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; rv:128.0) Gecko/20100101 Firefox/128.0";

/// Lowercase phrases served by queue pages and anti-bot interstitials.
const TRANSIENT_MARKERS: &[&str] = &[
    "you are in the queue",
    "you are in queue",
    "your position in the queue",
    "still loading",
    "please wait while",
    "checking your browser",
    "ddos protection",
    "are you a robot",
    "complete the captcha",
];

/// A single failed attempt. Always retried while attempts remain.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AttemptError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("transient page detected ({0:?})")]
    TransientPage(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("exhausted retries after {attempts} attempts: {last_error}")]
    ExhaustedRetries {
        attempts: u32,
        last_error: AttemptError,
    },
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("archive fetched content: {0:#}")]
    Archive(anyhow::Error),
}

/// True for addresses whose host lives on the overlay network.
pub fn is_overlay_address(address: &str) -> bool {
    let trimmed = address.trim();
    let parsed_host = Url::parse(trimmed)
        .ok()
        .and_then(|url| url.host_str().map(str::to_ascii_lowercase));
    if let Some(host) = parsed_host {
        return host.ends_with(OVERLAY_SUFFIX);
    }
    let host = trimmed
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .rsplit('@')
        .next()
        .unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default();
    host.to_ascii_lowercase().ends_with(OVERLAY_SUFFIX)
}

pub fn select_transport(address: &str) -> Transport {
    if is_overlay_address(address) {
        Transport::Overlay
    } else {
        Transport::Direct
    }
}

/// Parses `address`, assuming `http://` when no scheme is given.
pub fn normalize_address(address: &str) -> Result<Url, FetchError> {
    let trimmed = address.trim();
    let invalid = |reason: String| FetchError::InvalidAddress {
        address: address.to_owned(),
        reason,
    };
    if trimmed.is_empty() {
        return Err(invalid("address is empty".to_owned()));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_owned()
    } else {
        format!("http://{trimmed}")
    };
    let url = Url::parse(&candidate).map_err(|err| invalid(err.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(invalid("address must have a host".to_owned()));
    }
    Ok(url)
}

pub fn detect_transient_page(body: &str) -> Option<&'static str> {
    let lower = body.to_lowercase();
    TRANSIENT_MARKERS
        .iter()
        .copied()
        .find(|marker| lower.contains(marker))
}

pub struct Fetcher {
    direct: reqwest::Client,
    overlay: reqwest::Client,
    archive: ArchiveStore,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl Fetcher {
    pub fn new(
        config: &FetchConfig,
        archive: ArchiveStore,
        sleeper: Arc<dyn Sleeper>,
    ) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        let direct = reqwest::Client::builder()
            .timeout(config.direct_timeout)
            .default_headers(headers)
            .no_proxy()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build direct http client")?;

        let proxy = reqwest::Proxy::all(config.overlay_proxy.as_str())
            .with_context(|| format!("configure overlay proxy: {}", config.overlay_proxy))?;
        let overlay = reqwest::Client::builder()
            .timeout(config.overlay_timeout)
            .proxy(proxy)
            .user_agent(BROWSER_USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build overlay http client")?;

        Ok(Self {
            direct,
            overlay,
            archive,
            policy: config.retry.clone(),
            sleeper,
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn fetch(
        &self,
        address: &str,
        section: Option<&str>,
    ) -> Result<FetchResult, FetchError> {
        self.fetch_with_policy(address, section, &self.policy).await
    }

    pub async fn fetch_with_policy(
        &self,
        address: &str,
        section: Option<&str>,
        policy: &RetryPolicy,
    ) -> Result<FetchResult, FetchError> {
        let url = normalize_address(address)?;
        let transport = select_transport(url.as_str());

        let mut attempt = 1_u32;
        let document = loop {
            match self.attempt(transport, &url).await {
                Ok(body) => break body,
                Err(err) => {
                    let backoff = policy.after_failure(attempt);
                    tracing::warn!(
                        address = %url,
                        attempt,
                        delay_secs = backoff.delay.as_secs_f64(),
                        %err,
                        "fetch attempt failed; backing off"
                    );
                    if !backoff.delay.is_zero() {
                        self.sleeper.sleep(backoff.delay).await;
                    }
                    match backoff.next_attempt {
                        Some(next) => attempt = next,
                        None => {
                            return Err(FetchError::ExhaustedRetries {
                                attempts: attempt,
                                last_error: err,
                            });
                        }
                    }
                }
            }
        };

        let extracted = extract(&document, section, address.trim())?;
        let storage_path = self
            .archive
            .write(address.trim(), &extracted.raw_view, chrono::Utc::now())
            .await
            .map_err(FetchError::Archive)?;
        tracing::info!(
            address = %url,
            ?transport,
            attempt,
            archive = %storage_path.display(),
            "fetched"
        );

        Ok(FetchResult {
            address: url.to_string(),
            raw_content: extracted.raw_view,
            normalized_text: extracted.normalized_text,
            title: extracted.title,
            document,
            storage_path,
            transport,
            attempts: attempt,
        })
    }

    async fn attempt(&self, transport: Transport, url: &Url) -> Result<String, AttemptError> {
        let client = match transport {
            Transport::Overlay => &self.overlay,
            Transport::Direct => &self.direct,
        };

        let response = client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| AttemptError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::Status(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|err| AttemptError::Transport(err.to_string()))?;
        if let Some(marker) = detect_transient_page(&body) {
            return Err(AttemptError::TransientPage(marker));
        }
        Ok(body)
    }
}
