use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::Context as _;

use crate::config::MonitorConfig;
use crate::fetch::{FetchError, Fetcher, is_overlay_address, normalize_address};
use crate::formats::{
    AdditionalResult, ErrorInfo, ErrorKind, JobFailure, JobOutcome, JobReport, JobResult,
    LogUpdate, MonitorTarget, TargetLog,
};
use crate::notify::{
    JsonlExportSink, MarkdownReportRenderer, Notifier, TracingAlertDispatcher,
    WebhookAlertDispatcher,
};
use crate::retry::{RetryPolicy, Sleeper, TokioSleeper};
use crate::store::{ArchiveStore, LocalFsLogStore, LocalFsSnapshotStore, LogStore, SnapshotStore};

/// Links found on the target page are followed once; their own links are not.
pub const MAX_LINK_DEPTH: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetching,
    Extracting,
    Diffing,
    Matching,
    Enumerating,
    LoggingUpdate,
    RecursingLinks,
    Notifying,
}

/// Runs the fetch, diff, match and link pipeline for one target at a time.
/// Safe to share across tasks; the log store serializes its own updates.
pub struct Monitor {
    fetcher: Fetcher,
    snapshots: Arc<dyn SnapshotStore>,
    log: Arc<dyn LogStore>,
    notifier: Notifier,
}

impl Monitor {
    pub fn new(
        fetcher: Fetcher,
        snapshots: Arc<dyn SnapshotStore>,
        log: Arc<dyn LogStore>,
        notifier: Notifier,
    ) -> Self {
        Self {
            fetcher,
            snapshots,
            log,
            notifier,
        }
    }

    pub fn from_config(config: &MonitorConfig) -> anyhow::Result<Self> {
        Self::from_config_with_sleeper(config, Arc::new(TokioSleeper))
    }

    pub fn from_config_with_sleeper(
        config: &MonitorConfig,
        sleeper: Arc<dyn Sleeper>,
    ) -> anyhow::Result<Self> {
        let layout = &config.layout;
        let fetcher = Fetcher::new(
            &config.fetch,
            ArchiveStore::new(layout.archive_dir()),
            sleeper,
        )
        .context("build fetcher")?;

        let mut notifier = Notifier::new();
        if config.notify {
            notifier = notifier
                .with_alert(Arc::new(TracingAlertDispatcher))
                .with_export(Arc::new(JsonlExportSink::new(
                    layout.reports_dir().join("log.jsonl"),
                )))
                .with_report(Arc::new(MarkdownReportRenderer::new(layout.reports_dir())));
            if let Some(webhook) = &config.alert_webhook {
                tracing::info!(webhook = %webhook, "using webhook alert dispatcher");
                notifier = notifier.with_alert(Arc::new(
                    WebhookAlertDispatcher::new(webhook.clone()).context("build webhook alerts")?,
                ));
            }
        }

        Ok(Self::new(
            fetcher,
            Arc::new(LocalFsSnapshotStore::new(layout.snapshot_dir())),
            Arc::new(LocalFsLogStore::new(layout.log_path())),
            notifier,
        ))
    }

    pub fn log_store(&self) -> &Arc<dyn LogStore> {
        &self.log
    }

    /// Flat form of [`Monitor::run`] for schedulers and dashboards.
    pub async fn run_job(&self, target: &MonitorTarget) -> JobResult {
        JobResult::from(&self.run(target).await)
    }

    /// Never fails past this boundary: every error becomes a [`JobFailure`].
    pub async fn run(&self, target: &MonitorTarget) -> JobOutcome {
        let title = target.address.trim().to_owned();
        match self.try_run(target).await {
            Ok(report) => Ok(report),
            Err((stage, error)) => {
                tracing::error!(
                    address = %title,
                    ?stage,
                    kind = ?error.kind,
                    message = %error.message,
                    "monitor job failed"
                );
                Err(JobFailure { title, error })
            }
        }
    }

    async fn try_run(&self, target: &MonitorTarget) -> Result<JobReport, (Stage, ErrorInfo)> {
        let address = target.address.trim();
        let keywords_configured = target.has_keywords();

        tracing::debug!(address, stage = ?Stage::Fetching);
        let fetched = self
            .fetcher
            .fetch(address, target.section.as_deref())
            .await
            .map_err(|err| {
                let stage = match err {
                    FetchError::Extraction(_) => Stage::Extracting,
                    _ => Stage::Fetching,
                };
                (stage, fetch_error_info(&err))
            })?;

        tracing::debug!(address, stage = ?Stage::Diffing);
        let previous = self
            .snapshots
            .load(address)
            .await
            .map_err(|err| (Stage::Diffing, storage_error_info(&err)))?;
        let change = crate::diff::diff(previous.as_deref().unwrap_or(""), &fetched.raw_content);

        tracing::debug!(address, stage = ?Stage::Matching);
        let found_keywords =
            crate::keywords::match_keywords(&fetched.normalized_text, &target.keywords);

        tracing::debug!(address, stage = ?Stage::Enumerating);
        let backlinks = crate::links::enumerate(&fetched.document, &fetched.address);

        tracing::debug!(address, stage = ?Stage::LoggingUpdate);
        let update = LogUpdate {
            has_changes: change.has_changes,
            found_keywords: keywords_configured.then(|| found_keywords.clone()),
        };
        let log = self
            .commit(address, previous.as_deref(), &fetched.raw_content, &update)
            .await
            .map_err(|err| (Stage::LoggingUpdate, storage_error_info(&err)))?;

        let additional_results = if keywords_configured {
            tracing::debug!(address, stage = ?Stage::RecursingLinks);
            self.scan_linked_pages(&fetched.address, &backlinks, &target.keywords)
                .await
        } else {
            Vec::new()
        };

        let report = JobReport {
            address: address.to_owned(),
            title: fetched.title,
            changes: change.diff_text,
            has_changes: change.has_changes,
            keywords_configured,
            found_keywords,
            additional_results,
            backlinks,
            archive_path: fetched.storage_path,
            log,
        };

        if report.should_notify() && !self.notifier.is_empty() {
            tracing::debug!(address, stage = ?Stage::Notifying);
            self.notifier.notify(&report).await;
        }

        tracing::info!(
            address,
            has_changes = report.has_changes,
            keywords = report.found_keywords.len(),
            linked_hits = report.additional_results.len(),
            "monitor job done"
        );
        Ok(report)
    }

    /// Replaces the snapshot and updates the log entry as one unit: when the
    /// log update fails the previous snapshot is restored.
    async fn commit(
        &self,
        address: &str,
        previous: Option<&str>,
        current: &str,
        update: &LogUpdate,
    ) -> anyhow::Result<TargetLog> {
        self.snapshots
            .store(address, current)
            .await
            .context("replace snapshot")?;

        match self.log.upsert(address, update).await {
            Ok(entry) => Ok(entry),
            Err(err) => {
                let restored = match previous {
                    Some(previous) => self.snapshots.store(address, previous).await,
                    None => self.snapshots.remove(address).await,
                };
                if let Err(restore_err) = restored {
                    tracing::error!(address, ?restore_err, "failed to restore snapshot");
                }
                Err(err).context("update target log")
            }
        }
    }

    /// Breadth-first scan of overlay links, bounded by [`MAX_LINK_DEPTH`].
    /// Failures are logged and skipped.
    async fn scan_linked_pages(
        &self,
        origin: &str,
        links: &[String],
        keywords: &BTreeSet<String>,
    ) -> Vec<AdditionalResult> {
        let policy = RetryPolicy::single_shot();
        let mut visited: HashSet<String> = HashSet::from([canonical(origin)]);
        let mut worklist: VecDeque<(String, u32)> = links
            .iter()
            .filter(|link| is_overlay_address(link))
            .map(|link| (link.clone(), 1))
            .collect();

        let mut results = Vec::new();
        while let Some((link, depth)) = worklist.pop_front() {
            if depth > MAX_LINK_DEPTH || !visited.insert(canonical(&link)) {
                continue;
            }

            let page = match self.fetcher.fetch_with_policy(&link, None, &policy).await {
                Ok(page) => page,
                Err(err) => {
                    tracing::warn!(link = %link, %err, "skipping linked page");
                    continue;
                }
            };

            let found = crate::keywords::match_keywords(&page.normalized_text, keywords);
            if !found.is_empty() {
                results.push(AdditionalResult {
                    address: link.clone(),
                    found_keywords: found,
                });
            }

            if depth < MAX_LINK_DEPTH {
                for next in crate::links::enumerate(&page.document, &page.address) {
                    if is_overlay_address(&next) {
                        worklist.push_back((next, depth + 1));
                    }
                }
            }
        }
        results
    }
}

fn canonical(address: &str) -> String {
    normalize_address(address)
        .map(|url| url.to_string())
        .unwrap_or_else(|_| address.trim().to_owned())
}

fn fetch_error_info(err: &FetchError) -> ErrorInfo {
    let (kind, attempts) = match err {
        FetchError::InvalidAddress { .. } => (ErrorKind::InvalidAddress, None),
        FetchError::ExhaustedRetries { attempts, .. } => {
            (ErrorKind::ExhaustedRetries, Some(*attempts))
        }
        FetchError::Extraction(_) => (ErrorKind::Extraction, None),
        FetchError::Archive(_) => (ErrorKind::Storage, None),
    };
    ErrorInfo {
        kind,
        message: err.to_string(),
        attempts,
    }
}

fn storage_error_info(err: &anyhow::Error) -> ErrorInfo {
    ErrorInfo {
        kind: ErrorKind::Storage,
        message: format!("{err:#}"),
        attempts: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractionError;
    use crate::fetch::AttemptError;

    #[test]
    fn exhausted_retries_keep_attempt_count() {
        let info = fetch_error_info(&FetchError::ExhaustedRetries {
            attempts: 5,
            last_error: AttemptError::Status(503),
        });
        assert_eq!(info.kind, ErrorKind::ExhaustedRetries);
        assert_eq!(info.attempts, Some(5));
        assert!(info.message.contains("exhausted retries"));
    }

    #[test]
    fn extraction_errors_map_to_extraction_kind() {
        let info = fetch_error_info(&FetchError::Extraction(ExtractionError::SectionNotFound(
            "news".to_owned(),
        )));
        assert_eq!(info.kind, ErrorKind::Extraction);
        assert_eq!(info.attempts, None);
    }

    #[test]
    fn canonical_form_ignores_missing_scheme() {
        assert_eq!(canonical("abc.onion"), canonical("http://abc.onion/"));
    }
}
