use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt as _;

use crate::formats::{AdditionalResult, JobReport};
use crate::store::address_key;

const CHANGE_SUMMARY_CHARS: usize = 200;

#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    async fn alert(
        &self,
        address: &str,
        keywords: &BTreeSet<String>,
        message: &str,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ExportSink: Send + Sync {
    async fn append(
        &self,
        address: &str,
        diff_text: &str,
        keywords: &BTreeSet<String>,
        additional_results: &[AdditionalResult],
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ReportRenderer: Send + Sync {
    async fn render(
        &self,
        address: &str,
        keywords: &BTreeSet<String>,
        diff_text: &str,
        archive_path: &Path,
        additional_results: &[AdditionalResult],
    ) -> anyhow::Result<PathBuf>;
}

pub fn compose_message(report: &JobReport) -> String {
    let keywords = report
        .found_keywords
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    let mut message = format!(
        "Changes found at {}\nKeywords: [{keywords}]\nChanges:\n{}",
        report.address, report.changes
    );
    for extra in &report.additional_results {
        let found = extra
            .found_keywords
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        message.push_str(&format!("\nLinked page {}: [{found}]", extra.address));
    }
    message
}

/// Fans a report out to the downstream collaborators. Their failures are
/// logged and never returned.
#[derive(Clone, Default)]
pub struct Notifier {
    alerts: Vec<Arc<dyn AlertDispatcher>>,
    exports: Vec<Arc<dyn ExportSink>>,
    reports: Vec<Arc<dyn ReportRenderer>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alert(mut self, alert: Arc<dyn AlertDispatcher>) -> Self {
        self.alerts.push(alert);
        self
    }

    pub fn with_export(mut self, export: Arc<dyn ExportSink>) -> Self {
        self.exports.push(export);
        self
    }

    pub fn with_report(mut self, report: Arc<dyn ReportRenderer>) -> Self {
        self.reports.push(report);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty() && self.exports.is_empty() && self.reports.is_empty()
    }

    pub async fn notify(&self, report: &JobReport) {
        let message = compose_message(report);
        let address = report.address.as_str();

        for alert in &self.alerts {
            if let Err(err) = alert.alert(address, &report.found_keywords, &message).await {
                tracing::warn!(address, ?err, "alert dispatch failed");
            }
        }
        for export in &self.exports {
            if let Err(err) = export
                .append(
                    address,
                    &report.changes,
                    &report.found_keywords,
                    &report.additional_results,
                )
                .await
            {
                tracing::warn!(address, ?err, "export failed");
            }
        }
        for renderer in &self.reports {
            match renderer
                .render(
                    address,
                    &report.found_keywords,
                    &report.changes,
                    &report.archive_path,
                    &report.additional_results,
                )
                .await
            {
                Ok(path) => tracing::info!(address, report = %path.display(), "report written"),
                Err(err) => tracing::warn!(address, ?err, "report rendering failed"),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertDispatcher;

#[async_trait]
impl AlertDispatcher for TracingAlertDispatcher {
    async fn alert(
        &self,
        address: &str,
        keywords: &BTreeSet<String>,
        message: &str,
    ) -> anyhow::Result<()> {
        tracing::warn!(address, ?keywords, "{message}");
        Ok(())
    }
}

#[derive(Clone)]
pub struct WebhookAlertDispatcher {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertDispatcher {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build webhook http client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[derive(Debug, Serialize)]
struct AlertPayload<'a> {
    subject: &'a str,
    address: &'a str,
    keywords: &'a BTreeSet<String>,
    message: &'a str,
}

#[async_trait]
impl AlertDispatcher for WebhookAlertDispatcher {
    async fn alert(
        &self,
        address: &str,
        keywords: &BTreeSet<String>,
        message: &str,
    ) -> anyhow::Result<()> {
        let payload = AlertPayload {
            subject: "Site monitor alert",
            address,
            keywords,
            message,
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("send alert webhook")?;
        if resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("alert webhook failed ({status}): {body}");
    }
}

#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    timestamp: String,
    address: &'a str,
    keywords_found: String,
    change_summary: String,
    additional_results: &'a [AdditionalResult],
}

/// Appends one JSON line per notification.
#[derive(Debug, Clone)]
pub struct JsonlExportSink {
    path: PathBuf,
}

impl JsonlExportSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ExportSink for JsonlExportSink {
    async fn append(
        &self,
        address: &str,
        diff_text: &str,
        keywords: &BTreeSet<String>,
        additional_results: &[AdditionalResult],
    ) -> anyhow::Result<()> {
        let row = ExportRow {
            timestamp: chrono::Utc::now().to_rfc3339(),
            address,
            keywords_found: keywords
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", "),
            change_summary: diff_text.chars().take(CHANGE_SUMMARY_CHARS).collect(),
            additional_results,
        };
        let mut line = serde_json::to_vec(&row).context("serialize export row")?;
        line.push(b'\n');

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create export dir: {}", parent.display()))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open export log: {}", self.path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("append export row: {}", self.path.display()))?;
        file.flush().await.context("flush export log")?;
        Ok(())
    }
}

/// Writes one Markdown report per notification.
#[derive(Debug, Clone)]
pub struct MarkdownReportRenderer {
    dir: PathBuf,
}

impl MarkdownReportRenderer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ReportRenderer for MarkdownReportRenderer {
    async fn render(
        &self,
        address: &str,
        keywords: &BTreeSet<String>,
        diff_text: &str,
        archive_path: &Path,
        additional_results: &[AdditionalResult],
    ) -> anyhow::Result<PathBuf> {
        let now = chrono::Utc::now();
        let mut doc = String::new();
        doc.push_str("# Site Monitoring Report\n\n");
        doc.push_str(&format!("- Timestamp: {}\n", now.to_rfc3339()));
        doc.push_str(&format!("- Monitored address: {address}\n"));
        doc.push_str(&format!("- Archived file: {}\n\n", archive_path.display()));

        doc.push_str("## Matched keywords\n\n");
        if keywords.is_empty() {
            doc.push_str("_none_\n");
        }
        for keyword in keywords {
            doc.push_str(&format!("- {keyword}\n"));
        }

        doc.push_str("\n## Detected changes\n\n");
        if diff_text.is_empty() {
            doc.push_str("_none_\n");
        } else {
            doc.push_str(&format!("```diff\n{diff_text}\n```\n"));
        }

        if !additional_results.is_empty() {
            doc.push_str("\n## Linked pages\n\n");
            for extra in additional_results {
                let found = extra
                    .found_keywords
                    .iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                doc.push_str(&format!("- {}: {found}\n", extra.address));
            }
        }

        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create reports dir: {}", self.dir.display()))?;
        let path = self.dir.join(format!(
            "monitoring_report_{}_{}.md",
            &address_key(address)[..12],
            now.format("%Y%m%d-%H%M%S%.3f")
        ));
        fs::write(&path, doc)
            .await
            .with_context(|| format!("write report: {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::formats::TargetLog;

    fn report() -> JobReport {
        JobReport {
            address: "http://forum.example/page".to_owned(),
            title: "Forum".to_owned(),
            changes: "+<p>breach announced</p>".to_owned(),
            has_changes: true,
            keywords_configured: true,
            found_keywords: ["breach".to_owned()].into(),
            additional_results: vec![AdditionalResult {
                address: "http://mirror.onion/".to_owned(),
                found_keywords: ["breach".to_owned()].into(),
            }],
            backlinks: Vec::new(),
            archive_path: PathBuf::from("archive/a.html"),
            log: TargetLog::default(),
        }
    }

    struct FailingAlert;

    #[async_trait]
    impl AlertDispatcher for FailingAlert {
        async fn alert(&self, _: &str, _: &BTreeSet<String>, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("smtp unavailable")
        }
    }

    #[derive(Default)]
    struct RecordingAlert {
        messages: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AlertDispatcher for RecordingAlert {
        async fn alert(&self, _: &str, _: &BTreeSet<String>, message: &str) -> anyhow::Result<()> {
            if let Ok(mut messages) = self.messages.lock() {
                messages.push(message.to_owned());
            }
            Ok(())
        }
    }

    #[test]
    fn message_lists_changes_keywords_and_linked_pages() {
        let message = compose_message(&report());
        assert!(message.starts_with("Changes found at http://forum.example/page\n"));
        assert!(message.contains("Keywords: [breach]"));
        assert!(message.contains("+<p>breach announced</p>"));
        assert!(message.contains("Linked page http://mirror.onion/: [breach]"));
    }

    #[tokio::test]
    async fn failing_collaborator_does_not_stop_the_others() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let recording = Arc::new(RecordingAlert::default());
        let notifier = Notifier::new()
            .with_alert(Arc::new(FailingAlert))
            .with_alert(Arc::clone(&recording) as Arc<dyn AlertDispatcher>)
            .with_export(Arc::new(JsonlExportSink::new(temp.path().join("log.jsonl"))));

        notifier.notify(&report()).await;

        assert_eq!(recording.messages.lock().map(|m| m.len()).unwrap_or(0), 1);
        let exported = std::fs::read_to_string(temp.path().join("log.jsonl"))?;
        assert_eq!(exported.lines().count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn export_truncates_change_summary() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("reports").join("log.jsonl");
        let sink = JsonlExportSink::new(&path);
        let long_diff = "+".repeat(500);

        sink.append("a", &long_diff, &BTreeSet::new(), &[]).await?;
        sink.append("b", "-x", &BTreeSet::new(), &[]).await?;

        let contents = std::fs::read_to_string(&path)?;
        let rows: Vec<serde_json::Value> = contents
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0]["change_summary"].as_str().map(str::len),
            Some(CHANGE_SUMMARY_CHARS)
        );
        assert_eq!(rows[1]["address"], "b");
        Ok(())
    }

    #[tokio::test]
    async fn markdown_report_mentions_archive_and_keywords() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let renderer = MarkdownReportRenderer::new(temp.path());
        let report = report();

        let path = renderer
            .render(
                &report.address,
                &report.found_keywords,
                &report.changes,
                &report.archive_path,
                &report.additional_results,
            )
            .await?;
        let doc = std::fs::read_to_string(path)?;
        assert!(doc.contains("- Archived file: archive/a.html"));
        assert!(doc.contains("- breach\n"));
        assert!(doc.contains("```diff\n+<p>breach announced</p>\n```"));
        Ok(())
    }
}
