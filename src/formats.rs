use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One monitored resource as configured by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorTarget {
    pub address: String,
    #[serde(default)]
    pub keywords: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

impl MonitorTarget {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            keywords: BTreeSet::new(),
            section: None,
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    /// True when at least one non-blank keyword is configured.
    pub fn has_keywords(&self) -> bool {
        self.keywords.iter().any(|kw| !kw.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Overlay,
    Direct,
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Normalized address that was requested.
    pub address: String,
    /// Serialized section (or whole document) used as the diff view.
    pub raw_content: String,
    /// Markup-free, whitespace-collapsed text used for keyword matching.
    pub normalized_text: String,
    pub title: String,
    /// Full response body, kept for link discovery.
    pub document: String,
    pub storage_path: PathBuf,
    pub transport: Transport,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub diff_text: String,
    pub has_changes: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetLog {
    pub changes_count: u64,
    pub keywords_count: u64,
    pub last_keywords: BTreeSet<String>,
}

/// Effect of one successful run on a target's log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogUpdate {
    pub has_changes: bool,
    /// `None` when the target has no keywords configured.
    pub found_keywords: Option<BTreeSet<String>>,
}

impl TargetLog {
    pub fn apply(&mut self, update: &LogUpdate) {
        if update.has_changes {
            self.changes_count = self.changes_count.saturating_add(1);
        }
        if let Some(found) = &update.found_keywords {
            self.keywords_count = self.keywords_count.saturating_add(found.len() as u64);
            self.last_keywords = found.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalResult {
    pub address: String,
    pub found_keywords: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidAddress,
    ExhaustedRetries,
    Extraction,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

/// Successful outcome of one monitoring run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub address: String,
    pub title: String,
    pub changes: String,
    pub has_changes: bool,
    pub keywords_configured: bool,
    pub found_keywords: BTreeSet<String>,
    pub additional_results: Vec<AdditionalResult>,
    pub backlinks: Vec<String>,
    pub archive_path: PathBuf,
    pub log: TargetLog,
}

impl JobReport {
    /// Alerts re-fire on every run with keyword hits, not only when they change.
    pub fn should_notify(&self) -> bool {
        self.has_changes
            || (self.keywords_configured
                && (!self.found_keywords.is_empty() || !self.additional_results.is_empty()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub title: String,
    pub error: ErrorInfo,
}

pub type JobOutcome = Result<JobReport, JobFailure>;

/// Flat result handed to schedulers and dashboards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub changes: String,
    pub found_keywords: BTreeSet<String>,
    pub additional_results: Vec<AdditionalResult>,
    pub title: String,
    pub backlinks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl From<&JobOutcome> for JobResult {
    fn from(outcome: &JobOutcome) -> Self {
        match outcome {
            Ok(report) => Self {
                changes: report.changes.clone(),
                found_keywords: report.found_keywords.clone(),
                additional_results: report.additional_results.clone(),
                title: report.title.clone(),
                backlinks: report.backlinks.clone(),
                error: None,
            },
            Err(failure) => Self {
                title: failure.title.clone(),
                error: Some(failure.error.clone()),
                ..Self::default()
            },
        }
    }
}

/// Targets file consumed by `sitewatch batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetsFile {
    pub targets: Vec<MonitorTarget>,
}
