use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::formats::{JobResult, MonitorTarget, TargetsFile};
use crate::monitor::Monitor;

pub async fn load_targets(path: &Path) -> anyhow::Result<Vec<MonitorTarget>> {
    let yaml = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read targets file: {}", path.display()))?;
    let file: TargetsFile = serde_yaml::from_str(&yaml)
        .with_context(|| format!("parse targets file: {}", path.display()))?;
    Ok(file.targets)
}

/// Runs every target once, at most `max_concurrency` at a time. Results keep
/// the order of `targets`.
pub async fn run_all(
    monitor: Arc<Monitor>,
    targets: Vec<MonitorTarget>,
    max_concurrency: usize,
) -> anyhow::Result<Vec<(MonitorTarget, JobResult)>> {
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for (index, target) in targets.into_iter().enumerate() {
        let monitor = Arc::clone(&monitor);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .context("batch semaphore is closed")?;
            let result = monitor.run_job(&target).await;
            anyhow::Ok((index, target, result))
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let (index, target, result) = joined.context("join monitor task")??;
        results.push((index, target, result));
    }
    results.sort_by_key(|(index, _, _)| *index);

    Ok(results
        .into_iter()
        .map(|(_, target, result)| (target, result))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_targets_file() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("targets.yaml");
        std::fs::write(
            &path,
            r#"targets:
  - address: abc.onion
    keywords: [breach, leak]
    section: news
  - address: https://example.com
"#,
        )?;

        let targets = load_targets(&path).await?;
        assert_eq!(targets.len(), 2);
        assert_eq!(
            targets[0],
            MonitorTarget::new("abc.onion")
                .with_keywords(["breach", "leak"])
                .with_section("news")
        );
        assert!(targets[1].keywords.is_empty());
        assert_eq!(targets[1].section, None);
        Ok(())
    }

    #[tokio::test]
    async fn missing_targets_file_is_reported() {
        let err = load_targets(Path::new("does/not/exist.yaml"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("read targets file"));
    }
}
