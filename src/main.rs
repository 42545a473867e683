use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser as _;

use sitewatch::cli::{Command, JobArgs};
use sitewatch::config::{DataLayout, MonitorConfig};
use sitewatch::formats::MonitorTarget;
use sitewatch::monitor::Monitor;
use sitewatch::retry::RetryPolicy;
use sitewatch::store::{LocalFsLogStore, LogStore as _};

#[tokio::main]
async fn main() -> ExitCode {
    match try_main().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns `false` when a monitoring job reported an error.
async fn try_main() -> anyhow::Result<bool> {
    sitewatch::logging::init().context("init logging")?;

    let cli = sitewatch::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        Command::Run(args) => {
            let monitor = build_monitor(&args.job)?;
            let mut target = MonitorTarget::new(args.url)
                .with_keywords(args.keywords.into_iter().map(|kw| kw.trim().to_owned()));
            target.section = args.section;

            let result = monitor.run_job(&target).await;
            print_json(&result)?;
            Ok(result.error.is_none())
        }
        Command::Batch(args) => {
            let targets = sitewatch::batch::load_targets(&PathBuf::from(&args.targets))
                .await
                .context("load targets")?;
            let monitor = Arc::new(build_monitor(&args.job)?);
            let results = sitewatch::batch::run_all(monitor, targets, args.concurrency)
                .await
                .context("batch")?;

            let all_ok = results.iter().all(|(_, result)| result.error.is_none());
            let rows = results
                .into_iter()
                .map(|(target, result)| {
                    serde_json::json!({ "address": target.address, "result": result })
                })
                .collect::<Vec<_>>();
            print_json(&rows)?;
            Ok(all_ok)
        }
        Command::Log(args) => {
            let layout = DataLayout::new(&args.store.data_dir);
            let log = LocalFsLogStore::new(layout.log_path())
                .load_log()
                .await
                .context("load target log")?;
            print_json(&log)?;
            Ok(true)
        }
    }
}

fn build_monitor(args: &JobArgs) -> anyhow::Result<Monitor> {
    let retry = RetryPolicy::default()
        .with_max_attempts(args.max_attempts)
        .with_base_delay(Duration::from_secs(args.backoff_base_secs));
    let config = MonitorConfig::from_env(&args.store.data_dir, retry, !args.no_notify)
        .context("load config")?;
    tracing::debug!(?config, "monitor config");
    Monitor::from_config(&config).context("build monitor")
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value).context("write json")?;
    stdout.write_all(b"\n").context("write newline")?;
    Ok(())
}
