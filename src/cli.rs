use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the monitoring job once for a single target.
    Run(RunArgs),
    /// Run every target of a targets file once, concurrently.
    Batch(BatchArgs),
    /// Print the accumulated per-target log.
    Log(LogArgs),
}

#[derive(Debug, Args)]
pub struct StoreArgs {
    /// Directory holding archive/, snapshots/, reports/ and monitor_log.json.
    #[arg(long, default_value = "monitor-data")]
    pub data_dir: String,
}

#[derive(Debug, Args)]
pub struct JobArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Fetch attempts before giving up.
    #[arg(long, default_value_t = 5)]
    pub max_attempts: u32,

    /// First backoff delay; doubles after every failed attempt.
    #[arg(long, default_value_t = 5)]
    pub backoff_base_secs: u64,

    /// Skip alerts, exports and reports.
    #[arg(long)]
    pub no_notify: bool,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Target address (`.onion` hosts go through the overlay proxy).
    #[arg(long)]
    pub url: String,

    /// Keyword to look for (repeatable or comma-separated).
    #[arg(long = "keyword", value_delimiter = ',')]
    pub keywords: Vec<String>,

    /// Element id to narrow the page to.
    #[arg(long)]
    pub section: Option<String>,

    #[command(flatten)]
    pub job: JobArgs,
}

#[derive(Debug, Args)]
pub struct BatchArgs {
    /// YAML file with a `targets` list.
    #[arg(long)]
    pub targets: String,

    /// Maximum targets monitored at the same time.
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    #[command(flatten)]
    pub job: JobArgs,
}

#[derive(Debug, Args)]
pub struct LogArgs {
    #[command(flatten)]
    pub store: StoreArgs,
}
