use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn from_env() -> anyhow::Result<Self> {
        let raw = std::env::var("SITEWATCH_LOG_FORMAT").unwrap_or_default();
        Self::parse(&raw).with_context(|| {
            format!("invalid SITEWATCH_LOG_FORMAT={raw:?}. expected one of: text, json")
        })
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("unsupported log format: {other}"),
        }
    }
}

/// Installs the stderr subscriber. `RUST_LOG` overrides the `info` default;
/// monitor runs under a scheduler usually want `SITEWATCH_LOG_FORMAT=json`.
pub fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("build log filter")?;
    let format = LogFormat::from_env()?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::LogFormat;

    #[test]
    fn parse_known_formats() {
        assert_eq!(LogFormat::parse("").unwrap(), LogFormat::Text);
        assert_eq!(LogFormat::parse(" TEXT ").unwrap(), LogFormat::Text);
        assert_eq!(LogFormat::parse("json").unwrap(), LogFormat::Json);
    }

    #[test]
    fn parse_invalid() {
        let err = LogFormat::parse("xml").unwrap_err().to_string();
        assert!(err.contains("unsupported log format"));
    }
}
