use clap::Parser;

/// Local reverse proxy for the Anthropic Messages API.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "bridge.config.json")]
    pub config: std::path::PathBuf,

    /// Overrides the bind address from the config file.
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Log filter directive string, e.g. `info` or `bridge_core=debug,info`.
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Overrides the Direct-mode upstream base URL from the config file.
    #[arg(long, env = "ANTHROPIC_BASE_URL")]
    pub anthropic_base_url: Option<String>,

    /// Overrides the Translated-mode upstream base URL from the config file.
    #[arg(long, env = "OPENROUTER_BASE_URL")]
    pub openrouter_base_url: Option<String>,

    /// Overrides the upstream request timeout, in seconds, from the config file.
    #[arg(long, env = "REQUEST_TIMEOUT")]
    pub request_timeout: Option<u64>,
}
