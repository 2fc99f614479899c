use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use crate::error::DaemonError;
use crate::metadata::{service_account_url, DEFAULT_METADATA_HOST};

/// Domains the daemon writes the cookie for
pub const DEFAULT_DOMAINS: [&str; 2] = [".googlesource.com", "source.developers.google.com"];

/// Keeps git's cookie file filled with a fresh token from the GCE metadata server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Cookie file git reads (default: ~/.git-credential-cache/cookie)
    #[arg(short, long, env = "GIT_COOKIE_FILE")]
    pub cookie_file: Option<String>,

    /// Metadata server host
    #[arg(long, env = "GCE_METADATA_HOST", default_value = DEFAULT_METADATA_HOST)]
    pub metadata_host: String,

    /// Full service-account base URL (overrides --metadata-host)
    #[arg(long, env = "METADATA_URL")]
    pub metadata_url: Option<String>,

    /// Service account whose token is used
    #[arg(long, env = "METADATA_SERVICE_ACCOUNT", default_value = "default")]
    pub service_account: String,

    /// Cookie domains (repeat or comma-separate)
    #[arg(
        short,
        long = "domain",
        env = "COOKIE_DOMAINS",
        value_delimiter = ',',
        default_values = DEFAULT_DOMAINS
    )]
    pub domains: Vec<String>,

    /// Seconds before expiry to refresh
    #[arg(long, env = "REFRESH_MARGIN", default_value = "25")]
    pub refresh_margin: u64,

    /// Seconds between failed attempts
    #[arg(long, env = "RETRY_INTERVAL", default_value = "5")]
    pub retry_interval: u64,

    /// Stay attached to the terminal
    #[arg(short, long, visible_alias = "nofork")]
    pub foreground: bool,

    /// Verbose diagnostics
    #[arg(long)]
    pub debug: bool,

    /// Leave git's http.cookiefile alone
    #[arg(long)]
    pub skip_git_config: bool,

    /// git executable
    #[arg(long, env = "GIT_BINARY", default_value = "git")]
    pub git_binary: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Scope the detaching parent already primed with
    #[arg(long, hide = true, requires = "primed_expires_at")]
    pub primed_scope: Option<String>,

    /// Expiry of the cookie the detaching parent wrote (Unix seconds)
    #[arg(long, hide = true, requires = "primed_scope")]
    pub primed_expires_at: Option<i64>,
}

/// Startup state a detached child inherits from its parent
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handoff {
    pub scope: String,
    pub expires_at: i64,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Cookie file
    pub cookie_file: PathBuf,
    pub domains: Vec<String>,

    // Metadata server
    pub metadata_url: String,

    // Timing (seconds)
    pub refresh_margin: u64,
    pub retry_interval: u64,

    // Process
    pub foreground: bool,
    pub configure_git: bool,
    pub git_binary: String,

    // Debug
    pub debug: bool,
    pub log_level: String,

    // Set only in the detached child
    pub handoff: Option<Handoff>,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    /// Build configuration from parsed arguments
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let cookie_file = match args.cookie_file {
            Some(path) => expand_tilde(&path),
            None => default_cookie_file()?,
        };

        let metadata_url = args
            .metadata_url
            .unwrap_or_else(|| service_account_url(&args.metadata_host, &args.service_account));

        let domains = args
            .domains
            .into_iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();

        let handoff = match (args.primed_scope, args.primed_expires_at) {
            (Some(scope), Some(expires_at)) => Some(Handoff { scope, expires_at }),
            _ => None,
        };

        Ok(Config {
            cookie_file,
            domains,
            metadata_url,
            refresh_margin: args.refresh_margin,
            retry_interval: args.retry_interval,
            foreground: args.foreground,
            configure_git: !args.skip_git_config,
            git_binary: args.git_binary,
            log_level: if args.debug {
                "debug".to_string()
            } else {
                args.log_level
            },
            debug: args.debug,
            handoff,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.domains.is_empty() {
            anyhow::bail!("At least one cookie domain is required");
        }

        if self.retry_interval == 0 {
            anyhow::bail!("RETRY_INTERVAL must be at least 1 second");
        }

        // git stores the path verbatim, so it must not depend on the working directory
        if !self.cookie_file.is_absolute() {
            anyhow::bail!(
                "Cookie file must be an absolute path: {}",
                self.cookie_file.display()
            );
        }

        if self.cookie_file.file_name().is_none() {
            anyhow::bail!(
                "Cookie file has no file name: {}",
                self.cookie_file.display()
            );
        }

        Ok(())
    }
}

/// `~/.git-credential-cache/cookie`
pub fn default_cookie_file() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".git-credential-cache").join("cookie"))
        .ok_or_else(|| {
            DaemonError::MissingEnvironment(
                "cannot determine home directory".to_string(),
            )
        })
        .context("Set --cookie-file or GIT_COOKIE_FILE")
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
