use anyhow::{Context, Result};
use std::time::Duration;

use git_cookie_authdaemon::auth::{self, CredentialStore, RefreshScheduler, Scope};
use git_cookie_authdaemon::config::Config;
use git_cookie_authdaemon::daemon;
use git_cookie_authdaemon::git_config::GitConfigAdapter;
use git_cookie_authdaemon::metadata::MetadataClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(config.debug)
        .with_line_number(config.debug)
        .init();

    tracing::info!("git-cookie-authdaemon {} starting", env!("CARGO_PKG_VERSION"));
    tracing::debug!("Cookie file: {}", config.cookie_file.display());
    tracing::debug!("Metadata server: {}", config.metadata_url);

    let store = CredentialStore::new(&config.cookie_file);
    let metadata = MetadataClient::new(config.metadata_url.clone())?;
    let refresh_margin = Duration::from_secs(config.refresh_margin);
    let retry_interval = Duration::from_secs(config.retry_interval);

    // Detached child: the parent already configured git and primed the cookie
    if let Some(handoff) = &config.handoff {
        tracing::info!("Resuming refresh loop (cookie expires at {})", handoff.expires_at);
        let mut scheduler = RefreshScheduler::new(
            metadata,
            Scope::new(handoff.scope.clone()),
            store,
            config.domains.clone(),
            refresh_margin,
            retry_interval,
        )
        .resume_at(handoff.expires_at);
        let guard = scheduler.store().cleanup_guard();

        daemon::run_until_shutdown(&mut scheduler, guard, daemon::shutdown_signal()).await?;
        tracing::info!("Shutdown complete");
        return Ok(());
    }

    // A failed pointer write still leaves a usable cookie file
    if config.configure_git {
        let git = GitConfigAdapter::new(&config.git_binary);
        if let Err(e) = git.point_client_at(store.path()).await {
            tracing::warn!("Could not configure git: {}", e);
        }
    }

    let scope = auth::select_scope(&metadata)
        .await
        .context("Startup failed: no usable scope on this VM")?;

    let mut scheduler = RefreshScheduler::new(
        metadata,
        scope.clone(),
        store,
        config.domains.clone(),
        refresh_margin,
        retry_interval,
    );

    let expires_at = scheduler
        .prime()
        .await
        .context("Startup failed: could not obtain the first token")?;

    // Armed only once this process has written the cookie
    let mut guard = scheduler.store().cleanup_guard();

    if config.debug {
        println!("Cookie file: {}", config.cookie_file.display());
        println!("Expires at:  {}", expires_at);
    }

    if !config.foreground {
        let pid = daemon::detach(&scope, expires_at)?;
        // The child owns the cookie file from here on
        guard.disarm();
        tracing::info!("Running in background (pid {})", pid);
        return Ok(());
    }

    daemon::run_until_shutdown(&mut scheduler, guard, daemon::shutdown_signal()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
