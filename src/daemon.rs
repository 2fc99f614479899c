// Process lifecycle: detaching, signals, and the shutdown-aware run loop

use std::ffi::OsString;
use std::future::Future;
use std::process::Stdio;

use crate::auth::{CleanupGuard, RefreshScheduler, Scope};
use crate::error::{DaemonError, Result};
use crate::metadata::MetadataSource;

/// Flag appended to the re-executed child so it does not detach again
pub const FOREGROUND_FLAG: &str = "--foreground";

/// Flags carrying the primed state to the child
pub const PRIMED_SCOPE_FLAG: &str = "--primed-scope";
pub const PRIMED_EXPIRES_AT_FLAG: &str = "--primed-expires-at";

#[cfg(windows)]
const DETACHED_PROCESS: u32 = 0x0000_0008;
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Arguments for the detached child
///
/// The parent's own arguments, `--foreground`, and the primed scope and
/// expiry so the child starts in Steady instead of priming again.
pub fn child_args<I>(parent_args: I, scope: &Scope, expires_at: i64) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut args: Vec<OsString> = parent_args.into_iter().collect();
    args.push(FOREGROUND_FLAG.into());
    args.push(PRIMED_SCOPE_FLAG.into());
    args.push(scope.as_str().into());
    args.push(PRIMED_EXPIRES_AT_FLAG.into());
    args.push(expires_at.to_string().into());
    args
}

/// Start a copy of this executable in the background; returns its pid
///
/// The child gets [`child_args`], no stdio, and on Unix its own process
/// group so terminal hangups do not reach it.
pub fn detach(scope: &Scope, expires_at: i64) -> Result<u32> {
    let exe = std::env::current_exe()
        .map_err(|e| DaemonError::Detach(format!("cannot locate executable: {}", e)))?;

    let mut cmd = std::process::Command::new(exe);
    cmd.args(child_args(std::env::args_os().skip(1), scope, expires_at))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(DETACHED_PROCESS | CREATE_NO_WINDOW);
    }

    let child = cmd
        .spawn()
        .map_err(|e| DaemonError::Detach(format!("spawn failed: {}", e)))?;

    Ok(child.id())
}

/// Run the refresh loop until `shutdown` completes, then clean up
///
/// Returns an error only when priming fails. Nothing was written on that
/// path, so the guard is disarmed and an existing cookie file stays.
pub async fn run_until_shutdown<M, F>(
    scheduler: &mut RefreshScheduler<M>,
    mut guard: CleanupGuard,
    shutdown: F,
) -> Result<()>
where
    M: MetadataSource,
    F: Future<Output = ()>,
{
    tokio::select! {
        result = scheduler.run() => {
            if let Err(e) = result {
                guard.disarm();
                return Err(e);
            }
        }
        _ = shutdown => {}
    }

    guard.cleanup();
    tracing::info!("Removed {}", scheduler.store().path().display());
    Ok(())
}

/// Resolves on Ctrl+C, SIGTERM or SIGHUP
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(mut term), Ok(mut hup)) => {
                tokio::select! {
                    _ = term.recv() => tracing::info!("Received terminate signal"),
                    _ = hup.recv() => tracing::info!("Received hangup signal"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, shutting down...");
        },
        _ = terminate => {
            tracing::info!("Shutting down...");
        },
    }
}
