// Points git at the cookie file through `http.cookiefile`

use std::ffi::OsString;
use std::path::Path;
use tokio::process::Command;

use crate::error::{DaemonError, Result};

/// Git configuration key that names the cookie jar
pub const COOKIE_FILE_KEY: &str = "http.cookiefile";

/// Reads and writes the user's global `http.cookiefile`
#[derive(Debug, Clone)]
pub struct GitConfigAdapter {
    program: OsString,

    /// Arguments placed before `config ...`
    prefix: Vec<OsString>,
}

impl GitConfigAdapter {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            prefix: Vec::new(),
        }
    }

    /// Current value of the key, `None` when unset
    pub async fn current(&self) -> Result<Option<String>> {
        let output = self
            .command()
            .args(["config", "--global", "--get", COOKIE_FILE_KEY])
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        // git exits 1 when the key is missing
        match output.status.code() {
            Some(0) => {
                let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
                Ok(Some(value))
            }
            Some(1) => Ok(None),
            _ => Err(DaemonError::GitConfig(format!(
                "git config --get exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }

    /// Set the key to `path` unless it already has that value
    pub async fn point_client_at(&self, path: &Path) -> Result<()> {
        let wanted = path.to_string_lossy();

        if let Ok(Some(current)) = self.current().await {
            if current == wanted {
                tracing::debug!("{} already set to {}", COOKIE_FILE_KEY, wanted);
                return Ok(());
            }
        }

        let output = self
            .command()
            .args(["config", "--global", COOKIE_FILE_KEY])
            .arg(path)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            return Err(DaemonError::GitConfig(format!(
                "git config exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        tracing::info!("Set git {} to {}", COOKIE_FILE_KEY, wanted);
        Ok(())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix);
        cmd
    }

    fn spawn_error(&self, e: std::io::Error) -> DaemonError {
        DaemonError::GitConfig(format!(
            "failed to run {}: {}",
            self.program.to_string_lossy(),
            e
        ))
    }
}
