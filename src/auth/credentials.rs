// Cookie-jar persistence for the access token

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::types::Token;
use crate::error::{DaemonError, Result};

/// Cookie name the git hosts read the token from
const COOKIE_NAME: &str = "o";

/// First line of a Netscape cookie file; curl refuses files without it
const COOKIE_FILE_HEADER: &str = "# HTTP Cookie File";

/// Writes the token into a cookie file with atomic replace semantics
#[derive(Debug, Clone)]
pub struct CredentialStore {
    /// Final cookie file path
    path: PathBuf,

    /// Sibling staging path in the same directory
    tmp_path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "cookie".to_string());
        let tmp_path = path.with_file_name(format!("{}.tmp", file_name));
        Self { path, tmp_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    /// Render the cookie file contents for `domains`
    pub fn render(token: &Token, domains: &[String], now: i64) -> String {
        let expires_at = token.expires_at(now);
        let mut out = String::with_capacity(64 + domains.len() * (token.access_token.len() + 64));
        out.push_str(COOKIE_FILE_HEADER);
        out.push('\n');
        for domain in domains {
            let include_subdomains = if domain.starts_with('.') { "TRUE" } else { "FALSE" };
            out.push_str(&format!(
                "{}\t{}\t/\tTRUE\t{}\t{}\t{}\n",
                domain, include_subdomains, expires_at, COOKIE_NAME, token.access_token
            ));
        }
        out
    }

    /// Write and atomically install the cookie file; returns the absolute expiry
    pub fn write(&self, token: &Token, domains: &[String], now: i64) -> Result<i64> {
        self.stage(token, domains, now)?;
        self.commit()?;

        let expires_at = token.expires_at(now);
        tracing::debug!(
            "Wrote cookie file {} (expires at {})",
            self.path.display(),
            expires_at
        );
        Ok(expires_at)
    }

    /// Write the complete cookie file to the staging path
    pub fn stage(&self, token: &Token, domains: &[String], now: i64) -> Result<()> {
        self.ensure_dir()?;

        // Stale staging file from an earlier crash may carry wider permissions
        match fs::remove_file(&self.tmp_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(DaemonError::io(&self.tmp_path, e)),
        }

        let contents = Self::render(token, domains, now);

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(&self.tmp_path)
            .map_err(|e| DaemonError::io(&self.tmp_path, e))?;
        file.write_all(contents.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| DaemonError::io(&self.tmp_path, e))?;

        Ok(())
    }

    /// Replace the final path with the staged file
    pub fn commit(&self) -> Result<()> {
        fs::rename(&self.tmp_path, &self.path).map_err(|e| DaemonError::io(&self.path, e))
    }

    /// Remove the cookie file and any staging leftover; missing files are fine
    pub fn cleanup(&self) {
        for path in [&self.path, &self.tmp_path] {
            match fs::remove_file(path) {
                Ok(()) => tracing::debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::debug!("Could not remove {}: {}", path.display(), e),
            }
        }
    }

    /// Owned guard that runs `cleanup` when dropped
    pub fn cleanup_guard(&self) -> CleanupGuard {
        CleanupGuard {
            store: Some(self.clone()),
        }
    }

    fn ensure_dir(&self) -> Result<()> {
        let Some(dir) = self.path.parent() else {
            return Err(DaemonError::MissingEnvironment(format!(
                "cookie file {} has no parent directory",
                self.path.display()
            )));
        };
        if dir.as_os_str().is_empty() || dir.is_dir() {
            return Ok(());
        }

        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(dir).map_err(|e| DaemonError::io(dir, e))
    }
}

/// Removes the cookie file on drop unless disarmed
///
/// Held by whoever owns the process lifetime, so fatal-error returns and
/// panics still leave no stale credential behind.
#[derive(Debug)]
pub struct CleanupGuard {
    store: Option<CredentialStore>,
}

impl CleanupGuard {
    /// Run cleanup now; later drops do nothing
    pub fn cleanup(&mut self) {
        if let Some(store) = self.store.take() {
            store.cleanup();
        }
    }

    /// Keep the file (ownership passed to a detached process)
    pub fn disarm(&mut self) {
        self.store = None;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.cleanup();
    }
}
