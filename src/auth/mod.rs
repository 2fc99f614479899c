// Authentication module
// Scope discovery, token acquisition, cookie persistence and the refresh loop

mod credentials;
mod refresh;
mod scheduler;
mod scopes;
mod types;

pub use credentials::{CleanupGuard, CredentialStore};
pub use refresh::{acquire_token, RetryPolicy, MAX_EXPIRES_IN};
pub use scheduler::{next_wake, RefreshScheduler, SchedulerState};
pub use scopes::{parse_scopes, select_scope};
pub use types::{Scope, Token, SUPPORTED_SCOPES};
