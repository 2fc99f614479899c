// git-cookie-authdaemon - library root for testing

pub mod auth;
pub mod config;
pub mod daemon;
pub mod error;
pub mod git_config;
pub mod metadata;
