//! Error types for the module seams.
//!
//! The NPM client keeps its public "bool / absent" contract and only uses
//! [`ApiError`] inside its retry loop.  Binary-level plumbing uses
//! `anyhow`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("event channel closed")]
    ChannelClosed,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("authentication with Nginx Proxy Manager failed")]
    AuthenticationFailed,

    #[error("proxy host list could not be fetched")]
    HostListUnavailable,

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
