//! Error taxonomy for a rollout.
//!
//! Only [`ConfigurationError`], [`RegistryError`] and [`DeployError`] halt a run; they are
//! carried by [`RolloutError`]. [`VerificationError`] is logged and swallowed by the
//! verifier.

use std::path::PathBuf;

use alloy_core::primitives::Address;
use thiserror::Error;

/// Boxed error used as the source of network failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A caller mistake. Never retried.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("{artifact}: arguments supplied for upgrade without an initializer to call")]
    MissingInitializer { artifact: String },

    #[error("{artifact}: no function `{name}` taking {arity} argument(s) in the artifact ABI")]
    UnknownInitializer {
        artifact: String,
        name: String,
        arity: usize,
    },

    #[error("artifact `{0}` not found")]
    UnknownArtifact(String),

    #[error("{artifact}: reference `{reference}` does not name a deployed artifact")]
    UnresolvedReference { artifact: String, reference: String },

    #[error(
        "{artifact}: no code at registered address {address}; remove it from {} to redeploy",
        registry.display()
    )]
    StaleAddress {
        artifact: String,
        address: Address,
        registry: PathBuf,
    },

    #[error("{artifact}: invalid argument: {reason}")]
    InvalidArgument { artifact: String, reason: String },

    #[error("{0}")]
    Invalid(String),
}

/// Failure reading, parsing or writing a registry document.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse registry {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write registry {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry {} is locked by another rollout", path.display())]
    Locked { path: PathBuf },
}

/// The network rejected or timed out a deploy, an upgrade, or one of their reads.
#[derive(Debug, Error)]
#[error("{operation} of {target} failed")]
pub struct DeployError {
    /// Artifact name, or address for address-only operations.
    pub target: String,
    pub operation: &'static str,
    #[source]
    pub source: BoxError,
}

impl DeployError {
    pub fn new(
        target: impl Into<String>,
        operation: &'static str,
        source: impl Into<BoxError>,
    ) -> Self {
        Self {
            target: target.into(),
            operation,
            source: source.into(),
        }
    }
}

/// Publication to a source-verification service failed.
#[derive(Debug, Error)]
#[error("verification of {address} failed: {reason}")]
pub struct VerificationError {
    pub address: String,
    pub reason: String,
}

/// A fatal error that aborts the remaining targets of a run.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Deploy(#[from] DeployError),
}

pub type Result<T, E = RolloutError> = std::result::Result<T, E>;
