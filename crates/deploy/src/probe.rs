//! Static upgradeability classification.

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactDescriptor;

/// Event emitted by the initializer guard of upgradeable artifacts.
pub const INITIALIZED_EVENT: &str = "Initialized";

/// How an artifact is deployed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Upgradeability {
    /// Authored against the upgradeable-proxy convention.
    Upgradeable,
    /// Deployed directly, never upgraded.
    Plain,
}

impl Upgradeability {
    pub fn is_upgradeable(self) -> bool {
        self == Self::Upgradeable
    }
}

/// An artifact is upgradeable iff its ABI declares the `Initialized` event.
pub fn classify(artifact: &ArtifactDescriptor) -> Upgradeability {
    if artifact.abi.events.contains_key(INITIALIZED_EVENT) {
        Upgradeability::Upgradeable
    } else {
        Upgradeability::Plain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::tests::{token_abi, vault_abi};
    use alloy_core::{json_abi::JsonAbi, primitives::Bytes};

    #[test]
    fn test_classify_upgradeable() {
        let vault = ArtifactDescriptor::new("Vault", vault_abi(), Bytes::new());
        assert_eq!(classify(&vault), Upgradeability::Upgradeable);
        // repeated calls agree
        assert_eq!(classify(&vault), classify(&vault));
    }

    #[test]
    fn test_classify_plain() {
        let token = ArtifactDescriptor::new("Token", token_abi(), Bytes::new());
        assert_eq!(classify(&token), Upgradeability::Plain);

        let empty = ArtifactDescriptor::new("Empty", JsonAbi::default(), Bytes::new());
        assert_eq!(classify(&empty), Upgradeability::Plain);
    }

    #[test]
    fn test_initialize_function_alone_is_not_enough() {
        let abi: JsonAbi = serde_json::from_value(serde_json::json!([{
            "type": "function",
            "name": "initialize",
            "inputs": [],
            "outputs": [],
            "stateMutability": "nonpayable"
        }]))
        .unwrap();

        let artifact = ArtifactDescriptor::new("Legacy", abi, Bytes::new());
        assert_eq!(classify(&artifact), Upgradeability::Plain);
    }
}
