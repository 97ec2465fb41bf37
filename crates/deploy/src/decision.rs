//! Deploy / upgrade / reuse decision per artifact.
//!
//! An address already on file is never redeployed from scratch: at most it is upgraded in
//! place. Version bookkeeping only decides between reuse and upgrade.

use alloy_core::primitives::Address;
use serde::{Deserialize, Serialize};

use crate::{
    probe::Upgradeability,
    registry::{Registry, VersionTag},
};

/// The single action selected for a deployment target.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Reuse,
    DeployPlain,
    DeployProxy,
    UpgradeProxy,
}

impl Action {
    /// Whether the action mutates network state.
    pub fn is_mutation(self) -> bool {
        self != Self::Reuse
    }
}

/// Registry-derived state of one artifact on one network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentState {
    Absent,
    DeployedPlain(Address),
    DeployedProxy {
        proxy: Address,
        /// Highest version with a recorded implementation, if any.
        version: Option<VersionTag>,
    },
}

impl DeploymentState {
    pub fn of(registry: &Registry, name: &str, classification: Upgradeability) -> Self {
        match (registry.contract(name), classification) {
            (None, _) => Self::Absent,
            (Some(address), Upgradeability::Plain) => Self::DeployedPlain(address),
            (Some(proxy), Upgradeability::Upgradeable) => Self::DeployedProxy {
                proxy,
                version: registry.latest_version(name),
            },
        }
    }
}

/// Select the action for `name` at `version`.
pub fn decide(
    registry: &Registry,
    name: &str,
    classification: Upgradeability,
    version: VersionTag,
) -> Action {
    match DeploymentState::of(registry, name, classification) {
        DeploymentState::Absent => match classification {
            Upgradeability::Plain => Action::DeployPlain,
            Upgradeability::Upgradeable => Action::DeployProxy,
        },
        // Plain artifacts are never redeployed through this path.
        DeploymentState::DeployedPlain(_) => Action::Reuse,
        DeploymentState::DeployedProxy { .. } => {
            if registry.implementation(version, name).is_some() {
                Action::Reuse
            } else {
                Action::UpgradeProxy
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_core::primitives::address;

    const PROXY: Address = address!("70997970C51812dc3A010C7d01b50e0d17dc79C8");
    const IMPL: Address = address!("3C44CdDdB6a900fa2b585dd299e03d12FA4293BC");

    fn v(n: u32) -> VersionTag {
        VersionTag::new(n).unwrap()
    }

    #[test]
    fn test_absent_plain_deploys_plain() {
        let registry = Registry::default();
        assert_eq!(
            decide(&registry, "Token", Upgradeability::Plain, v(1)),
            Action::DeployPlain
        );
    }

    #[test]
    fn test_absent_upgradeable_deploys_proxy() {
        let registry = Registry::default();
        assert_eq!(
            decide(&registry, "Vault", Upgradeability::Upgradeable, v(1)),
            Action::DeployProxy
        );
        // any requested version still starts with a fresh proxy
        assert_eq!(
            decide(&registry, "Vault", Upgradeability::Upgradeable, v(3)),
            Action::DeployProxy
        );
    }

    #[test]
    fn test_deployed_plain_is_reused() {
        let mut registry = Registry::default();
        registry.set_contract("Token", PROXY);

        assert_eq!(
            decide(&registry, "Token", Upgradeability::Plain, v(1)),
            Action::Reuse
        );
        assert_eq!(
            decide(&registry, "Token", Upgradeability::Plain, v(2)),
            Action::Reuse
        );
    }

    #[test]
    fn test_recorded_version_is_reused() {
        let mut registry = Registry::default();
        registry.set_contract("Vault", PROXY);
        registry.record_implementation(v(1), "Vault", IMPL);

        assert_eq!(
            decide(&registry, "Vault", Upgradeability::Upgradeable, v(1)),
            Action::Reuse
        );
    }

    #[test]
    fn test_unrecorded_version_upgrades() {
        let mut registry = Registry::default();
        registry.set_contract("Vault", PROXY);
        registry.record_implementation(v(1), "Vault", IMPL);

        assert_eq!(
            decide(&registry, "Vault", Upgradeability::Upgradeable, v(2)),
            Action::UpgradeProxy
        );
    }

    #[test]
    fn test_proxy_without_any_version_upgrades() {
        let mut registry = Registry::default();
        registry.set_contract("Vault", PROXY);

        assert_eq!(
            DeploymentState::of(&registry, "Vault", Upgradeability::Upgradeable),
            DeploymentState::DeployedProxy {
                proxy: PROXY,
                version: None
            }
        );
        assert_eq!(
            decide(&registry, "Vault", Upgradeability::Upgradeable, v(1)),
            Action::UpgradeProxy
        );
    }

    #[test]
    fn test_version_entry_without_contract_is_ignored() {
        let mut registry = Registry::default();
        registry.record_implementation(v(1), "Vault", IMPL);

        assert_eq!(
            decide(&registry, "Vault", Upgradeability::Upgradeable, v(1)),
            Action::DeployProxy
        );
    }

    #[test]
    fn test_action_display() {
        assert_eq!(Action::UpgradeProxy.to_string(), "upgrade-proxy");
        assert_eq!("deploy-plain".parse::<Action>().unwrap(), Action::DeployPlain);
        assert!(!Action::Reuse.is_mutation());
        assert!(Action::DeployProxy.is_mutation());
    }
}
