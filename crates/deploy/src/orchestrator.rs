//! Sequential rollout of an ordered list of deployment targets.
//!
//! Each target is decided against the registry as it stands after every preceding target,
//! so `"${Name}"` arguments may reference anything deployed earlier in the same run.

use alloy_core::primitives::{Address, Bytes};
use derive_more::Deref;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    artifact::{ArtifactDescriptor, ArtifactStore, DEFAULT_INITIALIZER, resolve_references},
    decision::{Action, decide},
    deployer::{ContractDeployer, proxy_init_data, upgrade_call},
    error::{ConfigurationError, Result},
    probe::{Upgradeability, classify},
    registry::{AddressRegistry, Registry, VersionTag},
    verifier::{NoopVerifier, VerificationKind, VerificationRequest, Verifier},
};

/// One artifact to bring to a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTarget {
    /// Artifact name.
    pub name: String,
    /// Constructor arguments (plain) or initializer arguments (proxy).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    #[serde(default)]
    pub version: VersionTag,
    /// Function to call on deploy or upgrade. Defaults to `initialize` for fresh proxies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initializer: Option<String>,
}

impl DeploymentTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: None,
            version: VersionTag::FIRST,
            initializer: None,
        }
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = Some(args);
        self
    }

    pub fn version(mut self, version: VersionTag) -> Self {
        self.version = version;
        self
    }

    pub fn initializer(mut self, initializer: impl Into<String>) -> Self {
        self.initializer = Some(initializer.into());
        self
    }
}

/// Result of one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentOutcome {
    pub name: String,
    /// Canonical address: the proxy for upgradeable artifacts.
    pub address: Address,
    pub action: Action,
    /// Implementation behind the proxy, for upgradeable artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<Address>,
}

/// Outcomes of a run, in target order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deref, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Deployments(Vec<DeploymentOutcome>);

impl Deployments {
    /// Address of `name` as produced by this run.
    pub fn address_of(&self, name: &str) -> Option<Address> {
        self.0
            .iter()
            .rev()
            .find(|outcome| outcome.name == name)
            .map(|outcome| outcome.address)
    }

    /// Number of targets that mutated network state.
    pub fn mutations(&self) -> usize {
        self.0
            .iter()
            .filter(|outcome| outcome.action.is_mutation())
            .count()
    }

    fn push(&mut self, outcome: DeploymentOutcome) {
        self.0.push(outcome);
    }

    pub fn into_inner(self) -> Vec<DeploymentOutcome> {
        self.0
    }
}

/// Drives the decision engine, the deployer, the registry and the verifier for one network.
#[derive(Debug)]
pub struct Orchestrator<D, V = NoopVerifier> {
    deployer: D,
    verifier: V,
    registry: AddressRegistry,
    artifacts: ArtifactStore,
}

impl<D: ContractDeployer + Sync> Orchestrator<D> {
    pub fn new(deployer: D, registry: AddressRegistry, artifacts: ArtifactStore) -> Self {
        Self {
            deployer,
            verifier: NoopVerifier,
            registry,
            artifacts,
        }
    }
}

impl<D, V> Orchestrator<D, V>
where
    D: ContractDeployer + Sync,
    V: Verifier + Sync,
{
    pub fn with_verifier<W: Verifier + Sync>(self, verifier: W) -> Orchestrator<D, W> {
        Orchestrator {
            deployer: self.deployer,
            verifier,
            registry: self.registry,
            artifacts: self.artifacts,
        }
    }

    pub fn deployer(&self) -> &D {
        &self.deployer
    }

    pub fn verifier(&self) -> &V {
        &self.verifier
    }

    pub fn registry(&self) -> &AddressRegistry {
        &self.registry
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Bring every target to its requested version, in order.
    ///
    /// The first configuration, registry or deploy error aborts the run; targets already
    /// completed stay recorded. Verification failures never abort.
    pub async fn run(&self, targets: &[DeploymentTarget]) -> Result<Deployments> {
        let _lock = self.registry.lock()?;

        tracing::info!(
            network = %self.registry.network(),
            registry = %self.registry.path().display(),
            targets = targets.len(),
            "Starting rollout"
        );

        let mut deployments = Deployments::default();
        for target in targets {
            let outcome = self.step(target, &deployments).await?;
            deployments.push(outcome);
        }

        tracing::info!(
            network = %self.registry.network(),
            mutations = deployments.mutations(),
            "Rollout complete"
        );

        Ok(deployments)
    }

    async fn step(
        &self,
        target: &DeploymentTarget,
        deployments: &Deployments,
    ) -> Result<DeploymentOutcome> {
        let name = target.name.as_str();
        let artifact = self.artifacts.get(name)?;
        let classification = classify(artifact);

        let mut registry = self.registry.read()?;
        let action = decide(&registry, name, classification, target.version);

        tracing::info!(
            artifact = name,
            version = %target.version,
            classification = %classification,
            action = %action,
            "Processing target"
        );

        let args = resolve_args(target, deployments, &registry)?;
        let call_args = match action {
            Action::UpgradeProxy => upgrade_args(&registry, target, args.as_deref()),
            _ => args.as_deref(),
        };
        if call_args.is_none() && args.is_some() {
            tracing::info!(
                artifact = name,
                "Resuming an interrupted deployment, initializer arguments already applied"
            );
        }
        check_call(artifact, action, target, call_args)?;

        let address = match (action, registry.contract(name)) {
            (Action::Reuse, Some(address)) => {
                self.ensure_code(name, address).await?;
                address
            }
            (Action::UpgradeProxy, Some(proxy)) => {
                self.ensure_code(name, proxy).await?;
                self.deployer
                    .upgrade_proxy(proxy, artifact, call_args, target.initializer.as_deref())
                    .await?
            }
            (Action::DeployPlain, _) => {
                self.deployer
                    .deploy_plain(artifact, args.as_deref().unwrap_or_default())
                    .await?
            }
            (Action::DeployProxy, _) => {
                let initializer = target.initializer.as_deref().unwrap_or(DEFAULT_INITIALIZER);
                self.deployer
                    .deploy_proxy(artifact, args.as_deref().unwrap_or_default(), initializer)
                    .await?
            }
            (Action::Reuse | Action::UpgradeProxy, None) => {
                unreachable!("{action} is only selected for registered artifacts")
            }
        };

        registry.set_contract(name, address);
        self.registry.write(&registry)?;

        let implementation = match classification {
            Upgradeability::Upgradeable => {
                let implementation = self.deployer.resolve_implementation(address).await?;
                if registry.record_implementation(target.version, name, implementation) {
                    self.registry.write(&registry)?;
                    tracing::debug!(
                        artifact = name,
                        version = %target.version,
                        implementation = %implementation,
                        "Implementation recorded"
                    );
                }
                Some(implementation)
            }
            Upgradeability::Plain => None,
        };

        self.publish(artifact, address, implementation, args.as_deref())
            .await;

        tracing::info!(
            artifact = name,
            address = %address,
            implementation = ?implementation,
            action = %action,
            "Target done"
        );

        Ok(DeploymentOutcome {
            name: name.to_string(),
            address,
            action,
            implementation,
        })
    }

    /// A registered address must still hold code; a reset chain is an operator problem.
    async fn ensure_code(&self, name: &str, address: Address) -> Result<()> {
        if self.deployer.is_contract(address).await? {
            return Ok(());
        }
        Err(ConfigurationError::StaleAddress {
            artifact: name.to_string(),
            address,
            registry: self.registry.path().to_path_buf(),
        }
        .into())
    }

    async fn publish(
        &self,
        artifact: &ArtifactDescriptor,
        address: Address,
        implementation: Option<Address>,
        args: Option<&[Value]>,
    ) {
        match implementation {
            Some(implementation) => {
                self.verifier
                    .publish(&VerificationRequest {
                        address: implementation,
                        artifact,
                        constructor_args: Bytes::new(),
                        kind: VerificationKind::Implementation,
                    })
                    .await;
                self.verifier
                    .publish(&VerificationRequest {
                        address,
                        artifact,
                        constructor_args: Bytes::new(),
                        kind: VerificationKind::Proxy,
                    })
                    .await;
            }
            None => {
                let constructor_args = artifact
                    .encode_constructor_args(args.unwrap_or_default())
                    .map(Bytes::from)
                    .unwrap_or_else(|e| {
                        tracing::debug!(artifact = %artifact.name, error = %e, "Verifying without constructor arguments");
                        Bytes::new()
                    });
                self.verifier
                    .publish(&VerificationRequest {
                        address,
                        artifact,
                        constructor_args,
                        kind: VerificationKind::Plain,
                    })
                    .await;
            }
        }
    }
}

/// Deploy every target from scratch without reading or writing a registry.
///
/// Used against throwaway local chains: nothing is reused and nothing is verified.
pub async fn deploy_ephemeral<D: ContractDeployer + Sync>(
    deployer: &D,
    artifacts: &ArtifactStore,
    targets: &[DeploymentTarget],
) -> Result<Deployments> {
    let empty = Registry::default();
    let mut deployments = Deployments::default();

    for target in targets {
        let name = target.name.as_str();
        let artifact = artifacts.get(name)?;
        let classification = classify(artifact);
        let args = resolve_args(target, &deployments, &empty)?;
        let action = match classification {
            Upgradeability::Plain => Action::DeployPlain,
            Upgradeability::Upgradeable => Action::DeployProxy,
        };
        check_call(artifact, action, target, args.as_deref())?;
        let args = args.as_deref().unwrap_or_default();

        let (address, implementation) = match classification {
            Upgradeability::Plain => (deployer.deploy_plain(artifact, args).await?, None),
            Upgradeability::Upgradeable => {
                let initializer = target.initializer.as_deref().unwrap_or(DEFAULT_INITIALIZER);
                let proxy = deployer.deploy_proxy(artifact, args, initializer).await?;
                let implementation = deployer.resolve_implementation(proxy).await?;
                (proxy, Some(implementation))
            }
        };

        tracing::info!(artifact = name, address = %address, "Deployed (ephemeral)");

        deployments.push(DeploymentOutcome {
            name: name.to_string(),
            address,
            action,
            implementation,
        });
    }

    Ok(deployments)
}

/// Reject arguments the artifact cannot accept before anything is sent.
fn check_call(
    artifact: &ArtifactDescriptor,
    action: Action,
    target: &DeploymentTarget,
    args: Option<&[Value]>,
) -> Result<(), ConfigurationError> {
    match action {
        Action::Reuse => Ok(()),
        Action::DeployPlain => artifact
            .encode_constructor_args(args.unwrap_or_default())
            .map(|_| ()),
        Action::DeployProxy => {
            proxy_init_data(artifact, target.initializer.as_deref(), args.unwrap_or_default())
                .map(|_| ())
        }
        Action::UpgradeProxy => {
            match upgrade_call(&artifact.name, target.initializer.as_deref(), args)? {
                Some(call) => artifact.encode_call(&call.function, &call.args).map(|_| ()),
                None => Ok(()),
            }
        }
    }
}

/// Arguments to route through an upgrade of `target`.
///
/// A proxy on file with no recorded version was interrupted between the two registry writes
/// of its first deployment. Its conventional initializer already consumed the arguments, so
/// they are not replayed.
fn upgrade_args<'a>(
    registry: &Registry,
    target: &DeploymentTarget,
    args: Option<&'a [Value]>,
) -> Option<&'a [Value]> {
    let conventional = target
        .initializer
        .as_deref()
        .is_none_or(|name| name.is_empty() || name == DEFAULT_INITIALIZER);
    if conventional && !registry.has_any_version(&target.name) {
        return None;
    }
    args
}

/// Substitute `"${Name}"` references, preferring addresses produced earlier in this run.
fn resolve_args(
    target: &DeploymentTarget,
    deployments: &Deployments,
    registry: &Registry,
) -> Result<Option<Vec<Value>>, ConfigurationError> {
    target
        .args
        .as_deref()
        .map(|args| {
            resolve_references(&target.name, args, &|reference| {
                deployments
                    .address_of(reference)
                    .or_else(|| registry.contract(reference))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_core::primitives::address;
    use serde_json::json;

    #[test]
    fn test_target_from_manifest_entry() {
        let target: DeploymentTarget = serde_json::from_value(json!({
            "name": "Vault",
            "args": ["${Token}", 5],
            "version": 2,
            "initializer": "initializeV2"
        }))
        .unwrap();

        assert_eq!(
            target,
            DeploymentTarget::new("Vault")
                .args(vec![json!("${Token}"), json!(5)])
                .version(VersionTag::new(2).unwrap())
                .initializer("initializeV2")
        );

        let minimal: DeploymentTarget = serde_json::from_value(json!({ "name": "Token" })).unwrap();
        assert_eq!(minimal.version, VersionTag::FIRST);
        assert!(minimal.args.is_none());
    }

    #[test]
    fn test_resolve_args_prefers_current_run() {
        let on_file = address!("5fbdb2315678afecb367f032d93f642f64180aa3");
        let fresh = address!("e7f1725e7734ce288f8367e1bb143e90bb3f0512");

        let mut registry = Registry::default();
        registry.set_contract("Token", on_file);
        registry.set_contract("Oracle", on_file);

        let mut deployments = Deployments::default();
        deployments.push(DeploymentOutcome {
            name: "Token".to_string(),
            address: fresh,
            action: Action::DeployPlain,
            implementation: None,
        });

        let target = DeploymentTarget::new("Vault").args(vec![json!("${Token}"), json!("${Oracle}")]);
        let args = resolve_args(&target, &deployments, &registry).unwrap().unwrap();

        assert_eq!(args[0], json!(fresh.to_checksum(None)));
        assert_eq!(args[1], json!(on_file.to_checksum(None)));
    }

    #[test]
    fn test_resolve_args_unknown_reference() {
        let target = DeploymentTarget::new("Vault").args(vec![json!("${Missing}")]);

        assert!(matches!(
            resolve_args(&target, &Deployments::default(), &Registry::default()),
            Err(ConfigurationError::UnresolvedReference { reference, .. }) if reference == "Missing"
        ));
        assert_eq!(
            resolve_args(&DeploymentTarget::new("Token"), &Deployments::default(), &Registry::default())
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_upgrade_args_dropped_when_resuming_first_deployment() {
        let proxy = address!("5fbdb2315678afecb367f032d93f642f64180aa3");
        let implementation = address!("e7f1725e7734ce288f8367e1bb143e90bb3f0512");
        let args = [json!(proxy.to_checksum(None))];

        let mut registry = Registry::default();
        registry.set_contract("Vault", proxy);

        // no version on file: the proxy already ran `initialize` with these args
        let target = DeploymentTarget::new("Vault");
        assert_eq!(upgrade_args(&registry, &target, Some(&args[..])), None);
        let named_default = DeploymentTarget::new("Vault").initializer(DEFAULT_INITIALIZER);
        assert_eq!(upgrade_args(&registry, &named_default, Some(&args[..])), None);

        // an explicit re-initializer keeps its args
        let reinit = DeploymentTarget::new("Vault").initializer("initializeV2");
        assert_eq!(upgrade_args(&registry, &reinit, Some(&args[..])), Some(&args[..]));

        // a real version bump keeps them too, so missing initializers still get reported
        registry.record_implementation(VersionTag::FIRST, "Vault", implementation);
        let bump = DeploymentTarget::new("Vault").version(VersionTag::new(2).unwrap());
        assert_eq!(upgrade_args(&registry, &bump, Some(&args[..])), Some(&args[..]));
    }

    #[test]
    fn test_check_call_rejects_unknown_named_initializer_on_fresh_proxy() {
        let vault =
            ArtifactDescriptor::new("Vault", crate::artifact::tests::vault_abi(), Bytes::new());

        let named = DeploymentTarget::new("Vault").initializer("setup");
        assert!(matches!(
            check_call(&vault, Action::DeployProxy, &named, None),
            Err(ConfigurationError::UnknownInitializer { name, arity: 0, .. }) if name == "setup"
        ));
    }

    #[test]
    fn test_deployments_mutations() {
        let address = address!("5fbdb2315678afecb367f032d93f642f64180aa3");
        let mut deployments = Deployments::default();
        for action in [Action::Reuse, Action::DeployPlain, Action::UpgradeProxy] {
            deployments.push(DeploymentOutcome {
                name: action.to_string(),
                address,
                action,
                implementation: None,
            });
        }

        assert_eq!(deployments.len(), 3);
        assert_eq!(deployments.mutations(), 2);
        assert_eq!(deployments.address_of("reuse"), Some(address));
        assert_eq!(deployments.address_of("Token"), None);
    }
}
