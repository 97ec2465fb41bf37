//! rollout-deploy - Deployment and upgrade orchestration for EVM contracts.
//!
//! Given an ordered list of artifacts and a target version per artifact, this crate
//! decides whether each one is deployed plain, deployed behind a proxy, upgraded in place
//! or reused, performs the action and records canonical addresses and per-version
//! implementations in a per-network registry file, so that re-running the same rollout
//! is a no-op.

mod artifact;
pub use artifact::{
    ArtifactDescriptor, ArtifactStore, BuildInfo, DEFAULT_INITIALIZER, address_reference,
    resolve_references,
};

mod config;
pub use config::{
    DEFAULT_PROXY_ARTIFACT, ENV_PREFIX, ExplorerConfig, MANIFEST_FILENAME, NetworkConfig,
    REGISTRY_PATH_ENV_SUFFIX, RolloutManifest,
};

mod decision;
pub use decision::{Action, DeploymentState, decide};

mod deployer;
pub use deployer::{
    ConfirmationPolicy, ContractDeployer, IMPLEMENTATION_SLOT, RpcDeployer, UpgradeCall,
    encode_upgrade_to_and_call, proxy_init_data, upgrade_call,
};

mod error;
pub use error::{
    BoxError, ConfigurationError, DeployError, RegistryError, Result, RolloutError,
    VerificationError,
};

mod orchestrator;
pub use orchestrator::{
    DeploymentOutcome, DeploymentTarget, Deployments, Orchestrator, deploy_ephemeral,
};

mod probe;
pub use probe::{INITIALIZED_EVENT, Upgradeability, classify};

mod registry;
pub use registry::{AddressRegistry, Registry, RegistryLock, VersionTag};

mod rpc;
pub use rpc::{RpcClient, TransactionReceipt};

mod verifier;
pub use verifier::{
    EtherscanVerifier, NoopVerifier, VerificationKind, VerificationRequest, Verifier,
    known_explorer_api,
};
