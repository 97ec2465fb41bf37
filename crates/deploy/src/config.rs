//! Rollout manifest: artifacts location, networks and the ordered target list.
//!
//! Loaded from `Rollout.toml`, then overridden by `ROLLOUT_`-prefixed environment variables
//! (nested keys separated by `__`, e.g. `ROLLOUT_NETWORKS__SEPOLIA__RPC_URL`).

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_core::primitives::Address;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use url::Url;

use crate::{
    artifact::{ArtifactDescriptor, ArtifactStore},
    deployer::{ConfirmationPolicy, RpcDeployer},
    error::{ConfigurationError, DeployError, Result},
    orchestrator::DeploymentTarget,
    registry::AddressRegistry,
    rpc::RpcClient,
    verifier::{EtherscanVerifier, known_explorer_api},
};

/// Default manifest file name.
pub const MANIFEST_FILENAME: &str = "Rollout.toml";

/// Prefix of environment variables overriding manifest keys.
pub const ENV_PREFIX: &str = "ROLLOUT_";

/// Suffix of the per-network registry path override, e.g. `SEPOLIA_CONFIG_FILE_PATH`.
pub const REGISTRY_PATH_ENV_SUFFIX: &str = "_CONFIG_FILE_PATH";

/// Artifact name looked up when no `proxy_artifact` path is configured.
pub const DEFAULT_PROXY_ARTIFACT: &str = "ERC1967Proxy";

/// Top-level manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct RolloutManifest {
    /// Directory holding compiled artifacts, searched recursively.
    #[serde(default = "default_artifacts")]
    pub artifacts: PathBuf,

    /// Build artifact of the ERC-1967 proxy. Falls back to `ERC1967Proxy` in `artifacts`.
    #[serde(default)]
    pub proxy_artifact: Option<PathBuf>,

    #[serde(default)]
    pub networks: BTreeMap<String, NetworkConfig>,

    /// Targets, deployed in order.
    #[serde(default)]
    pub targets: Vec<DeploymentTarget>,

    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub root: PathBuf,
}

fn default_artifacts() -> PathBuf {
    PathBuf::from("artifacts")
}

/// Connection and bookkeeping settings for one network.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub rpc_url: Url,

    /// Expected chain id. Checked against the endpoint before anything is sent.
    #[serde(default)]
    pub chain_id: Option<u64>,

    /// Unlocked account transactions are sent from.
    pub from: Address,

    /// Registry document path. Defaults to `deployments/<network>.json`.
    #[serde(default)]
    pub registry: Option<PathBuf>,

    #[serde(default)]
    pub explorer: Option<ExplorerConfig>,

    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

const fn default_confirmation_timeout_secs() -> u64 {
    180
}

const fn default_poll_interval_ms() -> u64 {
    2000
}

impl NetworkConfig {
    pub fn confirmation(&self) -> ConfirmationPolicy {
        ConfirmationPolicy {
            timeout: Duration::from_secs(self.confirmation_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

/// Block explorer used for source verification.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExplorerConfig {
    /// API endpoint. Defaults to the known explorer for the chain id.
    #[serde(default)]
    pub api_url: Option<Url>,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl ExplorerConfig {
    fn api_key_with(&self, env: impl Fn(&str) -> Option<String>) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| self.api_key_env.as_deref().and_then(env))
    }

    fn api_url_for(&self, chain_id: u64) -> Option<Url> {
        self.api_url.clone().or_else(|| {
            known_explorer_api(chain_id).and_then(|url| Url::parse(url).ok())
        })
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

impl RolloutManifest {
    /// Load `path`, merged with `ROLLOUT_` environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        if !path.is_file() {
            return Err(ConfigurationError::Invalid(format!(
                "manifest not found: {}",
                path.display()
            )));
        }

        let mut manifest: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigurationError::Invalid(format!("{}: {}", path.display(), e)))?;

        manifest.root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        tracing::debug!(
            path = %path.display(),
            networks = manifest.networks.len(),
            targets = manifest.targets.len(),
            "Manifest loaded"
        );
        Ok(manifest)
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn network(&self, name: &str) -> Result<&NetworkConfig, ConfigurationError> {
        self.networks.get(name).ok_or_else(|| {
            ConfigurationError::Invalid(format!("network `{}` is not configured", name))
        })
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.resolve_path(&self.artifacts)
    }

    pub fn load_artifacts(&self) -> Result<ArtifactStore, ConfigurationError> {
        ArtifactStore::load_dir(&self.artifacts_dir())
            .map_err(|e| ConfigurationError::Invalid(format!("{:#}", e)))
    }

    /// The proxy artifact: the configured file, or `ERC1967Proxy` from `store`.
    pub fn proxy_artifact(
        &self,
        store: &ArtifactStore,
    ) -> Result<ArtifactDescriptor, ConfigurationError> {
        match &self.proxy_artifact {
            Some(path) => ArtifactDescriptor::load_from_file(&self.resolve_path(path))
                .map_err(|e| ConfigurationError::Invalid(format!("{:#}", e))),
            None => store.get(DEFAULT_PROXY_ARTIFACT).cloned(),
        }
    }

    /// Registry path for `network`, honouring `<NETWORK>_CONFIG_FILE_PATH`.
    pub fn registry_path(&self, network: &str) -> Result<PathBuf, ConfigurationError> {
        self.registry_path_with(network, env_var)
    }

    fn registry_path_with(
        &self,
        network: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<PathBuf, ConfigurationError> {
        let key = format!(
            "{}{}",
            network.to_uppercase().replace('-', "_"),
            REGISTRY_PATH_ENV_SUFFIX
        );
        if let Some(path) = env(&key) {
            tracing::debug!(network, env = %key, path = %path, "Registry path overridden");
            return Ok(PathBuf::from(path));
        }

        let config = self.network(network)?;
        let path = config
            .registry
            .clone()
            .unwrap_or_else(|| PathBuf::from("deployments").join(format!("{}.json", network)));
        Ok(self.resolve_path(&path))
    }

    pub fn address_registry(&self, network: &str) -> Result<AddressRegistry, ConfigurationError> {
        Ok(AddressRegistry::new(network, self.registry_path(network)?))
    }

    /// Connect to `network` and check that the endpoint serves the configured chain.
    ///
    /// Returns the RPC client together with the chain id it reported.
    pub async fn connect(&self, network: &str) -> Result<(RpcClient, u64)> {
        let config = self.network(network)?;
        let rpc = RpcClient::new(config.rpc_url.clone())
            .map_err(|e| ConfigurationError::Invalid(format!("{:#}", e)))?;

        let chain_id = rpc
            .chain_id()
            .await
            .map_err(|e| DeployError::new(network, "chain-id", e))?;

        match config.chain_id {
            Some(expected) if expected != chain_id => {
                return Err(ConfigurationError::Invalid(format!(
                    "network `{}` expects chain id {} but {} reports {}",
                    network, expected, config.rpc_url, chain_id
                ))
                .into());
            }
            _ => {}
        }

        tracing::debug!(network, chain_id, rpc_url = %config.rpc_url, "Connected");
        Ok((rpc, chain_id))
    }

    pub fn deployer(
        &self,
        network: &str,
        rpc: RpcClient,
        store: &ArtifactStore,
    ) -> Result<RpcDeployer, ConfigurationError> {
        let config = self.network(network)?;
        Ok(RpcDeployer::new(
            rpc,
            config.from,
            self.proxy_artifact(store)?,
            config.confirmation(),
        ))
    }

    /// Explorer verifier for `network`, if one is configured.
    pub fn verifier(
        &self,
        network: &str,
        chain_id: u64,
    ) -> Result<Option<EtherscanVerifier>, ConfigurationError> {
        self.verifier_with(network, chain_id, env_var)
    }

    fn verifier_with(
        &self,
        network: &str,
        chain_id: u64,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<EtherscanVerifier>, ConfigurationError> {
        let Some(explorer) = &self.network(network)?.explorer else {
            return Ok(None);
        };

        let api_url = explorer.api_url_for(chain_id).ok_or_else(|| {
            ConfigurationError::Invalid(format!(
                "network `{}`: no explorer api_url and chain {} has no known explorer",
                network, chain_id
            ))
        })?;

        let Some(api_key) = explorer.api_key_with(env) else {
            tracing::warn!(network, "Explorer configured without an API key, verification disabled");
            return Ok(None);
        };

        EtherscanVerifier::new(api_url, api_key)
            .map(Some)
            .map_err(|e| ConfigurationError::Invalid(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::VersionTag;
    use serde_json::json;
    use tempdir::TempDir;

    const MANIFEST: &str = r#"
artifacts = "out"

[networks.sepolia]
rpc_url = "https://rpc.sepolia.org"
chain_id = 11155111
from = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
explorer = { api_key_env = "SEPOLIA_EXPLORER_KEY" }

[networks.local]
rpc_url = "http://127.0.0.1:8545"
from = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
registry = "/var/lib/rollout/local.json"
poll_interval_ms = 100

[[targets]]
name = "Token"
args = ["Vault Share", [1, 2, 3]]

[[targets]]
name = "Vault"
args = ["${Token}", "0x70997970c51812dc3a010c7d01b50e0d17dc79c8"]

[[targets]]
name = "Vault"
version = 2
initializer = "initializeV2"
args = [7]
"#;

    fn load(dir: &TempDir) -> RolloutManifest {
        let path = dir.path().join(MANIFEST_FILENAME);
        std::fs::write(&path, MANIFEST).unwrap();
        RolloutManifest::load(&path).unwrap()
    }

    #[test]
    fn test_load_manifest() {
        let dir = TempDir::new("rollout-config").unwrap();
        let manifest = load(&dir);

        assert_eq!(manifest.artifacts_dir(), dir.path().join("out"));
        assert_eq!(manifest.networks.len(), 2);

        let sepolia = manifest.network("sepolia").unwrap();
        assert_eq!(sepolia.chain_id, Some(11155111));
        assert_eq!(sepolia.confirmation_timeout_secs, 180);

        let local = manifest.network("local").unwrap();
        assert_eq!(local.confirmation().poll_interval, Duration::from_millis(100));

        assert_eq!(manifest.targets.len(), 3);
        assert_eq!(manifest.targets[0].args, Some(vec![json!("Vault Share"), json!([1, 2, 3])]));
        assert_eq!(manifest.targets[1].version, VersionTag::FIRST);
        assert_eq!(manifest.targets[2].version, VersionTag::new(2).unwrap());
        assert_eq!(manifest.targets[2].initializer.as_deref(), Some("initializeV2"));
    }

    #[test]
    fn test_missing_manifest_or_network() {
        let dir = TempDir::new("rollout-config").unwrap();
        assert!(matches!(
            RolloutManifest::load(&dir.path().join(MANIFEST_FILENAME)),
            Err(ConfigurationError::Invalid(_))
        ));

        let manifest = load(&dir);
        assert!(matches!(
            manifest.network("mainnet"),
            Err(ConfigurationError::Invalid(_))
        ));
    }

    #[test]
    fn test_registry_path_resolution() {
        let dir = TempDir::new("rollout-config").unwrap();
        let manifest = load(&dir);
        let no_env = |_: &str| None;

        assert_eq!(
            manifest.registry_path_with("sepolia", no_env).unwrap(),
            dir.path().join("deployments").join("sepolia.json")
        );
        assert_eq!(
            manifest.registry_path_with("local", no_env).unwrap(),
            PathBuf::from("/var/lib/rollout/local.json")
        );

        let overridden = manifest
            .registry_path_with("sepolia", |key| {
                (key == "SEPOLIA_CONFIG_FILE_PATH").then(|| "/tmp/override.json".to_string())
            })
            .unwrap();
        assert_eq!(overridden, PathBuf::from("/tmp/override.json"));
    }

    #[test]
    fn test_verifier_selection() {
        let dir = TempDir::new("rollout-config").unwrap();
        let manifest = load(&dir);

        // no explorer table
        assert!(manifest.verifier_with("local", 31337, |_| None).unwrap().is_none());

        // explorer configured but key missing from the environment
        assert!(manifest.verifier_with("sepolia", 11155111, |_| None).unwrap().is_none());

        let with_key = |key: &str| (key == "SEPOLIA_EXPLORER_KEY").then(|| "KEY".to_string());
        assert!(manifest.verifier_with("sepolia", 11155111, with_key).unwrap().is_some());

        // unknown chain and no api_url
        assert!(matches!(
            manifest.verifier_with("sepolia", 31337, with_key),
            Err(ConfigurationError::Invalid(_))
        ));
    }
}
