//! Primitive network actions: deploy plain, deploy proxy, upgrade proxy.
//!
//! Every mutation blocks until the transaction receipt confirms it. The deployer never
//! touches the registry; recording the result is the orchestrator's job.

use std::{future::Future, time::Duration};

use alloy_core::{
    dyn_abi::DynSolValue,
    primitives::{Address, B256, Bytes, b256, keccak256},
};
use anyhow::Context;
use backon::{ConstantBuilder, Retryable};
use serde_json::Value;

use crate::{
    artifact::{ArtifactDescriptor, DEFAULT_INITIALIZER},
    error::{ConfigurationError, DeployError, Result},
    rpc::{RpcClient, TransactionReceipt},
};

/// ERC-1967 storage slot holding a proxy's implementation address.
pub const IMPLEMENTATION_SLOT: B256 =
    b256!("360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc");

/// Signature of the UUPS upgrade entry point.
const UPGRADE_TO_AND_CALL: &str = "upgradeToAndCall(address,bytes)";

/// The network-facing half of a rollout.
pub trait ContractDeployer {
    /// Instantiate a non-upgradeable artifact, passing `args` to its constructor.
    fn deploy_plain(
        &self,
        artifact: &ArtifactDescriptor,
        args: &[Value],
    ) -> impl Future<Output = Result<Address>> + Send;

    /// Instantiate `artifact` behind a fresh proxy, routing `args` through `initializer`.
    fn deploy_proxy(
        &self,
        artifact: &ArtifactDescriptor,
        args: &[Value],
        initializer: &str,
    ) -> impl Future<Output = Result<Address>> + Send;

    /// Point `proxy` at a new implementation of `artifact`, returning the proxy address.
    fn upgrade_proxy(
        &self,
        proxy: Address,
        artifact: &ArtifactDescriptor,
        args: Option<&[Value]>,
        initializer: Option<&str>,
    ) -> impl Future<Output = Result<Address>> + Send;

    /// Read the implementation currently behind `proxy`.
    fn resolve_implementation(&self, proxy: Address)
    -> impl Future<Output = Result<Address>> + Send;

    /// Whether code is deployed at `address`.
    fn is_contract(&self, address: Address) -> impl Future<Output = Result<bool>> + Send;
}

/// Call made on the proxy as part of an upgrade.
#[derive(Debug, Clone, PartialEq)]
pub struct UpgradeCall {
    pub function: String,
    pub args: Vec<Value>,
}

/// Decide which function, if any, to invoke during an upgrade.
///
/// The conventional initializer has already run on the proxy, so only an explicitly named
/// re-initializer is called. Arguments without such a name are a configuration error.
pub fn upgrade_call(
    artifact: &str,
    initializer: Option<&str>,
    args: Option<&[Value]>,
) -> std::result::Result<Option<UpgradeCall>, ConfigurationError> {
    let function = initializer.filter(|name| !name.is_empty() && *name != DEFAULT_INITIALIZER);

    match (function, args) {
        (Some(function), args) => Ok(Some(UpgradeCall {
            function: function.to_string(),
            args: args.map(<[Value]>::to_vec).unwrap_or_default(),
        })),
        (None, Some(_)) => Err(ConfigurationError::MissingInitializer {
            artifact: artifact.to_string(),
        }),
        (None, None) => Ok(None),
    }
}

/// Calldata handed to a fresh proxy's constructor.
///
/// `None` selects the conventional initializer, which may be absent when there is nothing to
/// pass it. A named initializer must exist with a matching arity.
pub fn proxy_init_data(
    artifact: &ArtifactDescriptor,
    initializer: Option<&str>,
    args: &[Value],
) -> std::result::Result<Bytes, ConfigurationError> {
    match initializer {
        None if args.is_empty() && !artifact.has_function(DEFAULT_INITIALIZER, 0) => {
            Ok(Bytes::new())
        }
        initializer => artifact.encode_call(initializer.unwrap_or(DEFAULT_INITIALIZER), args),
    }
}

/// Calldata for `upgradeToAndCall(implementation, data)`.
pub fn encode_upgrade_to_and_call(implementation: Address, data: &Bytes) -> Bytes {
    let mut calldata = keccak256(UPGRADE_TO_AND_CALL)[..4].to_vec();
    calldata.extend(
        DynSolValue::Tuple(vec![
            DynSolValue::Address(implementation),
            DynSolValue::Bytes(data.to_vec()),
        ])
        .abi_encode_params(),
    );
    calldata.into()
}

/// How long to wait for a transaction receipt, and how often to ask.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            poll_interval: Duration::from_secs(2),
        }
    }
}

impl ConfirmationPolicy {
    fn attempts(&self) -> usize {
        let poll = self.poll_interval.as_millis().max(1);
        (self.timeout.as_millis() / poll).max(1) as usize
    }
}

/// [`ContractDeployer`] over JSON-RPC, sending from an unlocked account.
///
/// Proxies are ERC-1967 with UUPS upgrades: the proxy artifact's constructor takes
/// `(address implementation, bytes data)` and the implementation exposes
/// `upgradeToAndCall`.
#[derive(Debug, Clone)]
pub struct RpcDeployer {
    rpc: RpcClient,
    from: Address,
    proxy_artifact: ArtifactDescriptor,
    confirmation: ConfirmationPolicy,
}

impl RpcDeployer {
    pub fn new(
        rpc: RpcClient,
        from: Address,
        proxy_artifact: ArtifactDescriptor,
        confirmation: ConfirmationPolicy,
    ) -> Self {
        Self {
            rpc,
            from,
            proxy_artifact,
            confirmation,
        }
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    /// Send a transaction and wait for a successful receipt.
    async fn submit(
        &self,
        target: &str,
        operation: &'static str,
        to: Option<Address>,
        data: Bytes,
    ) -> std::result::Result<TransactionReceipt, DeployError> {
        let hash = self
            .rpc
            .send_transaction(self.from, to, &data)
            .await
            .map_err(|e| DeployError::new(target, operation, e))?;

        tracing::debug!(artifact = %target, operation, tx_hash = %hash, "Transaction submitted");

        let receipt = self
            .wait_for_receipt(hash)
            .await
            .map_err(|e| DeployError::new(target, operation, e))?;

        if !receipt.succeeded() {
            return Err(DeployError::new(
                target,
                operation,
                anyhow::anyhow!("transaction {} reverted", receipt.transaction_hash),
            ));
        }

        Ok(receipt)
    }

    async fn wait_for_receipt(&self, hash: B256) -> anyhow::Result<TransactionReceipt> {
        let rpc = &self.rpc;

        (move || async move {
            rpc.transaction_receipt(hash)
                .await?
                .context("Transaction still pending")
        })
        .retry(
            ConstantBuilder::default()
                .with_delay(self.confirmation.poll_interval)
                .with_max_times(self.confirmation.attempts()),
        )
        .notify(|err, _| {
            tracing::trace!(tx_hash = %hash, error = %err, "Waiting for confirmation...");
        })
        .await
        .with_context(|| {
            format!(
                "Transaction {} not confirmed within {:?}",
                hash, self.confirmation.timeout
            )
        })
    }

    /// Deploy `code` as a new contract and return its address.
    async fn create(
        &self,
        target: &str,
        operation: &'static str,
        code: Bytes,
    ) -> std::result::Result<Address, DeployError> {
        let receipt = self.submit(target, operation, None, code).await?;
        receipt.contract_address.ok_or_else(|| {
            DeployError::new(
                target,
                operation,
                anyhow::anyhow!("receipt {} has no contract address", receipt.transaction_hash),
            )
        })
    }

    async fn deploy_implementation(&self, artifact: &ArtifactDescriptor) -> Result<Address> {
        let code = artifact.creation_code(&[])?;
        let implementation = self
            .create(&artifact.name, "deploy-implementation", code)
            .await?;
        tracing::debug!(artifact = %artifact.name, implementation = %implementation, "Implementation deployed");
        Ok(implementation)
    }
}

impl ContractDeployer for RpcDeployer {
    async fn deploy_plain(&self, artifact: &ArtifactDescriptor, args: &[Value]) -> Result<Address> {
        let code = artifact.creation_code(args)?;
        Ok(self.create(&artifact.name, "deploy-plain", code).await?)
    }

    async fn deploy_proxy(
        &self,
        artifact: &ArtifactDescriptor,
        args: &[Value],
        initializer: &str,
    ) -> Result<Address> {
        let initializer = Some(initializer).filter(|name| *name != DEFAULT_INITIALIZER);
        let init_data = proxy_init_data(artifact, initializer, args)?;

        let implementation = self.deploy_implementation(artifact).await?;

        let proxy_code = self.proxy_artifact.creation_code(&[
            Value::String(implementation.to_checksum(None)),
            Value::String(format!("0x{}", hex::encode(&init_data))),
        ])?;

        Ok(self.create(&artifact.name, "deploy-proxy", proxy_code).await?)
    }

    async fn upgrade_proxy(
        &self,
        proxy: Address,
        artifact: &ArtifactDescriptor,
        args: Option<&[Value]>,
        initializer: Option<&str>,
    ) -> Result<Address> {
        let data = match upgrade_call(&artifact.name, initializer, args)? {
            Some(call) => artifact.encode_call(&call.function, &call.args)?,
            None => Bytes::new(),
        };

        let implementation = self.deploy_implementation(artifact).await?;

        self.submit(
            &artifact.name,
            "upgrade-proxy",
            Some(proxy),
            encode_upgrade_to_and_call(implementation, &data),
        )
        .await?;

        Ok(proxy)
    }

    async fn resolve_implementation(&self, proxy: Address) -> Result<Address> {
        let operation = "resolve-implementation";
        let word = self
            .rpc
            .storage_at(proxy, IMPLEMENTATION_SLOT)
            .await
            .map_err(|e| DeployError::new(proxy.to_string(), operation, e))?;

        let implementation = Address::from_word(word);
        if implementation.is_zero() {
            return Err(DeployError::new(
                proxy.to_string(),
                operation,
                anyhow::anyhow!("no implementation in the ERC-1967 slot"),
            )
            .into());
        }

        Ok(implementation)
    }

    async fn is_contract(&self, address: Address) -> Result<bool> {
        let code = self
            .rpc
            .code_at(address)
            .await
            .map_err(|e| DeployError::new(address.to_string(), "get-code", e))?;
        Ok(!code.is_empty())
    }
}
