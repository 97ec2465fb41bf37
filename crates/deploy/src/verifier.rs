//! Best-effort source verification on a block explorer.

use std::{future::Future, time::Duration};

use alloy_core::primitives::{Address, Bytes};
use anyhow::Context;
use backon::{ConstantBuilder, Retryable};
use serde::Deserialize;
use url::Url;

use crate::{artifact::ArtifactDescriptor, error::VerificationError};

/// What is being published at an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum VerificationKind {
    /// A non-upgradeable instance.
    Plain,
    /// The implementation behind a proxy.
    Implementation,
    /// The proxy itself.
    Proxy,
}

/// One publication request.
#[derive(Debug, Clone)]
pub struct VerificationRequest<'a> {
    pub address: Address,
    pub artifact: &'a ArtifactDescriptor,
    /// ABI-encoded constructor arguments the instance was created with.
    pub constructor_args: Bytes,
    pub kind: VerificationKind,
}

pub trait Verifier {
    /// Publish the source of `request.address`.
    fn verify(
        &self,
        request: &VerificationRequest<'_>,
    ) -> impl Future<Output = Result<(), VerificationError>> + Send;

    /// Like [`Verifier::verify`], but failures are logged and swallowed.
    fn publish(&self, request: &VerificationRequest<'_>) -> impl Future<Output = ()> + Send
    where
        Self: Sync,
    {
        async move {
            match self.verify(request).await {
                Ok(()) => tracing::info!(
                    artifact = %request.artifact.name,
                    address = %request.address,
                    kind = %request.kind,
                    "Verified"
                ),
                Err(e) => tracing::warn!(
                    artifact = %request.artifact.name,
                    kind = %request.kind,
                    error = %e,
                    "Verification failed, continuing"
                ),
            }
        }
    }
}

/// Verifier for networks without an explorer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopVerifier;

impl Verifier for NoopVerifier {
    async fn verify(&self, request: &VerificationRequest<'_>) -> Result<(), VerificationError> {
        tracing::debug!(
            artifact = %request.artifact.name,
            address = %request.address,
            "No explorer configured, skipping verification"
        );
        Ok(())
    }
}

/// An optional verifier: `None` behaves like [`NoopVerifier`].
impl<V: Verifier + Sync> Verifier for Option<V> {
    async fn verify(&self, request: &VerificationRequest<'_>) -> Result<(), VerificationError> {
        match self {
            Some(verifier) => verifier.verify(request).await,
            None => NoopVerifier.verify(request).await,
        }
    }
}

/// Explorer API endpoints for the chains deployments commonly target.
pub fn known_explorer_api(chain_id: u64) -> Option<&'static str> {
    match chain_id {
        1 => Some("https://api.etherscan.io/api"),
        11155111 => Some("https://api-sepolia.etherscan.io/api"),
        56 => Some("https://api.bscscan.com/api"),
        97 => Some("https://api-testnet.bscscan.com/api"),
        168587773 => Some("https://api-sepolia.blastscan.io/api"),
        81 => Some("https://shibuya.blockscout.com/api"),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: String,
    #[serde(default)]
    message: String,
    result: String,
}

impl ExplorerResponse {
    fn ok(&self) -> bool {
        self.status == "1"
    }
}

fn already_verified(message: &str) -> bool {
    message.to_lowercase().contains("already verified")
}

/// Etherscan-compatible explorer client (Etherscan, BscScan, Blockscout, ...).
#[derive(Debug, Clone)]
pub struct EtherscanVerifier {
    client: reqwest::Client,
    api_url: Url,
    api_key: String,
    poll_interval: Duration,
    max_polls: usize,
}

impl EtherscanVerifier {
    pub fn new(api_url: Url, api_key: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            client: crate::rpc::create_client()?,
            api_url,
            api_key: api_key.into(),
            poll_interval: Duration::from_secs(5),
            max_polls: 12,
        })
    }

    async fn post(&self, form: &[(&str, &str)]) -> anyhow::Result<ExplorerResponse> {
        self.client
            .post(self.api_url.clone())
            .form(form)
            .send()
            .await
            .context("Failed to reach explorer")?
            .json()
            .await
            .context("Failed to parse explorer response")
    }

    /// Submit a request, retrying while the explorer has not indexed the bytecode yet.
    async fn submit(&self, form: &[(&str, &str)]) -> anyhow::Result<Option<String>> {
        let response = (move || async move {
            let response = self.post(form).await?;
            if !response.ok() && response.result.contains("Unable to locate ContractCode") {
                anyhow::bail!("{}", response.result);
            }
            Ok::<_, anyhow::Error>(response)
        })
        .retry(
            ConstantBuilder::default()
                .with_delay(self.poll_interval)
                .with_max_times(self.max_polls),
        )
        .notify(|err, _| tracing::debug!(error = %err, "Explorer not ready, retrying..."))
        .await?;

        if response.ok() {
            Ok(Some(response.result))
        } else if already_verified(&response.result) || already_verified(&response.message) {
            Ok(None)
        } else {
            anyhow::bail!("{}", response.result)
        }
    }

    /// Poll the status of a source submission until it leaves the queue.
    async fn wait_for_guid(&self, guid: &str) -> anyhow::Result<()> {
        let status = (move || async move {
            let response: ExplorerResponse = self
                .client
                .get(self.api_url.clone())
                .query(&[
                    ("apikey", self.api_key.as_str()),
                    ("module", "contract"),
                    ("action", "checkverifystatus"),
                    ("guid", guid),
                ])
                .send()
                .await
                .context("Failed to reach explorer")?
                .json()
                .await
                .context("Failed to parse explorer response")?;

            if response.result.to_lowercase().contains("pending") {
                anyhow::bail!("{}", response.result);
            }
            Ok::<_, anyhow::Error>(response)
        })
        .retry(
            ConstantBuilder::default()
                .with_delay(self.poll_interval)
                .with_max_times(self.max_polls),
        )
        .await?;

        if status.ok() || already_verified(&status.result) {
            Ok(())
        } else {
            anyhow::bail!("{}", status.result)
        }
    }

    async fn verify_source(&self, request: &VerificationRequest<'_>) -> anyhow::Result<()> {
        let build_info = request
            .artifact
            .build_info
            .as_ref()
            .context("artifact has no build info")?;

        let source_code = serde_json::to_string(&build_info.input)?;
        let contract_name = request.artifact.qualified_name();
        let compiler_version = format!("v{}", build_info.solc_long_version);
        let address = request.address.to_checksum(None);
        let constructor_args = hex::encode(&request.constructor_args);

        let form = [
            ("apikey", self.api_key.as_str()),
            ("module", "contract"),
            ("action", "verifysourcecode"),
            ("contractaddress", address.as_str()),
            ("sourceCode", source_code.as_str()),
            ("codeformat", "solidity-standard-json-input"),
            ("contractname", contract_name.as_str()),
            ("compilerversion", compiler_version.as_str()),
            // sic: the explorer API spells it this way
            ("constructorArguements", constructor_args.as_str()),
        ];

        match self.submit(&form).await? {
            Some(guid) => self.wait_for_guid(&guid).await,
            None => Ok(()),
        }
    }

    async fn verify_proxy(&self, request: &VerificationRequest<'_>) -> anyhow::Result<()> {
        let address = request.address.to_checksum(None);
        let form = [
            ("apikey", self.api_key.as_str()),
            ("module", "contract"),
            ("action", "verifyproxycontract"),
            ("address", address.as_str()),
        ];

        self.submit(&form).await.map(|_| ())
    }
}

impl Verifier for EtherscanVerifier {
    async fn verify(&self, request: &VerificationRequest<'_>) -> Result<(), VerificationError> {
        let result = match request.kind {
            VerificationKind::Plain | VerificationKind::Implementation => {
                self.verify_source(request).await
            }
            VerificationKind::Proxy => self.verify_proxy(request).await,
        };

        result.map_err(|e| VerificationError {
            address: request.address.to_string(),
            reason: format!("{:#}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_verified_detection() {
        assert!(already_verified("Contract source code already verified"));
        assert!(already_verified("Already Verified"));
        assert!(!already_verified("Fail - Unable to verify"));
    }

    #[test]
    fn test_known_explorers() {
        assert_eq!(
            known_explorer_api(11155111),
            Some("https://api-sepolia.etherscan.io/api")
        );
        assert!(known_explorer_api(97).is_some());
        assert!(known_explorer_api(31337).is_none());
    }

    #[test]
    fn test_explorer_response_parsing() {
        let response: ExplorerResponse = serde_json::from_str(
            r#"{ "status": "0", "message": "NOTOK", "result": "Contract source code already verified" }"#,
        )
        .unwrap();
        assert!(!response.ok());
        assert!(already_verified(&response.result));
    }

    #[tokio::test]
    async fn test_publish_swallows_failures() {
        struct Failing;

        impl Verifier for Failing {
            async fn verify(
                &self,
                request: &VerificationRequest<'_>,
            ) -> Result<(), VerificationError> {
                Err(VerificationError {
                    address: request.address.to_string(),
                    reason: "explorer unreachable".to_string(),
                })
            }
        }

        let artifact = ArtifactDescriptor::new(
            "Token",
            alloy_core::json_abi::JsonAbi::default(),
            Bytes::new(),
        );
        let request = VerificationRequest {
            address: Address::ZERO,
            artifact: &artifact,
            constructor_args: Bytes::new(),
            kind: VerificationKind::Plain,
        };

        // completes without panicking or returning an error
        Failing.publish(&request).await;
        NoopVerifier.publish(&request).await;
    }
}
