//! rollout deploys and upgrades contracts from a manifest, recording every address per network.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{Table, presets::UTF8_FULL};

use cli::{Cli, Command, OutputFormat};
use rollout_deploy::{
    ContractDeployer, Deployments, Orchestrator, Registry, RolloutManifest, classify,
    deploy_ephemeral,
};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let manifest = RolloutManifest::load(&cli.manifest)?;

    match &cli.command {
        Command::Deploy { ephemeral } => deploy(&cli, &manifest, *ephemeral).await,
        Command::Status => status(&cli, &manifest),
        Command::Address { name } => {
            let network = cli.network()?;
            let registry = manifest.address_registry(network)?.read()?;
            let address = registry
                .contract(name)
                .with_context(|| format!("{} is not deployed on {}", name, network))?;
            println!("{}", address);
            Ok(())
        }
        Command::Classify { name } => {
            let artifacts = manifest.load_artifacts()?;
            println!("{}", classify(artifacts.get(name)?));
            Ok(())
        }
        Command::Implementation { name } => {
            let network = cli.network()?;
            let registry = manifest.address_registry(network)?.read()?;
            let proxy = registry
                .contract(name)
                .with_context(|| format!("{} is not deployed on {}", name, network))?;

            let artifacts = manifest.load_artifacts()?;
            let (rpc, _) = manifest.connect(network).await?;
            let deployer = manifest.deployer(network, rpc, &artifacts)?;
            println!("{}", deployer.resolve_implementation(proxy).await?);
            Ok(())
        }
    }
}

async fn deploy(cli: &Cli, manifest: &RolloutManifest, ephemeral: bool) -> Result<()> {
    let network = cli.network()?;
    anyhow::ensure!(!manifest.targets.is_empty(), "the manifest lists no targets");

    let artifacts = manifest.load_artifacts()?;
    let (rpc, chain_id) = manifest.connect(network).await?;
    let deployer = manifest.deployer(network, rpc, &artifacts)?;

    tracing::info!(
        network,
        chain_id,
        targets = manifest.targets.len(),
        ephemeral,
        "Deploying..."
    );

    let deployments = if ephemeral {
        deploy_ephemeral(&deployer, &artifacts, &manifest.targets).await?
    } else {
        let verifier = manifest.verifier(network, chain_id)?;
        Orchestrator::new(deployer, manifest.address_registry(network)?, artifacts)
            .with_verifier(verifier)
            .run(&manifest.targets)
            .await?
    };

    print_deployments(&deployments, cli.format)
}

fn status(cli: &Cli, manifest: &RolloutManifest) -> Result<()> {
    let registry = manifest.address_registry(cli.network()?)?.read()?;
    print_registry(&registry, cli.format)
}

fn print_deployments(deployments: &Deployments, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(deployments)?),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_header(vec!["Artifact", "Action", "Address", "Implementation"]);
            for outcome in deployments.iter() {
                table.add_row(vec![
                    outcome.name.clone(),
                    outcome.action.to_string(),
                    outcome.address.to_string(),
                    outcome
                        .implementation
                        .map(|address| address.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                ]);
            }
            println!("{table}");
        }
    }
    Ok(())
}

fn print_registry(registry: &Registry, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(registry)?),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_header(vec!["Artifact", "Address", "Versions", "Latest implementation"]);
            for (name, address) in &registry.contracts {
                let versions: Vec<String> = registry
                    .versions
                    .iter()
                    .filter(|(_, table)| table.contains_key(name))
                    .map(|(version, _)| version.to_string())
                    .collect();
                let latest = registry
                    .latest_version(name)
                    .and_then(|version| registry.implementation(version, name))
                    .map(|address| address.to_string());

                table.add_row(vec![
                    name.clone(),
                    address.to_string(),
                    if versions.is_empty() {
                        "-".to_string()
                    } else {
                        versions.join(", ")
                    },
                    latest.unwrap_or_else(|| "-".to_string()),
                ]);
            }
            println!("{table}");
        }
    }
    Ok(())
}
