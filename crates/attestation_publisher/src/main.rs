// SPDX-License-Identifier: Apache-2.0

mod attestation;
mod config;
mod errors;
mod fetch;
mod identity;
mod image;
mod models;
mod pipeline;
mod registry;
mod resolver;
mod signer;
#[cfg(test)]
mod testing;
mod tracing;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use futures::future::try_join_all;

use attestation::verify_bundle;
use config::{IdentityArgs, ImageArgs, PipelineConfig, RegistryArgs, RegistryConfig, Target};
use fetch::{ChecksumManifest, verify_checksum_manifest};
use image::CosignImageVerifier;
use pipeline::run_pipeline;
use registry::HttpRegistryClient;
use signer::{IdentityTokenSource, KeylessSigner};

#[derive(Parser)]
#[command(version, about = "Verifies, collects and signs the build attestations of a multi-architecture image")]
struct Cli {
    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FMT", default_value = "text", value_parser = ["text", "json"], global = true)]
    log_fmt: String,

    /// Disable colored log output
    #[arg(long, env = "NO_COLOR", default_value_t = false, global = true)]
    log_no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify the image, then fetch, checksum and sign the attestations of every architecture.
    Run {
        #[command(flatten)]
        image: ImageArgs,

        #[command(flatten)]
        identity: IdentityArgs,

        #[command(flatten)]
        registry: RegistryArgs,

        /// Prefix of every written file
        #[arg(long, default_value = "policy-server")]
        product: String,

        /// Directory receiving one sub-directory per architecture
        #[arg(long, default_value = "attestations")]
        output_dir: PathBuf,

        /// OIDC token used for keyless signing
        #[arg(long, env = "SIGSTORE_ID_TOKEN", hide_env_values = true)]
        identity_token: Option<String>,

        #[arg(long, env = "ACTIONS_ID_TOKEN_REQUEST_URL", hide = true)]
        actions_token_request_url: Option<String>,

        #[arg(long, env = "ACTIONS_ID_TOKEN_REQUEST_TOKEN", hide = true, hide_env_values = true)]
        actions_token_request_token: Option<String>,
    },
    /// Print the provenance and SBOM layer digests of every architecture, without downloading them.
    Resolve {
        #[command(flatten)]
        image: ImageArgs,

        #[command(flatten)]
        registry: RegistryArgs,
    },
    /// Check a signed checksum file and every file it lists.
    VerifyBundle {
        /// Checksum file; the listed files are looked up next to it
        #[arg(long)]
        checksum_file: PathBuf,

        /// Sigstore bundle produced for the checksum file
        #[arg(long)]
        bundle: PathBuf,

        #[command(flatten)]
        identity: IdentityArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing::setup_tracing(&cli.log_level, &cli.log_fmt, cli.log_no_color)?;

    match cli.command {
        Commands::Run {
            image,
            identity,
            registry,
            product,
            output_dir,
            identity_token,
            actions_token_request_url,
            actions_token_request_token,
        } => {
            let config = PipelineConfig::new(
                Target::from_args(&image)?,
                &product,
                output_dir,
                identity.to_pattern()?,
                RegistryConfig::from_args(&registry),
            )?;
            let token_source = IdentityTokenSource::detect(
                identity_token,
                actions_token_request_url,
                actions_token_request_token,
            )?;
            handle_commands_run(config, token_source).await?
        }

        Commands::Resolve { image, registry } => {
            handle_commands_resolve(Target::from_args(&image)?, RegistryConfig::from_args(&registry))
                .await?
        }

        Commands::VerifyBundle {
            checksum_file,
            bundle,
            identity,
        } => handle_commands_verify_bundle(checksum_file, bundle, identity).await?,
    }

    Ok(())
}

async fn handle_commands_run(config: PipelineConfig, token_source: IdentityTokenSource) -> Result<()> {
    let registry = HttpRegistryClient::new(
        &config.target.image,
        config.registry.protocol,
        config.registry.auth.clone(),
    )?;
    let verifier =
        CosignImageVerifier::new(config.registry.protocol, config.registry.auth.clone()).await?;
    let signer = KeylessSigner::new(token_source);

    ::tracing::info!(
        image = %config.target.image,
        platforms = config.target.platforms.len(),
        output_dir = %config.output_dir.display(),
        "starting attestation pipeline"
    );
    let reports = run_pipeline(&config, registry, Arc::new(verifier), Arc::new(signer)).await;

    let json: Vec<serde_json::Value> = reports.iter().map(|r| r.to_json()).collect();
    let json_output =
        serde_json::to_string_pretty(&json).context("Failed to serialize results to JSON")?;
    println!("{}", json_output);

    ::tracing::info!(
        done = reports.iter().filter(|r| r.is_done()).count(),
        total = reports.len(),
        "attestation pipeline finished"
    );
    let failed: Vec<String> = reports
        .iter()
        .filter_map(|r| r.error().map(|e| format!("{}: {}", r.platform, e)))
        .collect();
    if !failed.is_empty() {
        bail!(
            "{} of {} architectures failed:\n{}",
            failed.len(),
            reports.len(),
            failed.join("\n")
        );
    }
    Ok(())
}

async fn handle_commands_resolve(target: Target, registry: RegistryConfig) -> Result<()> {
    let client = HttpRegistryClient::new(&target.image, registry.protocol, registry.auth)?;
    let image_digest = target.image.require_digest()?;
    let tie_break = target.tie_break;

    let resolved = try_join_all(target.platforms.iter().map(|platform| {
        let client = client.clone();
        async move {
            resolver::resolve(&client, image_digest, platform, tie_break)
                .await
                .with_context(|| format!("Failed to resolve attestations for {}", platform))
        }
    }))
    .await?;

    let json_output =
        serde_json::to_string_pretty(&resolved).context("Failed to serialize results to JSON")?;
    println!("{}", json_output);
    Ok(())
}

async fn handle_commands_verify_bundle(
    checksum_file: PathBuf,
    bundle: PathBuf,
    identity: IdentityArgs,
) -> Result<()> {
    let pattern = identity.to_pattern()?;
    let checksum = tokio::fs::read(&checksum_file)
        .await
        .with_context(|| format!("Failed to read {}", checksum_file.display()))?;
    let bundle_json = tokio::fs::read_to_string(&bundle)
        .await
        .with_context(|| format!("Failed to read {}", bundle.display()))?;

    let signer = verify_bundle(&bundle_json, &checksum, &pattern)
        .with_context(|| format!("Bundle {} does not verify", bundle.display()))?;

    let text = std::str::from_utf8(&checksum)
        .with_context(|| format!("{} is not UTF-8", checksum_file.display()))?;
    let manifest = ChecksumManifest::parse(text)?;
    let dir = checksum_file
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", checksum_file.display()))?;
    verify_checksum_manifest(&manifest, dir).await?;

    let summary = serde_json::json!({
        "identity": signer,
        "checksumFile": checksum_file.display().to_string(),
        "files": manifest.entries,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
