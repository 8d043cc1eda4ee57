// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use serde::Serialize;

use crate::identity::{GITHUB_ACTIONS_ISSUER, IdentityPattern};
use crate::models::oci::{Digest, Platform};
use crate::models::reference::ImageReference;
use crate::registry::{Protocol, RegistryAuth};
use crate::resolver::TieBreak;

/// Image and platforms to work on.
#[derive(Args, Debug, Clone)]
pub(crate) struct ImageArgs {
    /// Multi-architecture image, e.g. ghcr.io/kubewarden/policy-server@sha256:…
    #[arg(long)]
    pub image: String,

    /// Digest of the image index; overrides any digest in --image
    #[arg(long)]
    pub digest: Option<String>,

    /// Platforms to process (amd64, arm64, arm/v7, linux/s390x …)
    #[arg(long = "arch", required = true, value_delimiter = ',')]
    pub platforms: Vec<String>,

    /// What to do when the registry lists several candidates where one is expected
    #[arg(long, value_enum, default_value_t = TieBreak::First)]
    pub tie_break: TieBreak,
}

/// How to reach the registry.
#[derive(Args, Debug, Clone)]
pub(crate) struct RegistryArgs {
    /// Talk to the registry over plain HTTP
    #[arg(long, default_value_t = false)]
    pub plain_http: bool,

    #[arg(long, env = "REGISTRY_USERNAME", requires = "registry_password")]
    pub registry_username: Option<String>,

    #[arg(long, env = "REGISTRY_PASSWORD", hide_env_values = true)]
    pub registry_password: Option<String>,
}

/// Expected signer of both the image and the checksum bundle.
#[derive(Args, Debug, Clone)]
pub(crate) struct IdentityArgs {
    #[arg(long, default_value = GITHUB_ACTIONS_ISSUER)]
    pub certificate_oidc_issuer: String,

    /// Regular expression over the certificate identity; replaces the GitHub workflow template
    #[arg(long)]
    pub certificate_identity_regexp: Option<String>,

    #[arg(long, env = "GITHUB_REPOSITORY_OWNER")]
    pub github_owner: Option<String>,

    #[arg(long, default_value = "policy-server")]
    pub github_repository: String,

    #[arg(long, default_value = ".github/workflows/release.yml")]
    pub workflow: String,

    /// Git ref the workflow ran on, e.g. refs/tags/v1.20.0
    #[arg(long, env = "GITHUB_REF")]
    pub git_ref: Option<String>,
}

impl IdentityArgs {
    pub(crate) fn to_pattern(&self) -> Result<IdentityPattern> {
        if let Some(regexp) = &self.certificate_identity_regexp {
            return Ok(IdentityPattern::new(&self.certificate_oidc_issuer, regexp)?);
        }
        let owner = self.github_owner.as_deref().ok_or_else(|| {
            anyhow!("either --certificate-identity-regexp or --github-owner is required")
        })?;
        let git_ref = self.git_ref.as_deref().ok_or_else(|| {
            anyhow!("either --certificate-identity-regexp or --git-ref is required")
        })?;
        let pattern = IdentityPattern::github_workflow(
            owner,
            &self.github_repository,
            &self.workflow,
            git_ref,
        )?;
        if pattern.issuer() != self.certificate_oidc_issuer {
            bail!(
                "the GitHub workflow identity template only applies to issuer {}",
                GITHUB_ACTIONS_ISSUER
            );
        }
        Ok(pattern)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RegistryConfig {
    pub protocol: Protocol,
    pub auth: RegistryAuth,
}

impl RegistryConfig {
    pub(crate) fn from_args(args: &RegistryArgs) -> Self {
        let auth = match (&args.registry_username, &args.registry_password) {
            (Some(username), Some(password)) => RegistryAuth::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            _ => RegistryAuth::Anonymous,
        };
        RegistryConfig {
            protocol: if args.plain_http {
                Protocol::Http
            } else {
                Protocol::Https
            },
            auth,
        }
    }
}

/// Image reference pinned by digest plus the platforms to process.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct Target {
    pub image: ImageReference,
    pub platforms: Vec<Platform>,
    pub tie_break: TieBreak,
}

impl Target {
    pub(crate) fn from_args(args: &ImageArgs) -> Result<Self> {
        let mut image: ImageReference = args
            .image
            .parse()
            .with_context(|| format!("Invalid --image '{}'", args.image))?;
        if let Some(digest) = &args.digest {
            let digest: Digest = digest
                .parse()
                .with_context(|| format!("Invalid --digest '{}'", digest))?;
            image = image.with_digest(digest);
        }
        image.require_digest()?;

        let mut platforms = Vec::new();
        let mut labels = HashSet::new();
        for value in &args.platforms {
            let platform: Platform = value
                .parse()
                .with_context(|| format!("Invalid --arch '{}'", value))?;
            // output directories and file names are keyed by label
            if !labels.insert(platform.label()) {
                bail!("platform '{}' requested more than once", platform);
            }
            platforms.push(platform);
        }
        if platforms.is_empty() {
            bail!("at least one --arch is required");
        }

        Ok(Target {
            image,
            platforms,
            tie_break: args.tie_break,
        })
    }
}

/// Everything one `run` needs, validated.
#[derive(Debug, Clone)]
pub(crate) struct PipelineConfig {
    pub target: Target,
    pub product: String,
    pub output_dir: PathBuf,
    pub identity: IdentityPattern,
    pub registry: RegistryConfig,
}

impl PipelineConfig {
    pub(crate) fn new(
        target: Target,
        product: &str,
        output_dir: PathBuf,
        identity: IdentityPattern,
        registry: RegistryConfig,
    ) -> Result<Self> {
        if product.is_empty()
            || !product
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            bail!("invalid product name '{}'", product);
        }
        Ok(PipelineConfig {
            target,
            product: product.to_string(),
            output_dir,
            identity,
            registry,
        })
    }
}
