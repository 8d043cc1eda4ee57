// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use tracing::{debug, info};

use crate::errors::PipelineError;
use crate::models::oci::{Digest, PREDICATE_SLSA_PROVENANCE_V02, PREDICATE_SPDX_DOCUMENT, Platform};
use crate::models::statement::InTotoStatement;
use crate::registry::RegistryClient;
use crate::resolver::PartitionedLayers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ArtifactKind {
    Provenance,
    Sbom,
}

impl ArtifactKind {
    fn predicate_type(&self) -> &'static str {
        match self {
            ArtifactKind::Provenance => PREDICATE_SLSA_PROVENANCE_V02,
            ArtifactKind::Sbom => PREDICATE_SPDX_DOCUMENT,
        }
    }
}

/// A blob to download, and what it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlannedArtifact {
    pub kind: ArtifactKind,
    pub digest: Digest,
}

/// Provenance first, then the SBOMs in layer order.
pub(crate) fn plan_artifacts(layers: &PartitionedLayers) -> Vec<PlannedArtifact> {
    std::iter::once(PlannedArtifact {
        kind: ArtifactKind::Provenance,
        digest: layers.provenance.clone(),
    })
    .chain(layers.sboms.iter().map(|digest| PlannedArtifact {
        kind: ArtifactKind::Sbom,
        digest: digest.clone(),
    }))
    .collect()
}

/// File names of the published set, `{product}-attestation-{arch}-…`.
#[derive(Debug, Clone)]
pub(crate) struct ArtifactNaming {
    prefix: String,
}

impl ArtifactNaming {
    pub(crate) fn new(product: &str, platform: &Platform) -> Self {
        ArtifactNaming {
            prefix: format!("{}-attestation-{}", product, platform.label()),
        }
    }

    pub(crate) fn provenance_file(&self) -> String {
        format!("{}-provenance.json", self.prefix)
    }

    /// Uses the whole digest hex, so SBOMs whose digests share a prefix never collide.
    pub(crate) fn sbom_file(&self, digest: &Digest) -> String {
        format!("{}-sbom-{}.json", self.prefix, digest.hex())
    }

    pub(crate) fn checksum_file(&self) -> String {
        format!("{}-checksum.txt", self.prefix)
    }

    pub(crate) fn bundle_file(&self) -> String {
        format!("{}-checksum-cosign.bundle", self.prefix)
    }

    pub(crate) fn file_for(&self, artifact: &PlannedArtifact) -> String {
        match artifact.kind {
            ArtifactKind::Provenance => self.provenance_file(),
            ArtifactKind::Sbom => self.sbom_file(&artifact.digest),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChecksumEntry {
    pub sha256: String,
    pub file_name: String,
}

/// `sha256sum`-compatible listing of the downloaded files, in download order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct ChecksumManifest {
    pub entries: Vec<ChecksumEntry>,
}

impl ChecksumManifest {
    pub(crate) fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (number, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (sha256, file_name) = line
                .split_once("  ")
                .with_context(|| format!("Malformed checksum line {}: '{}'", number + 1, line))?;
            if sha256.len() != 64 || !sha256.chars().all(|c| c.is_ascii_hexdigit()) {
                bail!("Malformed checksum on line {}: '{}'", number + 1, sha256);
            }
            entries.push(ChecksumEntry {
                sha256: sha256.to_ascii_lowercase(),
                file_name: file_name.to_string(),
            });
        }
        Ok(ChecksumManifest { entries })
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Display for ChecksumManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{}  {}", entry.sha256, entry.file_name)?;
        }
        Ok(())
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| PipelineError::Io {
            path: path.display().to_string(),
            source,
        })
}

/// Checks that an attestation blob is an in-toto statement about `subject`
/// with the predicate its layer annotation promised.
fn check_statement(
    bytes: &[u8],
    artifact: &PlannedArtifact,
    subject: &Digest,
) -> Result<(), PipelineError> {
    let statement: InTotoStatement = serde_json::from_slice(bytes).map_err(|e| {
        PipelineError::InvalidAttestation(format!(
            "{} is not an in-toto statement: {}",
            artifact.digest, e
        ))
    })?;
    if statement.predicate_type != artifact.kind.predicate_type() {
        return Err(PipelineError::InvalidAttestation(format!(
            "{} has predicate type '{}', expected '{}'",
            artifact.digest,
            statement.predicate_type,
            artifact.kind.predicate_type()
        )));
    }
    if !statement.covers(subject) {
        return Err(PipelineError::InvalidAttestation(format!(
            "{} does not attest {}",
            artifact.digest, subject
        )));
    }
    Ok(())
}

/// Downloads every artifact into `out_dir` and returns one checksum entry per
/// artifact, in the order given.
pub(crate) async fn fetch_and_checksum<R: RegistryClient + ?Sized>(
    registry: &R,
    artifacts: &[PlannedArtifact],
    naming: &ArtifactNaming,
    out_dir: &Path,
    subject: &Digest,
) -> Result<ChecksumManifest, PipelineError> {
    let mut file_names = HashSet::new();
    for artifact in artifacts {
        let file_name = naming.file_for(artifact);
        if !file_names.insert(file_name.clone()) {
            return Err(PipelineError::Ambiguous(format!(
                "two artifacts would be written to {}",
                file_name
            )));
        }
    }

    let mut manifest = ChecksumManifest::default();
    for artifact in artifacts {
        let bytes = registry.fetch_blob(&artifact.digest).await?;
        let sha256 = hex::encode(Sha256::digest(&bytes));
        if artifact.digest.algorithm() == "sha256" && artifact.digest.hex() != sha256 {
            return Err(PipelineError::Transfer(format!(
                "blob {} has checksum {}",
                artifact.digest, sha256
            )));
        }
        check_statement(&bytes, artifact, subject)?;

        let file_name = naming.file_for(artifact);
        write_file(&out_dir.join(&file_name), &bytes).await?;
        debug!(file = %file_name, size = bytes.len(), "artifact written");
        manifest.entries.push(ChecksumEntry { sha256, file_name });
    }

    info!(files = manifest.len(), "attestation blobs fetched");
    Ok(manifest)
}

/// Writes the checksum file and returns the exact bytes that get signed.
pub(crate) async fn write_checksum_manifest(
    manifest: &ChecksumManifest,
    naming: &ArtifactNaming,
    out_dir: &Path,
) -> Result<Vec<u8>, PipelineError> {
    let bytes = manifest.to_string().into_bytes();
    write_file(&out_dir.join(naming.checksum_file()), &bytes).await?;
    Ok(bytes)
}

pub(crate) async fn write_bundle(
    bundle: &str,
    naming: &ArtifactNaming,
    out_dir: &Path,
) -> Result<(), PipelineError> {
    write_file(&out_dir.join(naming.bundle_file()), bundle.as_bytes()).await
}

/// Recomputes the checksum of every file listed in `manifest`, relative to `dir`.
pub(crate) async fn verify_checksum_manifest(manifest: &ChecksumManifest, dir: &Path) -> Result<()> {
    for entry in &manifest.entries {
        if entry.file_name.contains('/') || entry.file_name.contains('\\') || entry.file_name == ".." {
            bail!("Refusing to read '{}' outside of {}", entry.file_name, dir.display());
        }
        let path = dir.join(&entry.file_name);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let calculated = hex::encode(Sha256::digest(&bytes));
        if calculated != entry.sha256 {
            bail!(
                "Checksum mismatch for {}. Expected sha256: {}, Calculated: {}",
                entry.file_name,
                entry.sha256,
                calculated
            );
        }
        debug!(file = %entry.file_name, "checksum verified");
    }
    Ok(())
}
