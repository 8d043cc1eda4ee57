// SPDX-License-Identifier: Apache-2.0

use clap::ValueEnum;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::PipelineError;
use crate::models::oci::{
    ANNOTATION_PREDICATE_TYPE, ANNOTATION_REFERENCE_DIGEST, Descriptor, Digest,
    ManifestDocument, PREDICATE_SLSA_PROVENANCE_V02, PREDICATE_SPDX_DOCUMENT, Platform,
};
use crate::registry::RegistryClient;

/// What to do when the registry lists more than one candidate where exactly
/// one is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum TieBreak {
    /// Take the first candidate in listing order and log the others.
    #[default]
    First,
    /// Fail with `Ambiguous`.
    Strict,
}

/// Digests of everything attached to one platform image. No blob bytes.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ResolvedAttestations {
    pub platform: Platform,
    pub platform_digest: Digest,
    pub attestation_manifest_digest: Digest,
    pub provenance: Digest,
    pub sboms: Vec<Digest>,
}

/// Layers of an attestation manifest, split by predicate type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PartitionedLayers {
    pub provenance: Digest,
    pub sboms: Vec<Digest>,
}

fn pick_one<'a>(
    candidates: Vec<&'a Descriptor>,
    what: &str,
    tie_break: TieBreak,
) -> Result<&'a Descriptor, PipelineError> {
    match candidates.as_slice() {
        [] => Err(PipelineError::NotFound(what.to_string())),
        [only] => Ok(*only),
        [first, ..] => {
            let listed: Vec<String> = candidates.iter().map(|d| d.digest.to_string()).collect();
            match tie_break {
                TieBreak::First => {
                    warn!(
                        candidates = ?listed,
                        selected = %first.digest,
                        "multiple candidates for {}, taking the first in listing order",
                        what
                    );
                    Ok(*first)
                }
                TieBreak::Strict => Err(PipelineError::Ambiguous(format!(
                    "{} candidates for {}: {}",
                    listed.len(),
                    what,
                    listed.join(", ")
                ))),
            }
        }
    }
}

/// Picks the single-architecture manifest for `platform` out of an image index.
pub(crate) fn select_platform(
    index: &ManifestDocument,
    platform: &Platform,
    tie_break: TieBreak,
) -> Result<Digest, PipelineError> {
    let candidates = index
        .manifests
        .iter()
        .filter(|d| !d.is_attestation_manifest())
        .filter(|d| d.platform.as_ref().is_some_and(|p| platform.matches(p)))
        .collect();
    let selected = pick_one(
        candidates,
        &format!("image manifest for platform {}", platform),
        tie_break,
    )?;
    Ok(selected.digest.clone())
}

/// Picks the attestation manifest that buildkit attached to `platform_digest`.
/// It is a sibling in the same index, linked only by annotations.
pub(crate) fn select_attestation_manifest(
    index: &ManifestDocument,
    platform_digest: &Digest,
    tie_break: TieBreak,
) -> Result<Digest, PipelineError> {
    let target = platform_digest.to_string();
    let candidates = index
        .manifests
        .iter()
        .filter(|d| d.is_attestation_manifest())
        .filter(|d| d.annotation(ANNOTATION_REFERENCE_DIGEST) == Some(target.as_str()))
        .collect();
    let selected = pick_one(
        candidates,
        &format!("attestation manifest referencing {}", platform_digest),
        tie_break,
    )?;
    Ok(selected.digest.clone())
}

/// Splits attestation layers into the provenance layer and the SBOM layers.
pub(crate) fn partition_layers(
    manifest: &ManifestDocument,
    tie_break: TieBreak,
) -> Result<PartitionedLayers, PipelineError> {
    let mut provenance = Vec::new();
    let mut sboms: Vec<Digest> = Vec::new();

    for layer in &manifest.layers {
        match layer.annotation(ANNOTATION_PREDICATE_TYPE) {
            Some(PREDICATE_SLSA_PROVENANCE_V02) => provenance.push(layer),
            Some(PREDICATE_SPDX_DOCUMENT) => {
                if !sboms.contains(&layer.digest) {
                    sboms.push(layer.digest.clone());
                }
            }
            other => debug!(
                digest = %layer.digest,
                predicate_type = other.unwrap_or("<none>"),
                "ignoring attestation layer"
            ),
        }
    }

    let provenance = pick_one(provenance, "provenance layer", tie_break)?;
    Ok(PartitionedLayers {
        provenance: provenance.digest.clone(),
        sboms,
    })
}

/// The image index together with the platform manifest chosen from it.
pub(crate) struct PlatformSelection {
    index: ManifestDocument,
    pub platform_digest: Digest,
}

/// Walks index → platform manifest → attestation manifest → predicate layers
/// for one platform, one step per call.
pub(crate) struct AttestationWalk<'a, R: ?Sized> {
    registry: &'a R,
    platform: &'a Platform,
    tie_break: TieBreak,
}

impl<'a, R: RegistryClient + ?Sized> AttestationWalk<'a, R> {
    pub(crate) fn new(registry: &'a R, platform: &'a Platform, tie_break: TieBreak) -> Self {
        AttestationWalk {
            registry,
            platform,
            tie_break,
        }
    }

    pub(crate) async fn platform(&self, image_digest: &Digest) -> Result<PlatformSelection, PipelineError> {
        let index = self.registry.fetch_manifest(image_digest).await?;
        let platform_digest = select_platform(&index, self.platform, self.tie_break)?;
        info!(platform = %self.platform, %platform_digest, "platform resolved");
        Ok(PlatformSelection {
            index,
            platform_digest,
        })
    }

    pub(crate) fn attestation_manifest(
        &self,
        selection: &PlatformSelection,
    ) -> Result<Digest, PipelineError> {
        let digest =
            select_attestation_manifest(&selection.index, &selection.platform_digest, self.tie_break)?;
        info!(attestation_manifest_digest = %digest, "attestation manifest resolved");
        Ok(digest)
    }

    pub(crate) async fn layers(
        &self,
        attestation_manifest_digest: &Digest,
    ) -> Result<PartitionedLayers, PipelineError> {
        let manifest = self
            .registry
            .fetch_manifest(attestation_manifest_digest)
            .await?;
        let layers = partition_layers(&manifest, self.tie_break)?;
        info!(provenance = %layers.provenance, sboms = layers.sboms.len(), "attestation layers partitioned");
        Ok(layers)
    }
}

/// Resolves every attestation digest of one platform without fetching blobs.
pub(crate) async fn resolve<R: RegistryClient + ?Sized>(
    registry: &R,
    image_digest: &Digest,
    platform: &Platform,
    tie_break: TieBreak,
) -> Result<ResolvedAttestations, PipelineError> {
    let walk = AttestationWalk::new(registry, platform, tie_break);
    let selection = walk.platform(image_digest).await?;
    let attestation_manifest_digest = walk.attestation_manifest(&selection)?;
    let layers = walk.layers(&attestation_manifest_digest).await?;

    Ok(ResolvedAttestations {
        platform: platform.clone(),
        platform_digest: selection.platform_digest,
        attestation_manifest_digest,
        provenance: layers.provenance,
        sboms: layers.sboms,
    })
}
