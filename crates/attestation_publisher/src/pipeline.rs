// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use tracing::{Instrument, debug, error, info, info_span};

use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::fetch::{
    ArtifactNaming, fetch_and_checksum, plan_artifacts, write_bundle, write_checksum_manifest,
};
use crate::identity::IdentityPattern;
use crate::image::ImageVerifier;
use crate::models::oci::{Digest, Platform};
use crate::models::reference::ImageReference;
use crate::registry::RegistryClient;
use crate::resolver::{AttestationWalk, TieBreak};
use crate::signer::{BundleSigner, sign_and_self_verify};

/// Steps of one architecture run, in the only order they can complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) enum Stage {
    Idle,
    ImageSigVerified,
    PlatformResolved,
    AttestationResolved,
    LayersPartitioned,
    BlobsFetched,
    ChecksumBuilt,
    BundleSigned,
    BundleSelfVerified,
    Done,
}

impl Stage {
    fn next(self) -> Option<Stage> {
        match self {
            Stage::Idle => Some(Stage::ImageSigVerified),
            Stage::ImageSigVerified => Some(Stage::PlatformResolved),
            Stage::PlatformResolved => Some(Stage::AttestationResolved),
            Stage::AttestationResolved => Some(Stage::LayersPartitioned),
            Stage::LayersPartitioned => Some(Stage::BlobsFetched),
            Stage::BlobsFetched => Some(Stage::ChecksumBuilt),
            Stage::ChecksumBuilt => Some(Stage::BundleSigned),
            Stage::BundleSigned => Some(Stage::BundleSelfVerified),
            Stage::BundleSelfVerified => Some(Stage::Done),
            Stage::Done => None,
        }
    }
}

/// What a successful run left in its output directory.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PublishedArtifacts {
    pub directory: PathBuf,
    pub platform_digest: Digest,
    pub attestation_manifest_digest: Digest,
    pub files: Vec<String>,
    pub checksum_file: String,
    pub bundle_file: String,
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Done(PublishedArtifacts),
    Failed {
        last_completed: Stage,
        error: PipelineError,
    },
}

/// Result of one architecture run.
#[derive(Debug)]
pub(crate) struct ArchReport {
    pub platform: Platform,
    pub stages: Vec<Stage>,
    pub outcome: Outcome,
}

impl ArchReport {
    pub(crate) fn is_done(&self) -> bool {
        matches!(self.outcome, Outcome::Done(_))
    }

    pub(crate) fn error(&self) -> Option<&PipelineError> {
        match &self.outcome {
            Outcome::Done(_) => None,
            Outcome::Failed { error, .. } => Some(error),
        }
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        match &self.outcome {
            Outcome::Done(artifacts) => json!({
                "platform": self.platform.to_string(),
                "status": "done",
                "stages": self.stages,
                "artifacts": artifacts,
            }),
            Outcome::Failed {
                last_completed,
                error,
            } => json!({
                "platform": self.platform.to_string(),
                "status": "failed",
                "stages": self.stages,
                "lastCompletedStage": last_completed,
                "error": {
                    "kind": error.kind(),
                    "message": error.to_string(),
                },
            }),
        }
    }
}

/// Stages completed so far by one instance, starting at `Idle`.
struct StageLog(Vec<Stage>);

impl StageLog {
    fn new() -> Self {
        StageLog(vec![Stage::Idle])
    }

    fn current(&self) -> Stage {
        self.0.last().copied().unwrap_or(Stage::Idle)
    }

    fn advance(&mut self, next: Stage) {
        debug_assert_eq!(self.current().next(), Some(next));
        debug!(stage = ?next, "stage completed");
        self.0.push(next);
    }
}

/// State machine for one architecture. Owns everything it touches, so
/// instances can run on separate tasks without sharing mutable state.
struct ArchInstance<R, V: ?Sized, S: ?Sized> {
    platform: Platform,
    image: ImageReference,
    identity: IdentityPattern,
    product: String,
    output_dir: PathBuf,
    tie_break: TieBreak,
    registry: R,
    verifier: Arc<V>,
    signer: Arc<S>,
}

impl<R, V, S> ArchInstance<R, V, S>
where
    R: RegistryClient,
    V: ImageVerifier + ?Sized,
    S: BundleSigner + ?Sized,
{
    async fn drive(&self, stages: &mut StageLog) -> Result<PublishedArtifacts, PipelineError> {
        let image_digest = self.image.require_digest()?;

        self.verifier
            .verify_image(&self.image, &self.identity)
            .await?;
        info!(image = %self.image, "image signature verified");
        stages.advance(Stage::ImageSigVerified);

        let walk = AttestationWalk::new(&self.registry, &self.platform, self.tie_break);
        let selection = walk.platform(image_digest).await?;
        stages.advance(Stage::PlatformResolved);

        let attestation_manifest_digest = walk.attestation_manifest(&selection)?;
        stages.advance(Stage::AttestationResolved);

        let layers = walk.layers(&attestation_manifest_digest).await?;
        stages.advance(Stage::LayersPartitioned);

        let platform_digest = selection.platform_digest;
        let naming = ArtifactNaming::new(&self.product, &self.platform);
        let out_dir = self.output_dir.join(self.platform.label());
        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|source| PipelineError::Io {
                path: out_dir.display().to_string(),
                source,
            })?;
        let artifacts = plan_artifacts(&layers);
        let manifest = fetch_and_checksum(
            &self.registry,
            &artifacts,
            &naming,
            &out_dir,
            &platform_digest,
        )
        .await?;
        stages.advance(Stage::BlobsFetched);

        let payload = write_checksum_manifest(&manifest, &naming, &out_dir).await?;
        stages.advance(Stage::ChecksumBuilt);

        let bundle = match sign_and_self_verify(self.signer.as_ref(), &payload, &self.identity).await
        {
            Ok(bundle) => bundle,
            Err(e @ PipelineError::SelfVerificationFailure(_)) => {
                // the bundle exists but must never be published
                stages.advance(Stage::BundleSigned);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        stages.advance(Stage::BundleSigned);
        stages.advance(Stage::BundleSelfVerified);

        write_bundle(&bundle, &naming, &out_dir).await?;
        stages.advance(Stage::Done);

        Ok(PublishedArtifacts {
            directory: out_dir,
            platform_digest,
            attestation_manifest_digest,
            files: manifest
                .entries
                .into_iter()
                .map(|entry| entry.file_name)
                .collect(),
            checksum_file: naming.checksum_file(),
            bundle_file: naming.bundle_file(),
        })
    }

    async fn run(self) -> ArchReport {
        let mut stages = StageLog::new();
        let outcome = match self.drive(&mut stages).await {
            Ok(artifacts) => {
                info!(directory = %artifacts.directory.display(), "attestations published");
                Outcome::Done(artifacts)
            }
            Err(error) => {
                let last_completed = stages.current();
                error!(stage = ?last_completed, kind = error.kind(), "{}", error);
                Outcome::Failed {
                    last_completed,
                    error,
                }
            }
        };
        ArchReport {
            platform: self.platform,
            stages: stages.0,
            outcome,
        }
    }
}

/// Runs one instance per configured platform concurrently. A failure in one
/// instance never affects the others; reports come back in platform order.
pub(crate) async fn run_pipeline<R, V, S>(
    config: &PipelineConfig,
    registry: R,
    verifier: Arc<V>,
    signer: Arc<S>,
) -> Vec<ArchReport>
where
    R: RegistryClient + Clone + 'static,
    V: ImageVerifier + ?Sized + 'static,
    S: BundleSigner + ?Sized + 'static,
{
    let handles: Vec<_> = config
        .target
        .platforms
        .iter()
        .map(|platform| {
            let instance = ArchInstance {
                platform: platform.clone(),
                image: config.target.image.clone(),
                identity: config.identity.clone(),
                product: config.product.clone(),
                output_dir: config.output_dir.clone(),
                tie_break: config.target.tie_break,
                registry: registry.clone(),
                verifier: Arc::clone(&verifier),
                signer: Arc::clone(&signer),
            };
            let span = info_span!("arch", platform = %platform.label());
            tokio::spawn(instance.run().instrument(span))
        })
        .collect();

    join_all(handles)
        .await
        .into_iter()
        .zip(&config.target.platforms)
        .map(|(joined, platform)| {
            joined.unwrap_or_else(|e| ArchReport {
                platform: platform.clone(),
                stages: vec![Stage::Idle],
                outcome: Outcome::Failed {
                    last_completed: Stage::Idle,
                    error: PipelineError::Aborted(e.to_string()),
                },
            })
        })
        .collect()
}
