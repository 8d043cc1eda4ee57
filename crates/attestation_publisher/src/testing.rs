// SPDX-License-Identifier: Apache-2.0

//! Test doubles shared by the unit tests: an in-memory registry, a scripted
//! image verifier and a signer backed by a self-issued Fulcio-shaped certificate.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use p256::ecdsa::{Signature, SigningKey, signature::Signer};
use p256::pkcs8::DecodePrivateKey;
use rcgen::{CertificateParams, CustomExtension, KeyPair, SanType};
use sha2::{Digest as _, Sha256};

use crate::errors::PipelineError;
use crate::identity::IdentityPattern;
use crate::image::ImageVerifier;
use crate::models::oci::{
    ANNOTATION_PREDICATE_TYPE, ANNOTATION_REFERENCE_DIGEST, ANNOTATION_REFERENCE_TYPE, Digest,
    MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST, ManifestDocument, PREDICATE_SLSA_PROVENANCE_V02,
    PREDICATE_SPDX_DOCUMENT, REFERENCE_TYPE_ATTESTATION,
};
use crate::models::reference::ImageReference;
use crate::registry::RegistryClient;
use crate::signer::BundleSigner;

#[derive(Default)]
pub(crate) struct InMemoryRegistry {
    manifests: Mutex<HashMap<Digest, Vec<u8>>>,
    blobs: Mutex<HashMap<Digest, Vec<u8>>>,
    manifest_fetches: AtomicUsize,
    blob_fetches: AtomicUsize,
}

impl InMemoryRegistry {
    pub(crate) fn put_manifest(&self, document: serde_json::Value) -> Digest {
        let bytes = serde_json::to_vec(&document).unwrap();
        let digest = Digest::sha256_of(&bytes);
        self.manifests.lock().unwrap().insert(digest.clone(), bytes);
        digest
    }

    pub(crate) fn put_blob(&self, bytes: Vec<u8>) -> Digest {
        let digest = Digest::sha256_of(&bytes);
        self.blobs.lock().unwrap().insert(digest.clone(), bytes);
        digest
    }

    pub(crate) fn manifest_fetches(&self) -> usize {
        self.manifest_fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn blob_fetches(&self) -> usize {
        self.blob_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistry {
    async fn fetch_manifest(&self, digest: &Digest) -> Result<ManifestDocument, PipelineError> {
        self.manifest_fetches.fetch_add(1, Ordering::SeqCst);
        let bytes = self
            .manifests
            .lock()
            .unwrap()
            .get(digest)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("manifest {}", digest)))?;
        Ok(serde_json::from_slice(&bytes).unwrap())
    }

    async fn fetch_blob(&self, digest: &Digest) -> Result<Vec<u8>, PipelineError> {
        self.blob_fetches.fetch_add(1, Ordering::SeqCst);
        self.blobs
            .lock()
            .unwrap()
            .get(digest)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("blob {}", digest)))
    }
}

/// An in-toto statement about `subject`. `marker` keeps otherwise equal statements distinct.
pub(crate) fn statement_bytes(subject: &Digest, predicate_type: &str, marker: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "_type": "https://in-toto.io/Statement/v0.1",
        "subject": [{"name": "pkg:docker/kubewarden/policy-server", "digest": {"sha256": subject.hex()}}],
        "predicateType": predicate_type,
        "predicate": {"marker": marker}
    }))
    .unwrap()
}

/// Expected digests for one platform of a [`RegistryFixture`].
pub(crate) struct PlatformFixture {
    pub platform_digest: Digest,
    pub attestation_manifest_digest: Digest,
    pub provenance: Digest,
    pub sboms: Vec<Digest>,
}

/// A buildkit-shaped multi-architecture image stored in an [`InMemoryRegistry`].
pub(crate) struct RegistryFixture {
    pub registry: Arc<InMemoryRegistry>,
    pub index_digest: Digest,
    pub platforms: HashMap<String, PlatformFixture>,
}

#[derive(Default)]
pub(crate) struct RegistryFixtureBuilder {
    platforms: Vec<(String, usize)>,
    duplicate_attestations: Vec<String>,
}

impl RegistryFixture {
    pub(crate) fn builder() -> RegistryFixtureBuilder {
        RegistryFixtureBuilder::default()
    }
}

fn layer(digest: &Digest, predicate_type: &str) -> serde_json::Value {
    serde_json::json!({
        "mediaType": "application/vnd.in-toto+json",
        "digest": digest,
        "size": 1,
        "annotations": {ANNOTATION_PREDICATE_TYPE: predicate_type}
    })
}

impl RegistryFixtureBuilder {
    pub(crate) fn platform(mut self, arch: &str, sbom_count: usize) -> Self {
        self.platforms.push((arch.to_string(), sbom_count));
        self
    }

    /// Lists a second, different attestation manifest for `arch` after the real one.
    pub(crate) fn duplicate_attestation(mut self, arch: &str) -> Self {
        self.duplicate_attestations.push(arch.to_string());
        self
    }

    pub(crate) fn build(self) -> RegistryFixture {
        let registry = Arc::new(InMemoryRegistry::default());
        let mut entries = Vec::new();
        let mut platforms = HashMap::new();

        for (arch, sbom_count) in &self.platforms {
            let platform_digest = registry.put_manifest(serde_json::json!({
                "schemaVersion": 2,
                "mediaType": MEDIA_TYPE_OCI_MANIFEST,
                "layers": [],
                "annotations": {"org.opencontainers.image.title": arch}
            }));
            let provenance = registry.put_blob(statement_bytes(
                &platform_digest,
                PREDICATE_SLSA_PROVENANCE_V02,
                arch,
            ));
            let sboms: Vec<Digest> = (0..*sbom_count)
                .map(|i| {
                    registry.put_blob(statement_bytes(
                        &platform_digest,
                        PREDICATE_SPDX_DOCUMENT,
                        &format!("{}-{}", arch, i),
                    ))
                })
                .collect();

            let mut layers = vec![layer(&provenance, PREDICATE_SLSA_PROVENANCE_V02)];
            layers.extend(sboms.iter().map(|d| layer(d, PREDICATE_SPDX_DOCUMENT)));
            let attestation_manifest_digest = registry.put_manifest(serde_json::json!({
                "schemaVersion": 2,
                "mediaType": MEDIA_TYPE_OCI_MANIFEST,
                "layers": layers
            }));

            let attestation_entry = |digest: &Digest| {
                serde_json::json!({
                    "mediaType": MEDIA_TYPE_OCI_MANIFEST,
                    "digest": digest,
                    "size": 1,
                    "platform": {"os": "unknown", "architecture": "unknown"},
                    "annotations": {
                        ANNOTATION_REFERENCE_TYPE: REFERENCE_TYPE_ATTESTATION,
                        ANNOTATION_REFERENCE_DIGEST: platform_digest
                    }
                })
            };
            entries.push(serde_json::json!({
                "mediaType": MEDIA_TYPE_OCI_MANIFEST,
                "digest": platform_digest,
                "size": 1,
                "platform": {"os": "linux", "architecture": arch}
            }));
            entries.push(attestation_entry(&attestation_manifest_digest));
            if self.duplicate_attestations.contains(arch) {
                let decoy = registry.put_manifest(serde_json::json!({
                    "schemaVersion": 2,
                    "mediaType": MEDIA_TYPE_OCI_MANIFEST,
                    "layers": [layer(&provenance, PREDICATE_SLSA_PROVENANCE_V02)],
                    "annotations": {"decoy": "true"}
                }));
                entries.push(attestation_entry(&decoy));
            }

            platforms.insert(
                arch.clone(),
                PlatformFixture {
                    platform_digest,
                    attestation_manifest_digest,
                    provenance,
                    sboms,
                },
            );
        }

        let index_digest = registry.put_manifest(serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_INDEX,
            "manifests": entries
        }));

        RegistryFixture {
            registry,
            index_digest,
            platforms,
        }
    }
}

/// Accepts or rejects every image, and counts the calls.
pub(crate) struct ScriptedImageVerifier {
    accept: bool,
    calls: AtomicUsize,
}

impl ScriptedImageVerifier {
    pub(crate) fn accepting() -> Self {
        ScriptedImageVerifier {
            accept: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn rejecting() -> Self {
        ScriptedImageVerifier {
            accept: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageVerifier for ScriptedImageVerifier {
    async fn verify_image(
        &self,
        image: &ImageReference,
        identity: &IdentityPattern,
    ) -> Result<(), PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.accept {
            Ok(())
        } else {
            Err(PipelineError::SignatureInvalid(format!(
                "{} is not signed by {}",
                image,
                identity.identity_regexp()
            )))
        }
    }
}

/// DER UTF8String, as Fulcio encodes the issuer in extension 1.3.6.1.4.1.57264.1.8.
fn der_utf8_string(value: &str) -> Vec<u8> {
    let bytes = value.as_bytes();
    let mut der = vec![0x0c];
    if bytes.len() < 0x80 {
        der.push(bytes.len() as u8);
    } else {
        der.extend([0x81, bytes.len() as u8]);
    }
    der.extend_from_slice(bytes);
    der
}

/// Signs with a local P-256 key whose self-issued certificate carries the
/// same SAN and issuer extensions as a Fulcio certificate.
pub(crate) struct LocalSigner {
    signing_key: SigningKey,
    certificate_der: Vec<u8>,
    include_message_digest: bool,
}

impl LocalSigner {
    pub(crate) fn new(issuer: &str, identity: &str) -> Self {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.subject_alt_names = vec![if identity.contains("://") {
            SanType::URI(identity.try_into().unwrap())
        } else {
            SanType::Rfc822Name(identity.try_into().unwrap())
        }];
        params.custom_extensions = vec![
            CustomExtension::from_oid_content(
                &[1, 3, 6, 1, 4, 1, 57264, 1, 1],
                issuer.as_bytes().to_vec(),
            ),
            CustomExtension::from_oid_content(&[1, 3, 6, 1, 4, 1, 57264, 1, 8], der_utf8_string(issuer)),
        ];
        let certificate = params.self_signed(&key_pair).unwrap();
        let signing_key = SigningKey::from_pkcs8_der(&key_pair.serialize_der()).unwrap();

        LocalSigner {
            signing_key,
            certificate_der: certificate.der().to_vec(),
            include_message_digest: true,
        }
    }

    pub(crate) fn without_message_digest(mut self) -> Self {
        self.include_message_digest = false;
        self
    }
}

#[async_trait]
impl BundleSigner for LocalSigner {
    async fn sign(&self, payload: &[u8]) -> Result<String, PipelineError> {
        let signature: Signature = self.signing_key.sign(payload);
        let mut message_signature = serde_json::json!({
            "signature": STANDARD.encode(signature.to_der().as_bytes())
        });
        if self.include_message_digest {
            message_signature["messageDigest"] = serde_json::json!({
                "algorithm": "SHA2_256",
                "digest": STANDARD.encode(Sha256::digest(payload))
            });
        }
        Ok(serde_json::json!({
            "mediaType": "application/vnd.dev.sigstore.bundle+json;version=0.2",
            "verificationMaterial": {
                "x509CertificateChain": {
                    "certificates": [{"rawBytes": STANDARD.encode(&self.certificate_der)}]
                },
                "tlogEntries": []
            },
            "messageSignature": message_signature
        })
        .to_string())
    }
}
