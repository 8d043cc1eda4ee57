// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::errors::PipelineError;

pub(crate) const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub(crate) const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub(crate) const MEDIA_TYPE_DOCKER_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub(crate) const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// Annotations buildkit puts on the attestation entries of an image index.
pub(crate) const ANNOTATION_REFERENCE_TYPE: &str = "vnd.docker.reference.type";
pub(crate) const ANNOTATION_REFERENCE_DIGEST: &str = "vnd.docker.reference.digest";
pub(crate) const REFERENCE_TYPE_ATTESTATION: &str = "attestation-manifest";

/// Annotation carried by each layer of an attestation manifest.
pub(crate) const ANNOTATION_PREDICATE_TYPE: &str = "in-toto.io/predicate-type";
pub(crate) const PREDICATE_SLSA_PROVENANCE_V02: &str = "https://slsa.dev/provenance/v0.2";
pub(crate) const PREDICATE_SPDX_DOCUMENT: &str = "https://spdx.dev/Document";

/// Content address of a registry object, `algorithm:hex`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    pub(crate) fn sha256_of(bytes: &[u8]) -> Self {
        Digest {
            algorithm: "sha256".to_string(),
            hex: hex::encode(Sha256::digest(bytes)),
        }
    }

    pub(crate) fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The encoded part after the colon, used to build collision-free file names.
    pub(crate) fn hex(&self) -> &str {
        &self.hex
    }

    /// Checks that `bytes` hash to this digest.
    pub(crate) fn verify(&self, bytes: &[u8]) -> Result<(), PipelineError> {
        if self.algorithm != "sha256" {
            return Err(PipelineError::Transfer(format!(
                "unsupported digest algorithm '{}'",
                self.algorithm
            )));
        }
        let calculated = Digest::sha256_of(bytes);
        if calculated.hex != self.hex {
            return Err(PipelineError::Transfer(format!(
                "digest mismatch: expected {}, calculated {}",
                self, calculated
            )));
        }
        Ok(())
    }
}

impl FromStr for Digest {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| PipelineError::InvalidReference(format!("digest '{}' has no algorithm", s)))?;
        if algorithm.is_empty()
            || !algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c))
        {
            return Err(PipelineError::InvalidReference(format!(
                "digest '{}' has an invalid algorithm",
                s
            )));
        }
        let valid_hex = match algorithm {
            "sha256" => hex.len() == 64,
            "sha512" => hex.len() == 128,
            _ => !hex.is_empty(),
        } && hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !valid_hex {
            return Err(PipelineError::InvalidReference(format!(
                "digest '{}' has an invalid encoded part",
                s
            )));
        }
        Ok(Digest {
            algorithm: algorithm.to_string(),
            hex: hex.to_string(),
        })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Target platform of a single-architecture manifest.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub(crate) struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub(crate) fn linux(architecture: &str) -> Self {
        Platform {
            os: "linux".to_string(),
            architecture: architecture.to_string(),
            variant: None,
        }
    }

    /// A requested platform without a variant matches any variant of that architecture.
    pub(crate) fn matches(&self, candidate: &Platform) -> bool {
        self.os == candidate.os
            && self.architecture == candidate.architecture
            && match &self.variant {
                Some(variant) => candidate.variant.as_deref() == Some(variant.as_str()),
                None => true,
            }
    }

    /// Architecture label used in artifact names, e.g. `arm64` or `arm-v7`.
    pub(crate) fn label(&self) -> String {
        match &self.variant {
            Some(variant) => format!("{}-{}", self.architecture, variant),
            None => self.architecture.clone(),
        }
    }
}

/// Accepts `amd64`, `arm/v7`, `linux/arm64` and `linux/arm/v7`.
impl FromStr for Platform {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let (os, architecture, variant) = match parts.as_slice() {
            [arch] => ("linux", *arch, None),
            [os @ ("linux" | "windows" | "darwin"), arch] => (*os, *arch, None),
            [arch, variant] => ("linux", *arch, Some(*variant)),
            [os, arch, variant] => (*os, *arch, Some(*variant)),
            _ => {
                return Err(PipelineError::InvalidReference(format!(
                    "invalid platform '{}'",
                    s
                )));
            }
        };
        if os.is_empty() || architecture.is_empty() || variant.is_some_and(str::is_empty) {
            return Err(PipelineError::InvalidReference(format!(
                "invalid platform '{}'",
                s
            )));
        }
        Ok(Platform {
            os: os.to_string(),
            architecture: architecture.to_string(),
            variant: variant.map(str::to_string),
        })
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// An entry of `manifests[]` or `layers[]`.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Descriptor {
    #[serde(default)]
    pub media_type: Option<String>,
    pub digest: Digest,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl Descriptor {
    pub(crate) fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// True for the index entries buildkit adds to hold attestations.
    pub(crate) fn is_attestation_manifest(&self) -> bool {
        self.annotation(ANNOTATION_REFERENCE_TYPE) == Some(REFERENCE_TYPE_ATTESTATION)
    }
}

/// Either an image index (`manifests[]`) or an image manifest (`layers[]`).
/// Registries return both shapes from the same endpoint.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ManifestDocument {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}
