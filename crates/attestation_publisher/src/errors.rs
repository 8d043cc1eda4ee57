// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Every failure that can end a per-architecture run.
///
/// Each variant is terminal: the run stops at the step that produced it and
/// nothing is retried.
#[derive(Error, Debug)]
pub(crate) enum PipelineError {
    #[error("image signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("ambiguous registry response: {0}")]
    Ambiguous(String),

    #[error("registry transfer failed: {0}")]
    Transfer(String),

    #[error("signature bundle failed self-verification: {0}")]
    SelfVerificationFailure(String),

    #[error("invalid attestation: {0}")]
    InvalidAttestation(String),

    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("keyless signing failed: {0}")]
    Signing(String),

    #[error("architecture instance aborted: {0}")]
    Aborted(String),

    #[error("cannot write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Short, stable name of the variant, used in JSON reports.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            PipelineError::SignatureInvalid(_) => "SignatureInvalid",
            PipelineError::NotFound(_) => "NotFound",
            PipelineError::Ambiguous(_) => "Ambiguous",
            PipelineError::Transfer(_) => "Transfer",
            PipelineError::SelfVerificationFailure(_) => "SelfVerificationFailure",
            PipelineError::InvalidAttestation(_) => "InvalidAttestation",
            PipelineError::InvalidReference(_) => "InvalidReference",
            PipelineError::Signing(_) => "Signing",
            PipelineError::Aborted(_) => "Aborted",
            PipelineError::Io { .. } => "Io",
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        PipelineError::Transfer(e.to_string())
    }
}
