// SPDX-License-Identifier: Apache-2.0

use regex::Regex;
use serde::{Serialize, Serializer};

use crate::errors::PipelineError;

pub(crate) const GITHUB_ACTIONS_ISSUER: &str = "https://token.actions.githubusercontent.com";

/// The signer a certificate must belong to: an OIDC issuer plus a regular
/// expression over the certificate identity (SAN URI or email).
///
/// Matching is unanchored, like cosign's `--certificate-identity-regexp`;
/// patterns built by [`IdentityPattern::github_workflow`] are anchored.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct IdentityPattern {
    issuer: String,
    #[serde(serialize_with = "serialize_regex")]
    identity: Regex,
}

fn serialize_regex<S: Serializer>(regex: &Regex, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(regex.as_str())
}

impl IdentityPattern {
    pub(crate) fn new(issuer: &str, identity_regexp: &str) -> Result<Self, PipelineError> {
        if issuer.is_empty() {
            return Err(PipelineError::SignatureInvalid(
                "the OIDC issuer cannot be empty".to_string(),
            ));
        }
        let identity = Regex::new(identity_regexp).map_err(|e| {
            PipelineError::SignatureInvalid(format!(
                "invalid certificate identity regexp '{}': {}",
                identity_regexp, e
            ))
        })?;
        Ok(IdentityPattern {
            issuer: issuer.to_string(),
            identity,
        })
    }

    /// Binds to one workflow file of one repository at one git ref, e.g.
    /// `https://github.com/kubewarden/policy-server/.github/workflows/release.yml@refs/tags/v1.0.0`.
    pub(crate) fn github_workflow(
        owner: &str,
        repository: &str,
        workflow_path: &str,
        git_ref: &str,
    ) -> Result<Self, PipelineError> {
        let workflow_path = workflow_path.trim_start_matches('/');
        let regexp = format!(
            "^https://github\\.com/{}/{}/{}@{}$",
            regex::escape(owner),
            regex::escape(repository),
            regex::escape(workflow_path),
            regex::escape(git_ref)
        );
        IdentityPattern::new(GITHUB_ACTIONS_ISSUER, &regexp)
    }

    pub(crate) fn issuer(&self) -> &str {
        &self.issuer
    }

    pub(crate) fn identity_regexp(&self) -> &str {
        self.identity.as_str()
    }

    pub(crate) fn matches_issuer(&self, issuer: &str) -> bool {
        self.issuer == issuer
    }

    pub(crate) fn matches_identity(&self, identity: &str) -> bool {
        self.identity.is_match(identity)
    }

    pub(crate) fn matches(&self, issuer: &str, identity: &str) -> bool {
        self.matches_issuer(issuer) && self.matches_identity(identity)
    }
}
