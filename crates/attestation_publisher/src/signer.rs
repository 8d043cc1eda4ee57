// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use serde::Deserialize;
use sigstore::bundle::sign::SigningContext;
use sigstore::oauth::IdentityToken;
use tokio::task::spawn_blocking;
use tracing::{debug, info};

use crate::attestation::verify_bundle;
use crate::errors::PipelineError;
use crate::identity::IdentityPattern;

const SIGSTORE_AUDIENCE: &str = "sigstore";

/// Produces a Sigstore bundle (JSON) over arbitrary bytes.
#[async_trait]
pub(crate) trait BundleSigner: Send + Sync {
    async fn sign(&self, payload: &[u8]) -> Result<String, PipelineError>;
}

/// Where the short-lived OIDC token used for keyless signing comes from.
#[derive(Debug, Clone)]
pub(crate) enum IdentityTokenSource {
    /// A token handed over by the caller, e.g. `SIGSTORE_ID_TOKEN`.
    Static(String),
    /// The GitHub Actions OIDC provider of the running job.
    GithubActions {
        request_url: String,
        request_token: String,
    },
}

#[derive(Deserialize)]
struct GithubTokenResponse {
    value: String,
}

impl IdentityTokenSource {
    /// An explicit token wins over the GitHub Actions provider.
    pub(crate) fn detect(
        sigstore_id_token: Option<String>,
        actions_request_url: Option<String>,
        actions_request_token: Option<String>,
    ) -> Result<Self, PipelineError> {
        match (sigstore_id_token, actions_request_url, actions_request_token) {
            (Some(token), _, _) if !token.is_empty() => Ok(IdentityTokenSource::Static(token)),
            (_, Some(request_url), Some(request_token)) => Ok(IdentityTokenSource::GithubActions {
                request_url,
                request_token,
            }),
            _ => Err(PipelineError::Signing(
                "no OIDC identity token available: set SIGSTORE_ID_TOKEN or run inside GitHub Actions with `id-token: write`"
                    .to_string(),
            )),
        }
    }

    pub(crate) async fn fetch(&self, http: &reqwest::Client) -> Result<String, PipelineError> {
        match self {
            IdentityTokenSource::Static(token) => Ok(token.clone()),
            IdentityTokenSource::GithubActions {
                request_url,
                request_token,
            } => {
                debug!("requesting OIDC token from GitHub Actions");
                let response = http
                    .get(request_url)
                    .query(&[("audience", SIGSTORE_AUDIENCE)])
                    .bearer_auth(request_token)
                    .send()
                    .await
                    .map_err(|e| PipelineError::Signing(format!("OIDC token request failed: {}", e)))?;
                if !response.status().is_success() {
                    return Err(PipelineError::Signing(format!(
                        "OIDC token request failed: HTTP status {}",
                        response.status()
                    )));
                }
                let body: GithubTokenResponse = response.json().await.map_err(|e| {
                    PipelineError::Signing(format!("malformed OIDC token response: {}", e))
                })?;
                Ok(body.value)
            }
        }
    }
}

/// Signs with an ephemeral key certified by Fulcio and logged in Rekor.
pub(crate) struct KeylessSigner {
    token_source: IdentityTokenSource,
    http: reqwest::Client,
}

impl KeylessSigner {
    pub(crate) fn new(token_source: IdentityTokenSource) -> Self {
        KeylessSigner {
            token_source,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl BundleSigner for KeylessSigner {
    async fn sign(&self, payload: &[u8]) -> Result<String, PipelineError> {
        let raw_token = self.token_source.fetch(&self.http).await?;
        let token = IdentityToken::try_from(raw_token.as_str())
            .map_err(|e| PipelineError::Signing(format!("invalid OIDC token: {}", e)))?;
        let payload = payload.to_vec();

        // sigstore's signing session is not Send and drives its own runtime,
        // so it has to live on the blocking pool.
        spawn_blocking(move || sign_blocking(token, &payload))
            .await
            .map_err(|e| PipelineError::Signing(format!("signing task failed: {}", e)))?
    }
}

fn sign_blocking(token: IdentityToken, payload: &[u8]) -> Result<String, PipelineError> {
    let context = SigningContext::production()
        .map_err(|e| PipelineError::Signing(format!("cannot create signing context: {}", e)))?;
    let session = context
        .blocking_signer(token)
        .map_err(|e| PipelineError::Signing(format!("cannot obtain signing certificate: {}", e)))?;
    let artifact = session
        .sign(payload)
        .map_err(|e| PipelineError::Signing(format!("signing failed: {}", e)))?;
    debug!("payload signed and logged in Rekor");

    serde_json::to_string(&artifact.to_bundle())
        .map_err(|e| PipelineError::Signing(format!("cannot serialize bundle: {}", e)))
}

/// Signs `payload` and verifies the produced bundle against the identity it
/// was meant to be signed with. A bundle that fails here is never returned.
pub(crate) async fn sign_and_self_verify<S: BundleSigner + ?Sized>(
    signer: &S,
    payload: &[u8],
    identity: &IdentityPattern,
) -> Result<String, PipelineError> {
    let bundle = signer.sign(payload).await?;
    let matched = verify_bundle(&bundle, payload, identity)
        .map_err(|e| PipelineError::SelfVerificationFailure(format!("{:#}", e)))?;
    info!(identity = %matched, "signature bundle self-verified");
    Ok(bundle)
}
