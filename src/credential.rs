use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{CredentialConfig, DeviceIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Valid,
    Expired,
    Invalid,
}

/// Time-limited SAS token granting publish/subscribe rights on the broker.
/// Owned exclusively by the provider; consumers get a clone of the token
/// string that is only good for the connection attempt in hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub issued_at_ms: u64,
    pub expires_at_ms: u64,
    pub status: CredentialStatus,
}

impl Credential {
    pub fn is_usable(&self, now_ms: u64, margin_ms: u64) -> bool {
        self.status == CredentialStatus::Valid
            && now_ms < self.expires_at_ms.saturating_sub(margin_ms)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("token issuer unreachable: {0}")]
    IssuanceUnreachable(&'static str),
    #[error("token issuer rejected request (status {0})")]
    IssuanceRejected(u16),
    #[error("token issuer response malformed")]
    ResponseMalformed,
}

/// Outbound issuance request. The issuer signs
/// `<hostname>/devices/<device_id>` with the shared key.
#[derive(Debug)]
pub struct TokenRequest<'a> {
    pub hostname: &'a str,
    pub device_id: &'a str,
    pub primary_key: &'a str,
    pub ttl_s: u64,
}

#[derive(Debug)]
pub struct IssuerReply {
    pub status: u16,
    pub body: String,
}

/// The backend issuance endpoint, reached over an HTTPS-equivalent channel
/// owned by the platform layer. `Err` means the channel itself failed.
pub trait TokenIssuer {
    fn request_token(&mut self, request: &TokenRequest<'_>) -> Result<IssuerReply, &'static str>;
}

#[derive(Deserialize)]
struct IssuanceEnvelope {
    data: IssuanceData,
}

#[derive(Deserialize)]
struct IssuanceData {
    #[serde(rename = "sasToken")]
    sas_token: String,
}

/// Requests, caches, and renews the transport credential. Each `acquire` is
/// atomic from the caller's perspective: it either hands back a token that is
/// valid past the safety margin or an error the caller retries next tick.
#[derive(Debug)]
pub struct CredentialProvider {
    identity: DeviceIdentity,
    config: CredentialConfig,
    cached: Option<Credential>,
    issuance_count: u32,
}

impl CredentialProvider {
    pub fn new(identity: DeviceIdentity, config: CredentialConfig) -> Self {
        Self {
            identity,
            config,
            cached: None,
            issuance_count: 0,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Pure expiry check against the cached credential.
    pub fn is_valid(&self, now_ms: u64) -> bool {
        let margin_ms = self.config.renewal_margin_s * 1000;
        self.cached
            .as_ref()
            .map(|c| c.is_usable(now_ms, margin_ms))
            .unwrap_or(false)
    }

    /// Marks the cached credential unusable so the next `acquire` re-issues.
    /// Called by the transport when the broker rejects the token.
    pub fn invalidate(&mut self) {
        if let Some(credential) = self.cached.as_mut() {
            credential.status = CredentialStatus::Invalid;
        }
    }

    /// Number of issuance round-trips performed since boot.
    pub fn issuance_count(&self) -> u32 {
        self.issuance_count
    }

    pub fn acquire<I: TokenIssuer>(
        &mut self,
        issuer: &mut I,
        now_ms: u64,
    ) -> Result<&Credential, CredentialError> {
        if !self.is_valid(now_ms) {
            match self.issue(issuer, now_ms) {
                Ok(credential) => {
                    debug!(
                        expires_at_ms = credential.expires_at_ms,
                        "credential issued"
                    );
                    self.cached = Some(credential);
                }
                Err(err) => {
                    self.invalidate();
                    return Err(err);
                }
            }
        }
        match self.cached.as_ref() {
            Some(credential) => Ok(credential),
            None => Err(CredentialError::ResponseMalformed),
        }
    }

    fn issue<I: TokenIssuer>(
        &mut self,
        issuer: &mut I,
        now_ms: u64,
    ) -> Result<Credential, CredentialError> {
        let request = TokenRequest {
            hostname: &self.identity.hostname,
            device_id: &self.identity.device_id,
            primary_key: &self.identity.primary_key,
            ttl_s: self.config.ttl_s,
        };

        let reply = issuer.request_token(&request).map_err(|reason| {
            warn!(reason, "token issuer unreachable");
            CredentialError::IssuanceUnreachable(reason)
        })?;

        if !(200..300).contains(&reply.status) {
            warn!(status = reply.status, "token issuer rejected request");
            return Err(CredentialError::IssuanceRejected(reply.status));
        }

        let envelope: IssuanceEnvelope =
            serde_json::from_str(&reply.body).map_err(|_| CredentialError::ResponseMalformed)?;
        if envelope.data.sas_token.is_empty() {
            return Err(CredentialError::ResponseMalformed);
        }

        self.issuance_count += 1;
        Ok(Credential {
            token: envelope.data.sas_token,
            issued_at_ms: now_ms,
            expires_at_ms: now_ms + self.config.ttl_s * 1000,
            status: CredentialStatus::Valid,
        })
    }
}
