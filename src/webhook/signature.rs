use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::{header, Headers};
use crate::config::{HmacCredentials, PlatformCredentials, TokenCredentials};
use crate::domain::order::Platform;

type HmacSha256 = Hmac<Sha256>;

const AUTHORIZATION: &str = "Authorization";

/// Why a webhook was rejected. Logged, never returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    NotConfigured,
    MissingHeader,
    MalformedSignature,
    Mismatch,
}

impl Rejection {
    fn as_str(&self) -> &'static str {
        match self {
            Rejection::NotConfigured => "credentials_not_configured",
            Rejection::MissingHeader => "missing_authorization_header",
            Rejection::MalformedSignature => "malformed_signature",
            Rejection::Mismatch => "signature_mismatch",
        }
    }
}

/// Authenticates inbound webhooks per platform.
///
/// - `MARKETPLACE_A`: `hex(HMAC-SHA256(app_secret, app_key + body))` in the
///   `Authorization` header, compared case-insensitively in constant time.
/// - `MARKETPLACE_B` / `MARKETPLACE_C`: shared token (optionally `Bearer `
///   prefixed) in the `Authorization` header, matched against the
///   configured credential set.
pub struct SignatureVerifier {
    credentials: PlatformCredentials,
}

impl SignatureVerifier {
    pub fn new(credentials: PlatformCredentials) -> Self {
        Self { credentials }
    }

    /// Never fails loudly: any configuration or crypto problem is a `false`.
    pub fn verify(&self, platform: Platform, raw_body: &[u8], headers: &Headers) -> bool {
        let result = match platform {
            Platform::MarketplaceA => verify_hmac(&self.credentials.marketplace_a, raw_body, headers),
            Platform::MarketplaceB => verify_token(&self.credentials.marketplace_b, headers),
            Platform::MarketplaceC => verify_token(&self.credentials.marketplace_c, headers),
        };

        match result {
            Ok(()) => true,
            Err(rejection) => {
                tracing::warn!(
                    platform = %platform,
                    reason = rejection.as_str(),
                    body_len = raw_body.len(),
                    "Webhook signature verification failed"
                );
                false
            }
        }
    }
}

fn verify_hmac(creds: &HmacCredentials, raw_body: &[u8], headers: &Headers) -> Result<(), Rejection> {
    if creds.app_secret.is_empty() {
        return Err(Rejection::NotConfigured);
    }

    let signature = header(headers, AUTHORIZATION)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(Rejection::MissingHeader)?;
    // hex::decode accepts either case, which gives the case-insensitive match
    let signature = hex::decode(signature).map_err(|_| Rejection::MalformedSignature)?;

    let mut mac = HmacSha256::new_from_slice(creds.app_secret.as_bytes())
        .map_err(|_| Rejection::NotConfigured)?;
    mac.update(creds.app_key.as_bytes());
    mac.update(raw_body);

    mac.verify_slice(&signature).map_err(|_| Rejection::Mismatch)
}

fn verify_token(creds: &TokenCredentials, headers: &Headers) -> Result<(), Rejection> {
    if creds.tokens.is_empty() {
        return Err(Rejection::NotConfigured);
    }

    let presented = header(headers, AUTHORIZATION)
        .map(strip_bearer)
        .filter(|s| !s.is_empty())
        .ok_or(Rejection::MissingHeader)?;

    // Check every configured token so timing does not reveal which one matched
    let matched = creds
        .tokens
        .iter()
        .fold(false, |found, token| token_matches(token, presented) | found);

    if matched {
        Ok(())
    } else {
        Err(Rejection::Mismatch)
    }
}

/// Constant-time token comparison: both sides are MAC'd under the expected
/// token and the tags compared with `verify_slice`.
fn token_matches(expected: &str, presented: &str) -> bool {
    let tag = |input: &str| {
        HmacSha256::new_from_slice(expected.as_bytes()).map(|mut mac| {
            mac.update(input.as_bytes());
            mac
        })
    };

    match (tag(expected), tag(presented)) {
        (Ok(expected_mac), Ok(presented_mac)) => {
            let expected_tag = expected_mac.finalize().into_bytes();
            presented_mac.verify_slice(&expected_tag).is_ok()
        }
        _ => false,
    }
}

fn strip_bearer(value: &str) -> &str {
    let value = value.trim();
    match value.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => value[7..].trim(),
        _ => value,
    }
}
