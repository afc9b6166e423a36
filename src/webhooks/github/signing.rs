use std::io;

use anyhow::anyhow;
use hmac::{Hmac, Mac};
use rocket::{
    data::{ByteUnit, FromData, Outcome},
    http::Status,
    Data, Request,
};
use sha2::Sha256;
use tracing::{trace, warn};

use crate::config::RelayConfig;

const X_GITHUB_SIGNATURE: &str = "X-Hub-Signature-256";

type HmacSha256 = Hmac<Sha256>;

/// Computes the `X-Hub-Signature-256` header value GitHub would send for `data`.
#[cfg(test)]
pub fn sign(secret: &str, data: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(data);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Checks `signature` against the HMAC-SHA256 of `data` keyed with `secret`.
///
/// Never panics: a missing secret or header, a malformed header and a digest of the wrong length
/// are all reported as an invalid signature. The digest comparison runs in constant time.
pub fn validate_signature(secret: Option<&str>, signature: Option<&str>, data: &[u8]) -> bool {
    trace!("validating signature...");

    let secret = match secret {
        Some(secret) if !secret.is_empty() => secret,
        _ => {
            trace!("no webhook secret configured, can't validate anything");
            return false;
        }
    };

    let signature = match signature {
        Some(signature) => signature,
        None => {
            trace!("no signature to validate");
            return false;
        }
    };

    // GitHub puts a prefix in front of its hex SHA256
    let signature = match signature.strip_prefix("sha256=") {
        Some(s) => s,
        None => {
            trace!("couldn't strip prefix from signature `{}`", signature);
            return false;
        }
    };

    let bytes = match hex::decode(signature) {
        Ok(bytes) => bytes,
        Err(_) => {
            trace!("couldn't decode hex-encoded signature {}", signature);
            return false;
        }
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(data);

    // rejects digests of the wrong length instead of panicking
    mac.verify_slice(&bytes).is_ok()
}

/// Raw body of a webhook delivery whose signature was checked against the configured secret.
///
/// The bytes are kept untouched since the HMAC covers them exactly as sent.
pub struct SignedGitHubPayload(pub Vec<u8>);

const LIMIT: ByteUnit = ByteUnit::Mebibyte(25);

// Tracking issue for chaining Data guards to avoid reimplementing all this:
// https://github.com/SergioBenitez/Rocket/issues/775
#[rocket::async_trait]
impl<'r> FromData<'r> for SignedGitHubPayload {
    type Error = anyhow::Error;

    async fn from_data(request: &'r Request<'_>, data: Data<'r>) -> Outcome<'r, Self> {
        trace!("received payload on GitHub webhook endpoint: {:?}", request);

        let signatures = request
            .headers()
            .get(X_GITHUB_SIGNATURE)
            .collect::<Vec<_>>();
        let signature = match signatures.as_slice() {
            [signature] => Some(*signature),
            [] => {
                trace!("couldn't locate {} header", X_GITHUB_SIGNATURE);
                None
            }
            _ => {
                trace!("found more than one {} header", X_GITHUB_SIGNATURE);
                return Outcome::Error((
                    Status::Unauthorized,
                    anyhow!("request header needs exactly one signature"),
                ));
            }
        };

        let size_limit = request.limits().get("json").unwrap_or(LIMIT);
        let content = match data.open(size_limit).into_bytes().await {
            Ok(bytes) if bytes.is_complete() => bytes.into_inner(),
            Ok(_) => {
                let eof = io::ErrorKind::UnexpectedEof;
                trace!("payload was too big");
                return Outcome::Error((
                    Status::PayloadTooLarge,
                    io::Error::new(eof, "data limit exceeded").into(),
                ));
            }
            Err(e) => return Outcome::Error((Status::BadRequest, e.into())),
        };

        let secret = request
            .rocket()
            .state::<RelayConfig>()
            .and_then(|config| config.webhook_secret.as_deref());

        if !validate_signature(secret, signature, &content) {
            warn!("rejecting webhook delivery with an invalid signature");
            return Outcome::Error((Status::Unauthorized, anyhow!("couldn't verify signature")));
        }

        trace!("validated GitHub payload");
        Outcome::Success(SignedGitHubPayload(content))
    }
}
