//! Narrow seam to the identity provider used at device registration.
//! Verification internals live with the provider; the core only needs a
//! (user id, email) pair out of an assertion.

use anyhow::anyhow;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use tracing::{error, warn};

use crate::config::Config;
use crate::error::AppError;

use super::sha256_hex;

#[derive(Debug, Clone)]
pub struct VerifiedUser {
    pub user_id: String,
    pub email: String,
}

pub struct AssertionVerifier {
    http: reqwest::Client,
    verifier_url: Option<String>,
    disabled: bool,
}

impl AssertionVerifier {
    pub fn from_config(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            verifier_url: config.assertion_verifier.clone(),
            disabled: config.auth_disabled,
        }
    }

    pub async fn verify(&self, assertion: &str) -> Result<VerifiedUser, AppError> {
        // ******** DO NOT ENABLE AUTH_DISABLED IN PRODUCTION!! ******
        if self.disabled {
            warn!("!!! skipping assertion validation");
            return extract_unverified(assertion);
        }

        let Some(url) = &self.verifier_url else {
            error!("no assertion verifier configured");
            return Err(AppError::Unauthorized);
        };

        let reply: Value = self
            .http
            .post(url)
            .json(&serde_json::json!({ "assertion": assertion }))
            .send()
            .await
            .map_err(|err| {
                error!(error = %err, "assertion verification request failed");
                AppError::Unauthorized
            })?
            .json()
            .await
            .map_err(|_| AppError::Unauthorized)?;

        if reply.get("status").and_then(Value::as_str) != Some("okay") {
            error!(
                reason = reply.get("reason").and_then(Value::as_str).unwrap_or(""),
                "assertion verification rejected"
            );
            return Err(AppError::Unauthorized);
        }
        let email = reply
            .get("email")
            .and_then(Value::as_str)
            .ok_or(AppError::Unauthorized)?;

        Ok(VerifiedUser {
            user_id: sha256_hex(email),
            email: email.to_string(),
        })
    }
}

/// Pull the email straight out of the assertion body WITHOUT verification.
/// Only reachable behind the auth_disabled test flag.
fn extract_unverified(assertion: &str) -> Result<VerifiedUser, AppError> {
    if assertion.is_empty() {
        return Ok(VerifiedUser {
            user_id: "user1".into(),
            email: "user@example.com".into(),
        });
    }

    let email = assertion_email(assertion).map_err(|err| {
        error!(error = %err, "could not extract email from assertion");
        AppError::Unauthorized
    })?;
    Ok(VerifiedUser {
        user_id: sha256_hex(&email),
        email,
    })
}

fn assertion_email(assertion: &str) -> anyhow::Result<String> {
    let mut bits = assertion.split('.');
    let payload = bits
        .nth(1)
        .ok_or_else(|| anyhow!("assertion has no payload segment"))?;
    // pad to a byte boundary before decoding
    let padded = format!("{}{}", payload, &"===="[..(4 - payload.len() % 4) % 4]);
    let decoded = BASE64.decode(padded)?;
    let claims: Value = serde_json::from_slice(&decoded)?;

    if let Some(email) = claims.get("fxa-verifiedEmail").and_then(Value::as_str) {
        return Ok(email.to_string());
    }
    claims
        .pointer("/principal/email")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("no email in assertion"))
}
