//! OAuth 2.0 helpers: state tokens, PKCE and token responses

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{PlatformError, Result};
use crate::types::{AccessTokenData, Platform};

/// Random, URL-safe `state` parameter
pub fn generate_state() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// PKCE verifier and its S256 challenge
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let bytes: [u8; 32] = rand::thread_rng().gen();
        let verifier = URL_SAFE_NO_PAD.encode(bytes);
        let challenge = challenge_for(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Append query parameters to an authorization endpoint
pub fn authorize_url(platform: Platform, base: &str, params: &[(&str, &str)]) -> Result<String> {
    Url::parse_with_params(base, params)
        .map(String::from)
        .map_err(|e| {
            PlatformError::platform(format!("Invalid {} authorization URL: {}", platform, e))
                .with_context("platform", platform.as_str())
                .into()
        })
}

/// Standard OAuth 2.0 token endpoint response
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl From<TokenResponse> for AccessTokenData {
    fn from(response: TokenResponse) -> Self {
        AccessTokenData::from_expires_in(
            response.access_token,
            response.refresh_token,
            response.expires_in,
            response.token_type,
            response.scope,
        )
    }
}

pub fn scopes_or(configured: Option<&Vec<String>>, defaults: &[&str], separator: &str) -> String {
    match configured {
        Some(scopes) if !scopes.is_empty() => scopes.join(separator),
        _ => defaults.join(separator),
    }
}

pub fn missing_verifier(platform: Platform) -> crate::error::PostflowError {
    PlatformError::validation(format!("{} authorization requires a PKCE code verifier", platform))
        .with_context("platform", platform.as_str())
        .into()
}
