//! API client for the Gridee backend.
//!
//! This module provides the `ApiClient` struct for the authentication
//! endpoints. Successful logins are written straight into the
//! `SessionManager`, and every non-public request picks its bearer token
//! from there.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::ApiError;
use crate::auth::SessionManager;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Endpoints that must never carry a bearer token.
const PUBLIC_PATHS: &[&str] = &[
    "/api/auth/login",
    "/api/users/register",
    "/api/users/login",
    "/api/users/social-signin",
    "/api/otp/generate",
    "/api/otp/validate",
];

const LOGIN_PATH: &str = "api/auth/login";
const REGISTER_PATH: &str = "api/users/register";
const SOCIAL_SIGN_IN_PATH: &str = "api/users/social-signin";
const CURRENT_USER_PATH: &str = "api/oauth2/user";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// New account details for `POST api/users/register`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub password: String,
    pub parking_lot_name: Option<String>,
    pub vehicle_numbers: Vec<String>,
}

/// Google account details forwarded to the social sign-in endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleSignIn {
    pub id_token: String,
    pub email: String,
    pub name: String,
    pub profile_picture: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SocialSignInRequest<'a> {
    #[serde(flatten)]
    account: &'a GoogleSignIn,
    provider: &'static str,
}

/// Login/registration payload. The mobile endpoints answer flat
/// (`token, id, name, role`), the newer ones nest the identity under `user`.
#[derive(Debug, Deserialize)]
struct RawAuthResponse {
    token: Option<String>,
    id: Option<String>,
    name: Option<String>,
    role: Option<String>,
    user: Option<RawAuthUser>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAuthUser {
    id: Option<String>,
    name: Option<String>,
    role: Option<String>,
}

/// Identity and token issued by a successful authentication call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub token: String,
    pub subject_id: String,
    pub display_name: String,
    pub role: String,
    pub message: Option<String>,
}

impl TryFrom<RawAuthResponse> for AuthResponse {
    type Error = ApiError;

    fn try_from(raw: RawAuthResponse) -> std::result::Result<Self, Self::Error> {
        let token = raw
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                ApiError::InvalidResponse("Login successful but no token received".to_string())
            })?;

        let (user_id, user_name, user_role) = match raw.user {
            Some(user) => (user.id, user.name, user.role),
            None => (None, None, None),
        };

        Ok(Self {
            token,
            subject_id: raw.id.or(user_id).unwrap_or_default(),
            display_name: raw.name.or(user_name).unwrap_or_default(),
            role: raw.role.or(user_role).unwrap_or_default(),
            message: raw.message,
        })
    }
}

// ============================================================================
// Client
// ============================================================================

/// API client for the Gridee backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    session: Arc<SessionManager>,
}

impl ApiClient {
    pub fn new(base_url: &str, session: Arc<SessionManager>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        let base_url = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };

        Ok(Self {
            client,
            base_url,
            session,
        })
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Email addresses are case-insensitive on the backend; phone numbers are
    /// passed through untouched.
    pub fn normalize_identifier(identifier: &str) -> String {
        let trimmed = identifier.trim();
        if trimmed.contains('@') {
            trimmed.to_lowercase()
        } else {
            trimmed.to_string()
        }
    }

    pub fn is_public_path(path: &str) -> bool {
        let path = format!("/{}", path.trim_start_matches('/'));
        PUBLIC_PATHS.iter().any(|public| path.contains(public))
    }

    fn auth_headers(&self, path: &str) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        if Self::is_public_path(path) {
            return Ok(headers);
        }

        match self.session.bearer_header_value()? {
            Some(bearer) => {
                headers.insert(header::AUTHORIZATION, header::HeaderValue::from_str(&bearer)?);
                debug!(path, "Attached bearer token");
            }
            None => debug!(path, "No valid session, sending request without token"),
        }
        Ok(headers)
    }

    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body).into())
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self
                .client
                .get(&url)
                .headers(self.auth_headers(path)?)
                .send()
                .await
                .map_err(ApiError::from)
                .with_context(|| format!("Failed to send GET request to {}", url))?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    return response
                        .json()
                        .await
                        .with_context(|| format!("Failed to parse JSON response from {}", url));
                }
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited.into());
                    }
                    warn!(url = %url, retry = retries, backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }

    async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.url(path);
        let response = self
            .client
            .post(&url)
            .headers(self.auth_headers(path)?)
            .json(body)
            .send()
            .await
            .map_err(ApiError::from)
            .with_context(|| format!("Failed to send POST request to {}", url))?;

        match Self::check_response_for_retry(response).await? {
            Some(response) => response
                .json()
                .await
                .with_context(|| format!("Failed to parse JSON response from {}", url)),
            None => Err(ApiError::RateLimited.into()),
        }
    }

    // ===== Authentication =====

    /// Log in with an email address or phone number.
    pub async fn login(&self, identifier: &str, password: &str) -> Result<AuthResponse> {
        let email = Self::normalize_identifier(identifier);
        let raw: RawAuthResponse = self
            .post(LOGIN_PATH, &LoginRequest {
                email: &email,
                password,
            })
            .await?;
        self.establish_session(raw)
    }

    pub async fn register(&self, registration: &Registration) -> Result<AuthResponse> {
        let raw: RawAuthResponse = self.post(REGISTER_PATH, registration).await?;
        self.establish_session(raw)
    }

    pub async fn google_sign_in(&self, account: &GoogleSignIn) -> Result<AuthResponse> {
        let raw: RawAuthResponse = self
            .post(SOCIAL_SIGN_IN_PATH, &SocialSignInRequest {
                account,
                provider: "google",
            })
            .await?;
        self.establish_session(raw)
    }

    pub fn logout(&self) -> Result<()> {
        self.session
            .clear_session()
            .context("Failed to clear session")?;
        info!("Logged out");
        Ok(())
    }

    /// Profile of the signed-in user as the server sees it.
    pub async fn current_user(&self) -> Result<serde_json::Value> {
        self.get(CURRENT_USER_PATH).await
    }

    fn establish_session(&self, raw: RawAuthResponse) -> Result<AuthResponse> {
        let auth = AuthResponse::try_from(raw)?;
        self.session
            .save_session(&auth.token, &auth.subject_id, &auth.display_name, &auth.role)
            .context("Failed to save session")?;
        info!(subject_id = %auth.subject_id, role = %auth.role, "Authenticated");
        Ok(auth)
    }
}

// ============================================================================
// Tests
// ============================================================================
