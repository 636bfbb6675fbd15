//! OAuth2 authorization-code login against Google and GitHub.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use reqwest::Client;
use serde::Deserialize;

use crate::config::{OAuthClientConfig, ServerConfig};
use crate::error::{Error, Result};
use crate::types::{OAuthIdentity, OAuthProvider};

const STATE_BYTES: usize = 32;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("workbench/", env!("CARGO_PKG_VERSION"));

/// Generates a URL-safe CSRF state from 32 random bytes.
#[must_use]
pub fn generate_state() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// An identity provider that can start a login and resolve a callback code.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn authorization_url(&self, state: &str) -> String;

    async fn exchange_code(&self, code: &str) -> Result<OAuthIdentity>;
}

pub type ProviderRegistry = HashMap<OAuthProvider, Arc<dyn IdentityProvider>>;

/// Builds providers for every client configured in `config`.
pub fn providers_from_config(config: &ServerConfig) -> Result<ProviderRegistry> {
    let http = Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

    let mut providers: ProviderRegistry = HashMap::new();
    if let Some(client) = &config.google {
        providers.insert(
            OAuthProvider::Google,
            Arc::new(GoogleProvider::new(client.clone(), http.clone())),
        );
    }
    if let Some(client) = &config.github {
        providers.insert(
            OAuthProvider::GitHub,
            Arc::new(GitHubProvider::new(client.clone(), http)),
        );
    }
    Ok(providers)
}

fn build_url(base: &str, params: &[(&str, &str)]) -> String {
    let query = params
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{base}?{query}")
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: Option<String>,
    error: Option<String>,
}

impl AccessTokenResponse {
    fn into_token(self) -> Result<String> {
        match self.access_token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(Error::Upstream(
                self.error
                    .unwrap_or_else(|| "no access token returned".to_string()),
            )),
        }
    }
}

async fn request_json<T: for<'de> Deserialize<'de>>(
    request: reqwest::RequestBuilder,
    what: &str,
) -> Result<T> {
    let response = request
        .send()
        .await
        .map_err(|e| Error::Upstream(format!("{what}: {e}")))?;

    if !response.status().is_success() {
        return Err(Error::Upstream(format!(
            "{what}: provider returned {}",
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| Error::Upstream(format!("{what}: {e}")))
}

pub struct GoogleProvider {
    client: OAuthClientConfig,
    http: Client,
}

impl GoogleProvider {
    const AUTH_URL: &'static str = "https://accounts.google.com/o/oauth2/v2/auth";
    const TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";
    const USER_INFO_URL: &'static str = "https://www.googleapis.com/oauth2/v2/userinfo";
    const SCOPE: &'static str = "openid email profile";

    pub fn new(client: OAuthClientConfig, http: Client) -> Self {
        Self { client, http }
    }
}

#[derive(Debug, Deserialize)]
struct GoogleUserInfo {
    id: String,
    email: String,
    name: Option<String>,
    picture: Option<String>,
}

#[async_trait]
impl IdentityProvider for GoogleProvider {
    fn authorization_url(&self, state: &str) -> String {
        build_url(
            Self::AUTH_URL,
            &[
                ("client_id", self.client.client_id.as_str()),
                ("redirect_uri", self.client.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", Self::SCOPE),
                ("state", state),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )
    }

    async fn exchange_code(&self, code: &str) -> Result<OAuthIdentity> {
        let token: AccessTokenResponse = request_json(
            self.http.post(Self::TOKEN_URL).form(&[
                ("client_id", self.client.client_id.as_str()),
                ("client_secret", self.client.client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.client.redirect_uri.as_str()),
            ]),
            "google token exchange",
        )
        .await?;
        let access_token = token.into_token()?;

        let info: GoogleUserInfo = request_json(
            self.http.get(Self::USER_INFO_URL).bearer_auth(&access_token),
            "google user info",
        )
        .await?;

        Ok(OAuthIdentity {
            provider: OAuthProvider::Google,
            provider_user_id: info.id,
            email: info.email,
            display_name: info.name,
            avatar_url: info.picture,
        })
    }
}

pub struct GitHubProvider {
    client: OAuthClientConfig,
    http: Client,
}

impl GitHubProvider {
    const AUTH_URL: &'static str = "https://github.com/login/oauth/authorize";
    const TOKEN_URL: &'static str = "https://github.com/login/oauth/access_token";
    const USER_INFO_URL: &'static str = "https://api.github.com/user";
    const USER_EMAIL_URL: &'static str = "https://api.github.com/user/emails";
    const SCOPE: &'static str = "read:user user:email";

    pub fn new(client: OAuthClientConfig, http: Client) -> Self {
        Self { client, http }
    }
}

#[derive(Debug, Deserialize)]
struct GitHubUser {
    id: i64,
    login: String,
    name: Option<String>,
    email: Option<String>,
    avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    #[serde(default)]
    primary: bool,
    #[serde(default)]
    verified: bool,
}

/// Primary verified address first, then any verified address.
fn pick_github_email(emails: &[GitHubEmail]) -> Option<String> {
    emails
        .iter()
        .find(|e| e.primary && e.verified)
        .or_else(|| emails.iter().find(|e| e.verified))
        .map(|e| e.email.clone())
}

#[async_trait]
impl IdentityProvider for GitHubProvider {
    fn authorization_url(&self, state: &str) -> String {
        build_url(
            Self::AUTH_URL,
            &[
                ("client_id", self.client.client_id.as_str()),
                ("redirect_uri", self.client.redirect_uri.as_str()),
                ("scope", Self::SCOPE),
                ("state", state),
            ],
        )
    }

    async fn exchange_code(&self, code: &str) -> Result<OAuthIdentity> {
        let token: AccessTokenResponse = request_json(
            self.http
                .post(Self::TOKEN_URL)
                .header(reqwest::header::ACCEPT, "application/json")
                .form(&[
                    ("client_id", self.client.client_id.as_str()),
                    ("client_secret", self.client.client_secret.as_str()),
                    ("code", code),
                    ("redirect_uri", self.client.redirect_uri.as_str()),
                ]),
            "github token exchange",
        )
        .await?;
        let access_token = token.into_token()?;

        let user: GitHubUser = request_json(
            self.http
                .get(Self::USER_INFO_URL)
                .bearer_auth(&access_token)
                .header(reqwest::header::ACCEPT, "application/json"),
            "github user info",
        )
        .await?;

        let email = match user.email.filter(|e| !e.is_empty()) {
            Some(email) => Some(email),
            None => {
                let emails: Vec<GitHubEmail> = request_json(
                    self.http
                        .get(Self::USER_EMAIL_URL)
                        .bearer_auth(&access_token)
                        .header(reqwest::header::ACCEPT, "application/json"),
                    "github user emails",
                )
                .await?;
                pick_github_email(&emails)
            }
        };
        let email = email.ok_or_else(|| {
            Error::Upstream("no verified email found in GitHub account".to_string())
        })?;

        Ok(OAuthIdentity {
            provider: OAuthProvider::GitHub,
            provider_user_id: user.id.to_string(),
            email,
            display_name: user.name.or(Some(user.login)),
            avatar_url: user.avatar_url,
        })
    }
}
