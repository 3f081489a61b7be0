use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Full read/write access to the user's Drive.
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid client secret: {0}")]
    Json(#[from] serde_json::Error),
    #[error("client secret has neither an `installed` nor a `web` section")]
    MissingClientSection,
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

impl OAuthError {
    /// The token endpoint rejected the grant itself (revoked or expired refresh token).
    pub fn is_invalid_grant(&self) -> bool {
        let OAuthError::Api { status, body } = self else {
            return false;
        };
        if *status != StatusCode::BAD_REQUEST {
            return false;
        }
        serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|value| value.get("error")?.as_str().map(str::to_owned))
            .map_or(body.trim() == "invalid_grant", |error| error == "invalid_grant")
    }
}

/// OAuth client credentials as downloaded from the Google Cloud console.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClientSecret {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

#[derive(Deserialize)]
struct ClientSecretFile {
    installed: Option<ClientSecret>,
    web: Option<ClientSecret>,
}

impl ClientSecret {
    pub fn from_json(raw: &str) -> Result<Self, OAuthError> {
        let file: ClientSecretFile = serde_json::from_str(raw)?;
        file.installed
            .or(file.web)
            .ok_or(OAuthError::MissingClientSection)
    }
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Clone)]
pub struct OAuthClient {
    http: Client,
    auth_url: Url,
    token_url: Url,
    client_id: String,
    client_secret: String,
}

impl OAuthClient {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, OAuthError> {
        Ok(Self {
            http: Client::new(),
            auth_url: Url::parse(DEFAULT_AUTH_URI)?,
            token_url: Url::parse(DEFAULT_TOKEN_URI)?,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }

    pub fn from_client_secret(secret: &ClientSecret) -> Result<Self, OAuthError> {
        Ok(Self {
            http: Client::new(),
            auth_url: Url::parse(&secret.auth_uri)?,
            token_url: Url::parse(&secret.token_uri)?,
            client_id: secret.client_id.clone(),
            client_secret: secret.client_secret.clone(),
        })
    }

    /// Points both endpoints at one server: `/o/oauth2/auth` and `/token`.
    pub fn with_base_url(
        base_url: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, OAuthError> {
        let base = Url::parse(base_url)?;
        Ok(Self {
            http: Client::new(),
            auth_url: base.join("/o/oauth2/auth")?,
            token_url: base.join("/token")?,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }

    /// Consent URL requesting offline access so a refresh token is issued.
    pub fn authorize_url(&self, redirect_uri: &str, scope: &str, state: Option<&str>) -> Url {
        let mut url = self.auth_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", &self.client_id);
            query.append_pair("redirect_uri", redirect_uri);
            query.append_pair("scope", scope);
            query.append_pair("access_type", "offline");
            if let Some(state) = state {
                query.append_pair("state", state);
            }
        }
        url
    }

    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<OAuthToken, OAuthError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("redirect_uri", redirect_uri),
        ];
        self.post_token_form(&form).await
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthToken, OAuthError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        self.post_token_form(&form).await
    }

    async fn post_token_form(&self, form: &[(&str, &str)]) -> Result<OAuthToken, OAuthError> {
        let response = self
            .http
            .post(self.token_url.clone())
            .form(form)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.json::<OAuthToken>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(OAuthError::Api { status, body })
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}
