use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::model::Author;

/// Refresh this long before the id token actually expires.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {0}")]
    Status(u16),
    #[error("auth error: {0}")]
    Api(String),
    #[error("ROOMCHAT_API_KEY is not set")]
    MissingApiKey,
}

/// A signed-in user as persisted between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    pub email: String,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl Session {
    pub fn author(&self) -> Author {
        Author {
            id: self.user_id.clone(),
            email: self.email.clone(),
        }
    }

    pub fn needs_refresh(&self, now_secs: i64) -> bool {
        self.refresh_token.is_some()
            && self
                .expires_at
                .is_some_and(|expires_at| expires_at - EXPIRY_MARGIN_SECS <= now_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SecretsFile {
    session: Option<Session>,
    project_id: Option<String>,
    updated_at: Option<i64>,
}

pub struct AuthStore {
    path: PathBuf,
    project_id: String,
}

impl AuthStore {
    pub fn new(path: PathBuf, project_id: String) -> Self {
        Self { path, project_id }
    }

    /// `ROOMCHAT_USER_ID` and `ROOMCHAT_EMAIL` (plus an optional
    /// `ROOMCHAT_TOKEN`) take precedence over the session file.
    pub fn load_session(&self) -> Result<Option<Session>, AuthError> {
        if let Some(session) = session_from_env() {
            return Ok(Some(session));
        }

        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(AuthError::Io(err)),
        };

        let secrets: SecretsFile = serde_json::from_str(&contents)?;
        if let Some(project_id) = secrets.project_id.as_deref() {
            if project_id != self.project_id {
                debug!("ignoring session for project {project_id}");
                return Ok(None);
            }
        }
        Ok(secrets.session)
    }

    pub fn store_session(&self, session: &Session) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }

        let secrets = SecretsFile {
            session: Some(session.clone()),
            project_id: Some(self.project_id.clone()),
            updated_at: Some(chrono::Utc::now().timestamp()),
        };
        let payload = serde_json::to_string_pretty(&secrets)?;
        fs::write(&self.path, payload)?;
        set_file_permissions(&self.path, 0o600)?;
        Ok(())
    }

    pub fn clear_session(&self) -> Result<(), AuthError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AuthError::Io(err)),
        }
    }
}

fn session_from_env() -> Option<Session> {
    let var = |name: &str| env::var(name).ok().filter(|value| !value.trim().is_empty());
    let user_id = var("ROOMCHAT_USER_ID")?;
    let email = var("ROOMCHAT_EMAIL")?;
    Some(Session {
        user_id,
        email,
        id_token: var("ROOMCHAT_TOKEN"),
        refresh_token: None,
        expires_at: None,
    })
}

/// Email/password sign-in against the identity toolkit, plus token refresh.
#[derive(Clone)]
pub struct AuthClient {
    auth_url: String,
    token_url: String,
    api_key: Option<String>,
    http: Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResult {
    id_token: String,
    refresh_token: String,
    expires_in: String,
    local_id: String,
    email: String,
}

#[derive(Debug, Deserialize)]
struct RefreshResult {
    id_token: String,
    refresh_token: String,
    expires_in: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

impl AuthClient {
    pub fn new(auth_url: String, token_url: String, api_key: Option<String>) -> Self {
        Self {
            auth_url: auth_url.trim_end_matches('/').to_string(),
            token_url: token_url.trim_end_matches('/').to_string(),
            api_key,
            http: Client::new(),
        }
    }

    fn api_key(&self) -> Result<&str, AuthError> {
        self.api_key.as_deref().ok_or(AuthError::MissingApiKey)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let url = format!("{}/v1/accounts:signInWithPassword", self.auth_url);
        let response = self
            .http
            .post(url)
            .query(&[("key", self.api_key()?)])
            .json(&json!({
                "email": email,
                "password": password,
                "returnSecureToken": true,
            }))
            .send()
            .await?;
        let result: SignInResult = decode(response).await?;
        Ok(Session {
            user_id: result.local_id,
            email: result.email,
            id_token: Some(result.id_token),
            refresh_token: Some(result.refresh_token),
            expires_at: Some(expires_at(&result.expires_in)),
        })
    }

    pub async fn refresh(&self, session: &Session) -> Result<Session, AuthError> {
        let Some(refresh_token) = session.refresh_token.as_deref() else {
            return Ok(session.clone());
        };
        let url = format!("{}/v1/token", self.token_url);
        let response = self
            .http
            .post(url)
            .query(&[("key", self.api_key()?)])
            .form(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .send()
            .await?;
        let result: RefreshResult = decode(response).await?;
        debug!("refreshed id token for {}", result.user_id);
        Ok(Session {
            user_id: result.user_id,
            email: session.email.clone(),
            id_token: Some(result.id_token),
            refresh_token: Some(result.refresh_token),
            expires_at: Some(expires_at(&result.expires_in)),
        })
    }
}

async fn decode<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, AuthError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) if !envelope.error.message.is_empty() => Err(AuthError::Api(envelope.error.message)),
        _ => Err(AuthError::Status(status.as_u16())),
    }
}

fn expires_at(expires_in: &str) -> i64 {
    let seconds: i64 = expires_in.trim().parse().unwrap_or(0);
    chrono::Utc::now().timestamp() + seconds
}

fn ensure_dir(path: &Path) -> Result<(), io::Error> {
    fs::create_dir_all(path)?;
    set_dir_permissions(path, 0o700)?;
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path, mode: u32) -> Result<(), io::Error> {
    use std::os::unix::fs::PermissionsExt;
    let perm = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, perm)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path, mode: u32) -> Result<(), io::Error> {
    use std::os::unix::fs::PermissionsExt;
    let perm = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, perm)
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path, _mode: u32) -> Result<(), io::Error> {
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path, _mode: u32) -> Result<(), io::Error> {
    Ok(())
}
