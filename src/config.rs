use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::send::Platform;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown platform {0:?} (expected ios or android)")]
    Platform(String),
    #[error("invalid {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub project_id: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub storage_bucket: String,
    pub firestore_url: String,
    pub storage_url: String,
    pub auth_url: String,
    pub token_url: String,
    pub data_dir: PathBuf,
    pub secrets_path: PathBuf,
    pub cache_dir: PathBuf,
    pub platform: Platform,
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    pub camera_command: Option<String>,
    pub record_command: Option<String>,
    pub player_command: Option<String>,
    pub location: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let debug = cfg!(debug_assertions);
        let project_id = env::var("ROOMCHAT_PROJECT_ID").unwrap_or_else(|_| DEFAULT_PROJECT_ID.to_string());
        let api_key = non_empty_var("ROOMCHAT_API_KEY");
        let storage_bucket =
            env::var("ROOMCHAT_STORAGE_BUCKET").unwrap_or_else(|_| format!("{project_id}.appspot.com"));

        let firestore_url = url_var("ROOMCHAT_FIRESTORE_URL", debug, "http://localhost:8080", "https://firestore.googleapis.com");
        let storage_url = url_var(
            "ROOMCHAT_STORAGE_URL",
            debug,
            "http://localhost:9199",
            "https://firebasestorage.googleapis.com",
        );
        let auth_url = url_var(
            "ROOMCHAT_AUTH_URL",
            debug,
            "http://localhost:9099/identitytoolkit.googleapis.com",
            "https://identitytoolkit.googleapis.com",
        );
        let token_url = url_var(
            "ROOMCHAT_TOKEN_URL",
            debug,
            "http://localhost:9099/securetoken.googleapis.com",
            "https://securetoken.googleapis.com",
        );

        let data_dir = env::var("ROOMCHAT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir(debug));
        let secrets_path = env::var("ROOMCHAT_SECRETS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("session.json"));
        let cache_dir = env::var("ROOMCHAT_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("cache"));

        let platform = match non_empty_var("ROOMCHAT_PLATFORM") {
            Some(value) => value.parse().map_err(|_| ConfigError::Platform(value))?,
            None => Platform::Android,
        };

        let poll_interval = match non_empty_var("ROOMCHAT_POLL_INTERVAL_MS") {
            Some(value) => {
                let millis: u64 = value.parse().map_err(|_| ConfigError::Invalid {
                    name: "ROOMCHAT_POLL_INTERVAL_MS",
                    value: value.clone(),
                })?;
                Duration::from_millis(millis.max(MIN_POLL_INTERVAL_MS))
            }
            None => Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        };

        Ok(Self {
            project_id,
            api_key,
            storage_bucket,
            firestore_url,
            storage_url,
            auth_url,
            token_url,
            data_dir,
            secrets_path,
            cache_dir,
            platform,
            poll_interval,
            camera_command: non_empty_var("ROOMCHAT_CAMERA_COMMAND"),
            record_command: non_empty_var("ROOMCHAT_RECORD_COMMAND"),
            player_command: non_empty_var("ROOMCHAT_PLAYER_COMMAND"),
            location: non_empty_var("ROOMCHAT_LOCATION"),
        })
    }
}

const DEFAULT_PROJECT_ID: &str = "roomchat-dev";
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const MIN_POLL_INTERVAL_MS: u64 = 200;

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn url_var(name: &str, debug: bool, dev: &str, prod: &str) -> String {
    let value = env::var(name).unwrap_or_else(|_| if debug { dev.to_string() } else { prod.to_string() });
    value.trim_end_matches('/').to_string()
}

fn default_data_dir(debug: bool) -> PathBuf {
    let base = env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."));
    let dir_name = if debug { "roomchat-dev" } else { "roomchat" };
    base.join(".local").join("share").join(dir_name)
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
