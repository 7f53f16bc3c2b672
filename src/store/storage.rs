use std::path::PathBuf;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use url::Url;

use crate::store::firestore::error_for_status;
use crate::store::{ObjectStorage, StoreError};

/// Object storage over the REST upload API.
#[derive(Clone)]
pub struct CloudStorage {
    objects_url: String,
    token: Option<String>,
    http: Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMetadata {
    name: String,
    #[serde(default)]
    download_tokens: Option<String>,
}

impl CloudStorage {
    pub fn new(base_url: &str, bucket: &str, token: Option<String>) -> Self {
        Self {
            objects_url: format!("{}/v0/b/{bucket}/o", base_url.trim_end_matches('/')),
            token,
            http: Client::new(),
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// `{objects_url}/{path}` with the whole object path as one escaped segment.
    fn object_url(&self, path: &str) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.objects_url)?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Decode(format!("cannot append to {}", self.objects_url)))?
            .push(path);
        Ok(url)
    }
}

#[async_trait]
impl ObjectStorage for CloudStorage {
    async fn put_file(&self, path: &str, upload_uri: &str) -> Result<(), StoreError> {
        let local = local_file_path(upload_uri)?;
        let bytes = tokio::fs::read(&local).await?;
        let content_type = mime_guess::from_path(&local)
            .first()
            .map(|mime| mime.essence_str().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        debug!("uploading {} ({} bytes) to {path}", local.display(), bytes.len());
        let mut url = Url::parse(&self.objects_url)?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", path);
        let response = self
            .authorized(self.http.post(url))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?;
        error_for_status(response).await?;
        Ok(())
    }

    async fn download_url(&self, path: &str) -> Result<String, StoreError> {
        let url = self.object_url(path)?;
        let response = self.authorized(self.http.get(url.clone())).send().await?;
        let response = error_for_status(response).await?;
        let metadata: ObjectMetadata = response.json().await?;
        download_url_from_metadata(url, &metadata)
    }
}

fn download_url_from_metadata(mut object_url: Url, metadata: &ObjectMetadata) -> Result<String, StoreError> {
    let token = metadata
        .download_tokens
        .as_deref()
        .and_then(|tokens| tokens.split(',').map(str::trim).find(|token| !token.is_empty()))
        .ok_or_else(|| StoreError::NotFound(format!("download token for {}", metadata.name)))?;
    object_url
        .query_pairs_mut()
        .append_pair("alt", "media")
        .append_pair("token", token);
    Ok(object_url.to_string())
}

/// Resolves a normalized upload URI to a path on disk. `file://` URIs are
/// accepted because only iOS uploads have the scheme stripped.
fn local_file_path(upload_uri: &str) -> Result<PathBuf, StoreError> {
    if upload_uri.starts_with("file://") {
        let url = Url::parse(upload_uri)?;
        return url
            .to_file_path()
            .map_err(|_| StoreError::Decode(format!("not a local file uri: {upload_uri}")));
    }
    Ok(PathBuf::from(upload_uri))
}
