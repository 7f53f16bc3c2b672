pub mod firestore;
pub mod memory;
pub mod storage;
pub mod value;

use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use thiserror::Error;

use crate::model::{LatestMessageRecord, MessageDoc, MessageRecord, ThreadDoc};
use crate::subscription::{Listener, Subscription};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("url error: {0}")]
    Url(#[from] url::ParseError),
    #[error("unexpected status: {0}")]
    Status(u16),
    #[error("store error: {status} ({message})")]
    Api { status: String, message: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid document id: {0:?}")]
    InvalidId(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Rejected(String),
}

/// One document mutation inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Creates `THREADS/{thread_id}/MESSAGES/{message_id}`; fails if it exists.
    AddMessage {
        thread_id: String,
        message_id: String,
        record: MessageRecord,
    },
    /// Merges `latestMessage` into `THREADS/{thread_id}`, creating the thread if needed.
    MergeThreadSummary {
        thread_id: String,
        latest: LatestMessageRecord,
    },
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn thread(&self, thread_id: &str) -> Result<Option<ThreadDoc>, StoreError>;

    /// Applies every write or none of them.
    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError>;

    /// Threads ordered by `latestMessage.createdAt`, newest first.
    fn watch_threads(&self, listener: Listener<ThreadDoc>) -> Subscription;

    /// Messages of one thread ordered by `createdAt`, newest first.
    fn watch_messages(&self, thread_id: &str, listener: Listener<MessageDoc>) -> Subscription;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Uploads the local file behind `upload_uri` to `path`.
    async fn put_file(&self, path: &str, upload_uri: &str) -> Result<(), StoreError>;

    async fn download_url(&self, path: &str) -> Result<String, StoreError>;
}

const AUTO_ID_LEN: usize = 20;

/// Client-side document id in the same alphabet and length the store assigns.
pub fn auto_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(AUTO_ID_LEN)
        .map(char::from)
        .collect()
}
