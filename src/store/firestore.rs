use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use url::Url;

use crate::model::{MESSAGES_COLLECTION, MessageDoc, THREADS_COLLECTION, ThreadDoc};
use crate::store::value::{check_document_id, document_id, encode_value, from_fields, to_fields};
use crate::store::{DocumentStore, StoreError, Write};
use crate::subscription::{Listener, ListenerSlot, Subscription};

/// Document store over the REST API. Live queries are emulated by polling
/// `runQuery` and delivering only when the result set changed.
#[derive(Clone)]
pub struct FirestoreStore {
    documents_url: String,
    database_name: String,
    token: Option<String>,
    http: Client,
    poll_interval: Duration,
}

impl FirestoreStore {
    pub fn new(base_url: &str, project_id: &str, token: Option<String>, poll_interval: Duration) -> Self {
        let database_name = format!("projects/{project_id}/databases/(default)/documents");
        Self {
            documents_url: format!("{}/v1/{}", base_url.trim_end_matches('/'), database_name),
            database_name,
            token,
            http: Client::new(),
            poll_interval,
        }
    }

    pub async fn query_threads(&self) -> Result<Vec<ThreadDoc>, StoreError> {
        let documents = self.run_query(&self.documents_url, threads_query()).await?;
        Ok(decode_documents(documents, |id, record| ThreadDoc { id, record }))
    }

    pub async fn query_messages(&self, thread_id: &str) -> Result<Vec<MessageDoc>, StoreError> {
        let parent = self.thread_url(thread_id)?;
        let documents = self.run_query(parent.as_str(), messages_query()).await?;
        Ok(decode_documents(documents, |id, record| MessageDoc { id, record }))
    }

    /// `{documents_url}/THREADS/{thread_id}` with the id escaped as one segment.
    fn thread_url(&self, thread_id: &str) -> Result<Url, StoreError> {
        let thread_id = check_document_id(thread_id)?;
        let mut url = Url::parse(&self.documents_url)?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Decode(format!("cannot append to {}", self.documents_url)))?
            .push(THREADS_COLLECTION)
            .push(thread_id);
        Ok(url)
    }

    async fn run_query(&self, parent_url: &str, query: Value) -> Result<Vec<RawDocument>, StoreError> {
        let url = format!("{parent_url}:runQuery");
        let response = self.authorized(self.http.post(url)).json(&query).send().await?;
        let response = error_for_status(response).await?;
        let items: Vec<RunQueryItem> = response.json().await?;
        Ok(items.into_iter().filter_map(|item| item.document).collect())
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn spawn_poll<T, F, Fut>(&self, slot: Arc<ListenerSlot<T>>, label: String, fetch: F) -> Subscription
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<T>, StoreError>> + Send + 'static,
    {
        let interval = self.poll_interval;
        let task_slot = slot.clone();
        let handle = tokio::spawn(async move {
            let mut last: Option<Vec<T>> = None;
            loop {
                match fetch().await {
                    Ok(snapshot) => {
                        if last.as_ref() != Some(&snapshot) {
                            debug!("{label}: delivering {} documents", snapshot.len());
                            last = Some(snapshot.clone());
                            if !task_slot.deliver(snapshot) {
                                break;
                            }
                        }
                    }
                    Err(error) => warn!("{label}: poll failed: {error}"),
                }
                tokio::time::sleep(interval).await;
            }
        });
        Subscription::new(move || {
            slot.close();
            handle.abort();
        })
    }
}

#[async_trait]
impl DocumentStore for FirestoreStore {
    async fn thread(&self, thread_id: &str) -> Result<Option<ThreadDoc>, StoreError> {
        let url = self.thread_url(thread_id)?;
        let response = self.authorized(self.http.get(url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = error_for_status(response).await?;
        let document: RawDocument = response.json().await?;
        Ok(Some(ThreadDoc {
            id: document_id(&document.name).to_string(),
            record: from_fields(&document.fields)?,
        }))
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        let body = commit_body(&self.database_name, &writes)?;
        let url = format!("{}:commit", self.documents_url);
        let response = self.authorized(self.http.post(url)).json(&body).send().await?;
        error_for_status(response).await?;
        Ok(())
    }

    fn watch_threads(&self, listener: Listener<ThreadDoc>) -> Subscription {
        let store = self.clone();
        self.spawn_poll(ListenerSlot::new(listener), "threads".to_string(), move || {
            let store = store.clone();
            async move { store.query_threads().await }
        })
    }

    fn watch_messages(&self, thread_id: &str, listener: Listener<MessageDoc>) -> Subscription {
        let store = self.clone();
        let thread_id = thread_id.to_string();
        let label = format!("messages of {thread_id}");
        self.spawn_poll(ListenerSlot::new(listener), label, move || {
            let store = store.clone();
            let thread_id = thread_id.clone();
            async move { store.query_messages(&thread_id).await }
        })
    }
}

#[derive(Debug, Deserialize)]
struct RunQueryItem {
    document: Option<RawDocument>,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: String,
}

/// Decodes each document, leaving out the ones that do not fit the record shape.
fn decode_documents<R, D>(documents: Vec<RawDocument>, wrap: impl Fn(String, R) -> D) -> Vec<D>
where
    R: DeserializeOwned,
{
    documents
        .into_iter()
        .filter_map(|document| match from_fields::<R>(&document.fields) {
            Ok(record) => Some(wrap(document_id(&document.name).to_string(), record)),
            Err(error) => {
                warn!("skipping document {}: {error}", document.name);
                None
            }
        })
        .collect()
}

/// Passes successful responses through; otherwise decodes the API error body.
pub(crate) async fn error_for_status(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => Err(StoreError::Api {
            status: envelope
                .error
                .status
                .unwrap_or_else(|| status.as_u16().to_string()),
            message: envelope.error.message,
        }),
        Err(_) => Err(StoreError::Status(status.as_u16())),
    }
}

fn threads_query() -> Value {
    json!({
        "structuredQuery": {
            "from": [{ "collectionId": THREADS_COLLECTION }],
            "orderBy": [{
                "field": { "fieldPath": "latestMessage.createdAt" },
                "direction": "DESCENDING"
            }]
        }
    })
}

fn messages_query() -> Value {
    json!({
        "structuredQuery": {
            "from": [{ "collectionId": MESSAGES_COLLECTION }],
            "orderBy": [{
                "field": { "fieldPath": "createdAt" },
                "direction": "DESCENDING"
            }]
        }
    })
}

fn commit_body(database_name: &str, writes: &[Write]) -> Result<Value, StoreError> {
    let mut encoded = Vec::with_capacity(writes.len());
    for write in writes {
        match write {
            Write::AddMessage {
                thread_id,
                message_id,
                record,
            } => {
                let thread_id = check_document_id(thread_id)?;
                let message_id = check_document_id(message_id)?;
                encoded.push(json!({
                    "update": {
                        "name": format!(
                            "{database_name}/{THREADS_COLLECTION}/{thread_id}/{MESSAGES_COLLECTION}/{message_id}"
                        ),
                        "fields": to_fields(record)?,
                    },
                    "currentDocument": { "exists": false }
                }));
            }
            Write::MergeThreadSummary { thread_id, latest } => {
                let thread_id = check_document_id(thread_id)?;
                let latest = serde_json::to_value(latest)?;
                encoded.push(json!({
                    "update": {
                        "name": format!("{database_name}/{THREADS_COLLECTION}/{thread_id}"),
                        "fields": { "latestMessage": encode_value(&latest) },
                    },
                    "updateMask": { "fieldPaths": ["latestMessage"] }
                }));
            }
        }
    }
    Ok(json!({ "writes": encoded }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LatestMessageRecord, MessageRecord};

    const DATABASE: &str = "projects/demo/databases/(default)/documents";

    #[test]
    fn commit_body_creates_message_and_merges_summary() {
        let writes = vec![
            Write::AddMessage {
                thread_id: "t1".to_string(),
                message_id: "m1".to_string(),
                record: MessageRecord {
                    text: Some("hi".to_string()),
                    created_at: Some(5),
                    ..MessageRecord::default()
                },
            },
            Write::MergeThreadSummary {
                thread_id: "t1".to_string(),
                latest: LatestMessageRecord {
                    text: Some("hi".to_string()),
                    created_at: Some(5),
                },
            },
        ];
        let body = commit_body(DATABASE, &writes).expect("body");
        let first = &body["writes"][0];
        assert_eq!(
            first["update"]["name"],
            format!("{DATABASE}/THREADS/t1/MESSAGES/m1")
        );
        assert_eq!(first["currentDocument"]["exists"], false);
        assert_eq!(first["update"]["fields"]["text"]["stringValue"], "hi");

        let second = &body["writes"][1];
        assert_eq!(second["update"]["name"], format!("{DATABASE}/THREADS/t1"));
        assert_eq!(second["updateMask"]["fieldPaths"], json!(["latestMessage"]));
        assert_eq!(
            second["update"]["fields"]["latestMessage"]["mapValue"]["fields"]["createdAt"],
            json!({ "integerValue": "5" })
        );
    }

    #[test]
    fn queries_order_newest_first() {
        assert_eq!(
            threads_query()["structuredQuery"]["orderBy"][0]["field"]["fieldPath"],
            "latestMessage.createdAt"
        );
        let messages = messages_query();
        assert_eq!(messages["structuredQuery"]["from"][0]["collectionId"], "MESSAGES");
        assert_eq!(messages["structuredQuery"]["orderBy"][0]["direction"], "DESCENDING");
    }

    #[test]
    fn run_query_rows_without_documents_are_skipped() {
        let body = json!([
            { "readTime": "2026-01-01T00:00:00Z" },
            {
                "document": {
                    "name": format!("{DATABASE}/THREADS/abc"),
                    "fields": { "name": { "stringValue": "General" } }
                },
                "readTime": "2026-01-01T00:00:00Z"
            }
        ]);
        let items: Vec<RunQueryItem> = serde_json::from_value(body).expect("rows");
        let documents: Vec<RawDocument> = items.into_iter().filter_map(|item| item.document).collect();
        assert_eq!(documents.len(), 1);
        assert_eq!(document_id(&documents[0].name), "abc");
    }

    #[test]
    fn undecodable_documents_are_left_out_of_the_snapshot() {
        let documents = vec![
            RawDocument {
                name: format!("{DATABASE}/THREADS/good"),
                fields: json!({
                    "name": { "stringValue": "General" },
                    "latestMessage": { "mapValue": { "fields": {
                        "createdAt": { "timestampValue": "2023-10-11T00:00:00Z" }
                    } } }
                })
                .as_object()
                .cloned()
                .expect("fields"),
            },
            RawDocument {
                name: format!("{DATABASE}/THREADS/bad"),
                fields: json!({ "name": { "integerValue": "7" } })
                    .as_object()
                    .cloned()
                    .expect("fields"),
            },
        ];
        let threads = decode_documents(documents, |id, record| ThreadDoc { id, record });
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].id, "good");
        assert_eq!(
            threads[0].record.latest_message.as_ref().and_then(|latest| latest.created_at),
            Some(1_696_982_400_000)
        );
    }

    #[test]
    fn thread_ids_are_escaped_and_checked() {
        let store = FirestoreStore::new("http://localhost:8080", "demo", None, Duration::from_secs(1));
        let url = store.thread_url("a b").expect("url");
        assert_eq!(url.as_str(), format!("http://localhost:8080/v1/{DATABASE}/THREADS/a%20b"));
        assert!(matches!(store.thread_url("../t2"), Err(StoreError::InvalidId(_))));
        assert!(matches!(store.thread_url(".."), Err(StoreError::InvalidId(_))));

        let writes = vec![Write::MergeThreadSummary {
            thread_id: "t1/MESSAGES/m1".to_string(),
            latest: LatestMessageRecord::default(),
        }];
        assert!(matches!(commit_body(DATABASE, &writes), Err(StoreError::InvalidId(_))));
    }

    #[test]
    fn store_urls_are_rooted_at_the_project_database() {
        let store = FirestoreStore::new("http://localhost:8080/", "demo", None, Duration::from_secs(1));
        assert_eq!(
            store.documents_url,
            format!("http://localhost:8080/v1/{DATABASE}")
        );
    }
}
