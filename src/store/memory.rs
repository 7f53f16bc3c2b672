use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;

use crate::model::{MessageDoc, MessageRecord, ThreadDoc, ThreadRecord};
use crate::store::{DocumentStore, ObjectStorage, StoreError, Write};
use crate::subscription::{Listener, ListenerSlot, Subscription};

/// In-process store and object storage.
///
/// Every commit pushes a fresh snapshot to each open listener whose query it
/// touched. Snapshots are built under the lock and delivered after it is
/// released, so listeners may call back into the store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    threads: BTreeMap<String, ThreadRecord>,
    messages: HashMap<String, BTreeMap<String, MessageRecord>>,
    objects: BTreeMap<String, StoredObject>,
    thread_listeners: HashMap<u64, Arc<ListenerSlot<ThreadDoc>>>,
    message_listeners: HashMap<u64, (String, Arc<ListenerSlot<MessageDoc>>)>,
    next_listener_id: u64,
    failing_uploads: Vec<String>,
    failing_commit: Option<String>,
    commits: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub upload_uri: String,
    pub token: u64,
}

enum Pending {
    Threads(Arc<ListenerSlot<ThreadDoc>>, Vec<ThreadDoc>),
    Messages(Arc<ListenerSlot<MessageDoc>>, Vec<MessageDoc>),
}

impl Pending {
    fn deliver(self) {
        match self {
            Pending::Threads(slot, snapshot) => {
                slot.deliver(snapshot);
            }
            Pending::Messages(slot, snapshot) => {
                slot.deliver(snapshot);
            }
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_thread(&self, thread_id: &str, record: ThreadRecord) {
        let pending = {
            let mut inner = self.lock();
            inner.threads.insert(thread_id.to_string(), record);
            inner.thread_snapshots()
        };
        pending.into_iter().for_each(Pending::deliver);
    }

    pub fn seed_message(&self, thread_id: &str, message_id: &str, record: MessageRecord) {
        let pending = {
            let mut inner = self.lock();
            inner
                .messages
                .entry(thread_id.to_string())
                .or_default()
                .insert(message_id.to_string(), record);
            inner.message_snapshots(thread_id)
        };
        pending.into_iter().for_each(Pending::deliver);
    }

    pub fn thread_record(&self, thread_id: &str) -> Option<ThreadRecord> {
        self.lock().threads.get(thread_id).cloned()
    }

    /// Messages of a thread in listener order (newest first).
    pub fn messages(&self, thread_id: &str) -> Vec<MessageDoc> {
        self.lock().sorted_messages(thread_id)
    }

    pub fn object(&self, path: &str) -> Option<StoredObject> {
        self.lock().objects.get(path).cloned()
    }

    pub fn object_paths(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn active_listeners(&self) -> usize {
        let inner = self.lock();
        inner.thread_listeners.len() + inner.message_listeners.len()
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    /// Uploads whose destination path contains `fragment` fail.
    pub fn fail_uploads_containing(&self, fragment: &str) {
        self.lock().failing_uploads.push(fragment.to_string());
    }

    /// The next commit fails with `reason` and writes nothing.
    pub fn fail_next_commit(&self, reason: &str) {
        self.lock().failing_commit = Some(reason.to_string());
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Inner {
    fn sorted_threads(&self) -> Vec<ThreadDoc> {
        let mut docs: Vec<ThreadDoc> = self
            .threads
            .iter()
            .filter(|(_, record)| {
                record
                    .latest_message
                    .as_ref()
                    .and_then(|latest| latest.created_at)
                    .is_some()
            })
            .map(|(id, record)| ThreadDoc {
                id: id.clone(),
                record: record.clone(),
            })
            .collect();
        docs.sort_by_key(|doc| {
            Reverse(
                doc.record
                    .latest_message
                    .as_ref()
                    .and_then(|latest| latest.created_at)
                    .unwrap_or(0),
            )
        });
        docs
    }

    fn sorted_messages(&self, thread_id: &str) -> Vec<MessageDoc> {
        let Some(messages) = self.messages.get(thread_id) else {
            return Vec::new();
        };
        let mut docs: Vec<MessageDoc> = messages
            .iter()
            .filter(|(_, record)| record.created_at.is_some())
            .map(|(id, record)| MessageDoc {
                id: id.clone(),
                record: record.clone(),
            })
            .collect();
        docs.sort_by_key(|doc| Reverse(doc.record.created_at.unwrap_or(0)));
        docs
    }

    fn thread_snapshots(&self) -> Vec<Pending> {
        if self.thread_listeners.is_empty() {
            return Vec::new();
        }
        let snapshot = self.sorted_threads();
        self.thread_listeners
            .values()
            .map(|slot| Pending::Threads(slot.clone(), snapshot.clone()))
            .collect()
    }

    fn message_snapshots(&self, thread_id: &str) -> Vec<Pending> {
        let slots: Vec<_> = self
            .message_listeners
            .values()
            .filter(|(watched, _)| watched == thread_id)
            .map(|(_, slot)| slot.clone())
            .collect();
        if slots.is_empty() {
            return Vec::new();
        }
        let snapshot = self.sorted_messages(thread_id);
        slots
            .into_iter()
            .map(|slot| Pending::Messages(slot, snapshot.clone()))
            .collect()
    }

    fn next_id(&mut self) -> u64 {
        self.next_listener_id += 1;
        self.next_listener_id
    }
}

fn unregister(inner: &Weak<Mutex<Inner>>, id: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut guard = match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.thread_listeners.remove(&id);
    guard.message_listeners.remove(&id);
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn thread(&self, thread_id: &str) -> Result<Option<ThreadDoc>, StoreError> {
        Ok(self.thread_record(thread_id).map(|record| ThreadDoc {
            id: thread_id.to_string(),
            record,
        }))
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        let pending = {
            let mut inner = self.lock();
            if let Some(reason) = inner.failing_commit.take() {
                return Err(StoreError::Rejected(reason));
            }
            for write in &writes {
                if let Write::AddMessage {
                    thread_id,
                    message_id,
                    ..
                } = write
                {
                    let exists = inner
                        .messages
                        .get(thread_id)
                        .is_some_and(|messages| messages.contains_key(message_id));
                    if exists {
                        return Err(StoreError::Rejected(format!(
                            "message {message_id} already exists"
                        )));
                    }
                }
            }

            let mut touched_threads = false;
            let mut touched_messages = Vec::new();
            for write in writes {
                match write {
                    Write::AddMessage {
                        thread_id,
                        message_id,
                        record,
                    } => {
                        inner
                            .messages
                            .entry(thread_id.clone())
                            .or_default()
                            .insert(message_id, record);
                        touched_messages.push(thread_id);
                    }
                    Write::MergeThreadSummary { thread_id, latest } => {
                        inner.threads.entry(thread_id).or_default().latest_message = Some(latest);
                        touched_threads = true;
                    }
                }
            }
            inner.commits += 1;

            let mut pending = Vec::new();
            if touched_threads {
                pending.extend(inner.thread_snapshots());
            }
            touched_messages.dedup();
            for thread_id in touched_messages {
                pending.extend(inner.message_snapshots(&thread_id));
            }
            pending
        };
        pending.into_iter().for_each(Pending::deliver);
        Ok(())
    }

    fn watch_threads(&self, listener: Listener<ThreadDoc>) -> Subscription {
        let slot = ListenerSlot::new(listener);
        let (id, snapshot) = {
            let mut inner = self.lock();
            let id = inner.next_id();
            inner.thread_listeners.insert(id, slot.clone());
            (id, inner.sorted_threads())
        };
        slot.deliver(snapshot);

        let registry = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            slot.close();
            unregister(&registry, id);
        })
    }

    fn watch_messages(&self, thread_id: &str, listener: Listener<MessageDoc>) -> Subscription {
        let slot = ListenerSlot::new(listener);
        let (id, snapshot) = {
            let mut inner = self.lock();
            let id = inner.next_id();
            inner
                .message_listeners
                .insert(id, (thread_id.to_string(), slot.clone()));
            (id, inner.sorted_messages(thread_id))
        };
        slot.deliver(snapshot);

        let registry = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            slot.close();
            unregister(&registry, id);
        })
    }
}

#[async_trait]
impl ObjectStorage for MemoryStore {
    async fn put_file(&self, path: &str, upload_uri: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner
            .failing_uploads
            .iter()
            .any(|fragment| path.contains(fragment.as_str()))
        {
            return Err(StoreError::Rejected(format!("upload to {path} refused")));
        }
        let token = inner.objects.len() as u64 + 1;
        inner.objects.insert(
            path.to_string(),
            StoredObject {
                upload_uri: upload_uri.to_string(),
                token,
            },
        );
        Ok(())
    }

    async fn download_url(&self, path: &str) -> Result<String, StoreError> {
        let inner = self.lock();
        let object = inner
            .objects
            .get(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        Ok(format!("memory://{path}?token={}", object.token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LatestMessageRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn thread(name: &str, created_at: i64) -> ThreadRecord {
        ThreadRecord {
            name: Some(name.to_string()),
            latest_message: Some(LatestMessageRecord {
                text: Some(String::new()),
                created_at: Some(created_at),
            }),
        }
    }

    #[tokio::test]
    async fn threads_snapshot_is_ordered_newest_first() {
        let store = MemoryStore::new();
        store.seed_thread("old", thread("Old", 10));
        store.seed_thread("new", thread("New", 20));
        store.seed_thread("draft", ThreadRecord::default());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _subscription = store.watch_threads(Box::new(move |docs: Vec<ThreadDoc>| {
            let ids = docs.into_iter().map(|doc| doc.id).collect::<Vec<_>>();
            sink.lock().expect("lock").push(ids);
        }));

        let batches = seen.lock().expect("lock").clone();
        assert_eq!(batches, vec![vec!["new".to_string(), "old".to_string()]]);
    }

    #[tokio::test]
    async fn commit_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.seed_message("t1", "m1", MessageRecord::default());
        let result = store
            .commit(vec![
                Write::MergeThreadSummary {
                    thread_id: "t1".to_string(),
                    latest: LatestMessageRecord {
                        text: Some("hi".to_string()),
                        created_at: Some(1),
                    },
                },
                Write::AddMessage {
                    thread_id: "t1".to_string(),
                    message_id: "m1".to_string(),
                    record: MessageRecord::default(),
                },
            ])
            .await;
        assert!(matches!(result, Err(StoreError::Rejected(_))));
        assert!(store.thread_record("t1").is_none());
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn closing_unregisters_listener() {
        let store = MemoryStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut subscription = store.watch_messages(
            "t1",
            Box::new(move |_docs: Vec<MessageDoc>| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(store.active_listeners(), 1);

        subscription.close();
        assert_eq!(store.active_listeners(), 0);
        store.seed_message(
            "t1",
            "m1",
            MessageRecord {
                created_at: Some(1),
                ..MessageRecord::default()
            },
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn uploads_can_be_refused() {
        let store = MemoryStore::new();
        store.fail_uploads_containing("/videos/");
        store
            .put_file("Room/images/a.jpg", "/tmp/a.jpg")
            .await
            .expect("image upload");
        assert!(store.put_file("Room/videos/b.mp4", "/tmp/b.mp4").await.is_err());
        let url = store.download_url("Room/images/a.jpg").await.expect("url");
        assert_eq!(url, "memory://Room/images/a.jpg?token=1");
        assert!(matches!(
            store.download_url("Room/videos/b.mp4").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
