//! Live thread and message lists bound to a screen's lifetime.

use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use crate::model::{ChatMessage, MessageDoc, ThreadView};
use crate::store::DocumentStore;
use crate::subscription::Subscription;

struct LiveState<V> {
    items: Vec<V>,
    loaded: bool,
}

impl<V> Default for LiveState<V> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            loaded: false,
        }
    }
}

/// The latest snapshot of one live query. Every delivery replaces the whole list.
struct LiveList<V> {
    state: Arc<Mutex<LiveState<V>>>,
    subscription: Subscription,
}

impl<V: Clone + Send + 'static> LiveList<V> {
    fn open<D: 'static>(
        map: impl Fn(&D) -> V + Send + Sync + 'static,
        on_change: impl Fn(&[V]) + Send + Sync + 'static,
        subscribe: impl FnOnce(Box<dyn Fn(Vec<D>) + Send + Sync>) -> Subscription,
    ) -> Self {
        let state = Arc::new(Mutex::new(LiveState::default()));
        let sink = state.clone();
        let subscription = subscribe(Box::new(move |docs: Vec<D>| {
            let items: Vec<V> = docs.iter().map(&map).collect();
            {
                let mut state = lock(&sink);
                state.items = items.clone();
                state.loaded = true;
            }
            on_change(&items);
        }));
        Self { state, subscription }
    }

    fn items(&self) -> Vec<V> {
        lock(&self.state).items.clone()
    }

    fn is_loading(&self) -> bool {
        !lock(&self.state).loaded
    }

    fn close(&mut self) {
        self.subscription.close();
    }

    fn is_closed(&self) -> bool {
        self.subscription.is_closed()
    }
}

fn lock<V>(state: &Mutex<LiveState<V>>) -> MutexGuard<'_, LiveState<V>> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Threads ordered by latest message, newest first.
pub struct ThreadListSync {
    list: LiveList<ThreadView>,
}

impl ThreadListSync {
    pub fn activate(store: &dyn DocumentStore, on_change: impl Fn(&[ThreadView]) + Send + Sync + 'static) -> Self {
        debug!("watching threads");
        let list = LiveList::open(ThreadView::from_doc, on_change, |listener| store.watch_threads(listener));
        Self { list }
    }

    pub fn threads(&self) -> Vec<ThreadView> {
        self.list.items()
    }

    /// True until the first snapshot arrives.
    pub fn is_loading(&self) -> bool {
        self.list.is_loading()
    }

    pub fn is_active(&self) -> bool {
        !self.list.is_closed()
    }

    pub fn deactivate(&mut self) {
        self.list.close();
    }
}

/// Messages of one thread, newest first.
pub struct MessageListSync {
    thread_id: String,
    list: LiveList<ChatMessage>,
}

impl MessageListSync {
    pub fn activate(
        store: &dyn DocumentStore,
        thread_id: &str,
        on_change: impl Fn(&[ChatMessage]) + Send + Sync + 'static,
    ) -> Self {
        debug!("watching messages of {thread_id}");
        let list = LiveList::open(
            |doc: &MessageDoc| ChatMessage::from_doc(doc, chrono::Utc::now().timestamp_millis()),
            on_change,
            |listener| store.watch_messages(thread_id, listener),
        );
        Self {
            thread_id: thread_id.to_string(),
            list,
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.list.items()
    }

    pub fn is_loading(&self) -> bool {
        self.list.is_loading()
    }

    pub fn is_active(&self) -> bool {
        !self.list.is_closed()
    }

    pub fn deactivate(&mut self) {
        debug!("stopped watching messages of {}", self.thread_id);
        self.list.close();
    }
}
