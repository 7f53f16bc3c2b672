//! Message send pipeline: upload attachments, then append the message and
//! refresh the thread summary in one batch.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::capture::ThumbnailGenerator;
use crate::model::{Author, Coordinates, LatestMessageRecord, LocalAttachment, MessageContent, MessageRecord};
use crate::store::{DocumentStore, ObjectStorage, StoreError, Write, auto_id};

/// Frame grabbed for video thumbnails.
pub const THUMBNAIL_AT: Duration = Duration::from_millis(10_000);

/// Stored as the thumbnail when none could be produced.
pub const PLACEHOLDER_THUMBNAIL_URL: &str =
    "https://encrypted-tbn0.gstatic.com/images?q=tbn:ANd9GcRJVTwzb0qgP1sWqpXpqUSCHJ6ldaB1kHzYUQ&usqp=CAU";

const FALLBACK_STEM: &str = "attachment";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    /// Upload paths drop the `file://` scheme on iOS and keep it on Android.
    pub fn upload_uri(self, local: &LocalAttachment) -> String {
        match self {
            Platform::Ios => local
                .uri
                .strip_prefix("file://")
                .unwrap_or(&local.uri)
                .to_string(),
            Platform::Android => local.uri.clone(),
        }
    }

    pub fn recording_extension(self) -> &'static str {
        match self {
            Platform::Ios => "m4a",
            Platform::Android => "mp3",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
        })
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
}

impl MediaKind {
    pub fn folder(self) -> &'static str {
        match self {
            MediaKind::Image => "images",
            MediaKind::Video => "videos",
            MediaKind::Audio => "audios",
        }
    }
}

/// `{thread_name}/{images|videos|audios}/{file_name}`
pub fn storage_path(thread_name: &str, kind: MediaKind, file_name: &str) -> String {
    format!("{thread_name}/{}/{file_name}", kind.folder())
}

/// Hands out `{stem}_{millis}.{ext}` names whose suffixes never repeat,
/// even when the clock does.
#[derive(Debug, Default)]
pub struct UploadNamer {
    last_suffix: Option<i64>,
}

impl UploadNamer {
    pub fn next_name(&mut self, local: &LocalAttachment, now_ms: i64) -> String {
        let suffix = match self.last_suffix {
            Some(last) if now_ms <= last => last + 1,
            _ => now_ms,
        };
        self.last_suffix = Some(suffix);

        let file_name = local.file_name();
        let (stem, extension) = match file_name.rfind('.') {
            Some(index) if index > 0 => (&file_name[..index], Some(&file_name[index + 1..])),
            _ => (file_name, None),
        };
        let stem = if stem.is_empty() { FALLBACK_STEM } else { stem };
        match extension {
            Some(extension) if !extension.is_empty() => format!("{stem}_{suffix}.{extension}"),
            _ => format!("{stem}_{suffix}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadRef {
    pub id: String,
    pub name: String,
}

/// What the user asked to send, before any upload.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Text(String),
    Image(LocalAttachment),
    Video(LocalAttachment),
    Audio(LocalAttachment),
    Location(Coordinates),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("message text is empty")]
    EmptyText,
    #[error("upload of {path} failed: {source}")]
    Upload {
        path: String,
        #[source]
        source: StoreError,
    },
    #[error("could not resolve download url for {path}: {source}")]
    DownloadUrl {
        path: String,
        #[source]
        source: StoreError,
    },
    #[error("saving message failed: {0}")]
    Write(#[source] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    pub thread_id: String,
    pub message_id: String,
    pub created_at: i64,
    pub summary: String,
    pub record: MessageRecord,
    #[serde(skip)]
    pub content: MessageContent,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct SendPipeline {
    store: Arc<dyn DocumentStore>,
    storage: Arc<dyn ObjectStorage>,
    thumbnails: Arc<dyn ThumbnailGenerator>,
    thread: ThreadRef,
    author: Author,
    platform: Platform,
    namer: Mutex<UploadNamer>,
    clock: fn() -> i64,
}

impl SendPipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        storage: Arc<dyn ObjectStorage>,
        thumbnails: Arc<dyn ThumbnailGenerator>,
        thread: ThreadRef,
        author: Author,
        platform: Platform,
    ) -> Self {
        Self {
            store,
            storage,
            thumbnails,
            thread,
            author,
            platform,
            namer: Mutex::new(UploadNamer::default()),
            clock: now_millis,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn thread(&self) -> &ThreadRef {
        &self.thread
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Uploads whatever `outgoing` carries, then publishes the message.
    /// Nothing is written to the document store unless every upload succeeded.
    pub async fn send(&self, outgoing: Outgoing) -> Result<SentMessage, SendError> {
        let content = match outgoing {
            Outgoing::Text(text) => MessageContent::Text(text),
            Outgoing::Image(local) => MessageContent::Image {
                url: self.upload(MediaKind::Image, &local).await?,
            },
            Outgoing::Video(local) => {
                let url = self.upload(MediaKind::Video, &local).await?;
                let thumbnail = self.video_thumbnail(&local).await;
                MessageContent::Video { url, thumbnail }
            }
            Outgoing::Audio(local) => MessageContent::Audio {
                url: self.upload(MediaKind::Audio, &local).await?,
            },
            Outgoing::Location(coordinates) => MessageContent::Location(coordinates),
        };
        self.publish(content).await
    }

    /// Appends the message and merges the thread summary in a single commit.
    async fn publish(&self, content: MessageContent) -> Result<SentMessage, SendError> {
        if matches!(&content, MessageContent::Text(text) if text.trim().is_empty()) {
            return Err(SendError::EmptyText);
        }
        let created_at = (self.clock)();
        let record = content.to_record(created_at, &self.author);
        let summary = content.summary_text();
        let message_id = auto_id();

        let writes = vec![
            Write::AddMessage {
                thread_id: self.thread.id.clone(),
                message_id: message_id.clone(),
                record: record.clone(),
            },
            Write::MergeThreadSummary {
                thread_id: self.thread.id.clone(),
                latest: LatestMessageRecord {
                    text: Some(summary.clone()),
                    created_at: Some(created_at),
                },
            },
        ];
        self.store.commit(writes).await.map_err(SendError::Write)?;
        info!("sent {} message {message_id} to thread {}", content.kind(), self.thread.id);

        Ok(SentMessage {
            thread_id: self.thread.id.clone(),
            message_id,
            created_at,
            summary,
            record,
            content,
        })
    }

    /// Uploads one local file under the thread's folder for `kind` and
    /// returns its download url.
    pub async fn upload(&self, kind: MediaKind, local: &LocalAttachment) -> Result<String, SendError> {
        let file_name = {
            let mut namer = self.namer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            namer.next_name(local, (self.clock)())
        };
        let path = storage_path(&self.thread.name, kind, &file_name);
        let upload_uri = self.platform.upload_uri(local);
        debug!("uploading {upload_uri} to {path}");

        self.storage
            .put_file(&path, &upload_uri)
            .await
            .map_err(|source| SendError::Upload {
                path: path.clone(),
                source,
            })?;
        self.storage
            .download_url(&path)
            .await
            .map_err(|source| SendError::DownloadUrl { path, source })
    }

    /// Thumbnail url for a video, or the placeholder when the frame grab or its
    /// upload fails.
    async fn video_thumbnail(&self, video: &LocalAttachment) -> String {
        let frame = match self.thumbnails.thumbnail(video, THUMBNAIL_AT).await {
            Ok(frame) => frame,
            Err(error) => {
                warn!("thumbnail for {} failed: {error}", video.uri);
                return PLACEHOLDER_THUMBNAIL_URL.to_string();
            }
        };
        match self.upload(MediaKind::Image, &frame).await {
            Ok(url) => url,
            Err(error) => {
                warn!("thumbnail upload failed: {error}");
                PLACEHOLDER_THUMBNAIL_URL.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::FakeThumbnailer;
    use crate::model::{DOCUMENT_UPLOAD_LABEL, LOCATION_SEND_LABEL, ThreadRecord};
    use crate::store::memory::MemoryStore;

    fn frozen() -> i64 {
        1_700_000_000_000
    }

    fn pipeline(store: &MemoryStore, platform: Platform, thumbnails_fail: bool) -> SendPipeline {
        store.seed_thread(
            "t1",
            ThreadRecord {
                name: Some("General".to_string()),
                latest_message: None,
            },
        );
        SendPipeline::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(FakeThumbnailer {
                fail: thumbnails_fail,
            }),
            ThreadRef {
                id: "t1".to_string(),
                name: "General".to_string(),
            },
            Author {
                id: "uid-1".to_string(),
                email: "ada@example.com".to_string(),
            },
            platform,
        )
    }

    fn latest_text(store: &MemoryStore) -> Option<String> {
        store
            .thread_record("t1")
            .and_then(|record| record.latest_message)
            .and_then(|latest| latest.text)
    }

    #[tokio::test]
    async fn sending_text_updates_the_thread_summary() {
        let store = MemoryStore::new();
        let sent = pipeline(&store, Platform::Android, false)
            .send(Outgoing::Text("hi".to_string()))
            .await
            .expect("send");

        let messages = store.messages("t1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, sent.message_id);
        assert_eq!(messages[0].record.text.as_deref(), Some("hi"));
        assert_eq!(messages[0].record.populated_content(), vec!["text"]);
        assert_eq!(latest_text(&store).as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn sending_location_uses_the_location_label() {
        let store = MemoryStore::new();
        let coordinates: Coordinates = "37.78,-122.43".parse().expect("coordinates");
        let sent = pipeline(&store, Platform::Ios, false)
            .send(Outgoing::Location(coordinates))
            .await
            .expect("send");

        let messages = store.messages("t1");
        assert_eq!(messages[0].record.location.as_deref(), Some("37.78,-122.43"));
        assert_eq!(messages[0].record.text.as_deref(), Some(""));
        let latest = store
            .thread_record("t1")
            .and_then(|record| record.latest_message)
            .expect("latest");
        assert_eq!(latest.text.as_deref(), Some(LOCATION_SEND_LABEL));
        assert!(latest.created_at.expect("timestamp") >= sent.created_at);
    }

    #[tokio::test]
    async fn media_summary_timestamp_covers_the_message() {
        let cases = [
            (Outgoing::Image(LocalAttachment::new("/sdcard/DCIM/cat.jpg")), "image", "General/images/cat_"),
            (Outgoing::Video(LocalAttachment::new("/sdcard/clip.mp4")), "video", "General/videos/clip_"),
            (Outgoing::Audio(LocalAttachment::new("/cache/1audio.mp3")), "audio", "General/audios/1audio_"),
        ];
        for (outgoing, kind, prefix) in cases {
            let store = MemoryStore::new();
            let sent = pipeline(&store, Platform::Android, false)
                .send(outgoing)
                .await
                .expect("send");

            let record = store.thread_record("t1").expect("thread");
            let latest = record.latest_message.expect("latest");
            assert_eq!(latest.text.as_deref(), Some(DOCUMENT_UPLOAD_LABEL), "{kind}");
            assert!(latest.created_at.expect("timestamp") >= sent.created_at, "{kind}");
            assert_eq!(record.name.as_deref(), Some("General"));
            assert_eq!(sent.record.populated_content(), vec![kind]);
            assert!(
                store.object_paths().iter().any(|path| path.starts_with(prefix)),
                "{kind}: {:?}",
                store.object_paths()
            );
        }
    }

    #[tokio::test]
    async fn identical_file_names_get_distinct_paths() {
        let store = MemoryStore::new();
        let pipeline = pipeline(&store, Platform::Android, false).with_clock(frozen);
        for _ in 0..2 {
            pipeline
                .send(Outgoing::Audio(LocalAttachment::new("/cache/1audio.mp3")))
                .await
                .expect("send");
        }
        assert_eq!(
            store.object_paths(),
            vec![
                "General/audios/1audio_1700000000000.mp3".to_string(),
                "General/audios/1audio_1700000000001.mp3".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn upload_paths_are_normalized_per_platform() {
        let ios = MemoryStore::new();
        pipeline(&ios, Platform::Ios, false)
            .with_clock(frozen)
            .send(Outgoing::Image(LocalAttachment::new("file:///var/mobile/IMG_1.jpg")))
            .await
            .expect("send");
        let object = ios
            .object("General/images/IMG_1_1700000000000.jpg")
            .expect("object");
        assert_eq!(object.upload_uri, "/var/mobile/IMG_1.jpg");

        let android = MemoryStore::new();
        pipeline(&android, Platform::Android, false)
            .with_clock(frozen)
            .send(Outgoing::Image(LocalAttachment::new("file:///storage/IMG_1.jpg")))
            .await
            .expect("send");
        let object = android
            .object("General/images/IMG_1_1700000000000.jpg")
            .expect("object");
        assert_eq!(object.upload_uri, "file:///storage/IMG_1.jpg");
    }

    #[tokio::test]
    async fn video_carries_an_uploaded_thumbnail() {
        let store = MemoryStore::new();
        let sent = pipeline(&store, Platform::Android, false)
            .send(Outgoing::Video(LocalAttachment::new("/sdcard/clip.mp4")))
            .await
            .expect("send");

        assert!(sent.record.video.as_deref().is_some_and(|url| url.contains("General/videos/clip_")));
        assert!(
            sent.record
                .video_thumbnail
                .as_deref()
                .is_some_and(|url| url.contains("General/images/clip.mp4_"))
        );
        assert_eq!(sent.record.populated_content(), vec!["video"]);
    }

    #[tokio::test]
    async fn failed_thumbnail_falls_back_to_placeholder() {
        let store = MemoryStore::new();
        let sent = pipeline(&store, Platform::Android, true)
            .send(Outgoing::Video(LocalAttachment::new("/sdcard/clip.mp4")))
            .await
            .expect("send");
        assert_eq!(sent.record.video_thumbnail.as_deref(), Some(PLACEHOLDER_THUMBNAIL_URL));

        let store = MemoryStore::new();
        store.fail_uploads_containing("/images/");
        let sent = pipeline(&store, Platform::Android, false)
            .send(Outgoing::Video(LocalAttachment::new("/sdcard/clip.mp4")))
            .await
            .expect("send");
        assert_eq!(sent.record.video_thumbnail.as_deref(), Some(PLACEHOLDER_THUMBNAIL_URL));
    }

    #[tokio::test]
    async fn failed_upload_writes_nothing() {
        let store = MemoryStore::new();
        store.fail_uploads_containing("/audios/");
        let error = pipeline(&store, Platform::Android, false)
            .send(Outgoing::Audio(LocalAttachment::new("/cache/1audio.mp3")))
            .await
            .expect_err("upload should fail");
        assert!(matches!(error, SendError::Upload { .. }));
        assert!(store.messages("t1").is_empty());
        assert_eq!(store.commit_count(), 0);
        assert_eq!(latest_text(&store), None);
    }

    #[tokio::test]
    async fn rejected_commit_leaves_thread_untouched() {
        let store = MemoryStore::new();
        let pipeline = pipeline(&store, Platform::Android, false);
        store.fail_next_commit("offline");
        let error = pipeline
            .send(Outgoing::Text("hi".to_string()))
            .await
            .expect_err("commit should fail");
        assert!(matches!(error, SendError::Write(_)));
        assert!(store.messages("t1").is_empty());
        assert_eq!(latest_text(&store), None);
    }

    #[tokio::test]
    async fn blank_text_is_not_sent() {
        let store = MemoryStore::new();
        let error = pipeline(&store, Platform::Android, false)
            .send(Outgoing::Text("   ".to_string()))
            .await
            .expect_err("blank");
        assert!(matches!(error, SendError::EmptyText));
        assert_eq!(store.commit_count(), 0);

        let error = pipeline(&store, Platform::Android, false)
            .publish(MessageContent::Text(String::new()))
            .await
            .expect_err("empty content");
        assert!(matches!(error, SendError::EmptyText));
        assert!(store.messages("t1").is_empty());
    }

    #[test]
    fn namer_keeps_suffixes_increasing() {
        let mut namer = UploadNamer::default();
        let local = LocalAttachment::new("/tmp/photo.final.jpg");
        assert_eq!(namer.next_name(&local, 10), "photo.final_10.jpg");
        assert_eq!(namer.next_name(&local, 10), "photo.final_11.jpg");
        assert_eq!(namer.next_name(&local, 5), "photo.final_12.jpg");
        assert_eq!(namer.next_name(&local, 20), "photo.final_20.jpg");
        assert_eq!(namer.next_name(&LocalAttachment::new("/tmp/"), 30), "attachment_30");
        assert_eq!(namer.next_name(&LocalAttachment::new("README"), 40), "README_40");
    }

    #[test]
    fn platform_parsing_and_paths() {
        assert_eq!("iOS".parse::<Platform>(), Ok(Platform::Ios));
        assert_eq!("android".parse::<Platform>(), Ok(Platform::Android));
        assert!("windows".parse::<Platform>().is_err());
        assert_eq!(storage_path("General", MediaKind::Video, "a.mp4"), "General/videos/a.mp4");
        let local = LocalAttachment::new("/plain/path.jpg");
        assert_eq!(Platform::Ios.upload_uri(&local), "/plain/path.jpg");
    }
}
