//! Device capability seams: permissions, pickers, camera, location, audio.

pub mod desktop;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::model::{Coordinates, LocalAttachment};
use crate::send::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    Camera,
    Microphone,
    Location,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Capability::Camera => "camera",
            Capability::Microphone => "microphone",
            Capability::Location => "location",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
    NeverAskAgain,
}

/// Result of a user-facing capture: either something was produced or the user backed out.
#[derive(Debug, Clone, PartialEq)]
pub enum Capture<T> {
    Captured(T),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickKind {
    Photo,
    Video,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("{0} is not available")]
    Unavailable(Capability),
    #[error("{0}")]
    Failed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn request(&self, capability: Capability) -> Permission;
}

#[async_trait]
pub trait MediaPicker: Send + Sync {
    async fn pick(&self, kind: PickKind) -> Result<Capture<LocalAttachment>, CaptureError>;
}

#[async_trait]
pub trait Camera: Send + Sync {
    async fn take_photo(&self) -> Result<Capture<LocalAttachment>, CaptureError>;
}

#[async_trait]
pub trait Geolocator: Send + Sync {
    async fn current_position(&self) -> Result<Coordinates, CaptureError>;
}

#[async_trait]
pub trait ThumbnailGenerator: Send + Sync {
    /// Grabs one frame of `video` at `at` into a local image.
    async fn thumbnail(&self, video: &LocalAttachment, at: Duration) -> Result<LocalAttachment, CaptureError>;
}

#[async_trait]
pub trait AudioRecorder: Send + Sync {
    async fn start(&self, output: &Path) -> Result<(), CaptureError>;

    /// Stops the running recording and returns the file it wrote.
    async fn stop(&self) -> Result<PathBuf, CaptureError>;
}

#[async_trait]
pub trait AudioPlayer: Send + Sync {
    /// Plays `url` to the end.
    async fn play(&self, url: &str) -> Result<(), CaptureError>;
}

enum RecordingState {
    Idle,
    Recording { output: PathBuf, started: Instant },
}

/// A finished recording ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub attachment: LocalAttachment,
    pub elapsed: Duration,
}

/// Screen-scoped owner of the recorder and player.
///
/// Recording is a two-state toggle: press-and-hold starts it, release stops it.
/// Only one clip plays at a time.
pub struct AudioSession {
    recorder: Box<dyn AudioRecorder>,
    player: Box<dyn AudioPlayer>,
    platform: Platform,
    cache_dir: PathBuf,
    state: Mutex<RecordingState>,
    playing: AtomicBool,
}

impl AudioSession {
    pub fn acquire(
        recorder: Box<dyn AudioRecorder>,
        player: Box<dyn AudioPlayer>,
        platform: Platform,
        cache_dir: PathBuf,
    ) -> Self {
        Self {
            recorder,
            player,
            platform,
            cache_dir,
            state: Mutex::new(RecordingState::Idle),
            playing: AtomicBool::new(false),
        }
    }

    pub async fn is_recording(&self) -> bool {
        matches!(*self.state.lock().await, RecordingState::Recording { .. })
    }

    /// Returns false when a recording is already running.
    pub async fn press_and_hold(&self) -> Result<bool, CaptureError> {
        let mut state = self.state.lock().await;
        if matches!(*state, RecordingState::Recording { .. }) {
            return Ok(false);
        }
        let output = recording_path(self.platform, &self.cache_dir, chrono::Utc::now().timestamp_millis());
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.recorder.start(&output).await?;
        info!("recording to {}", output.display());
        *state = RecordingState::Recording {
            output,
            started: Instant::now(),
        };
        Ok(true)
    }

    /// Stops the recording. Releasing while idle does nothing.
    pub async fn release(&self) -> Result<Option<Recording>, CaptureError> {
        let mut state = self.state.lock().await;
        let RecordingState::Recording { output, started } =
            std::mem::replace(&mut *state, RecordingState::Idle)
        else {
            return Ok(None);
        };
        let written = self.recorder.stop().await?;
        let elapsed = started.elapsed();
        let expected = self.platform.recording_extension();
        if written.extension().and_then(|ext| ext.to_str()) != Some(expected) {
            return Err(CaptureError::Failed(format!(
                "recorder wrote {} instead of a .{expected} file (asked for {})",
                written.display(),
                output.display()
            )));
        }
        debug!("recorded {} in {}", written.display(), format_clock(elapsed));
        Ok(Some(Recording {
            attachment: LocalAttachment::new(written.to_string_lossy().into_owned()),
            elapsed,
        }))
    }

    /// Returns false when another clip is still playing.
    pub async fn play(&self, url: &str) -> Result<bool, CaptureError> {
        if self
            .playing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }
        let result = self.player.play(url).await;
        self.playing.store(false, Ordering::SeqCst);
        result.map(|_| true)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// Stops a running recording and discards it.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let RecordingState::Recording { output, .. } = std::mem::replace(&mut *state, RecordingState::Idle) {
            match self.recorder.stop().await {
                Ok(path) => debug!("discarded recording {}", path.display()),
                Err(error) => warn!("failed to stop recording {}: {error}", output.display()),
            }
        }
    }
}

/// `{cache}/{millis}audio.m4a` on iOS, `{cache}/{millis}audio.mp3` on Android.
pub fn recording_path(platform: Platform, cache_dir: &Path, now_ms: i64) -> PathBuf {
    cache_dir.join(format!("{now_ms}audio.{}", platform.recording_extension()))
}

/// `mm:ss`, minutes keep growing past an hour.
pub fn format_clock(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use super::*;

    pub struct FixedPermissions(pub Permission);

    #[async_trait]
    impl PermissionGate for FixedPermissions {
        async fn request(&self, _capability: Capability) -> Permission {
            self.0
        }
    }

    /// Hands out queued capture results, then cancels.
    #[derive(Default)]
    pub struct ScriptedPicker {
        queue: StdMutex<VecDeque<Result<Capture<LocalAttachment>, String>>>,
    }

    impl ScriptedPicker {
        pub fn with(results: Vec<Result<Capture<LocalAttachment>, String>>) -> Self {
            Self {
                queue: StdMutex::new(results.into_iter().collect()),
            }
        }

        fn next(&self) -> Result<Capture<LocalAttachment>, CaptureError> {
            let next = self.queue.lock().expect("picker lock").pop_front();
            match next {
                Some(Ok(capture)) => Ok(capture),
                Some(Err(message)) => Err(CaptureError::Failed(message)),
                None => Ok(Capture::Cancelled),
            }
        }
    }

    #[async_trait]
    impl MediaPicker for ScriptedPicker {
        async fn pick(&self, _kind: PickKind) -> Result<Capture<LocalAttachment>, CaptureError> {
            self.next()
        }
    }

    #[async_trait]
    impl Camera for ScriptedPicker {
        async fn take_photo(&self) -> Result<Capture<LocalAttachment>, CaptureError> {
            self.next()
        }
    }

    pub struct FakeThumbnailer {
        pub fail: bool,
    }

    #[async_trait]
    impl ThumbnailGenerator for FakeThumbnailer {
        async fn thumbnail(&self, video: &LocalAttachment, _at: Duration) -> Result<LocalAttachment, CaptureError> {
            if self.fail {
                return Err(CaptureError::Failed("no frame".to_string()));
            }
            Ok(LocalAttachment::new(format!("{}.jpg", video.uri)))
        }
    }

    /// Records into memory; `stop` returns the path `start` was given.
    #[derive(Default)]
    pub struct FakeRecorder {
        pub output: StdMutex<Option<PathBuf>>,
        pub stops: StdMutex<usize>,
    }

    #[async_trait]
    impl AudioRecorder for FakeRecorder {
        async fn start(&self, output: &Path) -> Result<(), CaptureError> {
            *self.output.lock().expect("recorder lock") = Some(output.to_path_buf());
            Ok(())
        }

        async fn stop(&self) -> Result<PathBuf, CaptureError> {
            *self.stops.lock().expect("recorder lock") += 1;
            self.output
                .lock()
                .expect("recorder lock")
                .take()
                .ok_or_else(|| CaptureError::Failed("not recording".to_string()))
        }
    }

    #[derive(Default)]
    pub struct FakePlayer {
        pub played: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl AudioPlayer for FakePlayer {
        async fn play(&self, url: &str) -> Result<(), CaptureError> {
            self.played.lock().expect("player lock").push(url.to_string());
            Ok(())
        }
    }
}
