//! One open conversation: the live message list plus every user action that
//! captures something and sends it.

use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::capture::{
    AudioPlayer, AudioRecorder, AudioSession, Camera, Capability, Capture, CaptureError, Geolocator, MediaPicker,
    Permission, PermissionGate, PickKind,
};
use crate::model::{ChatMessage, LocalAttachment};
use crate::notify::Notifier;
use crate::send::{Outgoing, SendError, SendPipeline, SentMessage, ThreadRef};
use crate::sync::MessageListSync;

const LOCATION_INACTIVE: &str = "make sure your geo location is active";

/// The device side of a room.
pub struct Devices {
    pub permissions: Arc<dyn PermissionGate>,
    pub picker: Arc<dyn MediaPicker>,
    pub camera: Arc<dyn Camera>,
    pub geolocator: Arc<dyn Geolocator>,
    pub recorder: Box<dyn AudioRecorder>,
    pub player: Box<dyn AudioPlayer>,
}

#[derive(Debug)]
pub enum ActionOutcome {
    Sent(SentMessage),
    /// The user backed out of a picker or camera.
    Cancelled,
    PermissionDenied(Capability),
    Failed(String),
    Recording,
    Played,
    /// Nothing to do: blank text, release without recording, or a clip already playing.
    Idle,
}

pub struct Room {
    pipeline: SendPipeline,
    permissions: Arc<dyn PermissionGate>,
    picker: Arc<dyn MediaPicker>,
    camera: Arc<dyn Camera>,
    geolocator: Arc<dyn Geolocator>,
    audio: AudioSession,
    messages: MessageListSync,
    notifier: Arc<dyn Notifier>,
}

impl Room {
    /// Opens the message subscription and acquires the audio session.
    pub fn enter(
        pipeline: SendPipeline,
        devices: Devices,
        notifier: Arc<dyn Notifier>,
        cache_dir: PathBuf,
        on_messages: impl Fn(&[ChatMessage]) + Send + Sync + 'static,
    ) -> Self {
        let thread_id = pipeline.thread().id.clone();
        info!("entering thread {thread_id}");
        let messages = MessageListSync::activate(pipeline.store().as_ref(), &thread_id, on_messages);
        let audio = AudioSession::acquire(devices.recorder, devices.player, pipeline.platform(), cache_dir);
        Self {
            pipeline,
            permissions: devices.permissions,
            picker: devices.picker,
            camera: devices.camera,
            geolocator: devices.geolocator,
            audio,
            messages,
            notifier,
        }
    }

    pub fn thread(&self) -> &ThreadRef {
        self.pipeline.thread()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.messages()
    }

    pub fn is_loading(&self) -> bool {
        self.messages.is_loading()
    }

    pub async fn send_text(&self, text: &str) -> ActionOutcome {
        self.deliver(Outgoing::Text(text.to_string())).await
    }

    pub async fn pick_image(&self) -> ActionOutcome {
        match self.captured(self.picker.pick(PickKind::Photo).await, "image picker") {
            Ok(local) => self.deliver(Outgoing::Image(local)).await,
            Err(outcome) => outcome,
        }
    }

    /// Only Android asks for the camera up front.
    pub async fn take_photo(&self) -> ActionOutcome {
        if self.pipeline.platform() == crate::send::Platform::Android {
            if let Err(outcome) = self.ensure(Capability::Camera).await {
                return outcome;
            }
        }
        match self.captured(self.camera.take_photo().await, "camera") {
            Ok(local) => self.deliver(Outgoing::Image(local)).await,
            Err(outcome) => outcome,
        }
    }

    pub async fn pick_video(&self) -> ActionOutcome {
        match self.captured(self.picker.pick(PickKind::Video).await, "video picker") {
            Ok(local) => self.deliver(Outgoing::Video(local)).await,
            Err(outcome) => outcome,
        }
    }

    pub async fn send_location(&self) -> ActionOutcome {
        if let Err(outcome) = self.ensure(Capability::Location).await {
            return outcome;
        }
        match self.geolocator.current_position().await {
            Ok(coordinates) => self.deliver(Outgoing::Location(coordinates)).await,
            Err(error) => {
                warn!("location lookup failed: {error}");
                let message = error.to_string();
                if message.trim().is_empty() {
                    self.notifier.toast(LOCATION_INACTIVE);
                } else {
                    self.notifier.toast(&message);
                }
                ActionOutcome::Failed(message)
            }
        }
    }

    pub async fn press_record(&self) -> ActionOutcome {
        if let Err(outcome) = self.ensure(Capability::Microphone).await {
            return outcome;
        }
        match self.audio.press_and_hold().await {
            Ok(true) => ActionOutcome::Recording,
            Ok(false) => {
                debug!("already recording");
                ActionOutcome::Recording
            }
            Err(error) => {
                error!("failed to start recording: {error}");
                ActionOutcome::Failed(error.to_string())
            }
        }
    }

    /// Stops recording and sends the clip right away.
    pub async fn release_record(&self) -> ActionOutcome {
        match self.audio.release().await {
            Ok(Some(recording)) => {
                info!("recorded {}", crate::capture::format_clock(recording.elapsed));
                self.send_audio(recording.attachment).await
            }
            Ok(None) => ActionOutcome::Idle,
            Err(error) => {
                error!("failed to stop recording: {error}");
                ActionOutcome::Failed(error.to_string())
            }
        }
    }

    pub async fn send_audio(&self, local: LocalAttachment) -> ActionOutcome {
        self.deliver(Outgoing::Audio(local)).await
    }

    pub async fn play_audio(&self, message: &ChatMessage) -> ActionOutcome {
        let Some(url) = message.audio.as_deref().filter(|url| !url.is_empty()) else {
            return ActionOutcome::Failed(format!("message {} has no audio", message.id));
        };
        match self.audio.play(url).await {
            Ok(true) => ActionOutcome::Played,
            Ok(false) => ActionOutcome::Idle,
            Err(error) => {
                warn!("playback failed: {error}");
                ActionOutcome::Failed(error.to_string())
            }
        }
    }

    /// Closes the subscription and releases the recorder.
    pub async fn leave(mut self) {
        info!("leaving thread {}", self.pipeline.thread().id);
        self.messages.deactivate();
        self.audio.close().await;
    }

    async fn ensure(&self, capability: Capability) -> Result<(), ActionOutcome> {
        match self.permissions.request(capability).await {
            Permission::Granted => Ok(()),
            denied => {
                warn!("{capability} permission {denied:?}");
                Err(ActionOutcome::PermissionDenied(capability))
            }
        }
    }

    fn captured(
        &self,
        result: Result<Capture<LocalAttachment>, CaptureError>,
        source: &str,
    ) -> Result<LocalAttachment, ActionOutcome> {
        match result {
            Ok(Capture::Captured(local)) => Ok(local),
            Ok(Capture::Cancelled) => {
                debug!("{source} cancelled");
                Err(ActionOutcome::Cancelled)
            }
            Err(CaptureError::Unavailable(capability)) => {
                warn!("{source}: {capability} unavailable");
                Err(ActionOutcome::Failed(format!("{capability} is not available")))
            }
            Err(error) => {
                warn!("{source} error: {error}");
                Err(ActionOutcome::Failed(error.to_string()))
            }
        }
    }

    async fn deliver(&self, outgoing: Outgoing) -> ActionOutcome {
        let uploaded = match &outgoing {
            Outgoing::Image(_) => Some(("Photo uploaded!", "Your photo has been uploaded to cloud storage!")),
            Outgoing::Video(_) => Some((
                "Video and Video Thumbnail uploaded!",
                "Your video has been uploaded to cloud storage!",
            )),
            Outgoing::Audio(_) => Some(("Audio uploaded!", "Your recording has been uploaded to cloud storage!")),
            Outgoing::Text(_) | Outgoing::Location(_) => None,
        };
        match self.pipeline.send(outgoing).await {
            Ok(sent) => {
                if let Some((title, message)) = uploaded {
                    self.notifier.alert(title, message);
                }
                ActionOutcome::Sent(sent)
            }
            Err(SendError::EmptyText) => ActionOutcome::Idle,
            Err(error) => {
                error!("send to {} failed: {error}", self.pipeline.thread().id);
                self.notifier.alert("Upload failed", &error.to_string());
                ActionOutcome::Failed(error.to_string())
            }
        }
    }
}
