//! Terminal stand-ins for the device capabilities, driven by external tools.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use dialoguer::Input;
use log::{debug, warn};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::capture::{
    AudioPlayer, AudioRecorder, Camera, Capability, Capture, CaptureError, Geolocator, MediaPicker, Permission,
    PermissionGate, PickKind, ThumbnailGenerator,
};
use crate::model::{Coordinates, LocalAttachment};

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Grants the capabilities backed by a configured tool and denies the rest.
pub struct ToolGate {
    granted: Vec<Capability>,
}

impl ToolGate {
    pub fn new(granted: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            granted: granted.into_iter().collect(),
        }
    }
}

#[async_trait]
impl PermissionGate for ToolGate {
    async fn request(&self, capability: Capability) -> Permission {
        if self.granted.contains(&capability) {
            debug!("granting {capability}");
            Permission::Granted
        } else {
            debug!("no tool configured for {capability}");
            Permission::Denied
        }
    }
}

/// Picks a file from a preset path, or asks for one on the terminal.
/// An empty answer cancels.
pub struct PathPicker {
    preset: Option<PathBuf>,
}

impl PathPicker {
    pub fn new(preset: Option<PathBuf>) -> Self {
        Self { preset }
    }
}

#[async_trait]
impl MediaPicker for PathPicker {
    async fn pick(&self, kind: PickKind) -> Result<Capture<LocalAttachment>, CaptureError> {
        let path = match self.preset.clone() {
            Some(path) => path,
            None => {
                let prompt = match kind {
                    PickKind::Photo => "Photo path (empty to cancel)",
                    PickKind::Video => "Video path (empty to cancel)",
                };
                let answer = tokio::task::spawn_blocking(move || {
                    Input::<String>::new()
                        .with_prompt(prompt)
                        .allow_empty(true)
                        .interact_text()
                })
                .await
                .map_err(|error| CaptureError::Failed(format!("prompt failed: {error}")))?
                .map_err(|error| CaptureError::Failed(format!("prompt failed: {error}")))?;
                let answer = answer.trim();
                if answer.is_empty() {
                    return Ok(Capture::Cancelled);
                }
                PathBuf::from(answer)
            }
        };

        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(CaptureError::Failed(format!("{} is not a file", path.display())));
        }
        let expected = match kind {
            PickKind::Photo => mime_guess::mime::IMAGE,
            PickKind::Video => mime_guess::mime::VIDEO,
        };
        let matches_kind = mime_guess::from_path(&path)
            .iter()
            .any(|mime| mime.type_() == expected);
        if !matches_kind {
            return Err(CaptureError::Failed(format!(
                "{} does not look like a {expected} file",
                path.display()
            )));
        }
        Ok(Capture::Captured(attachment_for(&path)))
    }
}

/// Runs a shell command template to take a photo. `{output}` is replaced with
/// the destination path.
pub struct CommandCamera {
    template: Option<String>,
    cache_dir: PathBuf,
}

impl CommandCamera {
    pub fn new(template: Option<String>, cache_dir: PathBuf) -> Self {
        Self { template, cache_dir }
    }
}

#[async_trait]
impl Camera for CommandCamera {
    async fn take_photo(&self) -> Result<Capture<LocalAttachment>, CaptureError> {
        let template = self
            .template
            .as_deref()
            .ok_or(CaptureError::Unavailable(Capability::Camera))?;
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let output = self
            .cache_dir
            .join(format!("{}photo.jpg", chrono::Utc::now().timestamp_millis()));

        let status = shell(&render(template, &output)).status().await?;
        if !status.success() {
            return Err(CaptureError::Failed(format!("camera command exited with {status}")));
        }
        match tokio::fs::metadata(&output).await {
            Ok(metadata) if metadata.len() > 0 => Ok(Capture::Captured(attachment_for(&output))),
            _ => Ok(Capture::Cancelled),
        }
    }
}

/// Records with a long-running command. Stopping writes `q` to its stdin
/// and kills it if it does not exit in time.
pub struct CommandRecorder {
    template: Option<String>,
    running: Mutex<Option<(Child, PathBuf)>>,
}

impl CommandRecorder {
    pub fn new(template: Option<String>) -> Self {
        Self {
            template,
            running: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AudioRecorder for CommandRecorder {
    async fn start(&self, output: &Path) -> Result<(), CaptureError> {
        let template = self
            .template
            .as_deref()
            .ok_or(CaptureError::Unavailable(Capability::Microphone))?;
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(CaptureError::Failed("recorder is already running".to_string()));
        }
        let child = shell(&render(template, output))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        *running = Some((child, output.to_path_buf()));
        Ok(())
    }

    async fn stop(&self) -> Result<PathBuf, CaptureError> {
        let (mut child, output) = self
            .running
            .lock()
            .await
            .take()
            .ok_or_else(|| CaptureError::Failed("recorder is not running".to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(error) = stdin.write_all(b"q\n").await {
                debug!("recorder stdin closed: {error}");
            }
        }
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!("recorder exited with {status}");
            }
            Err(_) => {
                warn!("recorder did not stop, killing it");
                child.kill().await?;
            }
        }

        let metadata = tokio::fs::metadata(&output).await?;
        if metadata.len() == 0 {
            return Err(CaptureError::Failed(format!("{} is empty", output.display())));
        }
        Ok(output)
    }
}

/// Plays a url with a command template. `{url}` is replaced with the url.
pub struct CommandPlayer {
    template: Option<String>,
}

impl CommandPlayer {
    pub fn new(template: Option<String>) -> Self {
        Self { template }
    }
}

#[async_trait]
impl AudioPlayer for CommandPlayer {
    async fn play(&self, url: &str) -> Result<(), CaptureError> {
        let template = self
            .template
            .as_deref()
            .ok_or_else(|| CaptureError::Failed("no player command configured".to_string()))?;
        let command = template.replace("{url}", &shell_quote(url));
        let status = shell(&command).stdin(Stdio::null()).status().await?;
        if !status.success() {
            return Err(CaptureError::Failed(format!("player exited with {status}")));
        }
        Ok(())
    }
}

/// Grabs a video frame with `ffmpeg`.
pub struct FfmpegThumbnailer {
    cache_dir: PathBuf,
}

impl FfmpegThumbnailer {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }
}

#[async_trait]
impl ThumbnailGenerator for FfmpegThumbnailer {
    async fn thumbnail(&self, video: &LocalAttachment, at: Duration) -> Result<LocalAttachment, CaptureError> {
        let input = local_path(&video.uri);
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let stem = input
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("video");
        let output = self.cache_dir.join(format!("{stem}-thumb.jpg"));

        let result = Command::new("ffmpeg")
            .arg("-y")
            .arg("-loglevel")
            .arg("error")
            .arg("-ss")
            .arg(format!("{:.3}", at.as_secs_f64()))
            .arg("-i")
            .arg(&input)
            .arg("-frames:v")
            .arg("1")
            .arg(&output)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(CaptureError::Failed(format!("ffmpeg failed: {}", stderr.trim())));
        }
        match tokio::fs::metadata(&output).await {
            Ok(metadata) if metadata.len() > 0 => Ok(attachment_for(&output)),
            _ => Err(CaptureError::Failed(format!(
                "no frame at {}s in {}",
                at.as_secs(),
                input.display()
            ))),
        }
    }
}

/// Reports a configured position.
pub struct FixedLocation {
    position: Option<Coordinates>,
}

impl FixedLocation {
    pub fn new(position: Option<Coordinates>) -> Self {
        Self { position }
    }
}

#[async_trait]
impl Geolocator for FixedLocation {
    async fn current_position(&self) -> Result<Coordinates, CaptureError> {
        self.position.ok_or(CaptureError::Unavailable(Capability::Location))
    }
}

fn shell(command: &str) -> Command {
    debug!("running {command}");
    let mut shell = Command::new("sh");
    shell.arg("-c").arg(command);
    shell
}

fn render(template: &str, output: &Path) -> String {
    template.replace("{output}", &shell_quote(&output.to_string_lossy()))
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn attachment_for(path: &Path) -> LocalAttachment {
    LocalAttachment::new(format!("file://{}", path.display()))
}

fn local_path(uri: &str) -> PathBuf {
    PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
}
