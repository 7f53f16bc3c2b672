use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const THREADS_COLLECTION: &str = "THREADS";
pub const MESSAGES_COLLECTION: &str = "MESSAGES";

pub const DOCUMENT_UPLOAD_LABEL: &str = "Document Upload";
pub const LOCATION_SEND_LABEL: &str = "Location Send";

/// Region shown when a stored location string cannot be parsed.
pub const DEFAULT_MAP_REGION: Coordinates = Coordinates {
    latitude: 37.78825,
    longitude: -122.4324,
};

static COORDINATES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(-?\d+(?:\.\d+)?)\s*,\s*(-?\d+(?:\.\d+)?)\s*$").expect("valid coordinates regex")
});

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("invalid coordinates {0:?} (expected \"lat,lng\")")]
    InvalidCoordinates(String),
    #[error("coordinates out of range: {0}")]
    CoordinatesOutOfRange(String),
}

/// Thread document as stored in `THREADS`. Every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_message: Option<LatestMessageRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestMessageRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadDoc {
    pub id: String,
    pub record: ThreadRecord,
}

/// Message document as stored in `THREADS/{id}/MESSAGES`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<bool>,
}

impl MessageRecord {
    /// Names of the content fields that carry a non-empty value.
    /// `videoThumbnail` rides along with `video` and is not counted.
    pub fn populated_content(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.text.as_deref().is_some_and(|text| !text.is_empty()) {
            fields.push("text");
        }
        let slots = [
            ("image", &self.image),
            ("video", &self.video),
            ("audio", &self.audio),
            ("location", &self.location),
        ];
        for (name, value) in slots {
            if value.as_deref().is_some_and(|value| !value.is_empty()) {
                fields.push(name);
            }
        }
        fields
    }

    pub fn is_system(&self) -> bool {
        self.system.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageDoc {
    pub id: String,
    pub record: MessageRecord,
}

/// The signed-in user stamped on every outgoing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    pub email: String,
}

impl Author {
    pub fn to_record(&self) -> UserRecord {
        UserRecord {
            id: self.id.clone(),
            email: self.email.clone(),
            name: None,
        }
    }
}

/// A device-local file produced by a capture adapter, as a path or `file://` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAttachment {
    pub uri: String,
}

impl LocalAttachment {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    /// Everything after the last `/`.
    pub fn file_name(&self) -> &str {
        match self.uri.rfind('/') {
            Some(index) => &self.uri[index + 1..],
            None => &self.uri,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, ModelError> {
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(ModelError::CoordinatesOutOfRange(format!("{latitude},{longitude}")));
        }
        Ok(Self { latitude, longitude })
    }

    /// Parses a stored location, falling back to the default map region.
    pub fn parse_or_default(value: &str) -> Self {
        value.parse().unwrap_or(DEFAULT_MAP_REGION)
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.latitude, self.longitude)
    }
}

impl FromStr for Coordinates {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let caps = COORDINATES_RE
            .captures(value)
            .ok_or_else(|| ModelError::InvalidCoordinates(value.to_string()))?;
        let latitude: f64 = caps[1]
            .parse()
            .map_err(|_| ModelError::InvalidCoordinates(value.to_string()))?;
        let longitude: f64 = caps[2]
            .parse()
            .map_err(|_| ModelError::InvalidCoordinates(value.to_string()))?;
        Coordinates::new(latitude, longitude)
    }
}

/// Content of one message. Exactly one kind per message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Image { url: String },
    Video { url: String, thumbnail: String },
    Audio { url: String },
    Location(Coordinates),
}

impl MessageContent {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageContent::Text(_) => "text",
            MessageContent::Image { .. } => "image",
            MessageContent::Video { .. } => "video",
            MessageContent::Audio { .. } => "audio",
            MessageContent::Location(_) => "location",
        }
    }

    /// Text written to the thread's latest-message summary.
    pub fn summary_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Image { .. } | MessageContent::Video { .. } | MessageContent::Audio { .. } => {
                DOCUMENT_UPLOAD_LABEL.to_string()
            }
            MessageContent::Location(_) => LOCATION_SEND_LABEL.to_string(),
        }
    }

    pub fn to_record(&self, created_at: i64, author: &Author) -> MessageRecord {
        let mut record = MessageRecord {
            text: Some(String::new()),
            created_at: Some(created_at),
            user: Some(author.to_record()),
            ..MessageRecord::default()
        };
        match self {
            MessageContent::Text(text) => record.text = Some(text.clone()),
            MessageContent::Image { url } => record.image = Some(url.clone()),
            MessageContent::Video { url, thumbnail } => {
                record.video = Some(url.clone());
                record.video_thumbnail = Some(thumbnail.clone());
            }
            MessageContent::Audio { url } => record.audio = Some(url.clone()),
            MessageContent::Location(coordinates) => record.location = Some(coordinates.to_string()),
        }
        record
    }

    /// Reads the content back from a stored record. Media fields win over text;
    /// a record with nothing populated yields empty text.
    pub fn from_record(record: &MessageRecord) -> Self {
        let filled = |value: &Option<String>| value.clone().filter(|value| !value.is_empty());
        if let Some(url) = filled(&record.image) {
            return MessageContent::Image { url };
        }
        if let Some(url) = filled(&record.video) {
            return MessageContent::Video {
                url,
                thumbnail: record.video_thumbnail.clone().unwrap_or_default(),
            };
        }
        if let Some(url) = filled(&record.audio) {
            return MessageContent::Audio { url };
        }
        if let Some(location) = filled(&record.location) {
            return MessageContent::Location(Coordinates::parse_or_default(&location));
        }
        MessageContent::Text(record.text.clone().unwrap_or_default())
    }
}

/// Thread list row with defaults applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadView {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub latest_message: LatestMessage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestMessage {
    pub text: String,
    pub created_at: Option<i64>,
}

impl ThreadView {
    pub fn from_doc(doc: &ThreadDoc) -> Self {
        let latest = doc.record.latest_message.clone().unwrap_or_default();
        Self {
            id: doc.id.clone(),
            name: doc.record.name.clone().unwrap_or_default(),
            latest_message: LatestMessage {
                text: latest.text.unwrap_or_default(),
                created_at: latest.created_at,
            },
        }
    }
}

/// Message shaped for the chat renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(rename = "_id")]
    pub id: String,
    pub text: String,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<ChatUser>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub system: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatUser {
    #[serde(rename = "_id")]
    pub id: String,
    pub email: String,
    pub name: String,
}

impl ChatMessage {
    pub fn from_doc(doc: &MessageDoc, now: i64) -> Self {
        let record = &doc.record;
        let system = record.is_system();
        let user = if system {
            None
        } else {
            let user = record.user.clone().unwrap_or_default();
            Some(ChatUser {
                name: user.email.clone(),
                id: user.id,
                email: user.email,
            })
        };
        Self {
            id: doc.id.clone(),
            text: record.text.clone().unwrap_or_default(),
            created_at: record.created_at.unwrap_or(now),
            user,
            image: record.image.clone(),
            video: record.video.clone(),
            video_thumbnail: record.video_thumbnail.clone(),
            audio: record.audio.clone(),
            location: record.location.clone(),
            system,
        }
    }

    pub fn content(&self) -> MessageContent {
        MessageContent::from_record(&MessageRecord {
            text: Some(self.text.clone()),
            image: self.image.clone(),
            video: self.video.clone(),
            video_thumbnail: self.video_thumbnail.clone(),
            audio: self.audio.clone(),
            location: self.location.clone(),
            ..MessageRecord::default()
        })
    }
}
