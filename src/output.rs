use serde::Serialize;
use thiserror::Error;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::model::{ChatMessage, MessageContent, ThreadView};
use crate::send::{SentMessage, ThreadRef};

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Copy)]
pub enum JsonFormat {
    Pretty,
    Compact,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadListOutput {
    pub items: Vec<ThreadListItem>,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadListItem {
    pub thread: ThreadView,
    pub relative_date: Option<String>,
}

impl ThreadListOutput {
    pub fn new(threads: &[ThreadView], now_ms: i64) -> Self {
        let items = threads
            .iter()
            .map(|thread| ThreadListItem {
                relative_date: thread
                    .latest_message
                    .created_at
                    .map(|created_at| format_relative_date(created_at / 1000, now_ms / 1000)),
                thread: thread.clone(),
            })
            .collect();
        Self { items }
    }
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageListOutput {
    pub thread: ThreadRef,
    pub items: Vec<MessageItem>,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageItem {
    pub message: ChatMessage,
    pub kind: &'static str,
    pub preview: String,
    pub sender_name: String,
    pub relative_date: String,
}

impl MessageListOutput {
    pub fn new(thread: ThreadRef, messages: &[ChatMessage], now_ms: i64) -> Self {
        let items = messages
            .iter()
            .map(|message| {
                let content = message.content();
                MessageItem {
                    kind: content.kind(),
                    preview: preview(&content),
                    sender_name: message
                        .user
                        .as_ref()
                        .map(|user| user.name.clone())
                        .unwrap_or_else(|| "system".to_string()),
                    relative_date: format_relative_date(message.created_at / 1000, now_ms / 1000),
                    message: message.clone(),
                }
            })
            .collect();
        Self { thread, items }
    }
}

/// One-line rendering of a message body.
pub fn preview(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.replace('\n', " "),
        MessageContent::Image { url } => format!("[image] {url}"),
        MessageContent::Video { url, .. } => format!("[video] {url}"),
        MessageContent::Audio { url } => format!("[audio] {url}"),
        MessageContent::Location(coordinates) => format!("[location] {coordinates}"),
    }
}

pub fn resolve_json_format(compact: bool) -> JsonFormat {
    if compact {
        JsonFormat::Compact
    } else {
        JsonFormat::Pretty
    }
}

pub fn json_string<T: Serialize + ?Sized>(value: &T, format: JsonFormat) -> Result<String, OutputError> {
    let payload = match format {
        JsonFormat::Pretty => serde_json::to_string_pretty(value)?,
        JsonFormat::Compact => serde_json::to_string(value)?,
    };
    Ok(payload)
}

pub fn print_json<T: Serialize + ?Sized>(value: &T, format: JsonFormat) -> Result<(), OutputError> {
    let payload = json_string(value, format)?;
    println!("{payload}");
    Ok(())
}

pub fn print_threads(output: &ThreadListOutput, json: bool, json_format: JsonFormat) -> Result<(), OutputError> {
    if json {
        return print_json(output, json_format);
    }
    if output.items.is_empty() {
        println!("No threads.");
        return Ok(());
    }

    let mut id_width = display_width("id");
    let mut name_width = display_width("name");
    let mut when_width = display_width("when");
    for item in &output.items {
        id_width = id_width.max(display_width(&item.thread.id));
        name_width = name_width.max(display_width(&item.thread.name));
        if let Some(when) = &item.relative_date {
            when_width = when_width.max(display_width(when));
        }
    }
    id_width = id_width.min(22);
    name_width = name_width.min(28);
    when_width = when_width.min(10);

    println!(
        "{}  {}  {}  {}",
        pad_right("id", id_width),
        pad_right("name", name_width),
        pad_right("when", when_width),
        pad_right("latest message", 60),
    );
    for item in &output.items {
        let latest = if item.thread.latest_message.text.is_empty() {
            "<no messages>"
        } else {
            item.thread.latest_message.text.as_str()
        };
        println!(
            "{}  {}  {}  {}",
            pad_right(&truncate_display(&item.thread.id, id_width), id_width),
            pad_right(&truncate_display(&item.thread.name, name_width), name_width),
            pad_right(item.relative_date.as_deref().unwrap_or("-"), when_width),
            pad_right(&truncate_display(latest, 60), 60),
        );
    }
    Ok(())
}

pub fn print_messages(output: &MessageListOutput, json: bool, json_format: JsonFormat) -> Result<(), OutputError> {
    if json {
        return print_json(output, json_format);
    }

    println!("Messages for {} ({})", output.thread.name, output.thread.id);
    let mut from_width = display_width("from");
    let mut when_width = display_width("when");
    for item in &output.items {
        from_width = from_width.max(display_width(&item.sender_name));
        when_width = when_width.max(display_width(&item.relative_date));
    }
    from_width = from_width.min(24);
    when_width = when_width.min(10);

    println!(
        "{}  {}  {}  {}",
        pad_right("id", 20),
        pad_right("when", when_width),
        pad_right("from", from_width),
        pad_right("text", 72),
    );
    for item in &output.items {
        println!(
            "{}  {}  {}  {}",
            pad_right(&item.message.id, 20),
            pad_right(&item.relative_date, when_width),
            pad_right(&truncate_display(&item.sender_name, from_width), from_width),
            pad_right(&truncate_display(&item.preview, 72), 72),
        );
    }
    Ok(())
}

pub fn print_sent(sent: &SentMessage, json: bool, json_format: JsonFormat) -> Result<(), OutputError> {
    if json {
        return print_json(sent, json_format);
    }
    println!("Sent {} message {} ({})", sent.content.kind(), sent.message_id, preview(&sent.content));
    Ok(())
}

pub fn format_relative_date(timestamp: i64, now: i64) -> String {
    if now <= 0 || timestamp <= 0 {
        return "-".to_string();
    }
    let (delta, future) = if timestamp > now {
        (timestamp - now, true)
    } else {
        (now - timestamp, false)
    };
    if delta < 10 {
        return "now".to_string();
    }
    if delta < 60 {
        return format_relative_unit(delta, "s", future);
    }
    let minutes = delta / 60;
    if minutes < 60 {
        return format_relative_unit(minutes, "m", future);
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format_relative_unit(hours, "h", future);
    }
    let days = hours / 24;
    if days < 7 {
        return format_relative_unit(days, "d", future);
    }
    let weeks = days / 7;
    if weeks < 4 {
        return format_relative_unit(weeks, "w", future);
    }
    let months = days / 30;
    if months < 12 {
        return format_relative_unit(months, "mo", future);
    }
    format_relative_unit(days / 365, "y", future)
}

fn format_relative_unit(value: i64, unit: &str, future: bool) -> String {
    if future {
        format!("in {value}{unit}")
    } else {
        format!("{value}{unit} ago")
    }
}

fn display_width(value: &str) -> usize {
    UnicodeWidthStr::width(value)
}

fn truncate_display(value: &str, max_width: usize) -> String {
    if display_width(value) <= max_width {
        return value.to_string();
    }
    let ellipsis = "...";
    let mut width = 0usize;
    let mut output = String::new();
    for ch in value.chars() {
        let ch_width = UnicodeWidthChar::width(ch).unwrap_or(0);
        if width + ch_width + ellipsis.len() > max_width {
            break;
        }
        output.push(ch);
        width += ch_width;
    }
    output.push_str(ellipsis);
    output
}

fn pad_right(value: &str, width: usize) -> String {
    let mut output = value.to_string();
    let current = display_width(value);
    if current < width {
        output.push_str(&" ".repeat(width - current));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Coordinates, LatestMessage};

    #[test]
    fn relative_dates() {
        assert_eq!(format_relative_date(100, 105), "now");
        assert_eq!(format_relative_date(100, 145), "45s ago");
        assert_eq!(format_relative_date(0, 145), "-");
        assert_eq!(format_relative_date(10_000, 10_000 + 3 * 3600), "3h ago");
        assert_eq!(format_relative_date(10_000 + 120, 10_000), "in 2m");
    }

    #[test]
    fn wide_text_is_truncated_by_display_width() {
        assert_eq!(truncate_display("hello world", 8), "hello...");
        assert_eq!(truncate_display("日本語のテキスト", 9), "日本語...");
        assert_eq!(pad_right("日本", 6), "日本  ");
    }

    #[test]
    fn previews_name_the_content_kind() {
        assert_eq!(preview(&MessageContent::Text("a\nb".to_string())), "a b");
        assert_eq!(
            preview(&MessageContent::Location(Coordinates {
                latitude: 1.5,
                longitude: 2.0
            })),
            "[location] 1.5,2"
        );
    }

    #[test]
    fn message_items_fall_back_to_system_sender() {
        let message = ChatMessage {
            id: "m1".to_string(),
            text: "Welcome".to_string(),
            created_at: 1_000,
            user: None,
            image: None,
            video: None,
            video_thumbnail: None,
            audio: Some("https://x/a.mp3".to_string()),
            location: None,
            system: true,
        };
        let thread = ThreadRef {
            id: "t1".to_string(),
            name: "General".to_string(),
        };
        let output = MessageListOutput::new(thread, &[message], 61_000);
        assert_eq!(output.items[0].sender_name, "system");
        assert_eq!(output.items[0].kind, "audio");
        assert_eq!(output.items[0].relative_date, "1m ago");
    }

    #[test]
    fn thread_items_carry_relative_dates() {
        let threads = vec![
            ThreadView {
                id: "t1".to_string(),
                name: "General".to_string(),
                latest_message: LatestMessage {
                    text: "hi".to_string(),
                    created_at: Some(1_000),
                },
            },
            ThreadView {
                id: "t2".to_string(),
                name: String::new(),
                latest_message: LatestMessage::default(),
            },
        ];
        let output = ThreadListOutput::new(&threads, 3_601_000);
        assert_eq!(output.items[0].relative_date.as_deref(), Some("1h ago"));
        assert_eq!(output.items[1].relative_date, None);
        let json = json_string(&output, JsonFormat::Compact).expect("json");
        assert!(json.contains("\"latestMessage\":{\"text\":\"hi\",\"createdAt\":1000}"), "{json}");
    }
}
