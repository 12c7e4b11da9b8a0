use serde::Serialize;

use super::media::MediaBlock;
use super::{FieldReader, TransformError, fold_media};

pub const MAX_CHAT_MODULES: usize = 15;

/// Plain and full-width backslash both mean "start a new message here".
const MESSAGE_DELIMITERS: [char; 2] = ['\\', '＼'];
const OPTION_MARKERS: [&str; 2] = ["선택지", "option"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Message,
    Option,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub order: usize,
    pub kind: MessageKind,
    pub text: Option<String>,
    pub media: Option<MediaBlock>,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntity {
    pub title: String,
    pub character: String,
    pub messages: Vec<ChatMessage>,
}

pub fn transform(reader: &FieldReader<'_>) -> Result<ChatEntity, TransformError> {
    let title = reader.required_text("title")?;
    let character = reader.required_text("character")?;

    let mut messages = Vec::new();
    for index in 1..=MAX_CHAT_MODULES {
        let Some(kind_label) = reader.text_at("module.kind", index) else {
            continue;
        };
        let text = reader.text_at("module.text", index);
        let media = fold_media(&reader.attachments_at("module.media", index));

        if is_option_module(&kind_label) {
            messages.push(ChatMessage {
                order: messages.len() + 1,
                kind: MessageKind::Option,
                text,
                media,
                options: reader.list_at("module.options", index),
            });
            continue;
        }

        let segments = text.as_deref().map(split_message_text).unwrap_or_default();
        if segments.is_empty() {
            if media.is_some() {
                messages.push(ChatMessage {
                    order: messages.len() + 1,
                    kind: MessageKind::Message,
                    text: None,
                    media,
                    options: Vec::new(),
                });
            }
            continue;
        }

        let mut media = media;
        for segment in segments {
            messages.push(ChatMessage {
                order: messages.len() + 1,
                kind: MessageKind::Message,
                text: Some(segment),
                media: media.take(),
                options: Vec::new(),
            });
        }
    }

    Ok(ChatEntity {
        title,
        character,
        messages,
    })
}

fn is_option_module(label: &str) -> bool {
    let lowered = label.to_lowercase();
    OPTION_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Split on the message delimiters, trimming and dropping empty pieces.
pub fn split_message_text(text: &str) -> Vec<String> {
    text.split(MESSAGE_DELIMITERS)
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}
