//! Message content types and the validation applied to client-supplied frames.
//!
//! Text and info payloads are stripped of markup before they are stored. Image
//! payloads must be base64 WebP data URLs and GIFs must point below the
//! configured CDN prefix; both are stored untouched.

use std::{fmt, str::FromStr};

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_TEXT_LENGTH: usize = 10_000;
pub const MAX_IMAGE_LENGTH: usize = 500_000;
pub const MAX_META_LENGTH: usize = 200;
pub const MAX_GIF_URL_LENGTH: usize = 2_048;
pub const WEBP_DATA_URL_PREFIX: &str = "data:image/webp;base64,";

const RAW_TEXT_TAGS: &[&str] = &["script", "style"];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown content type '{0}'")]
pub struct UnknownContentType(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
    Gif,
    Info,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
            ContentType::Gif => "gif",
            ContentType::Info => "info",
        }
    }

    /// Only plain text messages may be edited after creation.
    pub fn is_editable(self) -> bool {
        matches!(self, ContentType::Text)
    }

    pub fn is_markup_sanitized(self) -> bool {
        matches!(self, ContentType::Text | ContentType::Info)
    }
}

impl FromStr for ContentType {
    type Err = UnknownContentType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(ContentType::Text),
            "image" => Ok(ContentType::Image),
            "gif" => Ok(ContentType::Gif),
            "info" => Ok(ContentType::Info),
            other => Err(UnknownContentType(other.to_string())),
        }
    }
}

impl TryFrom<String> for ContentType {
    type Error = UnknownContentType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("message content must not be empty")]
    Empty,
    #[error("text content exceeds {MAX_TEXT_LENGTH} characters")]
    TextTooLong,
    #[error("image content exceeds {MAX_IMAGE_LENGTH} characters")]
    ImageTooLarge,
    #[error("image content must be a base64 encoded WebP data URL")]
    InvalidImage,
    #[error("gif content must be a URL starting with {0}")]
    InvalidGifUrl(String),
    #[error("content_meta exceeds {MAX_META_LENGTH} characters")]
    MetaTooLong,
}

/// Rules that depend on deployment configuration.
#[derive(Debug, Clone)]
pub struct ContentRules {
    pub gif_url_prefix: String,
}

impl Default for ContentRules {
    fn default() -> Self {
        Self {
            gif_url_prefix: "https://media.tenor.com/".to_string(),
        }
    }
}

/// A client frame, discriminated by `content_type`. `info` is reserved for
/// system messages and is not accepted from clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "content_type", rename_all = "lowercase")]
pub enum InboundMessage {
    Text {
        content: String,
        #[serde(default)]
        content_meta: Option<String>,
    },
    Image {
        content: String,
        #[serde(default)]
        content_meta: Option<String>,
    },
    Gif {
        content: String,
        #[serde(default)]
        content_meta: Option<String>,
    },
}

/// Validated content ready to hand to the message store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContent {
    pub content_type: ContentType,
    pub content: String,
    pub content_meta: Option<String>,
}

impl MessageContent {
    /// System generated notice, e.g. membership changes.
    pub fn info(content: impl Into<String>) -> Self {
        Self {
            content_type: ContentType::Info,
            content: content.into(),
            content_meta: None,
        }
    }
}

impl InboundMessage {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(raw).map_err(|err| ValidationError::Malformed(err.to_string()))
    }

    pub fn content_type(&self) -> ContentType {
        match self {
            InboundMessage::Text { .. } => ContentType::Text,
            InboundMessage::Image { .. } => ContentType::Image,
            InboundMessage::Gif { .. } => ContentType::Gif,
        }
    }

    pub fn validate(self, rules: &ContentRules) -> Result<MessageContent, ValidationError> {
        let content_type = self.content_type();
        let (content, content_meta) = match self {
            InboundMessage::Text {
                content,
                content_meta,
            } => {
                if content.chars().count() > MAX_TEXT_LENGTH {
                    return Err(ValidationError::TextTooLong);
                }
                if content.trim().is_empty() {
                    return Err(ValidationError::Empty);
                }
                (content, content_meta)
            }
            InboundMessage::Image {
                content,
                content_meta,
            } => {
                validate_image(&content)?;
                (content, content_meta)
            }
            InboundMessage::Gif {
                content,
                content_meta,
            } => {
                validate_gif(&content, &rules.gif_url_prefix)?;
                (content, content_meta)
            }
        };

        if let Some(meta) = &content_meta {
            if meta.chars().count() > MAX_META_LENGTH {
                return Err(ValidationError::MetaTooLong);
            }
        }

        Ok(MessageContent {
            content_type,
            content,
            content_meta,
        })
    }
}

fn validate_image(content: &str) -> Result<(), ValidationError> {
    if content.len() > MAX_IMAGE_LENGTH {
        return Err(ValidationError::ImageTooLarge);
    }
    let Some(encoded) = content.strip_prefix(WEBP_DATA_URL_PREFIX) else {
        return Err(ValidationError::InvalidImage);
    };
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|_| ValidationError::InvalidImage)?;
    // RIFF container with a WEBP form type
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WEBP" {
        return Err(ValidationError::InvalidImage);
    }
    Ok(())
}

fn validate_gif(content: &str, prefix: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::InvalidGifUrl(prefix.to_string());
    if content.len() > MAX_GIF_URL_LENGTH || content.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    match content.strip_prefix(prefix) {
        Some(rest) if !rest.is_empty() => Ok(()),
        _ => Err(invalid()),
    }
}

/// Removes every markup tag from `input`, dropping the bodies of raw-text
/// elements such as `<script>`. Text outside tags is kept verbatim and the
/// result is trimmed. Applying it twice yields the same string.
pub fn sanitize_markup(input: &str) -> String {
    let mut current = strip_pass(input);
    loop {
        let next = strip_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn strip_pass(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];

        if !starts_tag(candidate) {
            out.push('<');
            rest = &candidate[1..];
            continue;
        }

        let Some(end) = candidate.find('>') else {
            out.push_str(candidate);
            rest = "";
            break;
        };

        let tag = &candidate[1..end];
        rest = &candidate[end + 1..];

        let name = tag_name(tag);
        if !tag.starts_with('/') && RAW_TEXT_TAGS.contains(&name.as_str()) {
            let closing = format!("</{name}");
            rest = match rest.to_ascii_lowercase().find(&closing) {
                Some(pos) => &rest[pos..],
                None => "",
            };
        }
    }

    out.push_str(rest);
    out.trim().to_string()
}

fn starts_tag(candidate: &str) -> bool {
    matches!(
        candidate[1..].chars().next(),
        Some(c) if c.is_ascii_alphabetic() || c == '/' || c == '!' || c == '?'
    )
}

fn tag_name(tag: &str) -> String {
    tag.trim_start_matches('/')
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}
