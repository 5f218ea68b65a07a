//! Domain vocabulary shared by the chatroom backend: room and system roles,
//! message content types, inbound frame validation and markup sanitization.

pub mod content;
pub mod role;

pub use content::{
    sanitize_markup, ContentRules, ContentType, InboundMessage, MessageContent,
    UnknownContentType, ValidationError, MAX_GIF_URL_LENGTH, MAX_IMAGE_LENGTH, MAX_META_LENGTH,
    MAX_TEXT_LENGTH, WEBP_DATA_URL_PREFIX,
};
pub use role::{ChatroomRole, RoleParseError, SystemRole};
