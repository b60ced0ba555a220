mod anthropic;

pub use anthropic::{ContentBlock, ImageSource, MessageParam, Role, ToolResultContent};
pub(crate) use anthropic::{MessageRequest, MessageResponse, ThinkingConfig, retain_recent_images};
