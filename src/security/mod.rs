pub mod sanitize;

pub use sanitize::{DEFAULT_PREVIEW_CHARS, sanitize_preview, truncate_chars};
