use avtool_core::LineEnding;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadClass {
    Ascii,
    Binary,
}

/// One observed byte exchange, possibly merged with near-identical repeats.
///
/// The raw bytes are not kept; `bytes_hex` is the lossless rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capture {
    pub id: String,
    pub timestamp: u64,
    pub last_timestamp: u64,
    pub source_address: String,
    pub source_port: u16,
    pub local_port: u16,
    pub bytes_hex: String,
    pub bytes_ascii: String,
    pub payload_class: PayloadClass,
    pub line_ending_hint: LineEnding,
    pub content_hash: String,
    pub pinned: bool,
    pub repeat_count: u32,
}

/// What `append` did with a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Stored(String),
    Merged(String),
}

impl AppendOutcome {
    pub fn id(&self) -> &str {
        match self {
            AppendOutcome::Stored(id) | AppendOutcome::Merged(id) => id,
        }
    }
}
