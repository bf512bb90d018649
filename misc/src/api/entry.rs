use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Maximum size of a clipboard payload, in bytes.
pub const MAX_CONTENT_SIZE: usize = 10 << 20;

/// Maximum length of a generated preview, in characters.
pub const MAX_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    Text,
    Image,
    File,
}

impl Default for ContentType {
    fn default() -> Self {
        ContentType::Text
    }
}

impl ContentType {
    pub fn to_code(self) -> u32 {
        match self {
            ContentType::Text => 0,
            ContentType::Image => 1,
            ContentType::File => 2,
        }
    }

    pub fn parse_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(ContentType::Text),
            1 => Ok(ContentType::Image),
            2 => Ok(ContentType::File),
            _ => bail!("unknown content type code {code}"),
        }
    }
}

/// One persisted clipboard item. Exactly one of `content` (non-empty) or
/// `external_path` (set) holds the bytes: images can be spilled to the
/// filesystem, in which case the row carries only the path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClipboardEntry {
    pub id: String,

    pub user_id: String,

    #[serde(default)]
    pub content_type: ContentType,

    #[serde(default)]
    pub content: Vec<u8>,

    pub preview: String,

    /// Lowercase hex sha256 of the content bytes.
    pub hash: String,

    #[serde(default)]
    pub source_device: Option<String>,

    #[serde(default)]
    pub create_time: u64,

    #[serde(default)]
    pub external_path: Option<String>,
}

/// The client-settable fields of a push request. Ids, hashes and
/// timestamps are assigned by the server on persist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    #[serde(default)]
    pub content_type: ContentType,

    pub content: Vec<u8>,

    #[serde(default)]
    pub preview: Option<String>,

    #[serde(default)]
    pub source_device: Option<String>,
}
