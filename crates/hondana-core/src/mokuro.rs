//! The mokuro OCR sidecar format.
//!
//! A `.mokuro` file is a JSON document produced by the mokuro OCR pipeline
//! and stored next to (or inside) a volume archive. Unknown fields are
//! preserved-by-ignoring so newer producers never break ingest.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MokuroData {
    #[serde(default)]
    pub version: String,
    pub title: String,
    pub title_uuid: Uuid,
    pub volume: String,
    pub volume_uuid: Uuid,
    #[serde(default)]
    pub pages: Vec<MokuroPage>,
    #[serde(default)]
    pub chars: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MokuroPage {
    pub img_path: String,
    pub img_width: u32,
    pub img_height: u32,
    #[serde(default)]
    pub blocks: Vec<MokuroBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MokuroBlock {
    /// `[xmin, ymin, xmax, ymax]` in page pixel coordinates.
    #[serde(rename = "box")]
    pub bbox: [f64; 4],
    #[serde(default)]
    pub vertical: bool,
    #[serde(default)]
    pub font_size: f64,
    #[serde(default)]
    pub lines: Vec<String>,
}

impl MokuroPage {
    /// Number of characters of text on this page.
    pub fn char_count(&self) -> u64 {
        self.blocks
            .iter()
            .flat_map(|b| b.lines.iter())
            .map(|line| line.chars().count() as u64)
            .sum()
    }
}

impl MokuroData {
    /// Character counts per page, aligned with `pages`.
    pub fn page_char_counts(&self) -> Vec<u64> {
        self.pages.iter().map(MokuroPage::char_count).collect()
    }

    /// Total characters across all pages. The sidecar's declared `chars`
    /// field wins when present and non-zero.
    pub fn character_count(&self) -> u64 {
        if self.chars > 0 {
            self.chars
        } else {
            self.page_char_counts().iter().sum()
        }
    }
}
