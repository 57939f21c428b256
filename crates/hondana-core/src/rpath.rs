//! Remote path model.
//!
//! Volume-owning files live at `"<SeriesTitle>/<VolumeTitle>.<ext>"` inside a
//! provider's app folder; top-level metadata files are bare filenames.
//! Comparisons are case-insensitive everywhere, but the verbatim path is kept
//! so it can be round-tripped back to the provider it came from.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// A slash-separated remote path, stored verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemotePath(String);

impl RemotePath {
    pub fn new(raw: impl Into<String>) -> Self {
        RemotePath(raw.into())
    }

    pub fn volume(series: &str, file_name: &str) -> Self {
        RemotePath(format!("{series}/{file_name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` for bare filenames at the app folder root.
    pub fn is_top_level(&self) -> bool {
        !self.0.contains('/')
    }

    /// The series segment, if this is a volume-owning path.
    pub fn series(&self) -> Option<&str> {
        self.0.rsplit_once('/').map(|(series, _)| series)
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit_once('/').map_or(&self.0, |(_, name)| name)
    }

    pub fn stem(&self) -> &str {
        stem(self.file_name())
    }

    pub fn extension(&self) -> String {
        ext(self.file_name())
    }

    /// Case-folded key for indexing and comparison.
    pub fn norm(&self) -> String {
        norm(&self.0)
    }

    /// Case-folded `"series/stem"` key, ignoring the extension. Used to pair
    /// archives with their sidecars.
    pub fn stem_key(&self) -> String {
        match self.0.rsplit_once('/') {
            Some((series, name)) => norm(&format!("{series}/{}", stem(name))),
            None => norm(stem(&self.0)),
        }
    }
}

impl Display for RemotePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RemotePath {
    fn from(value: &str) -> Self {
        RemotePath::new(value)
    }
}

/// Unicode-lowercase fold used for every path comparison.
pub fn norm(s: &str) -> String {
    s.to_lowercase()
}

/// The filename extension (without dot, lowercased), or `""`.
pub fn ext(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() => ext.to_ascii_lowercase(),
        _ => String::new(),
    }
}

/// The filename without its final extension. `.mokuro.gz` is treated as a
/// single compound extension so the stem pairs with its archive.
pub fn stem(name: &str) -> &str {
    let name = name
        .strip_suffix(".mokuro.gz")
        .or_else(|| name.rsplit_once('.').map(|(base, _)| base).filter(|b| !b.is_empty()))
        .unwrap_or(name);
    name
}

/// The last path segment of a slash-separated entry name.
pub fn base_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

/// The first path segment, or `None` for bare names.
pub fn first_segment(path: &str) -> Option<&str> {
    path.split_once('/').map(|(first, _)| first)
}
