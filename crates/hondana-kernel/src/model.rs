//! Row types persisted by the object database and the remote listing model
//! shared by every provider.

use std::{collections::BTreeSet, fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use hondana_core::{
    SeriesUuid, VolumeUuid,
    mokuro::MokuroPage,
    rpath::RemotePath,
};
use serde::{Deserialize, Serialize};

/// Identifies one configured remote store instance. Built-in providers use
/// their kind name (`drive`, `webdav`, `share`); read-only external
/// libraries use `library:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        ProviderId(id.into())
    }

    pub fn library(library_id: &str) -> Self {
        ProviderId(format!("library:{library_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Concurrency bucket key for the scheduler, e.g. `"drive:upload"`.
    pub fn op_key(&self, op: &str) -> String {
        format!("{}:{op}", self.0)
    }
}

impl Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProviderId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ProviderId(s.to_string()))
    }
}

/// One book volume. The unit of ingest, storage, and cloud transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub volume_uuid: VolumeUuid,
    pub series_uuid: SeriesUuid,
    pub series_title: String,
    pub volume_title: String,

    /// Empty string means image-only: no OCR row exists.
    #[serde(default)]
    pub mokuro_version: String,
    #[serde(default)]
    pub page_count: u32,
    #[serde(default)]
    pub character_count: u64,
    #[serde(default)]
    pub page_char_counts: Vec<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_height: Option<u32>,

    /// Page paths that were absent from the owning archive at ingest and are
    /// backed by a fabricated placeholder image.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub missing_page_paths: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudShadow>,
}

impl VolumeRecord {
    pub fn is_placeholder(&self) -> bool {
        self.cloud.as_ref().is_some_and(|c| c.is_placeholder)
    }

    pub fn is_image_only(&self) -> bool {
        self.mokuro_version.is_empty()
    }

    /// Non-empty for volumes sourced from a read-only external library.
    pub fn library_id(&self) -> Option<&str> {
        self.cloud
            .as_ref()
            .and_then(|c| c.library_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}

/// Cloud-backing attributes, present iff the volume is a placeholder or is
/// known to exist remotely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudShadow {
    #[serde(default, rename = "isPlaceholder")]
    pub is_placeholder: bool,
    #[serde(default, rename = "cloudProvider", skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderId>,
    #[serde(default, rename = "cloudFileId", skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default, rename = "cloudModifiedTime", skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, rename = "cloudSize", skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, rename = "cloudPath", skip_serializing_if = "Option::is_none")]
    pub path: Option<RemotePath>,
    #[serde(default, rename = "cloudThumbnailFileId", skip_serializing_if = "Option::is_none")]
    pub thumbnail_file_id: Option<String>,
    #[serde(default, rename = "libraryId", skip_serializing_if = "Option::is_none")]
    pub library_id: Option<String>,
}

/// OCR for one volume. Originals are never destructively edited; user edits
/// live in `edited_pages` keyed by page index so the original is always
/// recoverable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OcrDocument {
    pub pages: Vec<MokuroPage>,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub edited_pages: std::collections::BTreeMap<u32, MokuroPage>,
}

/// Reading progress and aggregates for one volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeStats {
    #[serde(default)]
    pub current_page: u32,
    #[serde(default)]
    pub chars_read: u64,
    #[serde(default)]
    pub minutes_read: u64,
    #[serde(default)]
    pub completed: bool,
    /// Recent page-turn timestamps (unix seconds), newest last, bounded.
    #[serde(default)]
    pub recent_turns: Vec<i64>,
    #[serde(default)]
    pub sessions: SessionSummary,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub reader: ReaderSettings,
}

pub const RECENT_TURNS_WINDOW: usize = 50;

impl VolumeStats {
    /// Records a page turn at `now`, trimming the window.
    pub fn record_turn(&mut self, now: i64, page: u32, chars_on_page: u64) {
        self.current_page = page;
        self.chars_read += chars_on_page;
        self.recent_turns.push(now);
        if self.recent_turns.len() > RECENT_TURNS_WINDOW {
            let excess = self.recent_turns.len() - RECENT_TURNS_WINDOW;
            self.recent_turns.drain(..excess);
        }
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSummary {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub total_minutes: u64,
    #[serde(default)]
    pub total_chars: u64,
}

/// Per-volume viewer settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReaderSettings {
    #[serde(default)]
    pub single_page: bool,
    #[serde(default)]
    pub right_to_left: bool,
    #[serde(default)]
    pub has_cover: bool,
}

/// Named bag of UI and integration settings. At least one profile
/// ("Default") always exists; one is designated current.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl Profile {
    pub const DEFAULT_NAME: &'static str = "Default";

    pub fn named(name: impl Into<String>) -> Self {
        Profile { name: name.into(), settings: Default::default() }
    }
}

/// Stored credential state for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ProviderCredentials {
    pub fn is_usable(&self) -> bool {
        self.access_token.is_some()
            && !self
                .expires_at
                .is_some_and(|expires| expires <= Utc::now())
    }
}

/// A read-only WebDAV-style external library source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    pub id: String,
    pub name: String,
    pub server_url: String,
    #[serde(default)]
    pub base_path: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fetched: Option<DateTime<Utc>>,
}

/// One entry of a provider's remote listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub provider: ProviderId,
    pub file_id: String,
    pub path: RemotePath,
    pub modified: DateTime<Utc>,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Provider status surfaced to the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub authenticated: bool,
    pub has_stored_credentials: bool,
    pub needs_attention: bool,
    #[serde(default)]
    pub status_message: String,
}

/// Storage quota as reported by a provider. `total`/`available` are absent
/// on stores that only report usage.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StorageQuota {
    pub used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_shadow_roundtrip() {
        let record = VolumeRecord {
            volume_uuid: VolumeUuid::derive("S", "V"),
            series_uuid: SeriesUuid::derive("S"),
            series_title: "S".into(),
            volume_title: "V".into(),
            mokuro_version: String::new(),
            page_count: 0,
            character_count: 0,
            page_char_counts: vec![],
            thumbnail_width: None,
            thumbnail_height: None,
            missing_page_paths: Default::default(),
            cloud: Some(CloudShadow {
                is_placeholder: true,
                provider: Some(ProviderId::new("drive")),
                file_id: Some("f1".into()),
                ..Default::default()
            }),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["cloud"]["isPlaceholder"], true);
        assert_eq!(json["cloud"]["cloudProvider"], "drive");

        let back: VolumeRecord = serde_json::from_value(json).unwrap();
        assert!(back.is_placeholder());
        assert!(back.is_image_only());
    }

    #[test]
    fn test_recent_turns_window_is_bounded() {
        let mut stats = VolumeStats::default();
        for i in 0..(RECENT_TURNS_WINDOW as i64 + 10) {
            stats.record_turn(i, i as u32, 5);
        }
        assert_eq!(stats.recent_turns.len(), RECENT_TURNS_WINDOW);
        assert_eq!(*stats.recent_turns.first().unwrap(), 10);
        assert_eq!(stats.chars_read, 5 * (RECENT_TURNS_WINDOW as u64 + 10));
    }

    #[test]
    fn test_credentials_expiry() {
        let mut creds = ProviderCredentials::default();
        assert!(!creds.is_usable());
        creds.access_token = Some("tok".into());
        assert!(creds.is_usable());
        creds.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        assert!(!creds.is_usable());
    }
}
