//! The local object database.
//!
//! One fjall keyspace with a partition per table. Record values are
//! serde_json documents so schema evolution is additive; page and thumbnail
//! blobs are raw values in kv-separated partitions. All multi-row writes go
//! through keyspace batches scoped to the tables they touch.

use std::{collections::BTreeSet, io, path::Path};

use bytes::Bytes;
use culprit::Culprit;
use fjall::{KvSeparationOptions, PartitionCreateOptions};
use hondana_core::VolumeUuid;
use keys::{VolumeKey, VolumeTag};
use serde::{Serialize, de::DeserializeOwned};
use tryiter::TryIteratorExt;

use crate::model::{
    LibraryConfig, OcrDocument, Profile, ProviderCredentials, ProviderId, VolumeRecord,
    VolumeStats,
};

pub mod keys;
mod migrations;

pub use migrations::SCHEMA_VERSION;

pub type Result<T> = culprit::Result<T, StorageErr>;

#[derive(Debug, thiserror::Error)]
pub enum StorageErr {
    #[error("fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("io error: {0}")]
    Io(io::ErrorKind),

    #[error("corrupt key")]
    CorruptKey,

    #[error("corrupt record: {0}")]
    CorruptRecord(#[from] serde_json::Error),

    #[error("schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },
}

impl From<io::Error> for StorageErr {
    fn from(err: io::Error) -> Self {
        StorageErr::Io(err.kind())
    }
}

impl From<lsm_tree::Error> for StorageErr {
    fn from(err: lsm_tree::Error) -> Self {
        StorageErr::Fjall(err.into())
    }
}

pub struct Storage {
    keyspace: fjall::Keyspace,

    /// {volume_uuid}{tag} -> VolumeRecord json | thumbnail bytes
    volumes: fjall::Partition,

    /// {volume_uuid} -> OcrDocument json
    ocr: fjall::Partition,

    /// {volume_uuid}{page_path} -> page blob
    files: fjall::Partition,

    /// "profile/{name}" -> Profile json
    /// "current" -> profile name
    /// "creds/{provider}" -> ProviderCredentials json
    profiles: fjall::Partition,

    /// {volume_uuid} -> VolumeStats json
    stats: fjall::Partition,

    /// {library_id} -> LibraryConfig json
    libraries: fjall::Partition,

    /// "schema_version" -> u32 BE
    meta: fjall::Partition,
}

impl Storage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_config(fjall::Config::new(path))
    }

    pub fn open_temporary() -> Result<Self> {
        Self::open_config(fjall::Config::new(tempfile::tempdir()?.keep()).temporary(true))
    }

    pub fn open_config(config: fjall::Config) -> Result<Self> {
        let keyspace = config.open()?;
        let volumes = keyspace.open_partition("volumes", PartitionCreateOptions::default())?;
        let ocr = keyspace.open_partition(
            "volume_ocr",
            PartitionCreateOptions::default().with_kv_separation(KvSeparationOptions::default()),
        )?;
        let files = keyspace.open_partition(
            "volume_files",
            PartitionCreateOptions::default().with_kv_separation(KvSeparationOptions::default()),
        )?;
        let profiles = keyspace.open_partition("profiles", PartitionCreateOptions::default())?;
        let stats = keyspace.open_partition("stats", PartitionCreateOptions::default())?;
        let libraries = keyspace.open_partition("libraries", PartitionCreateOptions::default())?;
        let meta = keyspace.open_partition("meta", PartitionCreateOptions::default())?;

        let storage = Storage {
            keyspace,
            volumes,
            ocr,
            files,
            profiles,
            stats,
            libraries,
            meta,
        };
        migrations::migrate(&storage)?;
        storage.ensure_default_profile()?;
        Ok(storage)
    }

    pub(crate) fn meta_partition(&self) -> &fjall::Partition {
        &self.meta
    }

    pub(crate) fn stats_partition(&self) -> &fjall::Partition {
        &self.stats
    }

    fn put_json<T: Serialize>(
        &self,
        partition: &fjall::Partition,
        key: impl AsRef<[u8]>,
        value: &T,
    ) -> Result<()> {
        let json = serde_json::to_vec(value).map_err(StorageErr::from)?;
        Ok(partition.insert(key.as_ref(), json)?)
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        partition: &fjall::Partition,
        key: impl AsRef<[u8]>,
    ) -> Result<Option<T>> {
        match partition.get(key)? {
            Some(value) => Ok(Some(
                serde_json::from_slice(&value).map_err(StorageErr::from)?,
            )),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // volumes
    // ------------------------------------------------------------------

    pub fn upsert_volume(&self, record: &VolumeRecord) -> Result<()> {
        debug_assert!(
            !record.is_placeholder(),
            "placeholders are derived state and are never persisted"
        );
        self.put_json(
            &self.volumes,
            VolumeKey::new(&record.volume_uuid, VolumeTag::Record),
            record,
        )
    }

    pub fn volume(&self, uuid: &VolumeUuid) -> Result<Option<VolumeRecord>> {
        self.get_json(&self.volumes, VolumeKey::new(uuid, VolumeTag::Record))
    }

    pub fn volumes(&self) -> Result<Vec<VolumeRecord>> {
        let mut out = Vec::new();
        let mut iter = self
            .volumes
            .snapshot()
            .iter()
            .err_into::<Culprit<StorageErr>>();
        while let Some((key, value)) = iter.try_next()? {
            let key = VolumeKey::decode(&key)?;
            if key.tag() == VolumeTag::Record {
                out.push(serde_json::from_slice(&value).map_err(StorageErr::from)?);
            }
        }
        Ok(out)
    }

    pub fn query_series(&self, series: &hondana_core::SeriesUuid) -> Result<Vec<VolumeRecord>> {
        let mut volumes = self.volumes()?;
        volumes.retain(|v| &v.series_uuid == series);
        Ok(volumes)
    }

    pub fn set_thumbnail(&self, uuid: &VolumeUuid, encoded: &[u8]) -> Result<()> {
        Ok(self
            .volumes
            .insert(VolumeKey::new(uuid, VolumeTag::Thumbnail).as_ref(), encoded)?)
    }

    pub fn thumbnail(&self, uuid: &VolumeUuid) -> Result<Option<Bytes>> {
        Ok(self
            .volumes
            .get(VolumeKey::new(uuid, VolumeTag::Thumbnail))?
            .map(|slice| Bytes::from(slice.to_vec())))
    }

    // ------------------------------------------------------------------
    // ocr
    // ------------------------------------------------------------------

    pub fn upsert_ocr(&self, uuid: &VolumeUuid, doc: &OcrDocument) -> Result<()> {
        self.put_json(&self.ocr, uuid.as_bytes(), doc)
    }

    pub fn ocr(&self, uuid: &VolumeUuid) -> Result<Option<OcrDocument>> {
        self.get_json(&self.ocr, uuid.as_bytes())
    }

    // ------------------------------------------------------------------
    // files
    // ------------------------------------------------------------------

    /// Writes a set of page blobs in one batch.
    pub fn write_files<I, B>(&self, uuid: &VolumeUuid, pages: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, B)>,
        B: AsRef<[u8]>,
    {
        let mut batch = self.keyspace.batch();
        for (path, blob) in pages {
            batch.insert(&self.files, keys::file_key(uuid, &path), blob.as_ref());
        }
        Ok(batch.commit()?)
    }

    pub fn file(&self, uuid: &VolumeUuid, path: &str) -> Result<Option<Bytes>> {
        Ok(self
            .files
            .get(keys::file_key(uuid, path))?
            .map(|slice| Bytes::from(slice.to_vec())))
    }

    /// Page paths for a volume in key order, without touching blob values.
    pub fn file_paths(&self, uuid: &VolumeUuid) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut iter = self
            .files
            .snapshot()
            .prefix(uuid.as_bytes())
            .err_into::<Culprit<StorageErr>>();
        while let Some((key, _)) = iter.try_next()? {
            out.push(keys::file_key_path(&key)?.to_string());
        }
        Ok(out)
    }

    /// Streams `(path, blob)` pairs one at a time so callers never need to
    /// materialise a whole volume in memory.
    pub fn iter_files(
        &self,
        uuid: &VolumeUuid,
    ) -> impl Iterator<Item = Result<(String, Bytes)>> + '_ {
        self.files
            .snapshot()
            .prefix(uuid.as_bytes().to_vec())
            .map(|entry| {
                let (key, value) = entry.map_err(StorageErr::from)?;
                let path = keys::file_key_path(&key)?.to_string();
                Ok((path, Bytes::from(value.to_vec())))
            })
    }

    fn delete_files(&self, uuid: &VolumeUuid) -> Result<()> {
        let mut batch = self.keyspace.batch();
        let mut iter = self
            .files
            .snapshot()
            .prefix(uuid.as_bytes())
            .err_into::<Culprit<StorageErr>>();
        while let Some((key, _)) = iter.try_next()? {
            batch.remove(&self.files, key);
        }
        Ok(batch.commit()?)
    }

    // ------------------------------------------------------------------
    // removal
    // ------------------------------------------------------------------

    /// Removes a volume and everything it owns.
    ///
    /// Deletion order is files, then OCR, then metadata, so a crash mid-way
    /// never leaves OCR or files dangling behind a missing record; rerunning
    /// resumes from the first unfinished step.
    pub fn remove_volume(&self, uuid: &VolumeUuid) -> Result<()> {
        self.delete_files(uuid)?;
        self.ocr.remove(uuid.as_bytes())?;
        self.volumes
            .remove(VolumeKey::new(uuid, VolumeTag::Thumbnail).as_ref())?;
        self.volumes
            .remove(VolumeKey::new(uuid, VolumeTag::Record).as_ref())?;
        self.stats.remove(uuid.as_bytes())?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // stats
    // ------------------------------------------------------------------

    pub fn stats(&self, uuid: &VolumeUuid) -> Result<Option<VolumeStats>> {
        self.get_json(&self.stats, uuid.as_bytes())
    }

    pub fn put_stats(&self, uuid: &VolumeUuid, stats: &VolumeStats) -> Result<()> {
        self.put_json(&self.stats, uuid.as_bytes(), stats)
    }

    // ------------------------------------------------------------------
    // profiles & credentials
    // ------------------------------------------------------------------

    fn ensure_default_profile(&self) -> Result<()> {
        if self.profile(Profile::DEFAULT_NAME)?.is_none() {
            self.put_profile(&Profile::named(Profile::DEFAULT_NAME))?;
        }
        if self.profiles.get(keys::CURRENT_PROFILE_KEY)?.is_none() {
            self.profiles
                .insert(keys::CURRENT_PROFILE_KEY, Profile::DEFAULT_NAME)?;
        }
        Ok(())
    }

    pub fn profile(&self, name: &str) -> Result<Option<Profile>> {
        self.get_json(&self.profiles, keys::profile_key(name))
    }

    pub fn put_profile(&self, profile: &Profile) -> Result<()> {
        self.put_json(&self.profiles, keys::profile_key(&profile.name), profile)
    }

    pub fn profiles(&self) -> Result<Vec<Profile>> {
        let mut out = Vec::new();
        let mut iter = self
            .profiles
            .snapshot()
            .prefix(keys::PROFILE_PREFIX)
            .err_into::<Culprit<StorageErr>>();
        while let Some((_, value)) = iter.try_next()? {
            out.push(serde_json::from_slice(&value).map_err(StorageErr::from)?);
        }
        Ok(out)
    }

    pub fn current_profile(&self) -> Result<Profile> {
        let name = self
            .profiles
            .get(keys::CURRENT_PROFILE_KEY)?
            .map(|slice| String::from_utf8_lossy(&slice).into_owned())
            .unwrap_or_else(|| Profile::DEFAULT_NAME.to_string());
        Ok(self
            .profile(&name)?
            .unwrap_or_else(|| Profile::named(name)))
    }

    pub fn set_current_profile(&self, name: &str) -> Result<()> {
        if self.profile(name)?.is_none() {
            self.put_profile(&Profile::named(name))?;
        }
        Ok(self.profiles.insert(keys::CURRENT_PROFILE_KEY, name)?)
    }

    /// Reads one setting from the current profile by dotted path, e.g.
    /// `"reader.font_size"`.
    pub fn setting(&self, path: &str) -> Result<Option<serde_json::Value>> {
        let profile = self.current_profile()?;
        let mut cursor = serde_json::Value::Object(profile.settings);
        for segment in path.split('.') {
            match cursor {
                serde_json::Value::Object(mut map) => match map.remove(segment) {
                    Some(next) => cursor = next,
                    None => return Ok(None),
                },
                _ => return Ok(None),
            }
        }
        Ok(Some(cursor))
    }

    /// Writes one setting into the current profile by dotted path,
    /// creating intermediate objects as needed.
    pub fn set_setting(&self, path: &str, value: serde_json::Value) -> Result<()> {
        let mut profile = self.current_profile()?;
        let mut value = Some(value);
        let mut cursor = &mut profile.settings;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                cursor.insert(
                    segment.to_string(),
                    value.take().expect("value consumed once"),
                );
                break;
            }
            let entry = cursor
                .entry(segment.to_string())
                .or_insert_with(|| serde_json::Value::Object(Default::default()));
            if !entry.is_object() {
                *entry = serde_json::Value::Object(Default::default());
            }
            cursor = entry.as_object_mut().expect("entry was just made an object");
        }
        self.put_profile(&profile)
    }

    pub fn credentials(&self, provider: &ProviderId) -> Result<Option<ProviderCredentials>> {
        self.get_json(&self.profiles, keys::creds_key(provider.as_str()))
    }

    pub fn put_credentials(
        &self,
        provider: &ProviderId,
        creds: &ProviderCredentials,
    ) -> Result<()> {
        self.put_json(&self.profiles, keys::creds_key(provider.as_str()), creds)
    }

    pub fn clear_credentials(&self, provider: &ProviderId) -> Result<()> {
        Ok(self
            .profiles
            .remove(keys::creds_key(provider.as_str()))?)
    }

    // ------------------------------------------------------------------
    // libraries
    // ------------------------------------------------------------------

    pub fn libraries(&self) -> Result<Vec<LibraryConfig>> {
        let mut out = Vec::new();
        let mut iter = self
            .libraries
            .snapshot()
            .iter()
            .err_into::<Culprit<StorageErr>>();
        while let Some((_, value)) = iter.try_next()? {
            out.push(serde_json::from_slice(&value).map_err(StorageErr::from)?);
        }
        Ok(out)
    }

    pub fn put_library(&self, library: &LibraryConfig) -> Result<()> {
        self.put_json(&self.libraries, library.id.as_bytes(), library)
    }

    pub fn remove_library(&self, id: &str) -> Result<()> {
        Ok(self.libraries.remove(id.as_bytes())?)
    }

    /// Volume uuids currently holding page file rows. Used by ingest
    /// rollback and by invariant checks in tests.
    pub fn volumes_with_files(&self) -> Result<BTreeSet<VolumeUuid>> {
        let mut out = BTreeSet::new();
        let mut iter = self
            .files
            .snapshot()
            .iter()
            .err_into::<Culprit<StorageErr>>();
        while let Some((key, _)) = iter.try_next()? {
            let uuid = key.get(..16).ok_or(StorageErr::CorruptKey)?;
            out.insert(VolumeUuid::from_slice(uuid).map_err(|_| StorageErr::CorruptKey)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CloudShadow;
    use hondana_core::SeriesUuid;

    fn record(series: &str, volume: &str) -> VolumeRecord {
        VolumeRecord {
            volume_uuid: VolumeUuid::derive(series, volume),
            series_uuid: SeriesUuid::derive(series),
            series_title: series.into(),
            volume_title: volume.into(),
            mokuro_version: String::new(),
            page_count: 0,
            character_count: 0,
            page_char_counts: vec![],
            thumbnail_width: None,
            thumbnail_height: None,
            missing_page_paths: Default::default(),
            cloud: None,
        }
    }

    #[test]
    fn test_volume_roundtrip() {
        let storage = Storage::open_temporary().unwrap();
        let rec = record("One Piece", "Volume 01");
        storage.upsert_volume(&rec).unwrap();

        let loaded = storage.volume(&rec.volume_uuid).unwrap().unwrap();
        assert_eq!(loaded.series_title, "One Piece");
        assert_eq!(storage.volumes().unwrap().len(), 1);
        assert_eq!(storage.query_series(&rec.series_uuid).unwrap().len(), 1);
        assert!(
            storage
                .volume(&VolumeUuid::derive("x", "y"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_files_stream_in_order() {
        let storage = Storage::open_temporary().unwrap();
        let uuid = VolumeUuid::derive("S", "V");
        storage
            .write_files(
                &uuid,
                vec![
                    ("01.jpg".to_string(), b"aaa".to_vec()),
                    ("02.jpg".to_string(), b"bbb".to_vec()),
                ],
            )
            .unwrap();

        assert_eq!(storage.file_paths(&uuid).unwrap(), vec!["01.jpg", "02.jpg"]);
        assert_eq!(
            storage.file(&uuid, "01.jpg").unwrap().unwrap().as_ref(),
            b"aaa"
        );
        assert!(storage.file(&uuid, "03.jpg").unwrap().is_none());

        let mut streamed = Vec::new();
        for entry in storage.iter_files(&uuid) {
            streamed.push(entry.unwrap().0);
        }
        assert_eq!(streamed, vec!["01.jpg", "02.jpg"]);
    }

    #[test]
    fn test_remove_volume_removes_everything() {
        let storage = Storage::open_temporary().unwrap();
        let mut rec = record("S", "V");
        rec.mokuro_version = "0.2.1".into();
        storage.upsert_volume(&rec).unwrap();
        storage
            .upsert_ocr(&rec.volume_uuid, &OcrDocument::default())
            .unwrap();
        storage
            .write_files(&rec.volume_uuid, vec![("01.jpg".to_string(), b"x".to_vec())])
            .unwrap();
        storage.set_thumbnail(&rec.volume_uuid, b"thumb").unwrap();
        storage
            .put_stats(&rec.volume_uuid, &VolumeStats::default())
            .unwrap();

        storage.remove_volume(&rec.volume_uuid).unwrap();
        assert!(storage.volume(&rec.volume_uuid).unwrap().is_none());
        assert!(storage.ocr(&rec.volume_uuid).unwrap().is_none());
        assert!(storage.thumbnail(&rec.volume_uuid).unwrap().is_none());
        assert!(storage.file_paths(&rec.volume_uuid).unwrap().is_empty());
        assert!(storage.stats(&rec.volume_uuid).unwrap().is_none());

        // idempotent
        storage.remove_volume(&rec.volume_uuid).unwrap();
    }

    #[test]
    fn test_default_profile_exists() {
        let storage = Storage::open_temporary().unwrap();
        let current = storage.current_profile().unwrap();
        assert_eq!(current.name, Profile::DEFAULT_NAME);

        storage.set_current_profile("Tablet").unwrap();
        assert_eq!(storage.current_profile().unwrap().name, "Tablet");
        assert_eq!(storage.profiles().unwrap().len(), 2);
    }

    #[test]
    fn test_settings_nested_paths() {
        let storage = Storage::open_temporary().unwrap();
        assert!(storage.setting("reader.font_size").unwrap().is_none());

        storage
            .set_setting("reader.font_size", serde_json::json!(18))
            .unwrap();
        storage
            .set_setting("reader.right_to_left", serde_json::json!(true))
            .unwrap();
        assert_eq!(
            storage.setting("reader.font_size").unwrap(),
            Some(serde_json::json!(18))
        );
        assert_eq!(
            storage.setting("reader").unwrap(),
            Some(serde_json::json!({"font_size": 18, "right_to_left": true}))
        );

        // settings are profile-scoped
        storage.set_current_profile("Tablet").unwrap();
        assert!(storage.setting("reader.font_size").unwrap().is_none());
        storage
            .set_setting("reader.font_size", serde_json::json!(24))
            .unwrap();
        storage.set_current_profile(Profile::DEFAULT_NAME).unwrap();
        assert_eq!(
            storage.setting("reader.font_size").unwrap(),
            Some(serde_json::json!(18))
        );
    }

    #[test]
    fn test_credentials_roundtrip() {
        let storage = Storage::open_temporary().unwrap();
        let provider = ProviderId::new("drive");
        assert!(storage.credentials(&provider).unwrap().is_none());

        let creds = ProviderCredentials {
            access_token: Some("tok".into()),
            ..Default::default()
        };
        storage.put_credentials(&provider, &creds).unwrap();
        assert!(storage.credentials(&provider).unwrap().unwrap().is_usable());

        storage.clear_credentials(&provider).unwrap();
        assert!(storage.credentials(&provider).unwrap().is_none());
    }

    #[test]
    fn test_separate_volumes_do_not_cross_contaminate() {
        let storage = Storage::open_temporary().unwrap();
        let a = VolumeUuid::derive("S", "A");
        let b = VolumeUuid::derive("S", "B");
        storage
            .write_files(&a, vec![("01.jpg".to_string(), b"a".to_vec())])
            .unwrap();
        storage
            .write_files(&b, vec![("01.jpg".to_string(), b"b".to_vec())])
            .unwrap();

        assert_eq!(storage.file(&a, "01.jpg").unwrap().unwrap().as_ref(), b"a");
        assert_eq!(storage.file(&b, "01.jpg").unwrap().unwrap().as_ref(), b"b");
        assert_eq!(
            storage.volumes_with_files().unwrap(),
            BTreeSet::from([a, b])
        );

        storage.remove_volume(&a).unwrap();
        assert!(storage.file(&a, "01.jpg").unwrap().is_none());
        assert_eq!(storage.file(&b, "01.jpg").unwrap().unwrap().as_ref(), b"b");
    }

    #[test]
    fn test_placeholder_rows_are_never_persisted() {
        let mut rec = record("S", "V");
        rec.cloud = Some(CloudShadow { is_placeholder: true, ..Default::default() });
        assert!(rec.is_placeholder());
    }
}
