//! Schema versioning.
//!
//! The `meta` partition carries a single version cell. Migration steps are
//! monotonic and idempotent: each step moves the version forward by one and
//! may be re-run safely if the process died before the cell was rewritten.

use culprit::Culprit;
use tryiter::TryIteratorExt;

use super::{Storage, StorageErr};
use crate::model::VolumeStats;

pub const SCHEMA_VERSION: u32 = 2;

const VERSION_KEY: &[u8] = b"schema_version";

pub(super) fn migrate(storage: &Storage) -> super::Result<()> {
    let meta = storage.meta_partition();
    let mut version = match meta.get(VERSION_KEY)? {
        Some(raw) => decode_version(&raw)?,
        // a keyspace created before versioning is schema 1
        None => 1,
    };

    if version > SCHEMA_VERSION {
        return Err(Culprit::new(StorageErr::SchemaTooNew {
            found: version,
            supported: SCHEMA_VERSION,
        }));
    }

    while version < SCHEMA_VERSION {
        match version {
            1 => stats_rows_gain_reader_settings(storage)?,
            _ => unreachable!("missing migration step from version {version}"),
        }
        version += 1;
        meta.insert(VERSION_KEY, version.to_be_bytes())?;
        tracing::info!(version, "migrated schema");
    }

    Ok(())
}

fn decode_version(raw: &[u8]) -> Result<u32, StorageErr> {
    let bytes: [u8; 4] = raw.try_into().map_err(|_| StorageErr::CorruptKey)?;
    Ok(u32::from_be_bytes(bytes))
}

/// v1 → v2: stats rows predate per-volume reader settings and session
/// rollups. Rewriting each row through the current model fills the new
/// fields with defaults. Rows already in the new shape pass through
/// unchanged, which keeps the step idempotent.
fn stats_rows_gain_reader_settings(storage: &Storage) -> super::Result<()> {
    let stats = storage.stats_partition();
    let mut iter = stats.snapshot().iter().err_into::<Culprit<StorageErr>>();
    while let Some((key, value)) = iter.try_next()? {
        let row: VolumeStats = serde_json::from_slice(&value).map_err(StorageErr::from)?;
        let rewritten = serde_json::to_vec(&row).map_err(StorageErr::from)?;
        if rewritten.as_slice() != value.as_ref() {
            stats.insert(key, rewritten)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_keyspace_lands_on_current_version() {
        let storage = Storage::open_temporary().unwrap();
        let raw = storage
            .meta_partition()
            .get(VERSION_KEY)
            .unwrap()
            .expect("version cell exists");
        assert_eq!(decode_version(&raw).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let storage = Storage::open_temporary().unwrap();
        migrate(&storage).unwrap();
        migrate(&storage).unwrap();
    }

    #[test]
    fn test_legacy_stats_rows_survive() {
        let storage = Storage::open_temporary().unwrap();
        // a v1-era row without reader settings or session rollups
        storage
            .stats_partition()
            .insert(
                hondana_core::VolumeUuid::derive("S", "V").as_bytes(),
                br#"{"current_page": 12, "chars_read": 300, "completed": false}"#.as_slice(),
            )
            .unwrap();
        stats_rows_gain_reader_settings(&storage).unwrap();

        let row = storage
            .stats(&hondana_core::VolumeUuid::derive("S", "V"))
            .unwrap()
            .unwrap();
        assert_eq!(row.current_page, 12);
        assert_eq!(row.chars_read, 300);
        assert!(!row.reader.right_to_left);
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let storage = Storage::open_temporary().unwrap();
        storage
            .meta_partition()
            .insert(VERSION_KEY, (SCHEMA_VERSION + 1).to_be_bytes())
            .unwrap();
        assert!(migrate(&storage).is_err());
    }
}
