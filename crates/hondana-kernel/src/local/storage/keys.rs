//! Key layouts for the fjall partitions.
//!
//! Fixed-layout keys use zerocopy so they can be encoded and decoded without
//! allocation; variable-length keys (file paths) are explicit
//! prefix-concatenations so a volume's rows form a contiguous scan range.

use hondana_core::VolumeUuid;
use zerocopy::{Immutable, IntoBytes, KnownLayout, TryFromBytes, Unaligned};

use super::StorageErr;

/// Row kind within the `volumes` partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, TryFromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(u8)]
pub enum VolumeTag {
    /// serde_json `VolumeRecord`
    Record = 1,
    /// raw encoded thumbnail bytes
    Thumbnail = 2,
}

/// `{volume_uuid}{tag}`; all rows for one volume share a uuid prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, TryFromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct VolumeKey {
    uuid: [u8; 16],
    tag: VolumeTag,
}

impl VolumeKey {
    pub fn new(uuid: &VolumeUuid, tag: VolumeTag) -> Self {
        VolumeKey { uuid: *uuid.as_bytes(), tag }
    }

    pub fn uuid(&self) -> Result<VolumeUuid, StorageErr> {
        VolumeUuid::from_slice(&self.uuid).map_err(|_| StorageErr::CorruptKey)
    }

    pub fn tag(&self) -> VolumeTag {
        self.tag
    }

    pub fn decode(bytes: &[u8]) -> Result<VolumeKey, StorageErr> {
        VolumeKey::try_read_from_bytes(bytes).map_err(|_| StorageErr::CorruptKey)
    }
}

impl AsRef<[u8]> for VolumeKey {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// `{volume_uuid}{page_path}` within the `volume_files` partition.
pub fn file_key(uuid: &VolumeUuid, path: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + path.len());
    key.extend_from_slice(uuid.as_bytes());
    key.extend_from_slice(path.as_bytes());
    key
}

/// Splits a `volume_files` key back into its page path.
pub fn file_key_path(key: &[u8]) -> Result<&str, StorageErr> {
    let path = key.get(16..).ok_or(StorageErr::CorruptKey)?;
    std::str::from_utf8(path).map_err(|_| StorageErr::CorruptKey)
}

/// Key within the `profiles` partition for a named profile.
pub fn profile_key(name: &str) -> Vec<u8> {
    [b"profile/", name.as_bytes()].concat()
}

/// Key within the `profiles` partition for a provider's credentials.
pub fn creds_key(provider: &str) -> Vec<u8> {
    [b"creds/", provider.as_bytes()].concat()
}

pub const CURRENT_PROFILE_KEY: &[u8] = b"current";
pub const PROFILE_PREFIX: &[u8] = b"profile/";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_key_roundtrip() {
        let uuid = VolumeUuid::derive("Series", "Volume 01");
        let key = VolumeKey::new(&uuid, VolumeTag::Record);
        let decoded = VolumeKey::decode(key.as_bytes()).unwrap();
        assert_eq!(decoded.uuid().unwrap(), uuid);
        assert_eq!(decoded.tag(), VolumeTag::Record);

        assert!(VolumeKey::decode(b"short").is_err());
        // tag byte 0 is invalid
        let mut bytes = key.as_bytes().to_vec();
        *bytes.last_mut().unwrap() = 0;
        assert!(VolumeKey::decode(&bytes).is_err());
    }

    #[test]
    fn test_volume_keys_share_prefix() {
        let uuid = VolumeUuid::derive("Series", "Volume 01");
        let record = VolumeKey::new(&uuid, VolumeTag::Record);
        let thumb = VolumeKey::new(&uuid, VolumeTag::Thumbnail);
        assert_eq!(&record.as_bytes()[..16], &thumb.as_bytes()[..16]);
        assert_eq!(&record.as_bytes()[..16], uuid.as_bytes());
    }

    #[test]
    fn test_file_key_roundtrip() {
        let uuid = VolumeUuid::derive("Series", "Volume 01");
        let key = file_key(&uuid, "pages/01.jpg");
        assert!(key.starts_with(uuid.as_bytes()));
        assert_eq!(file_key_path(&key).unwrap(), "pages/01.jpg");
        assert!(file_key_path(&key[..8]).is_err());
    }
}
