use std::{
    fmt::{Debug, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Namespace under which all deterministic ids are derived. Changing this
/// value changes every derived id, so it is frozen.
const NAMESPACE: Uuid = Uuid::from_bytes([
    0x9f, 0x1c, 0x7a, 0xd2, 0x4b, 0x30, 0x45, 0x1e, 0x8a, 0x6d, 0x02, 0x5e, 0xc4, 0x9b, 0x71, 0x38,
]);

#[derive(Debug, Error)]
#[error("invalid id: {0}")]
pub struct IdParseErr(#[from] uuid::Error);

macro_rules! derived_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub const fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            pub const fn uuid(&self) -> Uuid {
                self.0
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self, IdParseErr> {
                Ok(Self(Uuid::from_slice(bytes)?))
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                Display::fmt(&self.0, f)
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseErr;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

derived_id! {
    /// Identity of a series, derived from its title. Two devices deriving an
    /// id for the same title agree without coordination.
    SeriesUuid
}

derived_id! {
    /// Identity of a volume, derived from `"<series title>/<volume title>"`.
    VolumeUuid
}

impl SeriesUuid {
    pub fn derive(series_title: &str) -> Self {
        Self(Uuid::new_v5(&NAMESPACE, series_title.trim().as_bytes()))
    }
}

impl VolumeUuid {
    pub fn derive(series_title: &str, volume_title: &str) -> Self {
        let name = format!("{}/{}", series_title.trim(), volume_title.trim());
        Self(Uuid::new_v5(&NAMESPACE, name.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let a = VolumeUuid::derive("One Piece", "Volume 01");
        let b = VolumeUuid::derive("One Piece", "Volume 01");
        assert_eq!(a, b);
        assert_ne!(a, VolumeUuid::derive("One Piece", "Volume 02"));
        assert_ne!(
            SeriesUuid::derive("One Piece").uuid(),
            VolumeUuid::derive("One Piece", "Volume 01").uuid()
        );
    }

    #[test]
    fn test_whitespace_is_ignored() {
        assert_eq!(
            SeriesUuid::derive("  One Piece "),
            SeriesUuid::derive("One Piece")
        );
        assert_eq!(
            VolumeUuid::derive("One Piece ", " Volume 01"),
            VolumeUuid::derive("One Piece", "Volume 01")
        );
    }

    #[test]
    fn test_roundtrip_display_parse() {
        let id = SeriesUuid::derive("Naruto");
        let parsed: SeriesUuid = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<SeriesUuid>().is_err());
    }
}
