pub mod byte_unit;
pub mod ids;
pub mod mokuro;
pub mod natsort;
pub mod rpath;
pub mod series_tag;
pub mod sysfiles;

pub use byte_unit::ByteUnit;
pub use ids::{SeriesUuid, VolumeUuid};
