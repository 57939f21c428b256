//! Builds a volume archive back out of the database for backups and
//! exports.
//!
//! Pages are streamed out of the `volume_files` partition one entry at a
//! time and fed straight into the zip writer; a whole volume's pages are
//! never resident at once.

use std::io::{Cursor, Write};

use bytes::Bytes;
use culprit::{Culprit, ResultExt};
use hondana_core::VolumeUuid;
use serde::{Deserialize, Serialize};
use zip::write::SimpleFileOptions;

use crate::{
    ingest::build::{self, IngestErr},
    local::storage::Storage,
};

pub type Result<T> = culprit::Result<T, IngestErr>;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SidecarOptions {
    /// Produce the OCR and thumbnail sidecars alongside the archive.
    pub include_sidecars: bool,
    /// Place the sidecars inside the archive instead of next to it.
    pub embed_sidecars: bool,
}

#[derive(Debug, Clone)]
pub struct CompressedVolume {
    /// `"<VolumeTitle>.cbz"`
    pub file_name: String,
    pub archive: Bytes,
    /// Sidecars to deliver as sibling files (empty when embedded or not
    /// requested). Filenames share the archive's stem.
    pub sidecars: Vec<(String, Bytes)>,
}

/// Compresses one stored volume. `on_progress` receives 0–100 as pages are
/// archived.
pub fn compress_volume(
    storage: &Storage,
    uuid: &VolumeUuid,
    opts: SidecarOptions,
    mut on_progress: impl FnMut(u8),
) -> Result<CompressedVolume> {
    let record = storage
        .volume(uuid)
        .or_into_ctx()?
        .ok_or_else(|| Culprit::new(IngestErr::VolumeNotFound(*uuid)))?;

    let mut sidecars: Vec<(String, Bytes)> = Vec::new();
    if opts.include_sidecars {
        if let Some(ocr) = storage.ocr(uuid).or_into_ctx()? {
            let doc = build::sidecar_for(&record, &ocr);
            let json =
                serde_json::to_vec_pretty(&doc).map_err(IngestErr::SidecarJson)?;
            sidecars.push((format!("{}.mokuro", record.volume_title), Bytes::from(json)));
        }
        if let Some(thumb) = storage.thumbnail(uuid).or_into_ctx()? {
            if let Some(webp) = encode_webp(&thumb) {
                sidecars.push((format!("{}.webp", record.volume_title), webp));
            }
        }
    }

    let total = storage.file_paths(uuid).or_into_ctx()?.len().max(1);
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (index, entry) in storage.iter_files(uuid).enumerate() {
        let (path, blob) = entry.or_into_ctx()?;
        writer
            .start_file(path.as_str(), options)
            .map_err(|err| IngestErr::Archive(err.into()))?;
        writer
            .write_all(&blob)
            .map_err(|err| IngestErr::Archive(crate::ingest::archive::ArchiveErr::Io(err.kind())))?;
        on_progress(((index + 1) * 100 / total).min(100) as u8);
    }

    if opts.embed_sidecars {
        for (name, data) in sidecars.drain(..) {
            writer
                .start_file(name.as_str(), options)
                .map_err(|err| IngestErr::Archive(err.into()))?;
            writer.write_all(&data).map_err(|err| {
                IngestErr::Archive(crate::ingest::archive::ArchiveErr::Io(err.kind()))
            })?;
        }
    }

    let cursor = writer
        .finish()
        .map_err(|err| IngestErr::Archive(err.into()))?;
    on_progress(100);

    Ok(CompressedVolume {
        file_name: format!("{}.cbz", record.volume_title),
        archive: Bytes::from(cursor.into_inner()),
        sidecars,
    })
}

/// Re-encodes a stored thumbnail as webp for the remote sidecar layout.
/// Undecodable thumbnails are skipped rather than failing the backup.
fn encode_webp(data: &[u8]) -> Option<Bytes> {
    let img = image::load_from_memory(data).ok()?;
    let mut out = Cursor::new(Vec::new());
    img.to_rgb8()
        .write_to(&mut out, image::ImageFormat::WebP)
        .ok()?;
    Some(Bytes::from(out.into_inner()))
}
