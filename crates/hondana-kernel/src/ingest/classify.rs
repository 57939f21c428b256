//! Entry classification for archive ingest.

use hondana_core::{rpath, sysfiles};

/// Raster image extensions accepted as page files.
pub const PAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "avif", "gif", "bmp"];

/// Extensions accepted for the thumbnail sidecar at the archive root.
pub const THUMBNAIL_EXTENSIONS: &[&str] = &["webp", "png", "jpg", "avif", "gif"];

/// Containers that trigger recursive ingest; each nested archive produces
/// its own volume.
pub const NESTED_ARCHIVE_EXTENSIONS: &[&str] = &["zip", "cbz", "cbr", "rar", "7z"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// OS metadata, trash, backups. Skipped silently.
    System,
    /// `.mokuro` OCR sidecar (JSON).
    OcrSidecar,
    /// `.mokuro.gz` gzipped OCR sidecar.
    OcrSidecarGz,
    /// Cover image sidecar whose stem matches the archive stem.
    Thumbnail,
    /// Nested archive, queued for recursive ingest.
    NestedArchive,
    /// A page image.
    Page,
    /// Anything else. Ignored.
    Other,
}

/// Classifies one decompressed entry. `archive_stem` is the owning
/// archive's filename without extension; the thumbnail sidecar is only
/// recognised at the archive root.
pub fn classify(path: &str, archive_stem: &str) -> EntryKind {
    if sysfiles::is_system_path(path) {
        return EntryKind::System;
    }

    let name = rpath::base_name(path);
    if name.ends_with(".mokuro") {
        return EntryKind::OcrSidecar;
    }
    if name.ends_with(".mokuro.gz") {
        return EntryKind::OcrSidecarGz;
    }

    let ext = rpath::ext(name);
    let at_root = !path.contains('/');
    if at_root
        && THUMBNAIL_EXTENSIONS.contains(&ext.as_str())
        && rpath::norm(rpath::stem(name)) == rpath::norm(archive_stem)
    {
        return EntryKind::Thumbnail;
    }

    if NESTED_ARCHIVE_EXTENSIONS.contains(&ext.as_str()) {
        return EntryKind::NestedArchive;
    }

    if PAGE_EXTENSIONS.contains(&ext.as_str()) {
        return EntryKind::Page;
    }

    EntryKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_files_win() {
        assert_eq!(classify("__MACOSX/01.jpg", "vol"), EntryKind::System);
        assert_eq!(classify("._vol.mokuro", "vol"), EntryKind::System);
        assert_eq!(classify("page.bak", "vol"), EntryKind::System);
    }

    #[test]
    fn test_sidecars() {
        assert_eq!(classify("Volume 01.mokuro", "Volume 01"), EntryKind::OcrSidecar);
        assert_eq!(
            classify("Volume 01.mokuro.gz", "Volume 01"),
            EntryKind::OcrSidecarGz
        );
        // sidecars are recognised anywhere in the archive
        assert_eq!(classify("nested/x.mokuro", "Volume 01"), EntryKind::OcrSidecar);
    }

    #[test]
    fn test_thumbnail_requires_root_and_matching_stem() {
        assert_eq!(classify("Volume 01.webp", "Volume 01"), EntryKind::Thumbnail);
        assert_eq!(classify("volume 01.PNG", "Volume 01"), EntryKind::Thumbnail);
        // wrong stem: plain page
        assert_eq!(classify("Volume 02.webp", "Volume 01"), EntryKind::Page);
        // not at root: plain page
        assert_eq!(classify("x/Volume 01.webp", "Volume 01"), EntryKind::Page);
    }

    #[test]
    fn test_pages_and_nested() {
        assert_eq!(classify("pages/01.jpg", "vol"), EntryKind::Page);
        assert_eq!(classify("01.AVIF", "vol"), EntryKind::Page);
        assert_eq!(classify("extra.cbz", "vol"), EntryKind::NestedArchive);
        assert_eq!(classify("inner/part2.rar", "vol"), EntryKind::NestedArchive);
        assert_eq!(classify("notes.txt", "vol"), EntryKind::Other);
        assert_eq!(classify("noext", "vol"), EntryKind::Other);
    }
}
