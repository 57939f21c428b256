//! OS metadata, trash, and backup entries that must never be ingested.
//! The exclusion set is part of the public contract and is case-sensitive
//! where OS conventions dictate (`desktop.ini` and `Desktop.ini` are both
//! listed because both occur in the wild).

/// Path segments that mark an entry as system noise.
pub const EXCLUDED_SEGMENTS: &[&str] = &[
    "__MACOSX",
    ".DS_Store",
    ".Trashes",
    ".Spotlight-V100",
    ".fseventsd",
    ".TemporaryItems",
    ".Trash",
    "System Volume Information",
    "$RECYCLE.BIN",
    "Thumbs.db",
    "desktop.ini",
    "Desktop.ini",
    "RECYCLER",
    "RECYCLED",
    ".Trash-1000",
    ".thumbnails",
    ".directory",
    ".dropbox",
    ".dropbox.cache",
    ".git",
    ".svn",
];

/// File extensions (lowercase) that mark an entry as a backup/temp file.
pub const EXCLUDED_EXTENSIONS: &[&str] = &["bak", "tmp", "temp"];

/// Returns `true` when the entry path refers to a system file that ingest
/// skips silently.
pub fn is_system_path(path: &str) -> bool {
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        if EXCLUDED_SEGMENTS.contains(&segment) {
            return true;
        }
        if segment.starts_with("._") || segment.ends_with('~') {
            return true;
        }
    }

    let ext = crate::rpath::ext(crate::rpath::base_name(path));
    EXCLUDED_EXTENSIONS.contains(&ext.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excluded_segments() {
        assert!(is_system_path("__MACOSX/01.jpg"));
        assert!(is_system_path("series/.DS_Store"));
        assert!(is_system_path("Thumbs.db"));
        assert!(is_system_path("a/b/.git/config"));
    }

    #[test]
    fn test_case_sensitivity() {
        assert!(is_system_path("desktop.ini"));
        assert!(is_system_path("Desktop.ini"));
        // not in the set; DESKTOP.INI is not a conventional spelling
        assert!(!is_system_path("DESKTOP.INI"));
        assert!(!is_system_path("ds_store"));
    }

    #[test]
    fn test_segment_prefixes_and_suffixes() {
        assert!(is_system_path("._resource_fork"));
        assert!(is_system_path("series/._01.jpg"));
        assert!(is_system_path("notes.txt~"));
        assert!(is_system_path("backup~/01.jpg"));
        assert!(!is_system_path("with_underscore.jpg"));
    }

    #[test]
    fn test_excluded_extensions() {
        assert!(is_system_path("page.bak"));
        assert!(is_system_path("page.TMP"));
        assert!(is_system_path("series/page.temp"));
        assert!(!is_system_path("series/page.jpg"));
    }
}
