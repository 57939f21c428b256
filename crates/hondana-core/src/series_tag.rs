//! The series-description tag.
//!
//! A remote file description whose first non-empty line is
//! `Series: <name>` (case-insensitive) overrides the folder-derived series
//! title at ingest and placeholder fabrication. An existing tag is never
//! overwritten.

/// Extracts the series override from a free-form description.
pub fn parse(description: &str) -> Option<&str> {
    let line = description.lines().find(|line| !line.trim().is_empty())?;
    let line = line.trim();
    let rest = strip_prefix_ci(line, "series:")?;
    let name = rest.trim();
    if name.is_empty() { None } else { Some(name) }
}

/// Returns `true` when the description already carries a tag.
pub fn is_tagged(description: &str) -> bool {
    parse(description).is_some()
}

/// Renders a tag line for a canonical series title.
pub fn format(series_title: &str) -> String {
    format!("Series: {series_title}")
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}
