//! Terminal output helpers and selector plumbing.

use std::path::Path;

use hondana_core::VolumeUuid;
use hondana_kernel::{
    engine::Engine,
    model::{ProviderId, ProviderStatus},
    reconcile::SeriesGroup,
};

/// Derives the ingest base path for a dropped file: the parent directory is
/// the series unless overridden.
pub fn base_path_for(file: &Path, series: Option<&str>) -> String {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "volume.cbz".to_string());
    let series = series.map(str::to_string).or_else(|| {
        file.parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    });
    match series {
        Some(series) if !series.is_empty() => format!("{series}/{name}"),
        _ => name,
    }
}

pub fn print_catalog(catalog: &[SeriesGroup]) {
    if catalog.is_empty() {
        println!("library is empty");
        return;
    }
    for group in catalog {
        println!("{}", group.series_title);
        for volume in &group.volumes {
            let marker = if volume.is_placeholder() {
                "cloud"
            } else if volume.is_image_only() {
                "local"
            } else {
                "local+ocr"
            };
            let mut extras = String::new();
            if volume.page_count > 0 {
                extras.push_str(&format!("  {}p", volume.page_count));
            }
            if volume.character_count > 0 {
                extras.push_str(&format!("  {}ch", volume.character_count));
            }
            if !volume.missing_page_paths.is_empty() {
                extras.push_str(&format!(
                    "  {} missing",
                    volume.missing_page_paths.len()
                ));
            }
            println!("  [{marker:<9}] {}{extras}", volume.volume_title);
        }
    }
}

pub fn print_provider_status(id: &ProviderId, status: &ProviderStatus) {
    let mut flags = Vec::new();
    if status.authenticated {
        flags.push("authenticated");
    } else if status.has_stored_credentials {
        flags.push("stored credentials");
    }
    if status.needs_attention {
        flags.push("needs attention");
    }
    println!(
        "{id}: {} ({})",
        status.status_message,
        if flags.is_empty() { "signed out".to_string() } else { flags.join(", ") }
    );
}

/// Resolves selectors to local (non-placeholder) volume uuids; `all` takes
/// every local volume.
pub fn select_local_volumes(
    engine: &Engine,
    selectors: &[String],
    all: bool,
) -> Result<Vec<VolumeUuid>, String> {
    if all {
        return engine
            .storage()
            .volumes()
            .map(|volumes| volumes.into_iter().map(|v| v.volume_uuid).collect())
            .map_err(|err| err.ctx().to_string());
    }
    if selectors.is_empty() {
        return Err("no volumes selected (use --all for everything)".into());
    }
    let mut uuids = Vec::new();
    for selector in selectors {
        let uuid = engine
            .resolve_selector(selector)
            .map_err(|err| err.ctx().to_string())?
            .ok_or_else(|| format!("unknown volume: {selector}"))?;
        let record = engine
            .storage()
            .volume(&uuid)
            .map_err(|err| err.ctx().to_string())?
            .ok_or_else(|| format!("{selector} is not stored locally"))?;
        uuids.push(record.volume_uuid);
    }
    Ok(uuids)
}

pub fn print_stats(engine: &Engine, selector: Option<&str>) -> Result<(), String> {
    let volumes = engine
        .storage()
        .volumes()
        .map_err(|err| err.ctx().to_string())?;

    let wanted = match selector {
        Some(selector) => Some(
            engine
                .resolve_selector(selector)
                .map_err(|err| err.ctx().to_string())?
                .ok_or_else(|| format!("unknown volume: {selector}"))?,
        ),
        None => None,
    };

    let mut shown = 0;
    for volume in volumes {
        if wanted.is_some_and(|uuid| uuid != volume.volume_uuid) {
            continue;
        }
        let stats = engine
            .storage()
            .stats(&volume.volume_uuid)
            .map_err(|err| err.ctx().to_string())?
            .unwrap_or_default();
        println!(
            "{}/{}: page {}/{}  {} chars read  {} min  {}",
            volume.series_title,
            volume.volume_title,
            stats.current_page,
            volume.page_count,
            stats.chars_read,
            stats.minutes_read,
            if stats.completed { "done" } else { "reading" }
        );
        shown += 1;
    }
    if shown == 0 {
        println!("no stats recorded");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_path_for() {
        assert_eq!(
            base_path_for(Path::new("/library/One Piece/Volume 01.cbz"), None),
            "One Piece/Volume 01.cbz"
        );
        assert_eq!(
            base_path_for(Path::new("/library/One Piece/Volume 01.cbz"), Some("OP")),
            "OP/Volume 01.cbz"
        );
        assert_eq!(base_path_for(Path::new("Volume 01.cbz"), None), "Volume 01.cbz");
    }
}
