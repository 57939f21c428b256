//! Two-device synchronization over a shared path-addressed remote.
//!
//! Each "device" is a full engine with its own temporary object database;
//! the remote is a webdav-style store rooted in one shared directory, so
//! everything crosses a real byte boundary.

use std::sync::Arc;

use hondana_kernel::{
    engine::{Engine, EngineConfig},
    ingest::compress::SidecarOptions,
    local::storage::Storage,
    model::ProviderId,
    remote::provider::RemoteStoreConfig,
    rt::{
        backup::{BackupRequest, BackupTarget},
        pool::PoolConfig,
    },
};

fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (path, data) in entries {
        writer.start_file(*path, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn jpeg() -> Vec<u8> {
    use image::{ImageFormat, Rgba, RgbaImage};
    let img = RgbaImage::from_pixel(24, 36, Rgba([33, 44, 55, 255]));
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(img)
        .to_rgb8()
        .write_to(&mut out, ImageFormat::Jpeg)
        .unwrap();
    out.into_inner()
}

fn device(remote_root: &std::path::Path) -> Engine {
    hondana_tracing::init_tracing(hondana_tracing::TracingConsumer::Test);
    let storage = Arc::new(Storage::open_temporary().unwrap());
    Engine::new(
        storage,
        EngineConfig {
            pool: PoolConfig::default(),
            providers: vec![(
                ProviderId::new("webdav"),
                RemoteStoreConfig::Dav {
                    url: None,
                    root: Some(remote_root.to_path_buf()),
                },
            )],
        },
    )
    .unwrap()
}

fn sidecar_json(series: &str, volume: &str, paths: &[&str]) -> Vec<u8> {
    let pages: Vec<serde_json::Value> = paths
        .iter()
        .map(|p| {
            serde_json::json!({
                "img_path": p,
                "img_width": 24,
                "img_height": 36,
                "blocks": [{
                    "box": [1, 1, 10, 10],
                    "vertical": true,
                    "font_size": 12,
                    "lines": ["ねこ"]
                }]
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "version": "0.2.1",
        "title": series,
        "title_uuid": hondana_core::SeriesUuid::derive(series).uuid(),
        "volume": volume,
        "volume_uuid": hondana_core::VolumeUuid::derive(series, volume).uuid(),
        "pages": pages,
        "chars": 0,
    }))
    .unwrap()
}

#[tokio::test]
async fn test_backup_on_one_device_downloads_on_another() {
    let remote = tempfile::tempdir().unwrap();
    let provider = ProviderId::new("webdav");

    // device A ingests a full volume (pages + OCR sidecar) and backs it up
    let device_a = device(remote.path());
    let page = jpeg();
    let sidecar = sidecar_json("One Piece", "Volume 01", &["01.jpg", "02.jpg"]);
    let archive = zip_bytes(&[
        ("01.jpg", page.as_slice()),
        ("02.jpg", page.as_slice()),
        ("Volume 01.mokuro", sidecar.as_slice()),
    ]);
    let reports = device_a.ingest_archive("One Piece/Volume 01.cbz", &archive);
    let uuid = reports[0].result.as_ref().unwrap().uuid();

    let outcomes = device_a
        .run_backups(vec![BackupRequest {
            volume_uuid: uuid,
            target: BackupTarget::Provider(provider.clone()),
            opts: SidecarOptions { include_sidecars: true, embed_sidecars: false },
        }])
        .await;
    assert!(outcomes[0].result.is_ok(), "{outcomes:?}");

    // device B sees exactly one placeholder after a refresh
    let device_b = device(remote.path());
    device_b.refresh(None).await.unwrap();
    let catalog = device_b.catalog().unwrap();
    assert_eq!(catalog.len(), 1);
    assert_eq!(catalog[0].series_title, "One Piece");
    assert_eq!(catalog[0].volumes.len(), 1);
    assert!(catalog[0].volumes[0].is_placeholder());
    // deterministic identity agrees across devices
    assert_eq!(catalog[0].volumes[0].volume_uuid, uuid);

    // downloading materialises the same volume, OCR included
    let downloads = device_b.download_all_placeholders().await.unwrap();
    assert_eq!(downloads.len(), 1);
    assert!(downloads[0].result.is_ok(), "{downloads:?}");

    let record = device_b.storage().volume(&uuid).unwrap().unwrap();
    assert_eq!(record.mokuro_version, "0.2.1");
    assert_eq!(record.page_count, 2);
    assert_eq!(record.character_count, 4);
    assert!(!record.is_placeholder());

    let pages_a = device_a.storage().file_paths(&uuid).unwrap();
    let pages_b = device_b.storage().file_paths(&uuid).unwrap();
    assert_eq!(pages_a, pages_b);
    for path in &pages_a {
        assert_eq!(
            device_a.storage().file(&uuid, path).unwrap().unwrap(),
            device_b.storage().file(&uuid, path).unwrap().unwrap(),
            "page {path} differs between devices"
        );
    }

    // a second reconcile fabricates nothing: local and remote agree
    let reconciliation = device_b.reconcile().unwrap();
    assert!(reconciliation.volumes.iter().all(|v| !v.is_placeholder()));
    assert!(reconciliation.upgrades.is_empty());
}

#[tokio::test]
async fn test_remote_removal_drops_placeholder_on_next_reconcile() {
    let remote = tempfile::tempdir().unwrap();
    let provider = ProviderId::new("webdav");

    let device_a = device(remote.path());
    let page = jpeg();
    let archive = zip_bytes(&[("01.jpg", page.as_slice())]);
    let reports = device_a.ingest_archive("Naruto/Volume 05.cbz", &archive);
    let uuid = reports[0].result.as_ref().unwrap().uuid();
    device_a
        .run_backups(vec![BackupRequest {
            volume_uuid: uuid,
            target: BackupTarget::Provider(provider.clone()),
            opts: SidecarOptions::default(),
        }])
        .await;

    // device B only knows the volume as a placeholder
    let device_b = device(remote.path());
    device_b.refresh(None).await.unwrap();
    assert_eq!(
        device_b
            .reconcile()
            .unwrap()
            .volumes
            .iter()
            .filter(|v| v.is_placeholder())
            .count(),
        1
    );

    // device A deletes local and remote copies
    let mut record = device_a.storage().volume(&uuid).unwrap().unwrap();
    record.cloud = Some(hondana_kernel::model::CloudShadow {
        provider: Some(provider.clone()),
        file_id: Some("Naruto/Volume 05.cbz".to_string()),
        path: Some("Naruto/Volume 05.cbz".into()),
        ..Default::default()
    });
    device_a.storage().upsert_volume(&record).unwrap();
    device_a.refresh(None).await.unwrap();
    device_a.remove_volume(&uuid, true).await.unwrap();

    // after the next refresh the placeholder is gone on device B
    device_b.refresh(None).await.unwrap();
    assert_eq!(
        device_b
            .reconcile()
            .unwrap()
            .volumes
            .len(),
        0
    );
}

#[tokio::test]
async fn test_image_only_upgrade_across_devices() {
    let remote = tempfile::tempdir().unwrap();
    let provider = ProviderId::new("webdav");

    // device B has an image-only local ingest of the same volume
    let device_b = device(remote.path());
    let page = jpeg();
    let plain = zip_bytes(&[("01.jpg", page.as_slice()), ("02.jpg", page.as_slice())]);
    let reports = device_b.ingest_archive("One Piece/Volume 02.cbz", &plain);
    let uuid = reports[0].result.as_ref().unwrap().uuid();
    assert!(device_b.storage().volume(&uuid).unwrap().unwrap().is_image_only());

    // device A pushes the OCR-bearing copy of the same volume
    let device_a = device(remote.path());
    let sidecar = sidecar_json("One Piece", "Volume 02", &["01.jpg", "02.jpg"]);
    let full = zip_bytes(&[
        ("01.jpg", page.as_slice()),
        ("02.jpg", page.as_slice()),
        ("Volume 02.mokuro", sidecar.as_slice()),
    ]);
    let reports = device_a.ingest_archive("One Piece/Volume 02.cbz", &full);
    assert!(reports[0].result.is_ok());
    device_a
        .run_backups(vec![BackupRequest {
            volume_uuid: uuid,
            target: BackupTarget::Provider(provider.clone()),
            opts: SidecarOptions { include_sidecars: true, embed_sidecars: false },
        }])
        .await;

    // device B reconciles, finds the sidecar, and upgrades in place
    device_b.refresh(None).await.unwrap();
    let reconciliation = device_b.reconcile().unwrap();
    assert_eq!(reconciliation.upgrades.len(), 1);
    let outcomes = device_b.run_upgrades(reconciliation.upgrades).await;
    assert!(outcomes[0].1.is_ok(), "{outcomes:?}");

    let record = device_b.storage().volume(&uuid).unwrap().unwrap();
    assert!(!record.is_image_only());
    assert!(record.character_count > 0);
    // original pages were kept, not re-downloaded
    assert_eq!(device_b.storage().file_paths(&uuid).unwrap().len(), 2);
}
