use std::fs;

use assert_matches::assert_matches;

use msi_sync::config::ConfigLoader;
use msi_sync::error::SyncError;

#[test]
fn resolves_config_file_from_explicit_path() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("msi-sync.json");
    fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "base_url": "https://example.test/api",
            "data_dir": "/var/lib/msi",
            "download_dir": "/srv/pubs",
            "page_size": 25,
            "sources": ["asam", { "key": "modu", "refresh_minutes": 5 }]
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.base_url, "https://example.test/api");
    assert_eq!(resolved.page_size, 25);
    assert_eq!(resolved.store_path(), "/var/lib/msi/records.json");
    assert_eq!(resolved.ledger_path(), "/var/lib/msi/ledger.json");
    assert_eq!(resolved.download_dir, "/srv/pubs");
    let keys = resolved
        .sources
        .iter()
        .map(|source| source.key.as_str())
        .collect::<Vec<_>>();
    assert_eq!(keys, ["asam", "modu"]);
}

#[test]
fn unreadable_path_is_a_read_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(SyncError::ConfigRead(_))
    );
}

#[test]
fn malformed_json_is_a_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("msi-sync.json");
    fs::write(&path, "{ \"sources\": [ }").unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(SyncError::ConfigParse(_))
    );
}

#[test]
fn zero_page_size_is_clamped() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("msi-sync.json");
    fs::write(&path, r#"{ "data_dir": "/tmp/msi", "page_size": 0 }"#).unwrap();
    assert_eq!(ConfigLoader::resolve(path.to_str()).unwrap().page_size, 1);
}
