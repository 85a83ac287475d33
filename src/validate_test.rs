use crate::index::CacheStore;
use crate::testing::{make_fake_disc, FakeDiscOptions};
use crate::validate::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn store_in(tmp: &TempDir) -> CacheStore {
    CacheStore::open(tmp.path().join("_index_cache"))
}

#[test]
fn test_validate_clean_disc_is_ok() {
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let disc = make_fake_disc(tmp.path(), "CLEAN", &FakeDiscOptions::default());
    let r = validate_one_disc(&store, "Base", &disc.disc_root);
    assert_eq!(r.severity, Severity::Ok);
    assert!(r.ok);
    assert!(r.errors.is_empty());
    assert!(r.warnings.is_empty(), "{:?}", r.warnings);
    assert_eq!(r.product, "CLEAN disc");
    assert!(r.summary.starts_with("songs_xml=1"));
}

#[test]
fn test_validate_missing_songs_xml_fails() {
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let disc = make_fake_disc(tmp.path(), "NOSONGS", &FakeDiscOptions::default());
    fs::remove_file(disc.export_root.join("songs_1_0.xml")).unwrap();

    let r = validate_one_disc(&store, "Base", &disc.disc_root);
    assert_eq!(r.severity, Severity::Fail);
    assert!(r.errors.iter().any(|it| it.code == "NO_SONGS_XML"));
}

#[test]
fn test_validate_missing_media_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let disc = make_fake_disc(
        tmp.path(),
        "NOMEDIA",
        &FakeDiscOptions {
            include_media: false,
            ..Default::default()
        },
    );
    let r = validate_one_disc(&store, "Base", &disc.disc_root);
    assert_eq!(r.severity, Severity::Fail);
    let err = r.errors.iter().find(|it| it.code == "MISSING_MEDIA_FILES").unwrap();
    assert!(err.message.contains("2 song(s)"));
    assert_eq!(r.counts.get("missing_preview_files"), Some(&2));
}

#[test]
fn test_validate_missing_melody_is_a_warning() {
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let mut opts = FakeDiscOptions::default();
    opts.melodies.insert(2, None);
    let disc = make_fake_disc(tmp.path(), "NOMEL", &opts);

    let r = validate_one_disc(&store, "Base", &disc.disc_root);
    assert_eq!(r.severity, Severity::Warn);
    assert!(r.ok);
    assert!(r.warnings.iter().any(|it| it.code == "MISSING_REFERENCED_FILES"));
}

#[test]
fn test_validate_unresolvable_path() {
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let r = validate_one_disc(&store, "Base", &tmp.path().join("DOES_NOT_EXIST"));
    assert_eq!(r.severity, Severity::Fail);
    assert!(r.errors.iter().any(|it| it.code == "RESOLVE_EXPORT_ROOT"));
    assert!(r.summary.contains("Could not locate Export root"));
}

#[test]
fn test_validate_from_export_root_missing_dir() {
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let r = validate_one_disc_from_export_root(
        &store,
        "Base",
        &tmp.path().join("x"),
        &tmp.path().join("gone"),
        "full_disc",
        &[],
    );
    assert_eq!(r.severity, Severity::Fail);
    assert!(r.errors.iter().any(|it| it.code == "EXPORT_MISSING"));
    assert_eq!(r.summary, "Export folder missing.");
}

#[test]
fn test_validate_config_less_donor_warns() {
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let donor = tmp.path().join("Export");
    fs::create_dir_all(&donor).unwrap();
    fs::write(donor.join("songs_1_0.xml"), "<SONGS/>").unwrap();

    let r = validate_one_disc(&store, "Donor", &donor);
    assert!(r.warnings.iter().any(|it| it.code == "NO_CONFIG" || it.code == "MISSING_CONFIG_XML"), "{:?}", r.warnings);
    // Counts fall back to the minimal scan.
    assert_eq!(r.counts.get("songs_xml_files"), Some(&1));
}

#[test]
fn test_layout_warning_mapping_codes() {
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let disc = make_fake_disc(tmp.path(), "MAP", &FakeDiscOptions::default());
    let warnings = vec![
        "Export folder name casing deviates from convention".to_string(),
        "No textures folder found under Export.".to_string(),
        "No config.xml under Export".to_string(),
        "something else odd".to_string(),
    ];
    let r = validate_one_disc_from_export_root(&store, "X", &disc.disc_root, &disc.export_root, "full_disc", &warnings);
    let codes: Vec<&str> = r.warnings.iter().map(|it| it.code.as_str()).collect();
    assert!(codes.contains(&"CASING"));
    assert!(codes.contains(&"NO_TEXTURES"));
    assert!(codes.contains(&"NO_CONFIG"));
    assert!(codes.contains(&"LAYOUT"));
}

#[test]
fn test_warn_exception_report_shape() {
    let r = warn_exception_report("Base", &PathBuf::from("p"), "boom");
    assert_eq!(r.severity, Severity::Warn);
    assert!(r.ok);
    assert_eq!(r.summary, "Validation failed (exception).");
    assert_eq!(r.warnings[0].code, "VALIDATE_EXCEPTION");
    assert_eq!(r.warnings[0].message, "boom");
}

#[test]
fn test_format_validate_report_blocks() {
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let disc = make_fake_disc(tmp.path(), "REP", &FakeDiscOptions::default());
    let r = validate_one_disc(&store, "MyDisc", &disc.disc_root);
    let text = format_validate_report(&[r], true);
    assert!(text.starts_with("Validate Disc report (preflight)"));
    assert!(text.contains("=== MyDisc ==="));
    assert!(text.contains("Result: OK"));
    assert!(text.contains("Info: songs_xml=1"));
}

#[test]
fn test_validate_discs_streams_blocks_and_cancels() {
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let disc = make_fake_disc(tmp.path(), "MULTI", &FakeDiscOptions::default());
    let targets = vec![("Base".to_string(), disc.disc_root.clone())];

    let mut lines: Vec<String> = Vec::new();
    let mut log = |line: &str| lines.push(line.to_string());
    let (results, report) = validate_discs(&store, &targets, Some(&mut log), None).unwrap();
    assert_eq!(results.len(), 1);
    assert!(lines.iter().any(|l| l.contains("=== Base ===")));
    assert!(report.contains("Validate Disc report"));

    let token = crate::progress::CancelToken::new();
    token.cancel();
    let err = validate_discs(&store, &targets, None, Some(&token)).unwrap_err();
    assert!(err.is_cancelled());
}
