use crate::extract::*;
use crate::index::CacheStore;
use crate::progress::CancelToken;
use crate::testing::{make_fake_disc, FakeDiscOptions};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn store_in(tmp: &TempDir) -> CacheStore {
    CacheStore::open(tmp.path().join("_index_cache"))
}

/// A packed disc skeleton: PS3_GAME/USRDIR with Pack*.pkd files.
fn make_packed_disc(parent: &Path, name: &str, pkds: &[&str]) -> PathBuf {
    let usrdir = parent.join(name).join("PS3_GAME").join("USRDIR");
    fs::create_dir_all(&usrdir).unwrap();
    for pkd in pkds {
        fs::write(usrdir.join(pkd), b"packed-bytes").unwrap();
    }
    parent.join(name)
}

#[cfg(unix)]
fn write_fake_extractor(dir: &Path, script_body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let exe = dir.join("fake_extractor.sh");
    fs::write(&exe, format!("#!/bin/sh\n{script_body}\n")).unwrap();
    let mut perms = fs::metadata(&exe).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&exe, perms).unwrap();
    exe
}

#[test]
fn test_extractor_missing_exe_is_a_config_error() {
    let tmp = TempDir::new().unwrap();
    let disc = make_packed_disc(tmp.path(), "DISC", &["Pack1.pkd"]);
    let mut log = |_: &str| {};
    let err = extract_disc_pkds(&tmp.path().join("no_such_exe"), &disc, &mut log, None, false).unwrap_err();
    assert!(err.to_string().contains("Extractor exe not found"));
}

#[cfg(unix)]
#[test]
fn test_extract_requires_usrdir() {
    let tmp = TempDir::new().unwrap();
    let not_a_disc = tmp.path().join("EMPTY");
    fs::create_dir_all(&not_a_disc).unwrap();
    let exe = write_fake_extractor(tmp.path(), "exit 0");
    let mut log = |_: &str| {};
    let err = extract_disc_pkds(&exe, &not_a_disc, &mut log, None, false).unwrap_err();
    assert!(err.to_string().contains("PS3_GAME/USRDIR not found"));
}

#[cfg(unix)]
#[test]
fn test_extract_runs_tool_and_harvests_export() {
    let tmp = TempDir::new().unwrap();
    let disc = make_packed_disc(tmp.path(), "DISC", &["Pack1.pkd", "Pack2.pkd"]);
    // The fake extractor produces $1_out/filesystem/export with content.
    let exe = write_fake_extractor(
        tmp.path(),
        r#"out="$1_out"
mkdir -p "$out/filesystem/export/5"
echo '<CONFIG/>' > "$out/filesystem/export/config.xml"
echo melody > "$out/filesystem/export/5/melody_1.xml"
echo extracting "$1""#,
    );

    let mut logs: Vec<String> = Vec::new();
    let mut log = |m: &str| logs.push(m.to_string());
    let (dest, harvested, stats) = extract_disc_pkds(&exe, &disc, &mut log, None, false).unwrap();

    assert_eq!(dest, disc.join("PS3_GAME").join("USRDIR").join("FileSystem").join("Export"));
    assert!(dest.join("config.xml").is_file());
    assert!(dest.join("5").join("melody_1.xml").is_file());
    assert!(harvested >= 2);
    assert_eq!(stats.pkds_found, 2);
    assert_eq!(stats.pkds_to_extract, 2);
    assert!(stats.has_config_xml);
    assert!(logs.iter().any(|l| l.contains("Extracting (1/2)")));
    assert!(logs.iter().any(|l| l.contains("extracting")));
}

#[cfg(unix)]
#[test]
fn test_partial_pkd_out_is_moved_aside_and_reextracted() {
    let tmp = TempDir::new().unwrap();
    let disc = make_packed_disc(tmp.path(), "DISC", &["Pack1.pkd"]);
    let usrdir = disc.join("PS3_GAME").join("USRDIR");
    // A leftover output folder with no filesystem/ child looks incomplete.
    fs::create_dir_all(usrdir.join("Pack1.pkd_out").join("junk")).unwrap();

    let exe = write_fake_extractor(
        tmp.path(),
        r#"out="$1_out"
mkdir -p "$out/filesystem/export"
echo '<CONFIG/>' > "$out/filesystem/export/config.xml""#,
    );

    let mut log = |_: &str| {};
    let (_dest, _harvested, stats) = extract_disc_pkds(&exe, &disc, &mut log, None, false).unwrap();
    assert_eq!(stats.pkd_out_incomplete, 1);
    assert_eq!(stats.pkd_out_moved_aside, 1);
    assert_eq!(stats.pkd_out_moved_aside_samples.len(), 1);

    // The stale folder was renamed with the incomplete suffix.
    let moved: Vec<_> = fs::read_dir(&usrdir)
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().contains("_incomplete_"))
        .collect();
    assert_eq!(moved.len(), 1);
}

#[cfg(unix)]
#[test]
fn test_complete_pkd_out_is_skipped() {
    let tmp = TempDir::new().unwrap();
    let disc = make_packed_disc(tmp.path(), "DISC", &["Pack1.pkd"]);
    let usrdir = disc.join("PS3_GAME").join("USRDIR");
    let out = usrdir.join("Pack1.pkd_out").join("filesystem").join("export");
    fs::create_dir_all(&out).unwrap();
    fs::write(out.join("config.xml"), "<CONFIG/>").unwrap();

    // The extractor would fail loudly if invoked; a complete prior output
    // means it never runs.
    let exe = write_fake_extractor(tmp.path(), "exit 1");
    let mut logs: Vec<String> = Vec::new();
    let mut log = |m: &str| logs.push(m.to_string());
    let (_dest, harvested, stats) = extract_disc_pkds(&exe, &disc, &mut log, None, false).unwrap();
    assert_eq!(stats.pkds_skipped, 1);
    assert_eq!(stats.pkds_to_extract, 0);
    assert!(harvested >= 1);
    assert!(logs.iter().any(|l| l.contains("Skipping already extracted")));
}

#[cfg(unix)]
#[test]
fn test_extractor_failure_carries_log_tail() {
    let tmp = TempDir::new().unwrap();
    let disc = make_packed_disc(tmp.path(), "DISC", &["Pack1.pkd"]);
    let exe = write_fake_extractor(
        tmp.path(),
        r#"echo something went badly wrong
exit 3"#,
    );
    let mut log = |_: &str| {};
    let err = extract_disc_pkds(&exe, &disc, &mut log, None, false).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("Extractor failed for Pack1.pkd"));
    assert!(msg.contains("code 3"));
    assert!(msg.contains("something went badly wrong"));
}

#[cfg(unix)]
#[test]
fn test_pre_cancelled_extraction_raises() {
    let tmp = TempDir::new().unwrap();
    let disc = make_packed_disc(tmp.path(), "DISC", &["Pack1.pkd"]);
    let exe = write_fake_extractor(tmp.path(), "exit 0");
    let token = CancelToken::new();
    token.cancel();
    let mut log = |_: &str| {};
    let err = extract_disc_pkds(&exe, &disc, &mut log, Some(&token), true).unwrap_err();
    assert!(err.is_cancelled());
}

#[test]
fn test_verify_clean_disc_ok() {
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let disc = make_fake_disc(tmp.path(), "GOOD", &FakeDiscOptions::default());
    let res = verify_disc_extraction(&store, &disc.disc_root, None);
    assert!(res.ok, "errors={:?} warnings={:?}", res.errors, res.warnings);
    assert_eq!(res.counts["songs"], 2);
    assert_eq!(res.counts["missing_song_dirs"], 0);
}

#[test]
fn test_verify_flags_missing_song_dir_and_media() {
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let disc = make_fake_disc(tmp.path(), "BAD", &FakeDiscOptions::default());
    fs::remove_dir_all(disc.export_root.join("2")).unwrap();
    fs::remove_file(disc.export_root.join("1").join("video.mp4")).unwrap();

    let mut lines: Vec<String> = Vec::new();
    let mut log = |m: &str| lines.push(m.to_string());
    let res = verify_disc_extraction(&store, &disc.disc_root, Some(&mut log));
    assert!(!res.ok);
    assert_eq!(res.counts["missing_song_dirs"], 1);
    assert_eq!(res.counts["missing_video_files"], 1);
    assert_eq!(res.samples.missing_song_dir_ids, vec![2]);
    assert!(lines.iter().any(|l| l.contains("[verify]")));
}

#[test]
fn test_verify_unextracted_disc_reports_artifacts() {
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let disc = make_packed_disc(tmp.path(), "PACKED", &["Pack1.pkd"]);
    let res = verify_disc_extraction(&store, &disc, None);
    assert!(!res.ok);
    assert!(!res.errors.is_empty());
    assert_eq!(res.artifacts.pkd_files.len(), 1);
}
