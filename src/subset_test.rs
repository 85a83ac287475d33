use crate::layout::resolve_input;
use crate::progress::{CancelToken, ProgressEvent};
use crate::subset::*;
use crate::testing::{make_fake_disc, FakeDiscOptions};
use crate::xmlread::read_document;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn selected(ids: &[u32]) -> BTreeSet<u32> {
    ids.iter().copied().collect()
}

fn run_build(
    base: &Path,
    donors: &[(&str, &Path)],
    out_dir: &Path,
    ids: &[u32],
    winners: &BTreeMap<u32, String>,
    opts: &SubsetOptions,
) -> crate::Result<Vec<ProgressEvent>> {
    let base_ri = resolve_input(&base.to_string_lossy())?;
    let donor_ris: Vec<(String, crate::layout::ResolvedInput)> = donors
        .iter()
        .map(|(label, p)| Ok((label.to_string(), resolve_input(&p.to_string_lossy())?)))
        .collect::<crate::Result<_>>()?;
    let donor_refs: Vec<(String, &crate::layout::ResolvedInput)> =
        donor_ris.iter().map(|(l, ri)| (l.clone(), ri)).collect();

    let mut events: Vec<ProgressEvent> = Vec::new();
    let mut progress = |ev: &ProgressEvent| events.push(ev.clone());
    let cancel = CancelToken::new();
    build_subset(&base_ri, &donor_refs, out_dir, &selected(ids), winners, opts, &mut progress, &cancel)?;
    Ok(events)
}

#[test]
fn test_empty_selection_fails_fast() {
    let tmp = TempDir::new().unwrap();
    let base = make_fake_disc(tmp.path(), "BASE", &FakeDiscOptions::default());
    let out = tmp.path().join("OUT");
    let err = run_build(&base.disc_root, &[], &out, &[], &BTreeMap::new(), &SubsetOptions::default()).unwrap_err();
    assert!(err.to_string().contains("no songs selected"));
    assert!(!out.exists());
}

#[test]
fn test_build_prunes_to_selected_songs() {
    let tmp = TempDir::new().unwrap();
    let base = make_fake_disc(
        tmp.path(),
        "BASE",
        &FakeDiscOptions {
            song_ids: vec![1, 2, 3],
            ..Default::default()
        },
    );
    let out = tmp.path().join("OUT");
    let opts = SubsetOptions {
        target_version: 1,
        ..Default::default()
    };
    let events = run_build(&base.disc_root, &[], &out, &[1, 3], &BTreeMap::new(), &opts).unwrap();

    let export = out.join("PS3_GAME").join("USRDIR").join("FileSystem").join("Export");
    assert!(export.join("1").is_dir());
    assert!(!export.join("2").exists());
    assert!(export.join("3").is_dir());

    // Rewritten catalog carries only the selected songs.
    let songs = read_document(&export.join("songs_1_0.xml")).unwrap();
    let ids: Vec<Option<u32>> = songs.children.iter().map(|el| el.parse_id()).collect();
    assert_eq!(ids, vec![Some(1), Some(3)]);
    assert!(export.join("acts_1_0.xml").is_file());

    // Covers are filtered too.
    let covers = read_document(&export.join("covers.xml")).unwrap();
    assert_eq!(covers.children.len(), 2);

    // Phases appear in pipeline order.
    let phases: Vec<&str> = events.iter().map(|e| e.phase.as_str()).collect();
    let copy_pos = phases.iter().position(|p| *p == "copy").unwrap();
    let finalize_pos = phases.iter().position(|p| *p == "finalize").unwrap();
    assert!(copy_pos < finalize_pos);
    assert_eq!(*phases.last().unwrap(), "done");
}

#[test]
fn test_build_merges_donor_won_songs() {
    let tmp = TempDir::new().unwrap();
    let base = make_fake_disc(tmp.path(), "BASE", &FakeDiscOptions { song_ids: vec![1, 2], ..Default::default() });
    let donor = make_fake_disc(
        tmp.path(),
        "DONOR",
        &FakeDiscOptions {
            layout: "export_only",
            song_ids: vec![2, 3],
            ..Default::default()
        },
    );
    // Make the donor's copy of song 2 distinguishable.
    fs::write(donor.export_root.join("2").join("marker.txt"), b"donor").unwrap();

    let out = tmp.path().join("OUT");
    let winners = BTreeMap::from([(2, "Donor".to_string()), (3, "Donor".to_string())]);
    let opts = SubsetOptions {
        target_version: 1,
        ..Default::default()
    };
    run_build(
        &base.disc_root,
        &[("Donor", &donor.export_root)],
        &out,
        &[1, 2, 3],
        &winners,
        &opts,
    )
    .unwrap();

    let export = out.join("PS3_GAME").join("USRDIR").join("FileSystem").join("Export");
    // Song 2 came from the donor wholesale, song 3 only exists there.
    assert!(export.join("2").join("marker.txt").is_file());
    assert!(export.join("3").is_dir());
    assert!(export.join("1").is_dir());

    let songs = read_document(&export.join("songs_1_0.xml")).unwrap();
    assert_eq!(songs.children.len(), 3);
}

#[test]
fn test_build_refuses_existing_output_without_overwrite() {
    let tmp = TempDir::new().unwrap();
    let base = make_fake_disc(tmp.path(), "BASE", &FakeDiscOptions::default());
    let out = tmp.path().join("OUT");
    fs::create_dir_all(&out).unwrap();
    let err = run_build(&base.disc_root, &[], &out, &[1], &BTreeMap::new(), &SubsetOptions::default()).unwrap_err();
    assert!(err.to_string().contains("already exists"));
}

#[test]
fn test_overwrite_rotates_backup() {
    let tmp = TempDir::new().unwrap();
    let base = make_fake_disc(tmp.path(), "BASE", &FakeDiscOptions::default());
    let out = tmp.path().join("OUT");
    let opts = SubsetOptions {
        target_version: 1,
        ..Default::default()
    };
    run_build(&base.disc_root, &[], &out, &[1, 2], &BTreeMap::new(), &opts).unwrap();

    // A second build over the same output keeps the old tree as a backup.
    let opts2 = SubsetOptions {
        target_version: 1,
        allow_overwrite: true,
        keep_backup: true,
        ..Default::default()
    };
    run_build(&base.disc_root, &[], &out, &[1], &BTreeMap::new(), &opts2).unwrap();

    assert!(out.is_dir());
    let backups: Vec<_> = fs::read_dir(tmp.path())
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("OUT.backup."))
        .collect();
    assert_eq!(backups.len(), 1);
    // The backup still holds the previous (two-song) build.
    let backup_export = backups[0].path().join("PS3_GAME").join("USRDIR").join("FileSystem").join("Export");
    assert!(backup_export.join("2").is_dir());
}

#[test]
fn test_cancellation_leaves_no_output_or_temp() {
    let tmp = TempDir::new().unwrap();
    let base = make_fake_disc(tmp.path(), "BASE", &FakeDiscOptions::default());
    let out = tmp.path().join("OUT");

    let base_ri = resolve_input(&base.disc_root.to_string_lossy()).unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    let mut progress = |_: &ProgressEvent| {};
    let err = build_subset(
        &base_ri,
        &[],
        &out,
        &selected(&[1]),
        &BTreeMap::new(),
        &SubsetOptions::default(),
        &mut progress,
        &cancel,
    )
    .unwrap_err();
    assert!(err.is_cancelled());
    assert!(!out.exists());
    assert!(!tmp.path().join("OUT.building").exists());
}

#[test]
fn test_build_is_deterministic_across_runs() {
    let tmp = TempDir::new().unwrap();
    let base = make_fake_disc(tmp.path(), "BASE", &FakeDiscOptions { song_ids: vec![1, 2, 3], ..Default::default() });
    let opts = SubsetOptions {
        target_version: 2,
        ..Default::default()
    };
    let out_a = tmp.path().join("OUT_A");
    let out_b = tmp.path().join("OUT_B");
    run_build(&base.disc_root, &[], &out_a, &[1, 2], &BTreeMap::new(), &opts).unwrap();
    run_build(&base.disc_root, &[], &out_b, &[1, 2], &BTreeMap::new(), &opts).unwrap();

    let rel = Path::new("PS3_GAME").join("USRDIR").join("FileSystem").join("Export").join("songs_2_0.xml");
    let a = fs::read(out_a.join(&rel)).unwrap();
    let b = fs::read(out_b.join(&rel)).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_target_version_rewrites_config_and_chc() {
    let tmp = TempDir::new().unwrap();
    let base = make_fake_disc(tmp.path(), "BASE", &FakeDiscOptions::default());
    let out = tmp.path().join("OUT");
    let opts = SubsetOptions {
        target_version: 6,
        ..Default::default()
    };
    run_build(&base.disc_root, &[], &out, &[1, 2], &BTreeMap::new(), &opts).unwrap();

    let export = out.join("PS3_GAME").join("USRDIR").join("FileSystem").join("Export");
    assert!(export.join("songs_6_0.xml").is_file());
    assert!(export.join("acts_6_0.xml").is_file());
    assert!(!export.join("songs_1_0.xml").exists());
    assert!(export.join("melodies_6_0.chc").is_file());
    assert!(!export.join("melodies_1_0.chc").exists());

    let config = read_document(&export.join("config.xml")).unwrap();
    let versions: Vec<&str> = config
        .children
        .iter()
        .filter(|c| c.name_is("VERSION"))
        .filter_map(|c| c.attr_ci(&["version"]))
        .collect();
    assert_eq!(versions, vec!["6"]);
}

#[test]
fn test_export_only_base_builds_flat_export() {
    let tmp = TempDir::new().unwrap();
    let base = make_fake_disc(
        tmp.path(),
        "BASE",
        &FakeDiscOptions {
            layout: "export_only",
            ..Default::default()
        },
    );
    let out = tmp.path().join("OUT");
    let opts = SubsetOptions {
        target_version: 1,
        ..Default::default()
    };
    run_build(&base.export_root, &[], &out, &[1], &BTreeMap::new(), &opts).unwrap();
    assert!(out.join("config.xml").is_file());
    assert!(out.join("1").is_dir());
    assert!(!out.join("2").exists());
}

#[test]
fn test_fast_update_refuses_mismatched_base() {
    let tmp = TempDir::new().unwrap();
    let base = make_fake_disc(tmp.path(), "BASE", &FakeDiscOptions::default());
    let other = make_fake_disc(tmp.path(), "OTHER", &FakeDiscOptions::default());

    // Build once from OTHER, then attempt a fast update claiming BASE.
    let opts = SubsetOptions {
        target_version: 1,
        ..Default::default()
    };
    let out = tmp.path().join("OUT");
    run_build(&other.disc_root, &[], &out, &[1, 2], &BTreeMap::new(), &opts).unwrap();

    let fast = SubsetOptions {
        target_version: 1,
        fast_update: true,
        keep_backup: false,
        ..Default::default()
    };
    let err = run_build(&base.disc_root, &[], &out, &[1], &BTreeMap::new(), &fast).unwrap_err();
    assert!(err.to_string().contains("fast update refused"));
}

#[test]
fn test_fast_update_applies_in_place() {
    let tmp = TempDir::new().unwrap();
    let base = make_fake_disc(tmp.path(), "BASE", &FakeDiscOptions { song_ids: vec![1, 2], ..Default::default() });
    let out = tmp.path().join("OUT");
    let opts = SubsetOptions {
        target_version: 1,
        ..Default::default()
    };
    run_build(&base.disc_root, &[], &out, &[1, 2], &BTreeMap::new(), &opts).unwrap();

    let fast = SubsetOptions {
        target_version: 1,
        fast_update: true,
        keep_backup: true,
        ..Default::default()
    };
    run_build(&base.disc_root, &[], &out, &[1], &BTreeMap::new(), &fast).unwrap();

    let export = out.join("PS3_GAME").join("USRDIR").join("FileSystem").join("Export");
    assert!(export.join("1").is_dir());
    assert!(!export.join("2").exists());
    // The in-place update kept a backup copy beside the output.
    let backups: Vec<_> = fs::read_dir(tmp.path())
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("OUT.backup."))
        .collect();
    assert_eq!(backups.len(), 1);
}
