use crate::conflicts::*;
use crate::catalog::SongAgg;
use crate::testing::{fake_mp4_bytes, write_melody};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn agg(song_id: u32, sources: &[&str]) -> SongAgg {
    SongAgg {
        song_id,
        title: "T".into(),
        artist: "A".into(),
        preferred_source: sources[0].to_string(),
        sources: sources.iter().map(|s| s.to_string()).collect(),
    }
}

/// An export root containing one song folder, with an optional melody body.
fn export_with_song(tmp: &Path, name: &str, song_id: u32, melody: Option<&str>) -> PathBuf {
    let root = tmp.join(name);
    let song_dir = root.join(song_id.to_string());
    fs::create_dir_all(&song_dir).unwrap();
    if let Some(sentences) = melody {
        write_melody(&song_dir, sentences);
    }
    root
}

#[test]
fn test_conflict_detected_when_sha_and_fingerprint_differ() {
    let tmp = TempDir::new().unwrap();
    let a = export_with_song(tmp.path(), "base", 1, Some("<SENTENCE><NOTE MidiNote=\"60\" Duration=\"100\" Lyric=\"a\"/></SENTENCE>"));
    let b = export_with_song(tmp.path(), "donor", 1, Some("<SENTENCE><NOTE MidiNote=\"61\" Duration=\"100\" Lyric=\"a\"/></SENTENCE>"));
    let roots = BTreeMap::from([("Base".to_string(), a), ("Donor".to_string(), b)]);

    let songs = vec![agg(1, &["Base", "Donor"])];
    let conflicts = compute_song_id_conflicts(&songs, &roots);
    assert!(conflicts.contains_key(&1));
    let occs = &conflicts[&1];
    assert_eq!(occs.len(), 2);
    let fps: BTreeMap<&str, &Option<String>> = occs.iter().map(|o| (o.source_label.as_str(), &o.melody1_fp)).collect();
    assert!(fps["Base"].is_some() && fps["Donor"].is_some());
    assert_ne!(fps["Base"], fps["Donor"]);
}

#[test]
fn test_conflict_includes_missing_melody_side() {
    let tmp = TempDir::new().unwrap();
    let a = export_with_song(tmp.path(), "base", 2, Some("<SENTENCE><NOTE MidiNote=\"60\" Duration=\"100\" Lyric=\"a\"/></SENTENCE>"));
    let b = export_with_song(tmp.path(), "donor", 2, None);
    let roots = BTreeMap::from([("Base".to_string(), a), ("Donor".to_string(), b)]);

    let conflicts = compute_song_id_conflicts(&[agg(2, &["Base", "Donor"])], &roots);
    assert!(conflicts.contains_key(&2));
    let occs: BTreeMap<&str, &SongOccur> = conflicts[&2].iter().map(|o| (o.source_label.as_str(), o)).collect();
    assert!(occs["Base"].melody1_fp.is_some());
    assert!(occs["Donor"].melody1_fp.is_none());
    assert!(occs["Donor"].melody1_sha1.is_none());
}

#[test]
fn test_no_conflict_when_melodies_byte_identical() {
    let tmp = TempDir::new().unwrap();
    let body = "<SENTENCE><NOTE MidiNote=\"60\" Duration=\"100\" Lyric=\"a\"/></SENTENCE>";
    let a = export_with_song(tmp.path(), "base", 3, Some(body));
    let b = export_with_song(tmp.path(), "donor", 3, Some(body));
    let roots = BTreeMap::from([("Base".to_string(), a), ("Donor".to_string(), b)]);
    let conflicts = compute_song_id_conflicts(&[agg(3, &["Base", "Donor"])], &roots);
    assert!(conflicts.is_empty());
}

#[test]
fn test_single_source_song_is_never_a_candidate() {
    let tmp = TempDir::new().unwrap();
    let a = export_with_song(tmp.path(), "base", 4, None);
    let roots = BTreeMap::from([("Base".to_string(), a)]);
    let conflicts = compute_song_id_conflicts(&[agg(4, &["Base"])], &roots);
    assert!(conflicts.is_empty());
}

fn occs_for(roots: &BTreeMap<String, PathBuf>, songs: &[SongAgg]) -> ConflictSet {
    compute_song_id_conflicts(songs, roots)
}

#[test]
fn test_classify_effective_when_same_melody_but_assets_differ() {
    let tmp = TempDir::new().unwrap();
    // Same musical content with different whitespace: SHA differs,
    // fingerprint matches.
    let a = export_with_song(tmp.path(), "base", 5, Some("<SENTENCE><NOTE MidiNote=\"60\" Duration=\"100\" Lyric=\"a\"/></SENTENCE>"));
    let b = export_with_song(tmp.path(), "donor", 5, Some("<SENTENCE>\n\n  <NOTE   Lyric=\"a\" MidiNote=\"60\" Duration=\"100\"  />\n</SENTENCE>"));
    // Base has a small video, donor a much larger one.
    fs::write(a.join("5").join("video.mp4"), fake_mp4_bytes()).unwrap();
    let mut big = fake_mp4_bytes();
    big.resize(64 * 1024, 0);
    fs::write(b.join("5").join("video.mp4"), big).unwrap();

    let roots = BTreeMap::from([("Base".to_string(), a), ("Donor".to_string(), b)]);
    let songs = vec![agg(5, &["Base", "Donor"])];
    let conflicts = occs_for(&roots, &songs);
    let occs = &conflicts[&5];

    let mut analyzer = ConflictAnalyzer::new(&roots, None);
    let (class, summary) = analyzer.classify_conflict(5, occs);
    assert_eq!(class, ConflictClass::Effective);
    assert!(summary.contains("video differs") || summary.contains("total size differs"), "{summary}");
}

#[test]
fn test_classify_identical_when_only_xml_incidentals_differ() {
    let tmp = TempDir::new().unwrap();
    // Attribute order swapped: same byte length, different SHA, same melody.
    let a = export_with_song(tmp.path(), "base", 6, Some("<SENTENCE><NOTE MidiNote=\"60\" Duration=\"100\" Lyric=\"a\"/></SENTENCE>"));
    let b = export_with_song(tmp.path(), "donor", 6, Some("<SENTENCE><NOTE Duration=\"100\" MidiNote=\"60\" Lyric=\"a\"/></SENTENCE>"));
    let roots = BTreeMap::from([("Base".to_string(), a.clone()), ("Donor".to_string(), b.clone())]);
    let songs = vec![agg(6, &["Base", "Donor"])];
    let conflicts = occs_for(&roots, &songs);
    assert!(conflicts.contains_key(&6));
    let occs = &conflicts[&6];

    let mut analyzer = ConflictAnalyzer::new(&roots, None);
    let (class, summary) = analyzer.classify_conflict(6, occs);
    assert_eq!(class, ConflictClass::Identical);
    assert!(summary.is_empty());
}

#[test]
fn test_classify_different_when_fingerprint_missing() {
    let tmp = TempDir::new().unwrap();
    let a = export_with_song(tmp.path(), "base", 7, Some("<SENTENCE><NOTE MidiNote=\"60\" Duration=\"100\"/></SENTENCE>"));
    let b = export_with_song(tmp.path(), "donor", 7, None);
    let roots = BTreeMap::from([("Base".to_string(), a), ("Donor".to_string(), b)]);
    let songs = vec![agg(7, &["Base", "Donor"])];
    let conflicts = occs_for(&roots, &songs);
    let occs = &conflicts[&7];

    let mut analyzer = ConflictAnalyzer::new(&roots, None);
    let (class, _summary) = analyzer.classify_conflict(7, occs);
    assert_eq!(class, ConflictClass::Different);
}

#[test]
fn test_auto_pick_winner_prefers_base_label() {
    let occ = |label: &str| SongOccur {
        song_id: 1,
        title: String::new(),
        artist: String::new(),
        source_label: label.to_string(),
        melody1_sha1: None,
        melody1_fp: None,
    };
    assert_eq!(auto_pick_winner_label(&[occ("DonorA"), occ("Base")]).unwrap(), "Base");
    assert_eq!(auto_pick_winner_label(&[occ("DonorA"), occ("DonorB")]).unwrap(), "DonorA");
    assert!(auto_pick_winner_label(&[]).is_none());
}

#[test]
fn test_recommend_identical_keeps_base() {
    let tmp = TempDir::new().unwrap();
    let a = export_with_song(tmp.path(), "base", 8, None);
    let b = export_with_song(tmp.path(), "donor", 8, None);
    let roots = BTreeMap::from([("Base".to_string(), a), ("Donor".to_string(), b)]);
    let occ = |label: &str| SongOccur {
        song_id: 8,
        title: String::new(),
        artist: String::new(),
        source_label: label.to_string(),
        melody1_sha1: None,
        melody1_fp: Some("same".to_string()),
    };
    let mut analyzer = ConflictAnalyzer::new(&roots, None);
    let occs = vec![occ("Donor"), occ("Base")];
    let (winner, reason) = analyzer.recommend_winner(8, &occs, ConflictClass::Identical).unwrap();
    assert_eq!(winner, "Base");
    assert!(reason.contains("keep Base"));
}

#[test]
fn test_recommend_effective_only_one_with_video() {
    let tmp = TempDir::new().unwrap();
    let a = export_with_song(tmp.path(), "base", 9, None);
    let b = export_with_song(tmp.path(), "donor", 9, None);
    fs::write(b.join("9").join("video.mp4"), fake_mp4_bytes()).unwrap();
    let roots = BTreeMap::from([("Base".to_string(), a), ("Donor".to_string(), b)]);
    let occ = |label: &str| SongOccur {
        song_id: 9,
        title: String::new(),
        artist: String::new(),
        source_label: label.to_string(),
        melody1_sha1: None,
        melody1_fp: Some("same".to_string()),
    };
    let mut analyzer = ConflictAnalyzer::new(&roots, None);
    let occs = vec![occ("Base"), occ("Donor")];
    let (winner, reason) = analyzer.recommend_winner(9, &occs, ConflictClass::Effective).unwrap();
    assert_eq!(winner, "Donor");
    assert_eq!(reason, "only one with video");
}

struct FixedProber(BTreeMap<PathBuf, MediaInfo>);

impl MediaProber for FixedProber {
    fn probe(&self, media_path: &Path, _kind: MediaKind) -> Option<MediaInfo> {
        self.0.get(media_path).cloned()
    }
}

#[test]
fn test_quality_autopick_resolution_dominates_size() {
    let tmp = TempDir::new().unwrap();
    let a = export_with_song(tmp.path(), "src_a", 10, None);
    let b = export_with_song(tmp.path(), "src_b", 10, None);
    // B's file is larger on disk, but A has the higher resolution.
    fs::write(a.join("10").join("video.mp4"), fake_mp4_bytes()).unwrap();
    let mut big = fake_mp4_bytes();
    big.resize(128 * 1024, 0);
    fs::write(b.join("10").join("video.mp4"), big).unwrap();

    let probes = BTreeMap::from([
        (
            a.join("10").join("video.mp4"),
            MediaInfo { width: 1920, height: 1080, fps_milli: 25_000, kbps: 1200, ..Default::default() },
        ),
        (
            b.join("10").join("video.mp4"),
            MediaInfo { width: 1280, height: 720, fps_milli: 25_000, kbps: 4000, ..Default::default() },
        ),
    ]);
    let prober = FixedProber(probes);
    let roots = BTreeMap::from([("SourceA".to_string(), a), ("SourceB".to_string(), b)]);
    let occ = |label: &str| SongOccur {
        song_id: 10,
        title: String::new(),
        artist: String::new(),
        source_label: label.to_string(),
        melody1_sha1: None,
        melody1_fp: Some("same".to_string()),
    };
    let mut analyzer = ConflictAnalyzer::new(&roots, Some(&prober));
    let occs = vec![occ("SourceA"), occ("SourceB")];
    let winner = analyzer.auto_pick_best_quality_label(10, &occs).unwrap();
    assert_eq!(winner, "SourceA");
}

#[test]
fn test_quality_autopick_without_prober_uses_sizes() {
    let tmp = TempDir::new().unwrap();
    let a = export_with_song(tmp.path(), "src_a", 11, None);
    let b = export_with_song(tmp.path(), "src_b", 11, None);
    fs::write(a.join("11").join("video.mp4"), fake_mp4_bytes()).unwrap();
    let mut big = fake_mp4_bytes();
    big.resize(128 * 1024, 0);
    fs::write(b.join("11").join("video.mp4"), big).unwrap();

    let roots = BTreeMap::from([("SourceA".to_string(), a), ("SourceB".to_string(), b)]);
    let occ = |label: &str| SongOccur {
        song_id: 11,
        title: String::new(),
        artist: String::new(),
        source_label: label.to_string(),
        melody1_sha1: None,
        melody1_fp: Some("same".to_string()),
    };
    let mut analyzer = ConflictAnalyzer::new(&roots, None);
    let occs = vec![occ("SourceA"), occ("SourceB")];
    assert_eq!(analyzer.auto_pick_best_quality_label(11, &occs).unwrap(), "SourceB");
}

#[test]
fn test_scan_song_assets_summary() {
    let tmp = TempDir::new().unwrap();
    let root = export_with_song(tmp.path(), "assets", 12, Some("<SENTENCE><NOTE MidiNote=\"60\" Duration=\"10\"/></SENTENCE>"));
    fs::write(root.join("12").join("video.mp4"), fake_mp4_bytes()).unwrap();
    fs::write(root.join("12").join("audio.vag"), vec![1u8; 512]).unwrap();

    let assets = scan_song_assets(&root, 12);
    assert!(assets.song_dir_present);
    assert!(assets.melody1_present);
    assert_eq!(assets.total_files, 3);
    assert_eq!(assets.audio_bytes, 512);
    assert!(assets.video_bytes > 1024);

    let missing = scan_song_assets(&root, 999);
    assert!(!missing.song_dir_present);
    assert_eq!(missing.total_files, 0);
}
