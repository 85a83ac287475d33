use crate::index::*;
use crate::testing::{init_tracing, make_fake_disc, FakeDiscOptions};
use std::fs;
use tempfile::TempDir;

fn store_in(tmp: &TempDir) -> CacheStore {
    CacheStore::open(tmp.path().join("_index_cache"))
}

fn sample_index(disc: &crate::testing::FakeDisc) -> DiscIndex {
    DiscIndex {
        input_path: disc.disc_root.clone(),
        export_root: disc.export_root.clone(),
        product_code: Some("X".to_string()),
        product_desc: Some("X disc".to_string()),
        max_bank: 1,
        chosen_bank: 1,
        songs_xml: Some(disc.export_root.join("songs_1_0.xml")),
        acts_xml: Some(disc.export_root.join("acts_1_0.xml")),
        song_count: 2,
        warnings: vec![],
    }
}

#[test]
fn test_cache_roundtrip_and_status() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let disc = make_fake_disc(tmp.path(), "DISC1", &FakeDiscOptions::default());
    let idx = sample_index(&disc);

    let mut songs = SongMap::new();
    songs.insert(1, SongMeta { song_id: 1, title: "Song 1".into(), artist: "Artist 1".into() });
    songs.insert(2, SongMeta { song_id: 2, title: "Song 2".into(), artist: "Artist 2".into() });
    store.write(&idx, Some(&songs));

    let (idx2, songs2, stale, reason) = store.load(&disc.disc_root);
    assert!(!stale);
    assert_eq!(reason, "ok");
    let idx2 = idx2.unwrap();
    assert_eq!(idx2.export_root, idx.export_root);
    assert_eq!(idx2.chosen_bank, 1);
    assert_eq!(songs2.unwrap(), songs);

    let st = store.status(&disc.disc_root);
    assert!(st.exists);
    assert!(!st.stale);
    assert!(st.has_songs);
    assert_eq!(st.song_count, 2);
    assert!(!st.saved_utc.is_empty());
}

#[test]
fn test_cache_detects_stale_signature_on_config_edit() {
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let disc = make_fake_disc(tmp.path(), "DISC2", &FakeDiscOptions::default());
    store.write(&sample_index(&disc), None);

    let (idx, _songs, stale, _reason) = store.load(&disc.disc_root);
    assert!(idx.is_some());
    assert!(!stale);

    // Appending a comment changes the tracked file's size, which must
    // invalidate the entry.
    let cfg = disc.export_root.join("config.xml");
    let mut content = fs::read_to_string(&cfg).unwrap();
    content.push_str("\n<!-- changed -->\n");
    fs::write(&cfg, content).unwrap();

    let (idx2, songs2, stale, reason) = store.load(&disc.disc_root);
    assert!(idx2.is_none());
    assert!(songs2.is_none());
    assert!(stale);
    assert!(reason.contains("signature"));

    let st = store.status(&disc.disc_root);
    assert!(st.exists);
    assert!(st.stale);
}

#[test]
fn test_cache_corrupt_file_treated_as_absent() {
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let disc = make_fake_disc(tmp.path(), "DISC3", &FakeDiscOptions::default());
    let cache_path = store.path_for_input(&disc.disc_root);
    fs::create_dir_all(cache_path.parent().unwrap()).unwrap();
    fs::write(&cache_path, "{not json").unwrap();

    let (idx, songs, stale, reason) = store.load(&disc.disc_root);
    assert!(idx.is_none());
    assert!(songs.is_none());
    assert!(!stale);
    assert!(reason.contains("cache read failed"));
}

#[test]
fn test_cache_clear_removes_entries() {
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let disc = make_fake_disc(tmp.path(), "DISC4", &FakeDiscOptions::default());
    store.write(&sample_index(&disc), None);
    assert!(store.path_for_input(&disc.disc_root).is_file());

    let (ok, _msg) = store.clear();
    assert!(ok);
    assert!(!store.dir().exists());
}

#[test]
fn test_compute_disc_signature_changes_on_songs_edit() {
    let tmp = TempDir::new().unwrap();
    let disc = make_fake_disc(tmp.path(), "SIG", &FakeDiscOptions::default());
    let songs = disc.export_root.join("songs_1_0.xml");
    let acts = disc.export_root.join("acts_1_0.xml");

    let sig1 = compute_disc_signature(&disc.export_root, Some(&songs), Some(&acts));
    let mut content = fs::read_to_string(&songs).unwrap();
    content.push_str("\n<!-- edit -->\n");
    fs::write(&songs, content).unwrap();
    let sig2 = compute_disc_signature(&disc.export_root, Some(&songs), Some(&acts));
    assert_ne!(sig1, sig2);

    let idx = sample_index(&disc);
    assert_eq!(compute_disc_signature_for_idx(&idx), sig2);
}

#[test]
fn test_signature_flips_when_tracked_file_appears() {
    let tmp = TempDir::new().unwrap();
    let export = tmp.path().join("Export");
    fs::create_dir_all(&export).unwrap();
    let songs = export.join("songs_1_0.xml");
    let sig_missing = compute_disc_signature(&export, Some(&songs), None);
    fs::write(&songs, "<SONGS/>").unwrap();
    let sig_present = compute_disc_signature(&export, Some(&songs), None);
    assert_ne!(sig_missing, sig_present);
}

#[test]
fn test_index_disc_invariants_and_cache_reuse() {
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let disc = make_fake_disc(
        tmp.path(),
        "IDX",
        &FakeDiscOptions {
            bank: 4,
            ..Default::default()
        },
    );

    let idx = index_disc(&store, &disc.disc_root).unwrap();
    assert!(idx.chosen_bank <= idx.max_bank);
    assert_eq!(idx.chosen_bank, 4);
    assert_eq!(idx.product_code.as_deref(), Some("IDX"));
    assert!(idx.songs_xml.is_some() && idx.acts_xml.is_some());

    // Second call is served from the cache and agrees.
    let idx2 = index_disc(&store, &disc.disc_root).unwrap();
    assert_eq!(idx, idx2);
}

#[test]
fn test_index_disc_without_bank_pair_has_neither_xml() {
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let disc = make_fake_disc(tmp.path(), "NOBANK", &FakeDiscOptions::default());
    // Acts missing: the pair is incomplete, so both paths must stay unset.
    fs::remove_file(disc.export_root.join("acts_1_0.xml")).unwrap();

    let idx = index_disc(&store, &disc.disc_root).unwrap();
    assert!(idx.songs_xml.is_none());
    assert!(idx.acts_xml.is_none());
    assert!(idx.warnings.iter().any(|w| w.contains("No songs_<bank>_0.xml")));
}

#[test]
fn test_load_songs_resolves_titles_and_artists() {
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let disc = make_fake_disc(tmp.path(), "SONGS", &FakeDiscOptions::default());
    let idx = index_disc(&store, &disc.disc_root).unwrap();

    let songs = load_songs_for_disc(&idx).unwrap();
    assert_eq!(songs.len(), 2);
    assert_eq!(songs[&1].title, "Song 1");
    assert_eq!(songs[&1].artist, "Artist 1");
    assert_eq!(songs[&2].artist, "Artist 2");
}

#[test]
fn test_load_songs_cached_round_trip() {
    let tmp = TempDir::new().unwrap();
    let store = store_in(&tmp);
    let disc = make_fake_disc(tmp.path(), "CACHED", &FakeDiscOptions::default());
    let idx = index_disc(&store, &disc.disc_root).unwrap();

    let songs1 = load_songs_for_disc_cached(&store, &idx).unwrap();
    // The second load is served by the cache; results must be identical.
    let songs2 = load_songs_for_disc_cached(&store, &idx).unwrap();
    assert_eq!(songs1, songs2);
    let st = store.status(&disc.disc_root);
    assert!(st.has_songs);
}

#[test]
fn test_act_map_prefers_name_over_name_key() {
    let tmp = TempDir::new().unwrap();
    let acts = tmp.path().join("acts_1_0.xml");
    fs::write(
        &acts,
        r#"<ACTS><ACT ID="1"><NAME>Real Name</NAME><NAME_KEY>key_1</NAME_KEY></ACT><ACT ID="2"><NAME_KEY>key_2</NAME_KEY></ACT></ACTS>"#,
    )
    .unwrap();
    let map = act_map_from_xml(&acts).unwrap();
    assert_eq!(map[&1], "Real Name");
    assert_eq!(map[&2], "key_2");
}
