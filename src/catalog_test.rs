use crate::catalog::*;
use crate::index::{index_disc, CacheStore};
use crate::progress::CancelToken;
use crate::testing::{make_fake_disc, FakeDiscOptions};
use std::collections::BTreeMap;
use tempfile::TempDir;

fn catalog_fixture(tmp: &TempDir) -> (CacheStore, Vec<(String, crate::DiscIndex, bool)>) {
    let store = CacheStore::open(tmp.path().join("_index_cache"));
    let base = make_fake_disc(
        tmp.path(),
        "BASE",
        &FakeDiscOptions {
            song_ids: vec![1, 2],
            ..Default::default()
        },
    );
    let donor = make_fake_disc(
        tmp.path(),
        "DONOR",
        &FakeDiscOptions {
            layout: "export_only",
            song_ids: vec![2, 3],
            ..Default::default()
        },
    );
    let base_idx = index_disc(&store, &base.disc_root).unwrap();
    let donor_idx = index_disc(&store, &donor.disc_root).unwrap();
    let discs = vec![
        ("Base".to_string(), base_idx, true),
        ("DonorA".to_string(), donor_idx, false),
    ];
    (store, discs)
}

#[test]
fn test_catalog_merges_sources_base_first() {
    let tmp = TempDir::new().unwrap();
    let (store, discs) = catalog_fixture(&tmp);
    let mut log_lines: Vec<String> = Vec::new();
    let mut log = |line: &str| log_lines.push(line.to_string());
    let (songs, ids_by_label) = build_song_catalog(&store, &discs, None, Some(&mut log)).unwrap();

    assert_eq!(songs.len(), 3);
    assert_eq!(songs.iter().map(|s| s.song_id).collect::<Vec<_>>(), vec![1, 2, 3]);

    let by_id: BTreeMap<u32, &SongAgg> = songs.iter().map(|s| (s.song_id, s)).collect();
    assert_eq!(by_id[&1].preferred_source, "Base");
    assert_eq!(by_id[&1].sources, vec!["Base".to_string()]);
    // Song 2 exists in both; base wins and sources union.
    assert_eq!(by_id[&2].preferred_source, "Base");
    assert_eq!(by_id[&2].sources, vec!["Base".to_string(), "DonorA".to_string()]);
    // Song 3 is donor-only.
    assert_eq!(by_id[&3].preferred_source, "DonorA");
    assert_eq!(by_id[&3].sources, vec!["DonorA".to_string()]);

    assert_eq!(ids_by_label["Base"].iter().copied().collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(ids_by_label["DonorA"].iter().copied().collect::<Vec<_>>(), vec![2, 3]);
    assert!(log_lines.iter().any(|l| l.contains("Reading Base")));
}

#[test]
fn test_catalog_base_metadata_wins_when_base_listed_later() {
    let tmp = TempDir::new().unwrap();
    let (store, mut discs) = catalog_fixture(&tmp);
    // Same discs, donor first: the base occurrence must still win song 2.
    discs.reverse();
    let (songs, _ids) = build_song_catalog(&store, &discs, None, None).unwrap();
    let song2 = songs.iter().find(|s| s.song_id == 2).unwrap();
    assert_eq!(song2.preferred_source, "Base");
    assert_eq!(song2.title, "Song 2");
}

#[test]
fn test_catalog_honours_cancellation() {
    let tmp = TempDir::new().unwrap();
    let (store, discs) = catalog_fixture(&tmp);
    let token = CancelToken::new();
    token.cancel();
    let err = build_song_catalog(&store, &discs, Some(&token), None).unwrap_err();
    assert!(err.is_cancelled());
}

#[test]
fn test_prune_winner_overrides_drops_stale_targets() {
    let songs = vec![
        SongAgg {
            song_id: 1,
            title: "T".into(),
            artist: "A".into(),
            preferred_source: "Base".into(),
            sources: vec!["Base".into(), "DonorA".into()],
        },
        SongAgg {
            song_id: 2,
            title: "T".into(),
            artist: "A".into(),
            preferred_source: "Base".into(),
            sources: vec!["Base".into()],
        },
    ];
    let overrides: BTreeMap<u32, String> = BTreeMap::from([
        (1, "DonorA".to_string()),  // valid
        (2, "DonorA".to_string()),  // label not among song 2's sources
        (99, "DonorA".to_string()), // unknown song
    ]);
    let pruned = prune_winner_overrides(&songs, &overrides);
    assert_eq!(pruned.len(), 1);
    assert_eq!(pruned.get(&1).map(|s| s.as_str()), Some("DonorA"));
}
