/// Catalog aggregation: merge per-disc song maps into one catalog with
/// ownership tracking across sources.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::index::{load_songs_for_disc_cached, CacheStore, DiscIndex};
use crate::progress::CancelToken;

pub const BASE_LABEL: &str = "Base";

/// One aggregated catalog row. `preferred_source` is always a member of
/// `sources`; when the base disc carries the song, it wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongAgg {
    pub song_id: u32,
    pub title: String,
    pub artist: String,
    pub preferred_source: String,
    pub sources: Vec<String>,
}

/// Build an aggregated song catalog across discs.
///
/// `discs` is ordered `(label, index, is_base)`, base first. Returns the
/// catalog sorted by song id plus a `label -> song ids` ownership map.
pub fn build_song_catalog(
    store: &CacheStore,
    discs: &[(String, DiscIndex, bool)],
    cancel: Option<&CancelToken>,
    mut log: Option<&mut dyn FnMut(&str)>,
) -> Result<(Vec<SongAgg>, BTreeMap<String, BTreeSet<u32>>)> {
    let mut ids_by_label: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
    let mut agg: BTreeMap<u32, SongAgg> = BTreeMap::new();

    for (label, idx, is_base) in discs {
        if let Some(cancel) = cancel {
            cancel.raise_if_cancelled()?;
        }
        if let Some(log) = log.as_deref_mut() {
            log(&format!("[songs] Reading {label}..."));
        }

        let songs = load_songs_for_disc_cached(store, idx)?;
        debug!("catalog: {label} contributes {} songs", songs.len());
        ids_by_label.entry(label.clone()).or_default().extend(songs.keys().copied());

        for (sid, meta) in songs {
            match agg.get_mut(&sid) {
                None => {
                    agg.insert(
                        sid,
                        SongAgg {
                            song_id: sid,
                            title: meta.title,
                            artist: meta.artist,
                            preferred_source: if *is_base { BASE_LABEL.to_string() } else { label.clone() },
                            sources: vec![label.clone()],
                        },
                    );
                }
                Some(row) => {
                    if !row.sources.contains(label) {
                        row.sources.push(label.clone());
                    }
                    // The base disc's metadata wins when present.
                    if *is_base {
                        row.preferred_source = BASE_LABEL.to_string();
                        if !meta.title.is_empty() {
                            row.title = meta.title;
                        }
                        if !meta.artist.is_empty() {
                            row.artist = meta.artist;
                        }
                    }
                }
            }
        }
    }

    let mut songs_out: Vec<SongAgg> = agg
        .into_values()
        .map(|mut row| {
            row.sources.sort();
            row
        })
        .collect();
    songs_out.sort_by_key(|s| s.song_id);
    Ok((songs_out, ids_by_label))
}

/// Drop winner overrides whose target label is not among the song's sources
/// (stale overrides from a previous session). Returns the pruned map.
pub fn prune_winner_overrides(songs: &[SongAgg], overrides: &BTreeMap<u32, String>) -> BTreeMap<u32, String> {
    let sources_by_id: BTreeMap<u32, &Vec<String>> = songs.iter().map(|s| (s.song_id, &s.sources)).collect();
    overrides
        .iter()
        .filter(|(sid, label)| {
            sources_by_id
                .get(sid)
                .map(|srcs| srcs.iter().any(|s| s == *label))
                .unwrap_or(false)
        })
        .map(|(sid, label)| (*sid, label.clone()))
        .collect()
}
