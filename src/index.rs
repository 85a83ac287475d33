/// Disc indexing and the persistent per-disc index cache.
///
/// The cache is a directory of JSON records, one per normalized input path,
/// keyed by `sha1(normalized_input_path)`. A record is only trusted while the
/// stat signature of the disc's indexed files still matches; any mtime/size
/// change to a tracked file invalidates it. Records are written atomically
/// (temp file then rename) and corrupt or schema-mismatched records are
/// treated as absent. Writes are best-effort, last-writer-wins.
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::common::{normalize_input_path, sha1_hex, VERSION};
use crate::error::{Result, SpcdbError};
use crate::inspect::{best_bank_files, parse_config};
use crate::layout::resolve_input;
use crate::xmlread::{stream_elements, XmlElem};

pub const INDEX_CACHE_DIRNAME: &str = "_index_cache";
pub const INDEX_CACHE_SCHEMA: u32 = 1;

/// Immutable snapshot of a disc's metadata.
///
/// Invariants: `chosen_bank <= max_bank`; `songs_xml` and `acts_xml` are both
/// present or both absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscIndex {
    pub input_path: PathBuf,
    pub export_root: PathBuf,
    pub product_code: Option<String>,
    pub product_desc: Option<String>,
    pub max_bank: u32,
    pub chosen_bank: u32,
    pub songs_xml: Option<PathBuf>,
    pub acts_xml: Option<PathBuf>,
    pub song_count: u64,
    pub warnings: Vec<String>,
}

/// One catalog row as parsed from a disc's songs XML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongMeta {
    pub song_id: u32,
    pub title: String,
    pub artist: String,
}

pub type SongMap = BTreeMap<u32, SongMeta>;

fn stat_sig(p: &Path) -> String {
    let name = p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    match fs::metadata(p) {
        Ok(md) => {
            let mtime_ns = md
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            format!("{name}:{mtime_ns}:{}", md.len())
        }
        Err(_) => format!("{name}:missing"),
    }
}

/// Signature over the disc's indexed files: the export root directory itself,
/// `config.xml`, and the chosen bank's songs/acts XMLs.
pub fn compute_disc_signature(export_root: &Path, songs_xml: Option<&Path>, acts_xml: Option<&Path>) -> String {
    let mut parts = vec![stat_sig(export_root), stat_sig(&export_root.join("config.xml"))];
    if let Some(p) = songs_xml {
        parts.push(stat_sig(p));
    }
    if let Some(p) = acts_xml {
        parts.push(stat_sig(p));
    }
    sha1_hex(&parts.join("|"))
}

pub fn compute_disc_signature_for_idx(idx: &DiscIndex) -> String {
    compute_disc_signature(&idx.export_root, idx.songs_xml.as_deref(), idx.acts_xml.as_deref())
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    schema: u32,
    version: String,
    signature: String,
    saved_utc: String,
    disc_index: CacheDiscIndex,
    #[serde(skip_serializing_if = "Option::is_none")]
    songs: Option<Vec<(u32, String, String)>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheDiscIndex {
    input_path: PathBuf,
    input_path_norm: String,
    export_root: PathBuf,
    product_code: Option<String>,
    product_desc: Option<String>,
    max_bank: u32,
    chosen_bank: u32,
    songs_xml: Option<PathBuf>,
    acts_xml: Option<PathBuf>,
    song_count: u64,
    warnings: Vec<String>,
}

/// Status info about the persistent cache entry for an input path.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStatus {
    pub path: PathBuf,
    pub exists: bool,
    pub stale: bool,
    pub reason: String,
    pub saved_utc: String,
    pub version: String,
    pub has_songs: bool,
    pub song_count: u64,
}

/// The process-wide index cache directory, held explicitly (no singletons).
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Platform-default store under the app's local data directory.
    pub fn open_default() -> Result<Self> {
        let proj = ProjectDirs::from("", "", "spcdb")
            .ok_or_else(|| SpcdbError::Cache("could not resolve app data directory".to_string()))?;
        Ok(Self::open(proj.data_local_dir().join(INDEX_CACHE_DIRNAME)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for_input(&self, input_path: &Path) -> PathBuf {
        let norm = normalize_input_path(&input_path.to_string_lossy());
        self.dir.join(format!("{}.json", sha1_hex(&norm)))
    }

    /// Load the cached index (+ optional songs) for an input path.
    ///
    /// Returns `(idx, songs, stale, reason)`. When `stale` is true the cache
    /// exists but no longer matches the on-disk files.
    pub fn load(&self, input_path: &Path) -> (Option<DiscIndex>, Option<SongMap>, bool, String) {
        let cache_path = self.path_for_input(input_path);
        if !cache_path.is_file() {
            return (None, None, false, String::new());
        }

        let raw = match fs::read_to_string(&cache_path) {
            Ok(s) => s,
            Err(e) => return (None, None, false, format!("cache read failed: {e}")),
        };
        let rec: CacheRecord = match serde_json::from_str(&raw) {
            Ok(r) => r,
            Err(e) => return (None, None, false, format!("cache read failed: {e}")),
        };
        if rec.schema != INDEX_CACHE_SCHEMA {
            return (None, None, false, "schema mismatch".to_string());
        }

        let di = rec.disc_index;
        let cur_sig = compute_disc_signature(&di.export_root, di.songs_xml.as_deref(), di.acts_xml.as_deref());
        if rec.signature.is_empty() || cur_sig.is_empty() {
            return (None, None, true, "signature unavailable".to_string());
        }
        if rec.signature != cur_sig {
            return (None, None, true, "signature mismatch".to_string());
        }

        let songs: Option<SongMap> = rec.songs.map(|rows| {
            rows.into_iter()
                .map(|(sid, title, artist)| (sid, SongMeta { song_id: sid, title, artist }))
                .collect()
        });

        let song_count = if di.song_count > 0 {
            di.song_count
        } else {
            songs.as_ref().map(|s| s.len() as u64).unwrap_or(0)
        };

        // Prefer the caller's spelling of the input path (casing may differ).
        let idx = DiscIndex {
            input_path: input_path.to_path_buf(),
            export_root: di.export_root,
            product_code: di.product_code,
            product_desc: di.product_desc,
            max_bank: di.max_bank,
            chosen_bank: di.chosen_bank,
            songs_xml: di.songs_xml,
            acts_xml: di.acts_xml,
            song_count,
            warnings: di.warnings,
        };
        (Some(idx), songs, false, "ok".to_string())
    }

    /// Write/refresh the cache record for a disc index (and optional songs).
    /// Best-effort: failures log and return.
    ///
    /// A write without songs intentionally drops any previously cached songs,
    /// since the signature may have moved; they are rebuilt on next refresh.
    pub fn write(&self, idx: &DiscIndex, songs: Option<&SongMap>) {
        if fs::create_dir_all(&self.dir).is_err() {
            return;
        }
        let cache_path = self.path_for_input(&idx.input_path);

        let song_rows = songs.map(|sm| {
            let mut rows: Vec<(u32, String, String)> =
                sm.values().map(|m| (m.song_id, m.title.clone(), m.artist.clone())).collect();
            rows.sort_by_key(|r| r.0);
            rows
        });

        let rec = CacheRecord {
            schema: INDEX_CACHE_SCHEMA,
            version: VERSION.to_string(),
            signature: compute_disc_signature_for_idx(idx),
            saved_utc: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            disc_index: CacheDiscIndex {
                input_path: idx.input_path.clone(),
                input_path_norm: normalize_input_path(&idx.input_path.to_string_lossy()),
                export_root: idx.export_root.clone(),
                product_code: idx.product_code.clone(),
                product_desc: idx.product_desc.clone(),
                max_bank: idx.max_bank,
                chosen_bank: idx.chosen_bank,
                songs_xml: idx.songs_xml.clone(),
                acts_xml: idx.acts_xml.clone(),
                song_count: idx.song_count,
                warnings: idx.warnings.clone(),
            },
            songs: song_rows,
        };

        let payload = match serde_json::to_string_pretty(&rec) {
            Ok(p) => p,
            Err(e) => {
                debug!("cache serialize failed: {e}");
                return;
            }
        };

        // Atomic write: temp file in the cache dir, then rename over.
        let write_result = (|| -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
            tmp.write_all(payload.as_bytes())?;
            tmp.persist(&cache_path).map_err(|e| e.error)?;
            Ok(())
        })();
        if let Err(e) = write_result {
            debug!("cache write failed for {}: {e}", cache_path.display());
        }
    }

    /// Lightweight status probe for an input path's cache entry.
    pub fn status(&self, input_path: &Path) -> CacheStatus {
        let cache_path = self.path_for_input(input_path);
        let mut status = CacheStatus {
            path: cache_path.clone(),
            exists: cache_path.is_file(),
            ..Default::default()
        };
        if !status.exists {
            status.reason = "missing".to_string();
            return status;
        }

        if let Ok(raw) = fs::read_to_string(&cache_path) {
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(&raw) {
                status.saved_utc = v.get("saved_utc").and_then(|x| x.as_str()).unwrap_or("").to_string();
                status.version = v.get("version").and_then(|x| x.as_str()).unwrap_or("").to_string();
            }
        }

        let (idx, songs, stale, reason) = self.load(input_path);
        status.stale = stale;
        status.reason = reason;
        status.has_songs = songs.is_some();
        status.song_count = idx
            .as_ref()
            .map(|i| i.song_count)
            .filter(|&n| n > 0)
            .or_else(|| songs.as_ref().map(|s| s.len() as u64))
            .unwrap_or(0);
        status
    }

    /// Delete the cache entries (best-effort). Removes the directory itself
    /// when it ends up empty.
    pub fn clear(&self) -> (bool, String) {
        if !self.dir.exists() {
            return (true, "cache directory does not exist".to_string());
        }
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) => return (false, e.to_string()),
        };
        for entry in entries.flatten() {
            let p = entry.path();
            if p.extension().and_then(|e| e.to_str()) == Some("json") {
                let _ = fs::remove_file(&p);
            }
        }
        if fs::read_dir(&self.dir).map(|mut it| it.next().is_none()).unwrap_or(false) {
            let _ = fs::remove_dir(&self.dir);
        }
        (true, "cache cleared".to_string())
    }
}

/// Index a disc folder: resolve the layout, pick the best bank, and return a
/// `DiscIndex`, reusing the persistent cache while it is still valid.
pub fn index_disc(store: &CacheStore, input_path: &Path) -> Result<DiscIndex> {
    let (cached, _songs, stale, _reason) = store.load(input_path);
    if let Some(idx) = cached {
        if !stale {
            return Ok(idx);
        }
    }

    let ri = resolve_input(&input_path.to_string_lossy())?;
    let export_root = ri.export_root.clone();
    let mut warnings = ri.warnings.clone();

    let (product_code, product_desc, versions) = match parse_config(&export_root) {
        Ok(triple) => triple,
        Err(SpcdbError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => (None, None, Vec::new()),
        Err(e) => return Err(e),
    };
    let max_bank = versions.iter().max().copied().unwrap_or(1);

    let idx = match best_bank_files(&export_root, max_bank) {
        Some((bank, songs_xml, acts_xml)) => DiscIndex {
            input_path: ri.original.clone(),
            export_root,
            product_code,
            product_desc,
            max_bank,
            chosen_bank: bank,
            songs_xml: Some(songs_xml),
            acts_xml: Some(acts_xml),
            // Totals are computed when the songs list is refreshed; indexing
            // stays cheap.
            song_count: 0,
            warnings,
        },
        None => {
            warnings.push("No songs_<bank>_0.xml + acts_<bank>_0.xml pair found under Export root.".to_string());
            DiscIndex {
                input_path: ri.original.clone(),
                export_root,
                product_code,
                product_desc,
                max_bank,
                chosen_bank: max_bank,
                songs_xml: None,
                acts_xml: None,
                song_count: 0,
                warnings,
            }
        }
    };

    store.write(&idx, None);
    info!("indexed disc {} (bank {}/{})", idx.input_path.display(), idx.chosen_bank, idx.max_bank);
    Ok(idx)
}

/// Parse `acts_<bank>_0.xml` into `act_id -> display name`.
pub fn act_map_from_xml(acts_xml: &Path) -> Result<BTreeMap<u32, String>> {
    let mut out = BTreeMap::new();
    stream_elements(acts_xml, "ACT", &mut |el| {
        let aid = match el.parse_id() {
            Some(aid) => aid,
            None => return Ok(()),
        };
        // Prefer NAME over NAME_KEY, direct children only.
        let mut name = String::new();
        for ch in &el.children {
            if ch.name_is("NAME") && !ch.text.trim().is_empty() {
                name = ch.text.trim().to_string();
                break;
            }
        }
        if name.is_empty() {
            for ch in &el.children {
                if ch.name_is("NAME_KEY") && !ch.text.trim().is_empty() {
                    name = ch.text.trim().to_string();
                    break;
                }
            }
        }
        if !name.is_empty() {
            out.insert(aid, name);
        }
        Ok(())
    })?;
    Ok(out)
}

pub fn song_title(song_el: &XmlElem) -> String {
    // Be permissive; different discs use slightly different tag conventions.
    song_el
        .find_text_by_tags_ci(&["TITLE", "SONG_NAME", "NAME"])
        .or_else(|| song_el.find_text_by_tags_ci(&["TITLE_KEY", "SONG_NAME_KEY", "NAME_KEY"]))
        .unwrap_or_default()
}

pub fn song_artist(song_el: &XmlElem, act_map: &BTreeMap<u32, String>) -> String {
    if let Some(t) = song_el.find_text_by_tags_ci(&["PERFORMANCE_NAME"]) {
        return t;
    }
    // PERFORMED_BY element with an ID attribute resolved through the act map.
    for el in song_el.descendants() {
        if el.name_is("PERFORMED_BY") {
            if let Some(name) = el.parse_id().and_then(|aid| act_map.get(&aid)) {
                return name.clone();
            }
            break;
        }
    }
    song_el
        .find_text_by_tags_ci(&["PERFORMANCE_NAME_KEY", "ARTIST", "ARTIST_NAME"])
        .unwrap_or_default()
}

/// Parse `song_id -> SongMeta` for a disc index.
pub fn load_songs_for_disc(idx: &DiscIndex) -> Result<SongMap> {
    let (songs_xml, acts_xml) = match (&idx.songs_xml, &idx.acts_xml) {
        (Some(s), Some(a)) => (s, a),
        _ => return Ok(SongMap::new()),
    };

    let act_map = act_map_from_xml(acts_xml)?;
    let mut out = SongMap::new();
    stream_elements(songs_xml, "SONG", &mut |el| {
        if let Some(sid) = el.parse_id() {
            out.insert(
                sid,
                SongMeta {
                    song_id: sid,
                    title: song_title(&el),
                    artist: song_artist(&el, &act_map),
                },
            );
        }
        Ok(())
    })?;
    Ok(out)
}

/// Like `load_songs_for_disc`, but serves from the persistent cache when the
/// stored signature still matches the current index.
pub fn load_songs_for_disc_cached(store: &CacheStore, idx: &DiscIndex) -> Result<SongMap> {
    let (di, songs, stale, _reason) = store.load(&idx.input_path);
    if !stale {
        if let (Some(di), Some(songs)) = (di, songs) {
            // The cached record may describe a different bank choice; require
            // signature agreement with the *current* index.
            if compute_disc_signature_for_idx(idx) == compute_disc_signature_for_idx(&di) {
                return Ok(songs);
            }
        }
    }

    let out = load_songs_for_disc(idx)?;
    store.write(idx, Some(&out));
    Ok(out)
}
