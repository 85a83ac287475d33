/// Conflict detection and classification for duplicated song ids.
///
/// A song id becomes a candidate when it exists in 2+ sources and the raw
/// `Export/<id>/melody_1.xml` SHA-1 differs across them (cheap first pass).
/// Candidates then get a semantic melody fingerprint per source, and are
/// classified as identical (safe to auto-resolve), effectively identical
/// (same melody, differing assets/metadata), or different (true conflict).
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::catalog::{SongAgg, BASE_LABEL};
use crate::common::{norm_ci, sha1_file};
use crate::error::Result;
use crate::inspect::best_bank_files;
use crate::melody::{melody_fingerprint_file, melody_stats, MelodyStats};
use crate::xmlread::stream_elements;

/// Per-source occurrence of a conflicted song.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongOccur {
    pub song_id: u32,
    pub title: String,
    pub artist: String,
    pub source_label: String,
    pub melody1_sha1: Option<String>,
    pub melody1_fp: Option<String>,
}

pub type ConflictSet = BTreeMap<u32, Vec<SongOccur>>;

fn melody_path(export_root: &Path, song_id: u32) -> PathBuf {
    export_root.join(song_id.to_string()).join("melody_1.xml")
}

/// Detect duplicated song ids that need resolution.
///
/// Returns `song_id -> occurrences` (one per source) for every song whose raw
/// melody SHA-1s are not all equal; a missing melody counts as a distinct
/// value. Occurrences of detected candidates carry semantic fingerprints.
pub fn compute_song_id_conflicts(songs: &[SongAgg], export_roots_by_label: &BTreeMap<String, PathBuf>) -> ConflictSet {
    let mut conflicts = ConflictSet::new();

    for song in songs {
        if song.song_id == 0 || song.sources.len() <= 1 {
            continue;
        }

        let mut occs: Vec<SongOccur> = Vec::new();
        let mut sha_values: Vec<String> = Vec::new();
        for label in &song.sources {
            let sha = export_roots_by_label
                .get(label)
                .and_then(|root| sha1_file(&melody_path(root, song.song_id)));
            sha_values.push(sha.clone().unwrap_or_else(|| "MISSING".to_string()));
            occs.push(SongOccur {
                song_id: song.song_id,
                title: song.title.clone(),
                artist: song.artist.clone(),
                source_label: label.clone(),
                melody1_sha1: sha,
                melody1_fp: None,
            });
        }

        let first = &sha_values[0];
        if sha_values.iter().all(|v| v == first) {
            continue;
        }

        // Second pass (semantic): canonical fingerprint from note events.
        for occ in &mut occs {
            occ.melody1_fp = export_roots_by_label
                .get(&occ.source_label)
                .and_then(|root| melody_fingerprint_file(&melody_path(root, song.song_id)));
        }

        conflicts.insert(song.song_id, occs);
    }

    conflicts
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictClass {
    Identical,
    Effective,
    Different,
}

impl ConflictClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictClass::Identical => "identical",
            ConflictClass::Effective => "effective",
            ConflictClass::Different => "different",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// Optional media prober (e.g. an ffprobe wrapper supplied by the caller).
/// Without one, classification relies on file sizes and melody stats only.
pub trait MediaProber {
    fn probe(&self, media_path: &Path, kind: MediaKind) -> Option<MediaInfo>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInfo {
    pub width: u32,
    pub height: u32,
    pub fps_milli: u32,
    pub kbps: u32,
    pub channels: u32,
    pub sample_rate_hz: u32,
}

impl MediaInfo {
    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

const AUDIO_EXTS: [&str; 12] = ["mp3", "wav", "ogg", "at3", "aac", "m4a", "ac3", "flac", "wma", "aif", "aiff", "vag"];
const VIDEO_EXTS: [&str; 11] = ["mp4", "m2v", "mpg", "mpeg", "avi", "mov", "mkv", "wmv", "h264", "264", "vob"];

/// Presence/size summary of a song folder's assets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SongAssets {
    pub song_dir_present: bool,
    pub melody1_present: bool,
    pub total_files: u64,
    pub total_bytes: u64,
    pub audio_bytes: u64,
    pub video_bytes: u64,
    pub audio_path: Option<PathBuf>,
    pub video_path: Option<PathBuf>,
}

pub fn scan_song_assets(export_root: &Path, song_id: u32) -> SongAssets {
    let song_dir = export_root.join(song_id.to_string());
    if !song_dir.is_dir() {
        return SongAssets::default();
    }

    let mut assets = SongAssets {
        song_dir_present: true,
        melody1_present: song_dir.join("melody_1.xml").is_file() || song_dir.join("MELODY_1.XML").is_file(),
        ..Default::default()
    };

    for entry in WalkDir::new(&song_dir).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let p = entry.path();
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        assets.total_files += 1;
        assets.total_bytes += size;

        let ext = p.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()).unwrap_or_default();
        let name_l = p.file_name().and_then(|n| n.to_str()).map(|n| n.to_lowercase()).unwrap_or_default();
        if (AUDIO_EXTS.contains(&ext.as_str()) || (name_l.contains("audio") && size > 0)) && size > assets.audio_bytes {
            assets.audio_bytes = size;
            assets.audio_path = Some(p.to_path_buf());
        }
        if (VIDEO_EXTS.contains(&ext.as_str()) || (name_l.contains("video") && size > 0)) && size > assets.video_bytes {
            assets.video_bytes = size;
            assets.video_path = Some(p.to_path_buf());
        }
    }
    assets
}

/// Title/artist/duration/year of one song as recorded in a source's catalog.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SongCatalogMeta {
    pub title: String,
    pub artist: String,
    pub duration_ms: Option<i64>,
    pub year: Option<String>,
}

fn parse_time_to_ms(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Some((m, sec)) = s.split_once(':') {
        let (m, sec) = (m.trim().parse::<i64>().ok()?, sec.trim().parse::<i64>().ok()?);
        return Some((m * 60 + sec) * 1000);
    }
    s.parse::<i64>().ok()
}

/// Pull one song's catalog metadata out of a source's best-bank songs XML.
pub fn read_song_catalog_meta(export_root: &Path, song_id: u32) -> Result<Option<SongCatalogMeta>> {
    let (_bank, songs_xml, acts_xml) = match best_bank_files(export_root, u32::MAX) {
        Some(t) => t,
        None => return Ok(None),
    };
    let act_map = crate::index::act_map_from_xml(&acts_xml).unwrap_or_default();

    let mut found: Option<SongCatalogMeta> = None;
    stream_elements(&songs_xml, "SONG", &mut |el| {
        if found.is_some() || el.parse_id() != Some(song_id) {
            return Ok(());
        }
        found = Some(SongCatalogMeta {
            title: crate::index::song_title(&el),
            artist: crate::index::song_artist(&el, &act_map),
            duration_ms: el
                .find_text_by_tags_ci(&["DURATION", "TIME", "LENGTH"])
                .and_then(|t| parse_time_to_ms(&t)),
            year: el
                .find_text_by_tags_ci(&["YEAR", "RELEASE_YEAR", "DATE"])
                .map(|t| t.trim().to_string()),
        });
        Ok(())
    })?;
    Ok(found)
}

const DURATION_TOLERANCE_MS: i64 = 250;
const SPAN_TOLERANCE_MS: i64 = 250;

/// Classifier working set: caches per-(label, song) scans so classifying a
/// whole conflict set stays linear in file reads.
pub struct ConflictAnalyzer<'a> {
    export_roots: &'a BTreeMap<String, PathBuf>,
    prober: Option<&'a dyn MediaProber>,
    assets_cache: HashMap<(String, u32), SongAssets>,
    meta_cache: HashMap<(String, u32), Option<SongCatalogMeta>>,
    stats_cache: HashMap<(String, u32), Option<MelodyStats>>,
}

fn is_base_label(label: &str) -> bool {
    label.trim().to_lowercase().starts_with("base")
}

impl<'a> ConflictAnalyzer<'a> {
    pub fn new(export_roots: &'a BTreeMap<String, PathBuf>, prober: Option<&'a dyn MediaProber>) -> Self {
        Self {
            export_roots,
            prober,
            assets_cache: HashMap::new(),
            meta_cache: HashMap::new(),
            stats_cache: HashMap::new(),
        }
    }

    fn assets(&mut self, label: &str, song_id: u32) -> SongAssets {
        let key = (label.to_string(), song_id);
        if let Some(a) = self.assets_cache.get(&key) {
            return a.clone();
        }
        let a = self
            .export_roots
            .get(label)
            .map(|root| scan_song_assets(root, song_id))
            .unwrap_or_default();
        self.assets_cache.insert(key, a.clone());
        a
    }

    fn meta(&mut self, label: &str, song_id: u32) -> Option<SongCatalogMeta> {
        let key = (label.to_string(), song_id);
        if let Some(m) = self.meta_cache.get(&key) {
            return m.clone();
        }
        let m = self
            .export_roots
            .get(label)
            .and_then(|root| read_song_catalog_meta(root, song_id).ok().flatten());
        self.meta_cache.insert(key, m.clone());
        m
    }

    fn stats(&mut self, label: &str, song_id: u32) -> Option<MelodyStats> {
        let key = (label.to_string(), song_id);
        if let Some(s) = self.stats_cache.get(&key) {
            return s.clone();
        }
        let s = self.export_roots.get(label).and_then(|root| melody_stats(&melody_path(root, song_id)));
        self.stats_cache.insert(key, s.clone());
        s
    }

    fn video_info(&mut self, label: &str, song_id: u32) -> Option<MediaInfo> {
        let prober = self.prober?;
        let path = self.assets(label, song_id).video_path?;
        prober.probe(&path, MediaKind::Video)
    }

    fn audio_info(&mut self, label: &str, song_id: u32) -> Option<MediaInfo> {
        let prober = self.prober?;
        let path = self.assets(label, song_id).audio_path?;
        prober.probe(&path, MediaKind::Audio)
    }

    /// Material differences between one pair of sources, ordered by cost.
    pub fn pair_diffs(&mut self, song_id: u32, occs: &[SongOccur], a: &str, b: &str) -> Vec<String> {
        let mut diffs: Vec<String> = Vec::new();
        if !self.export_roots.contains_key(a) || !self.export_roots.contains_key(b) {
            return vec!["missing export root".to_string()];
        }

        let fp_of = |label: &str| {
            occs.iter()
                .find(|o| o.source_label == label)
                .and_then(|o| o.melody1_fp.clone())
                .unwrap_or_default()
        };
        let (fpa, fpb) = (fp_of(a), fp_of(b));
        if !fpa.is_empty() && !fpb.is_empty() && fpa != fpb {
            diffs.push("melody fingerprint differs".to_string());
        }
        if fpa.is_empty() || fpb.is_empty() {
            diffs.push("melody fingerprint missing".to_string());
        }

        let meta_a = self.meta(a, song_id).unwrap_or_default();
        let meta_b = self.meta(b, song_id).unwrap_or_default();
        let (ta, tb) = (norm_ci(&meta_a.title), norm_ci(&meta_b.title));
        if !ta.is_empty() && !tb.is_empty() && ta != tb {
            diffs.push("title differs".to_string());
        }
        let (aa, ab) = (norm_ci(&meta_a.artist), norm_ci(&meta_b.artist));
        if !aa.is_empty() && !ab.is_empty() && aa != ab {
            diffs.push("artist differs".to_string());
        }
        if let (Some(da), Some(db)) = (meta_a.duration_ms, meta_b.duration_ms) {
            if (da - db).abs() > DURATION_TOLERANCE_MS {
                diffs.push("duration differs".to_string());
            }
        }
        if let (Some(ya), Some(yb)) = (&meta_a.year, &meta_b.year) {
            if !ya.is_empty() && !yb.is_empty() && ya != yb {
                diffs.push("year differs".to_string());
            }
        }

        let assets_a = self.assets(a, song_id);
        let assets_b = self.assets(b, song_id);
        if assets_a.melody1_present != assets_b.melody1_present {
            diffs.push("melody_1.xml presence differs".to_string());
        }
        if assets_a.total_bytes != assets_b.total_bytes {
            diffs.push("total size differs".to_string());
        }
        if assets_a.audio_bytes != assets_b.audio_bytes {
            diffs.push("audio differs".to_string());
        }
        if assets_a.video_bytes != assets_b.video_bytes {
            diffs.push("video differs".to_string());
        }

        let stats_a = self.stats(a, song_id);
        let stats_b = self.stats(b, song_id);
        if let (Some(sa), Some(sb)) = (&stats_a, &stats_b) {
            if sa.notes != sb.notes {
                diffs.push("note count differs".to_string());
            }
            if let (Some(pa), Some(pb)) = (sa.pitch_min, sb.pitch_min) {
                if pa != pb {
                    diffs.push("pitch min differs".to_string());
                }
            }
            if let (Some(pa), Some(pb)) = (sa.pitch_max, sb.pitch_max) {
                if pa != pb {
                    diffs.push("pitch max differs".to_string());
                }
            }
            if let (Some(sp_a), Some(sp_b)) = (sa.span_ms, sb.span_ms) {
                if (sp_a - sp_b).abs() > SPAN_TOLERANCE_MS {
                    diffs.push("melody span differs".to_string());
                }
            }
        }

        if !diffs.is_empty() {
            return diffs;
        }

        // Media-level diffs only apply when a prober is available, and only
        // once the cheap checks came back clean.
        if self.prober.is_some() {
            let (va, vb) = (self.video_info(a, song_id), self.video_info(b, song_id));
            if let (Some(va), Some(vb)) = (&va, &vb) {
                if (va.width, va.height) != (vb.width, vb.height) {
                    diffs.push("video resolution differs".to_string());
                }
                if va.fps_milli != vb.fps_milli {
                    diffs.push("video fps differs".to_string());
                }
            }
            let (au_a, au_b) = (self.audio_info(a, song_id), self.audio_info(b, song_id));
            if let (Some(au_a), Some(au_b)) = (&au_a, &au_b) {
                if au_a.channels != au_b.channels {
                    diffs.push("audio channels differs".to_string());
                }
                if au_a.sample_rate_hz != au_b.sample_rate_hz {
                    diffs.push("audio sample rate differs".to_string());
                }
            }
        }

        diffs
    }

    /// Classify a conflict as identical / effective / different with a short
    /// diff summary.
    pub fn classify_conflict(&mut self, song_id: u32, occs: &[SongOccur]) -> (ConflictClass, String) {
        let mut labels: Vec<String> = Vec::new();
        for o in occs {
            if !o.source_label.is_empty() && !labels.contains(&o.source_label) {
                labels.push(o.source_label.clone());
            }
        }
        if labels.len() < 2 {
            return (ConflictClass::Different, String::new());
        }

        let mut missing_fp = false;
        let mut fp_list: Vec<String> = Vec::new();
        for o in occs {
            let fp = o.melody1_fp.clone().unwrap_or_default();
            if fp.is_empty() {
                missing_fp = true;
            }
            fp_list.push(if fp.is_empty() { "MISSING".to_string() } else { fp });
        }
        let semantic_same = !missing_fp && fp_list.windows(2).all(|w| w[0] == w[1]);

        let a = labels[0].clone();
        let mut uniq: Vec<String> = Vec::new();
        for b in &labels[1..] {
            for d in self.pair_diffs(song_id, occs, &a, b) {
                if !d.is_empty() && !uniq.contains(&d) {
                    uniq.push(d);
                }
            }
        }

        if !semantic_same {
            let summary = uniq.iter().take(4).cloned().collect::<Vec<_>>().join("; ");
            return (ConflictClass::Different, summary);
        }

        let material: Vec<String> = uniq
            .into_iter()
            .filter(|d| d != "melody fingerprint differs" && d != "melody fingerprint missing")
            .collect();
        if !material.is_empty() {
            let summary = material.iter().take(4).cloned().collect::<Vec<_>>().join("; ");
            return (ConflictClass::Effective, summary);
        }

        (ConflictClass::Identical, String::new())
    }

    /// Conservative winner recommendation (only when obvious).
    pub fn recommend_winner(&mut self, song_id: u32, occs: &[SongOccur], class: ConflictClass) -> Option<(String, String)> {
        let mut labels: Vec<String> = Vec::new();
        for o in occs {
            if !o.source_label.is_empty() && !labels.contains(&o.source_label) {
                labels.push(o.source_label.clone());
            }
        }
        if labels.is_empty() {
            return None;
        }

        if class == ConflictClass::Identical {
            if labels.iter().any(|l| l == BASE_LABEL) {
                return Some((BASE_LABEL.to_string(), "identical duplicates; keep Base".to_string()));
            }
            return Some((labels[0].clone(), "identical duplicates".to_string()));
        }
        if class != ConflictClass::Effective {
            return None;
        }

        // Unique presence: exactly one source has video (or audio).
        let with_video: Vec<&String> = labels.iter().filter(|l| self.assets(l, song_id).video_bytes > 0).collect();
        if with_video.len() == 1 {
            return Some((with_video[0].clone(), "only one with video".to_string()));
        }
        let with_audio: Vec<&String> = labels.iter().filter(|l| self.assets(l, song_id).audio_bytes > 0).collect();
        if with_audio.len() == 1 {
            return Some((with_audio[0].clone(), "only one with audio".to_string()));
        }

        if labels.len() != 2 {
            return None;
        }
        let (a, b) = (labels[0].clone(), labels[1].clone());

        // Clearly higher video resolution.
        if let (Some(va), Some(vb)) = (self.video_info(&a, song_id), self.video_info(&b, song_id)) {
            let (area_a, area_b) = (va.pixel_count(), vb.pixel_count());
            if area_a > 0 && area_b > 0 {
                if area_a as f64 >= area_b as f64 * 1.5 {
                    return Some((a, format!("higher video resolution ({}x{} vs {}x{})", va.width, va.height, vb.width, vb.height)));
                }
                if area_b as f64 >= area_a as f64 * 1.5 {
                    return Some((b, format!("higher video resolution ({}x{} vs {}x{})", vb.width, vb.height, va.width, va.height)));
                }
            }
        }

        // Much larger video file.
        let (sa, sb) = (self.assets(&a, song_id).video_bytes, self.assets(&b, song_id).video_bytes);
        if sa > 0 && sb > 0 {
            if sa as f64 >= sb as f64 * 1.8 {
                return Some((a, "much larger video file".to_string()));
            }
            if sb as f64 >= sa as f64 * 1.8 {
                return Some((b, "much larger video file".to_string()));
            }
        }

        None
    }

    /// Sortable quality score; higher wins. The tuple order stays robust when
    /// no prober is configured (sizes still discriminate).
    pub fn quality_score(&mut self, song_id: u32, label: &str, position: usize) -> (u64, u64, u64, u64, u64, u8, i64) {
        let assets = self.assets(label, song_id);
        let info = self.video_info(label, song_id).unwrap_or_default();
        (
            info.pixel_count(),
            info.kbps as u64,
            info.fps_milli as u64,
            assets.video_bytes,
            assets.total_bytes,
            u8::from(is_base_label(label)),
            -(position as i64),
        )
    }

    /// Winner label for an effectively-identical duplicate by quality score.
    pub fn auto_pick_best_quality_label(&mut self, song_id: u32, occs: &[SongOccur]) -> Option<String> {
        let mut labels: Vec<String> = Vec::new();
        for o in occs {
            if !o.source_label.is_empty() && !labels.contains(&o.source_label) {
                labels.push(o.source_label.clone());
            }
        }
        if labels.len() < 2 {
            return None;
        }
        labels
            .iter()
            .enumerate()
            .map(|(i, l)| (self.quality_score(song_id, l, i), l.clone()))
            .max_by(|(sa, _), (sb, _)| sa.cmp(sb))
            .map(|(_, l)| l)
    }
}

/// Deterministic winner for an identical-class duplicate: prefer a Base-ish
/// label, else the first source in occurrence order.
pub fn auto_pick_winner_label(occs: &[SongOccur]) -> Option<String> {
    let mut labels: Vec<&str> = Vec::new();
    for o in occs {
        let lab = o.source_label.trim();
        if !lab.is_empty() && !labels.contains(&lab) {
            labels.push(lab);
        }
    }
    if labels.is_empty() {
        return None;
    }
    labels
        .iter()
        .find(|l| is_base_label(l))
        .or(labels.first())
        .map(|l| l.to_string())
}
