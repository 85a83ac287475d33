/// Melody fingerprinting and melody statistics.
///
/// The fingerprint is a stable semantic hash over canonicalized note/marker
/// events derived from a streaming parse of `melody_1.xml`. Two files with
/// the same musical content hash identically regardless of whitespace,
/// attribute order, or namespace prefixes.
use std::path::Path;

use tracing::debug;

use crate::common::sha1_hex;
use crate::error::Result;
use crate::xmlread::{stream_elements_with_header, XmlElem};

/// Beats represented by one resolution unit. Unknown words fall back to a
/// demisemiquaver.
fn resolution_beats(word: &str) -> f64 {
    match word.trim().to_lowercase().as_str() {
        "semibreve" => 4.0,
        "minim" => 2.0,
        "crotchet" => 1.0,
        "quaver" => 0.5,
        "semiquaver" => 0.25,
        "demisemiquaver" => 0.125,
        "hemidemisemiquaver" => 0.0625,
        _ => 0.125,
    }
}

const DEFAULT_TEMPO: f64 = 120.0;
/// Nested marker delays at or below this raw value are milliseconds; larger
/// values are already note units. Preserved exactly for fingerprint
/// stability across versions.
const MARKER_DELAY_MS_CUTOFF: f64 = 100000.0;

fn attr_f64(el: &XmlElem, keys: &[&str]) -> Option<f64> {
    el.attr_ci(keys).and_then(|v| v.trim().parse().ok())
}

fn attr_i64(el: &XmlElem, keys: &[&str]) -> Option<i64> {
    el.attr_ci(keys).and_then(|v| v.trim().parse().ok())
}

struct EventWalk {
    tempo: f64,
    unit_ms: f64,
    pos_units: f64,
    events: Vec<String>,
}

impl EventWalk {
    fn new() -> Self {
        Self {
            tempo: DEFAULT_TEMPO,
            unit_ms: 60000.0 / DEFAULT_TEMPO * 0.125,
            pos_units: 0.0,
            events: Vec::new(),
        }
    }

    fn set_header(&mut self, melody: &XmlElem) {
        self.tempo = attr_f64(melody, &["Tempo"]).filter(|t| *t > 0.0).unwrap_or(DEFAULT_TEMPO);
        let beats = resolution_beats(melody.attr_ci(&["Resolution"]).unwrap_or(""));
        self.unit_ms = 60000.0 / self.tempo * beats;
        self.events.push(format!("T{:.4};R{beats:.4}", self.tempo));
    }

    fn visit_sentence(&mut self, sentence: &XmlElem) {
        for child in &sentence.children {
            let delay = attr_f64(child, &["Delay"]).unwrap_or(0.0);
            self.pos_units += delay;
            if child.name_is("NOTE") {
                let duration = attr_f64(child, &["Duration"]).unwrap_or(0.0);
                let midi = attr_i64(child, &["MidiNote", "Pitch"]).unwrap_or(0);
                let lyric = child.attr_ci(&["Lyric"]).unwrap_or("").trim().to_string();
                self.events.push(format!("N:{:.4}:{duration:.4}:{midi}:{lyric}", self.pos_units));
                self.visit_note_markers(child, self.pos_units);
                self.pos_units += duration;
            } else {
                self.events.push(format!("M:{}:{:.4}", child.name.to_uppercase(), self.pos_units));
            }
        }
    }

    fn visit_note_markers(&mut self, note: &XmlElem, note_pos: f64) {
        for m in &note.children {
            if !m.name.to_uppercase().starts_with("MARKER") {
                continue;
            }
            let raw_delay = attr_f64(m, &["Delay"]).unwrap_or(0.0);
            let offset_units = if raw_delay <= MARKER_DELAY_MS_CUTOFF {
                if self.unit_ms > 0.0 {
                    raw_delay / self.unit_ms
                } else {
                    0.0
                }
            } else {
                raw_delay
            };
            self.events
                .push(format!("M:{}:{:.4}", m.name.to_uppercase(), note_pos + offset_units));
        }
    }
}

fn melody_events(path: &Path) -> Result<Vec<String>> {
    let mut walk = EventWalk::new();
    let mut header_attrs: Option<XmlElem> = None;
    let mut sentences: Vec<XmlElem> = Vec::new();
    stream_elements_with_header(
        path,
        "MELODY",
        "SENTENCE",
        &mut |melody| header_attrs = Some(melody.clone()),
        &mut |sentence| {
            sentences.push(sentence);
            Ok(())
        },
    )?;
    if let Some(melody) = header_attrs {
        walk.set_header(&melody);
    } else {
        walk.events.push(format!("T{DEFAULT_TEMPO:.4};R0.1250"));
    }
    for s in &sentences {
        walk.visit_sentence(s);
    }
    Ok(walk.events)
}

/// Semantic fingerprint of a melody file. None when the file is missing or
/// unparseable (callers demote that to a conflict-classification signal).
pub fn melody_fingerprint_file(path: &Path) -> Option<String> {
    if !path.is_file() {
        return None;
    }
    match melody_events(path) {
        Ok(events) => Some(sha1_hex(&events.join(";"))),
        Err(e) => {
            debug!("melody fingerprint failed for {}: {e}", path.display());
            None
        }
    }
}

/// Aggregate statistics over a melody's notes, used for material-diff
/// comparisons between duplicate songs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MelodyStats {
    pub notes: u64,
    pub pitch_min: Option<i64>,
    pub pitch_max: Option<i64>,
    pub avg_pitch: Option<f64>,
    pub span_ms: Option<i64>,
    pub density_notes_per_sec: Option<f64>,
    pub longest_note_ms: i64,
    pub coverage_pct: Option<f64>,
}

/// Streaming melody stats. None when the file is missing or unreadable.
pub fn melody_stats(path: &Path) -> Option<MelodyStats> {
    if !path.is_file() {
        return None;
    }

    let mut walk = EventWalk::new();
    let mut header_attrs: Option<XmlElem> = None;
    let mut notes: Vec<(f64, f64, i64)> = Vec::new(); // (start_units, dur_units, pitch)
    let mut sentences: Vec<XmlElem> = Vec::new();
    let parsed = stream_elements_with_header(
        path,
        "MELODY",
        "SENTENCE",
        &mut |melody| header_attrs = Some(melody.clone()),
        &mut |sentence| {
            sentences.push(sentence);
            Ok(())
        },
    );
    if let Err(e) = parsed {
        debug!("melody stats parse failed for {}: {e}", path.display());
        return None;
    }
    if let Some(melody) = &header_attrs {
        walk.set_header(melody);
    }
    let unit_ms = walk.unit_ms;
    let mut pos = 0.0f64;
    for sentence in &sentences {
        for child in &sentence.children {
            pos += attr_f64(child, &["Delay"]).unwrap_or(0.0);
            if child.name_is("NOTE") {
                let duration = attr_f64(child, &["Duration"]).unwrap_or(0.0);
                let pitch = attr_i64(child, &["MidiNote", "Pitch"]).unwrap_or(0);
                notes.push((pos, duration, pitch));
                pos += duration;
            }
        }
    }

    if notes.is_empty() {
        return Some(MelodyStats::default());
    }

    let to_ms = |units: f64| (units * unit_ms).round() as i64;
    let mut stats = MelodyStats {
        notes: notes.len() as u64,
        ..Default::default()
    };

    let mut pitch_sum = 0i64;
    let mut t_min = f64::MAX;
    let mut t_max_end = f64::MIN;
    let mut longest = 0.0f64;
    let mut intervals: Vec<(i64, i64)> = Vec::new();
    for &(start, dur, pitch) in &notes {
        pitch_sum += pitch;
        stats.pitch_min = Some(stats.pitch_min.map_or(pitch, |p| p.min(pitch)));
        stats.pitch_max = Some(stats.pitch_max.map_or(pitch, |p| p.max(pitch)));
        t_min = t_min.min(start);
        t_max_end = t_max_end.max(start + dur);
        longest = longest.max(dur);
        if dur > 0.0 {
            intervals.push((to_ms(start), to_ms(start + dur)));
        }
    }

    stats.avg_pitch = Some(pitch_sum as f64 / notes.len() as f64);
    stats.longest_note_ms = to_ms(longest);
    let span_ms = (to_ms(t_max_end) - to_ms(t_min)).max(0);
    stats.span_ms = Some(span_ms);
    if span_ms > 0 {
        stats.density_notes_per_sec = Some(notes.len() as f64 / (span_ms as f64 / 1000.0));
        // Merge overlapping intervals to measure sung coverage of the span.
        intervals.sort_unstable();
        let mut covered = 0i64;
        let (mut cur_s, mut cur_e) = intervals[0];
        for &(s, e) in &intervals[1..] {
            if s <= cur_e {
                cur_e = cur_e.max(e);
            } else {
                covered += (cur_e - cur_s).max(0);
                cur_s = s;
                cur_e = e;
            }
        }
        covered += (cur_e - cur_s).max(0);
        stats.coverage_pct = Some(covered as f64 / span_ms as f64 * 100.0);
    }

    Some(stats)
}
