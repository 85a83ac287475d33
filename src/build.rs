/// End-to-end build orchestration: resolve inputs, optionally preflight,
/// plan, run the subset pipeline, then write the verification sidecars and
/// reports next to the output disc folder.
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Local;
use serde::Serialize;
use tracing::debug;

use crate::catalog::BASE_LABEL;
use crate::common::{format_seconds_hhmmss, norm_song_text, normalize_input_path, TOOL_NAME, VERSION};
use crate::error::{Result, SpcdbError};
use crate::index::{index_disc, load_songs_for_disc_cached, CacheStore};
use crate::layout::{resolve_input, ResolvedInput};
use crate::plan::{compute_dedupe_stats, format_preflight_summary, BuildPlan, DedupeStats};
use crate::progress::{CancelToken, ProgressEvent};
use crate::subset::{build_subset, SubsetOptions};
use crate::validate::{format_validate_report, validate_one_disc_from_export_root, DiscReport, Severity};

/// An expected-song row supplied by the session layer for output
/// verification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedSongRow {
    pub song_id: u32,
    pub title: String,
    pub artist: String,
    pub chosen_source: String,
    pub available_sources: Vec<String>,
}

/// Inputs to `run_build_subset`. Session state (selection, overrides,
/// expected rows) arrives here as immutable values; the engine never owns it.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub base_path: PathBuf,
    pub src_label_paths: Vec<(String, PathBuf)>,
    pub out_dir: PathBuf,
    pub selected_song_ids: BTreeSet<u32>,
    pub needed_donors: BTreeSet<String>,
    pub preferred_source_by_song_id: BTreeMap<u32, String>,
    pub song_sources_by_id: Option<BTreeMap<u32, Vec<String>>>,
    pub expected_song_rows: Option<Vec<ExpectedSongRow>>,
    pub preflight_validate: bool,
    pub block_on_errors: bool,
    pub allow_overwrite_output: bool,
    pub keep_backup_of_existing_output: bool,
    pub fast_update_existing_output: bool,
    pub target_version: u32,
}

impl BuildRequest {
    pub fn new(base_path: impl Into<PathBuf>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            src_label_paths: Vec::new(),
            out_dir: out_dir.into(),
            selected_song_ids: BTreeSet::new(),
            needed_donors: BTreeSet::new(),
            preferred_source_by_song_id: BTreeMap::new(),
            song_sources_by_id: None,
            expected_song_rows: None,
            preflight_validate: false,
            block_on_errors: false,
            allow_overwrite_output: false,
            keep_backup_of_existing_output: true,
            fast_update_existing_output: false,
            target_version: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportSource {
    pub label: String,
    pub path: PathBuf,
}

/// The build report persisted as `<name>_build_report.json`.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub tool: String,
    pub version: String,
    pub timestamp: String,
    pub elapsed_sec: f64,
    pub base_path: PathBuf,
    pub sources: Vec<ReportSource>,
    pub output_dir: PathBuf,
    pub selected_song_ids_count: u64,
    pub dedupe: DedupeStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preflight_plan: Option<BuildPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub song_diff: Option<SongDiff>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SongDiffFiles {
    pub expected_csv: PathBuf,
    pub built_csv: PathBuf,
    pub diff_csv: PathBuf,
}

/// Expected-vs-built song list comparison summary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SongDiff {
    pub expected_count: u64,
    pub built_count: u64,
    pub parse_ok: bool,
    pub missing_count: u64,
    pub extra_count: u64,
    pub meta_mismatch_count: u64,
    pub missing_ids_sample: Vec<u32>,
    pub extra_ids_sample: Vec<u32>,
    pub files: SongDiffFiles,
}

/// `<out parent>/<out name>_<suffix>`: reports live NEXT TO the disc
/// folder, never inside it.
fn sidecar_path(out_dir: &Path, suffix: &str) -> PathBuf {
    let name = out_dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "disc".to_string());
    out_dir.parent().unwrap_or(Path::new(".")).join(format!("{name}_{suffix}"))
}

fn write_preflight_summary(out_dir: &Path, text: &str) -> Result<PathBuf> {
    let rp = sidecar_path(out_dir, "preflight_summary.txt");
    if let Some(parent) = rp.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut payload = text.to_string();
    if !payload.ends_with('\n') {
        payload.push('\n');
    }
    fs::write(&rp, payload)?;
    Ok(rp)
}

fn csv_row(row: &ExpectedSongRow) -> [String; 5] {
    [
        row.song_id.to_string(),
        row.title.clone(),
        row.artist.clone(),
        row.chosen_source.clone(),
        row.available_sources.join(";"),
    ]
}

fn write_song_csv(path: &Path, rows: &[&ExpectedSongRow]) -> Result<()> {
    let mut w = csv::Writer::from_path(path)?;
    w.write_record(["song_id", "title", "artist", "chosen_source", "available_sources"])?;
    for row in rows {
        w.write_record(csv_row(row))?;
    }
    w.flush()?;
    Ok(())
}

/// Write expected/built song lists plus a diff CSV next to the output folder.
fn build_song_verification_sidecars(
    store: &CacheStore,
    req: &BuildRequest,
    log_cb: &mut dyn FnMut(&str),
) -> Result<SongDiff> {
    let out_dir = &req.out_dir;

    // Expected rows: prefer session-provided title/artist.
    let mut expected_by_id: BTreeMap<u32, ExpectedSongRow> = BTreeMap::new();
    if let Some(rows) = &req.expected_song_rows {
        for r in rows {
            if r.song_id == 0 {
                continue;
            }
            let mut rr = r.clone();
            rr.title = norm_song_text(&rr.title);
            rr.artist = norm_song_text(&rr.artist);
            if rr.chosen_source.trim().is_empty() {
                rr.chosen_source = BASE_LABEL.to_string();
            }
            expected_by_id.insert(rr.song_id, rr);
        }
    }
    for &sid in &req.selected_song_ids {
        let entry = expected_by_id.entry(sid).or_insert_with(|| ExpectedSongRow {
            song_id: sid,
            ..Default::default()
        });
        if entry.chosen_source.trim().is_empty() {
            entry.chosen_source = req
                .preferred_source_by_song_id
                .get(&sid)
                .cloned()
                .unwrap_or_else(|| BASE_LABEL.to_string());
        }
        if entry.available_sources.is_empty() {
            if let Some(sources) = &req.song_sources_by_id {
                entry.available_sources = sources.get(&sid).cloned().unwrap_or_default();
            }
        }
    }

    // Built rows: parse the output's songs XML.
    let mut built_by_id: BTreeMap<u32, ExpectedSongRow> = BTreeMap::new();
    let mut parse_ok = true;
    match index_disc(store, out_dir).and_then(|idx| load_songs_for_disc_cached(store, &idx)) {
        Ok(songs) => {
            for (sid, meta) in songs {
                let exp = expected_by_id.get(&sid);
                built_by_id.insert(
                    sid,
                    ExpectedSongRow {
                        song_id: sid,
                        title: norm_song_text(&meta.title),
                        artist: norm_song_text(&meta.artist),
                        chosen_source: exp.map(|e| e.chosen_source.clone()).unwrap_or_default(),
                        available_sources: exp.map(|e| e.available_sources.clone()).unwrap_or_default(),
                    },
                );
            }
        }
        Err(e) => {
            debug!("song verification: output index failed: {e}");
            parse_ok = false;
        }
    }

    let expected_csv = sidecar_path(out_dir, "expected_songs.csv");
    let built_csv = sidecar_path(out_dir, "built_songs.csv");
    let diff_csv = sidecar_path(out_dir, "song_diff.csv");
    write_song_csv(&expected_csv, &expected_by_id.values().collect::<Vec<_>>())?;
    write_song_csv(&built_csv, &built_by_id.values().collect::<Vec<_>>())?;

    let expected_ids: BTreeSet<u32> = expected_by_id.keys().copied().collect();
    let built_ids: BTreeSet<u32> = built_by_id.keys().copied().collect();
    let missing_ids: Vec<u32> = expected_ids.difference(&built_ids).copied().collect();
    let extra_ids: Vec<u32> = built_ids.difference(&expected_ids).copied().collect();

    let mut w = csv::Writer::from_path(&diff_csv)?;
    w.write_record([
        "status",
        "song_id",
        "expected_title",
        "expected_artist",
        "built_title",
        "built_artist",
        "chosen_source",
        "available_sources",
    ])?;
    let mut mismatch_n = 0u64;
    for sid in expected_ids.union(&built_ids) {
        let exp = expected_by_id.get(sid);
        let built = built_by_id.get(sid);
        let (status, row) = match (exp, built) {
            (Some(e), None) => ("MISSING_IN_OUTPUT", [e.title.clone(), e.artist.clone(), String::new(), String::new(), e.chosen_source.clone(), e.available_sources.join(";")]),
            (None, Some(b)) => ("EXTRA_IN_OUTPUT", [String::new(), String::new(), b.title.clone(), b.artist.clone(), b.chosen_source.clone(), b.available_sources.join(";")]),
            (Some(e), Some(b)) => {
                let title_mismatch = !e.title.is_empty() && !b.title.is_empty() && e.title != b.title;
                let artist_mismatch = !e.artist.is_empty() && !b.artist.is_empty() && e.artist != b.artist;
                let status = if title_mismatch || artist_mismatch {
                    mismatch_n += 1;
                    "META_MISMATCH"
                } else {
                    "OK"
                };
                (status, [e.title.clone(), e.artist.clone(), b.title.clone(), b.artist.clone(), e.chosen_source.clone(), e.available_sources.join(";")])
            }
            (None, None) => continue,
        };
        let mut record = vec![status.to_string(), sid.to_string()];
        record.extend(row);
        w.write_record(&record)?;
    }
    w.flush()?;

    log_cb(&format!(
        "[build] Song list diff: expected={} built={} missing={} extra={} mismatches={}",
        expected_ids.len(),
        built_ids.len(),
        missing_ids.len(),
        extra_ids.len(),
        mismatch_n
    ));
    log_cb(&format!(
        "[build] Wrote song list CSVs: {}, {}, {}",
        expected_csv.file_name().unwrap_or_default().to_string_lossy(),
        built_csv.file_name().unwrap_or_default().to_string_lossy(),
        diff_csv.file_name().unwrap_or_default().to_string_lossy()
    ));

    Ok(SongDiff {
        expected_count: expected_ids.len() as u64,
        built_count: built_ids.len() as u64,
        parse_ok,
        missing_count: missing_ids.len() as u64,
        extra_count: extra_ids.len() as u64,
        meta_mismatch_count: mismatch_n,
        missing_ids_sample: missing_ids.into_iter().take(100).collect(),
        extra_ids_sample: extra_ids.into_iter().take(100).collect(),
        files: SongDiffFiles {
            expected_csv,
            built_csv,
            diff_csv,
        },
    })
}

/// Label sort used in report text: Base first, then case-insensitive.
fn report_label_order(keys: &BTreeMap<String, u64>) -> Vec<&String> {
    let mut labels: Vec<&String> = keys.keys().collect();
    labels.sort_by_key(|k| (k.as_str() != BASE_LABEL, k.to_lowercase()));
    labels
}

/// Human-readable rendering of the build report JSON.
pub fn format_build_report_text(report: &BuildReport) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push(format!("{} - Build report", report.tool));
    lines.push(format!("Version: {}    Time: {}", report.version, report.timestamp));
    lines.push(format!("Output: {}", report.output_dir.display()));
    lines.push(String::new());
    lines.push(format!("Included songs: {}", report.selected_song_ids_count));

    if let Some(plan) = &report.preflight_plan {
        lines.push("Plan:".to_string());
        if !plan.donor_order.is_empty() {
            lines.push(format!("  Donor order: {}", plan.donor_order.join(", ")));
        }
        if !plan.planned_counts.is_empty() {
            lines.push("  Song winners (count):".to_string());
            for k in report_label_order(&plan.planned_counts) {
                lines.push(format!("    - {k}: {}", plan.planned_counts[k]));
            }
        }
        if !plan.override_counts.is_empty() {
            lines.push("  Overrides (preferred != Base):".to_string());
            for (k, v) in &plan.override_counts {
                lines.push(format!("    - {k}: {v}"));
            }
        }
        if !plan.implicit_counts.is_empty() {
            lines.push("  Implicit donor winners (not overrides):".to_string());
            for (k, v) in &plan.implicit_counts {
                lines.push(format!("    - {k}: {v}"));
            }
        }
        if !plan.missing_in_all_sources.is_empty() {
            let ids: Vec<String> = plan.missing_in_all_sources.iter().take(50).map(|x| x.to_string()).collect();
            lines.push(format!("  Missing in all sources (IDs): {}", ids.join(", ")));
        }
        if !plan.mismatched_preferred_source.is_empty() {
            let ids: Vec<String> = plan.mismatched_preferred_source.iter().take(50).map(|x| x.to_string()).collect();
            lines.push(format!("  Preferred source doesn't contain song (IDs): {}", ids.join(", ")));
        }
        if !plan.unused_needed_donors.is_empty() {
            lines.push(format!("  Unused donors (no songs routed): {}", plan.unused_needed_donors.join(", ")));
        }
        lines.push(String::new());
    }

    lines.push("Duplicates:".to_string());
    lines.push(format!("  Songs with duplicates: {}", report.dedupe.songs_with_duplicates));
    lines.push(format!("  Extra occurrences hidden: {}", report.dedupe.extra_occurrences_hidden));
    if !report.dedupe.winner_counts.is_empty() {
        lines.push("  Winners (count):".to_string());
        for k in report_label_order(&report.dedupe.winner_counts) {
            lines.push(format!("    - {k}: {}", report.dedupe.winner_counts[k]));
        }
    }
    lines.push(String::new());

    if let Some(sd) = &report.song_diff {
        lines.push("Song list verification:".to_string());
        lines.push(format!("  Expected (selected): {}", sd.expected_count));
        lines.push(format!("  Built (songs.xml): {}", sd.built_count));
        lines.push(format!("  Missing: {}", sd.missing_count));
        lines.push(format!("  Extra: {}", sd.extra_count));
        if sd.meta_mismatch_count > 0 {
            lines.push(format!("  Metadata mismatches: {}", sd.meta_mismatch_count));
        }
        lines.push("  CSVs:".to_string());
        for p in [&sd.files.expected_csv, &sd.files.built_csv, &sd.files.diff_csv] {
            lines.push(format!("    - {}", p.file_name().unwrap_or_default().to_string_lossy()));
        }
        lines.push(String::new());
    }

    lines.push(format!("Elapsed: {}", format_seconds_hhmmss(report.elapsed_sec)));
    format!("{}\n", lines.join("\n").trim_end())
}

fn write_transfer_notes(req: &BuildRequest) -> Result<PathBuf> {
    let out_dir = &req.out_dir;
    let rp = sidecar_path(out_dir, "transfer_notes.txt");
    let name = out_dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "disc".to_string());

    let mut lines: Vec<String> = Vec::new();
    lines.push(format!("{TOOL_NAME} - Transfer notes"));
    lines.push(String::new());
    lines.push(format!("Built disc folder: {}", out_dir.display()));
    lines.push(String::new());
    lines.push("This tool builds an extracted PS3 disc folder (no zip).".to_string());
    lines.push("Copy the entire built disc folder as-is to your extracted games folder on your internal (via FTP) or external drive.".to_string());
    lines.push(String::new());
    lines.push("Checklist:".to_string());
    lines.push("  - Keep the folder structure intact (PS3_GAME / PS3_DISC.SFB etc).".to_string());
    lines.push("  - If you use a USB/network transfer, ensure the destination filesystem supports large files.".to_string());
    lines.push(String::new());
    lines.push("Build inputs:".to_string());
    lines.push(format!("  Base: {}", req.base_path.display()));
    lines.push("  Sources:".to_string());
    lines.push(format!("    - Base: {}", req.base_path.display()));
    for (lab, sp) in &req.src_label_paths {
        lines.push(format!("    - {lab}: {}", sp.display()));
    }
    lines.push(format!("  Included songs: {}", req.selected_song_ids.len()));
    lines.push(String::new());
    lines.push("Extractor note (packed discs):".to_string());
    lines.push("  If you added packed/unextracted discs, you must configure the external extractor executable,".to_string());
    lines.push("  then Extract those discs before they can contribute songs to a build.".to_string());
    lines.push(String::new());
    lines.push("Related files (next to the disc folder):".to_string());
    for suffix in [
        "preflight_summary.txt",
        "build_report.json",
        "build_report.txt",
        "expected_songs.csv",
        "built_songs.csv",
        "song_diff.csv",
    ] {
        lines.push(format!("  - {name}_{suffix}"));
    }
    lines.push(format!("  - {name}_transfer_notes.txt (this file)"));
    lines.push(String::new());

    fs::write(&rp, format!("{}\n", lines.join("\n").trim_end()))?;
    Ok(rp)
}

/// Resolve inputs, optionally validate, then build a subset into
/// `req.out_dir`. The caller provides a log sink, an optional report sink for
/// the preflight text, an optional structured progress sink, and a
/// cancellation token.
pub fn run_build_subset(
    store: &CacheStore,
    req: &BuildRequest,
    log_cb: &mut dyn FnMut(&str),
    mut preflight_report_cb: Option<&mut dyn FnMut(&str)>,
    mut progress_cb: Option<&mut dyn FnMut(&ProgressEvent)>,
    cancel_token: Option<&CancelToken>,
) -> Result<()> {
    let default_token = CancelToken::new();
    let cancel = cancel_token.unwrap_or(&default_token);
    cancel.raise_if_cancelled()?;

    // Resolved inputs own any scratch dirs; keeping them in scope until
    // return guarantees release on all exit paths.
    let base_ri = resolve_input(&req.base_path.to_string_lossy())?;
    let base_norm = normalize_input_path(&base_ri.original.to_string_lossy());

    let mut resolved_sources: Vec<(String, PathBuf, ResolvedInput)> = Vec::new();
    for (lab, sp) in &req.src_label_paths {
        cancel.raise_if_cancelled()?;
        match resolve_input(&sp.to_string_lossy()) {
            Ok(ri) => {
                // De-duplicate: a donor that is really the base contributes
                // nothing and would fight the copy pipeline.
                if normalize_input_path(&ri.original.to_string_lossy()) == base_norm {
                    continue;
                }
                resolved_sources.push((lab.clone(), sp.clone(), ri));
            }
            Err(e) => {
                log_cb(&format!("[preflight] WARN: Could not resolve source '{lab}': {e}"));
            }
        }
    }

    if req.preflight_validate {
        cancel.raise_if_cancelled()?;
        let mode = if req.block_on_errors { " (block on Errors)..." } else { " (log-only)..." };
        log_cb(&format!("[preflight] Validate-before-build: running disc checks{mode}"));

        let mut ok_n = 0u32;
        let mut warn_n = 0u32;
        let mut fail_n = 0u32;
        let mut results: Vec<DiscReport> = Vec::new();

        let mut tally = |r: DiscReport, log_cb: &mut dyn FnMut(&str)| {
            match r.severity {
                Severity::Ok => ok_n += 1,
                Severity::Warn => warn_n += 1,
                Severity::Fail => fail_n += 1,
            }
            log_cb(&format!(
                "[preflight] {}: {} ({}E/{}W)",
                r.label,
                r.severity.as_str(),
                r.errors.len(),
                r.warnings.len()
            ));
            if r.severity == Severity::Fail {
                for it in r.errors.iter().take(2) {
                    log_cb(&format!("[preflight]   ERROR: {}", it.message));
                    log_cb(&format!("[preflight]   Fix: {}", it.fix));
                }
            }
            results.push(r);
        };

        cancel.raise_if_cancelled()?;
        let r_base = validate_one_disc_from_export_root(
            store,
            BASE_LABEL,
            &req.base_path,
            &base_ri.export_root,
            base_ri.kind.as_str(),
            &base_ri.warnings,
        );
        tally(r_base, &mut *log_cb);

        for (lab, sp, ri) in &resolved_sources {
            cancel.raise_if_cancelled()?;
            let r = validate_one_disc_from_export_root(store, lab, sp, &ri.export_root, ri.kind.as_str(), &ri.warnings);
            tally(r, &mut *log_cb);
        }
        drop(tally);

        let report_text = format_validate_report(&results, true);
        if let Some(cb) = preflight_report_cb.as_deref_mut() {
            cb(&report_text);
        }

        let any_fail = fail_n > 0;
        if req.block_on_errors && any_fail {
            log_cb(&format!(
                "[preflight] Done. OK={ok_n}, WARN={warn_n}, FAIL={fail_n}. -> BUILD BLOCKED (errors present)"
            ));
            log_cb("================ BUILD BLOCKED ================");
            log_cb("[preflight] Fix the ERRORs above, then run Build again (or disable blocking).");
            log_cb("[preflight] Tip: the full preflight report was published to the report sink.");
            return Err(SpcdbError::Blocked(
                "Preflight validation found Errors (FAIL). See the log for details.".to_string(),
            ));
        }
        log_cb(&format!("[preflight] Done. OK={ok_n}, WARN={warn_n}, FAIL={fail_n}."));
        cancel.raise_if_cancelled()?;
    }

    // Donors actually needed for this build, in declared order.
    let src_ris: Vec<(String, &ResolvedInput)> = resolved_sources
        .iter()
        .filter(|(lab, _, _)| req.needed_donors.contains(lab))
        .map(|(lab, _, ri)| (lab.clone(), ri))
        .collect();
    let donor_order: Vec<String> = src_ris.iter().map(|(lab, _)| lab.clone()).collect();

    // Plan summary (written next to the output folder and echoed to the log).
    let (summary_text, summary_log_lines, preflight_plan) = format_preflight_summary(
        &req.out_dir,
        &req.selected_song_ids,
        &req.needed_donors,
        &req.preferred_source_by_song_id,
        req.song_sources_by_id.as_ref(),
        &donor_order,
    );
    for ln in &summary_log_lines {
        log_cb(&format!("[preflight] {ln}"));
    }
    match write_preflight_summary(&req.out_dir, &summary_text) {
        Ok(rp) => log_cb(&format!("[preflight] Wrote preflight summary: {}", rp.display())),
        Err(e) => debug!("preflight summary write failed: {e}"),
    }

    // Effective winners resolve the plan (explicit preference, else Base,
    // else first donor carrying the song; unclaimed songs route to Base).
    let winners: BTreeMap<u32, String> = req
        .selected_song_ids
        .iter()
        .map(|&sid| {
            let w = BuildPlan::planned_winner(
                sid,
                &req.preferred_source_by_song_id,
                req.song_sources_by_id.as_ref(),
                &donor_order,
            );
            (sid, w)
        })
        .collect();

    let opts = SubsetOptions {
        target_version: req.target_version,
        allow_overwrite: req.allow_overwrite_output,
        keep_backup: req.keep_backup_of_existing_output,
        fast_update: req.fast_update_existing_output,
    };

    let t0 = Instant::now();
    {
        let mut bridge = |ev: &ProgressEvent| match progress_cb.as_deref_mut() {
            Some(cb) => cb(ev),
            None => {
                let line = match (ev.current, ev.total) {
                    (Some(c), Some(t)) => format!("[build] {}: {} ({c}/{t})", ev.phase, ev.message),
                    _ => format!("[build] {}: {}", ev.phase, ev.message),
                };
                log_cb(&line);
            }
        };
        build_subset(
            &base_ri,
            &src_ris,
            &req.out_dir,
            &req.selected_song_ids,
            &winners,
            &opts,
            &mut bridge,
            cancel,
        )?;
    }
    let elapsed_sec = t0.elapsed().as_secs_f64();

    // Expected/built song lists and a diff CSV (helps spot copy issues).
    let song_diff = match build_song_verification_sidecars(store, req, log_cb) {
        Ok(sd) => Some(sd),
        Err(e) => {
            debug!("song verification sidecars failed: {e}");
            None
        }
    };

    let report = BuildReport {
        tool: TOOL_NAME.to_string(),
        version: VERSION.to_string(),
        timestamp: Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        elapsed_sec,
        base_path: req.base_path.clone(),
        sources: req
            .src_label_paths
            .iter()
            .map(|(label, path)| ReportSource {
                label: label.clone(),
                path: path.clone(),
            })
            .collect(),
        output_dir: req.out_dir.clone(),
        selected_song_ids_count: req.selected_song_ids.len() as u64,
        dedupe: compute_dedupe_stats(
            &req.selected_song_ids,
            &req.preferred_source_by_song_id,
            req.song_sources_by_id.as_ref(),
        ),
        preflight_plan: Some(preflight_plan),
        song_diff,
    };

    let json_path = sidecar_path(&req.out_dir, "build_report.json");
    fs::write(&json_path, serde_json::to_string_pretty(&report)?)?;
    log_cb(&format!("[build] Wrote build report: {}", json_path.display()));

    let text_path = sidecar_path(&req.out_dir, "build_report.txt");
    fs::write(&text_path, format_build_report_text(&report))?;
    log_cb(&format!("[build] Wrote build report (text): {}", text_path.display()));

    let notes_path = write_transfer_notes(req)?;
    log_cb(&format!("[build] Wrote transfer notes: {}", notes_path.display()));

    Ok(())
}
