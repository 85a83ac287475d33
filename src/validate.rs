/// Per-disc validation with stable issue codes, severity rollup, and the
/// shared report text used for both standalone validation and build
/// preflight.
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;

use crate::common::VERSION;
use crate::error::{Result, SpcdbError};
use crate::index::{index_disc, load_songs_for_disc_cached, CacheStore};
use crate::inspect::{covers_song_to_page, inspect_export, minimal_export_scan, scan_missing_or_corrupt_media, texture_page_exists};
use crate::layout::resolve_input;
use crate::progress::CancelToken;

pub const MIN_MEDIA_BYTES: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportItem {
    pub code: String,
    pub message: String,
    pub fix: String,
}

impl ReportItem {
    fn new(code: &str, message: impl Into<String>, fix: &str) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            fix: fix.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Ok,
    Warn,
    Fail,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Ok => "OK",
            Severity::Warn => "WARN",
            Severity::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoversInfo {
    pub covers: u64,
    pub unique_pages: u64,
    pub missing_pages: u64,
}

/// Structured validation result for one disc.
#[derive(Debug, Clone, Serialize)]
pub struct DiscReport {
    pub label: String,
    pub input_path: PathBuf,
    pub ok: bool,
    pub severity: Severity,
    pub kind: String,
    pub resolved_root: PathBuf,
    pub export_root: PathBuf,
    pub product: String,
    pub summary: String,
    pub errors: Vec<ReportItem>,
    pub warnings: Vec<ReportItem>,
    pub missing_refs: Vec<String>,
    pub counts: BTreeMap<String, u64>,
    pub covers: CoversInfo,
}

impl DiscReport {
    fn empty(label: &str, input_path: &Path) -> Self {
        Self {
            label: label.to_string(),
            input_path: input_path.to_path_buf(),
            ok: false,
            severity: Severity::Fail,
            kind: String::new(),
            resolved_root: PathBuf::new(),
            export_root: PathBuf::new(),
            product: String::new(),
            summary: String::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            missing_refs: Vec::new(),
            counts: BTreeMap::new(),
            covers: CoversInfo::default(),
        }
    }

    fn rollup(&mut self) {
        if !self.errors.is_empty() {
            self.severity = Severity::Fail;
            self.ok = false;
        } else if !self.warnings.is_empty() {
            self.severity = Severity::Warn;
            self.ok = true;
        } else {
            self.severity = Severity::Ok;
            self.ok = true;
        }
        let songs_xml = self.counts.get("songs_xml_files").copied().unwrap_or(0);
        let banks = self.counts.get("banks_from_songs_xml").copied().unwrap_or(0);
        let tex = self.counts.get("texture_pages").copied().unwrap_or(0);
        self.summary = format!(
            "songs_xml={songs_xml}, banks={banks}, textures={tex}, missing_refs={}, missing_cover_pages={}",
            self.missing_refs.len(),
            self.covers.missing_pages
        );
    }
}

/// A validation pass that itself blew up is reported as a WARN, never a FAIL.
pub fn warn_exception_report(label: &str, input_path: &Path, msg: &str) -> DiscReport {
    let mut res = DiscReport::empty(label, input_path);
    res.severity = Severity::Warn;
    res.ok = true;
    res.summary = "Validation failed (exception).".to_string();
    res.warnings.push(ReportItem::new(
        "VALIDATE_EXCEPTION",
        msg,
        "Check the disc path / Export folder and try again.",
    ));
    res
}

fn classify_layout_warning(res: &mut DiscReport, w: &str) {
    let lw = w.to_lowercase();
    if lw.contains("export folder name") || lw.contains("casing") {
        res.warnings.push(ReportItem::new(
            "CASING",
            w,
            "Rename folders to match: FileSystem/Export, and Export/textures (textures lowercase).",
        ));
    } else if lw.contains("no textures folder found") {
        res.warnings.push(ReportItem::new(
            "NO_TEXTURES",
            w,
            "For real discs/output, ensure Export/textures exists and contains page_*.jpg.",
        ));
    } else if lw.contains("no config.xml") {
        res.warnings.push(ReportItem::new(
            "NO_CONFIG",
            w,
            "If this should be a full disc, re-extract the starting pack so Export/config.xml exists.",
        ));
    } else {
        res.warnings.push(ReportItem::new(
            "LAYOUT",
            w,
            "Review the folder layout under Export and re-extract if needed.",
        ));
    }
}

fn show_ids(ids: &[u32], limit: usize) -> String {
    let shown: Vec<String> = ids.iter().take(limit).map(|x| x.to_string()).collect();
    let more = if ids.len() > limit {
        format!(" (+{} more)", ids.len() - limit)
    } else {
        String::new()
    };
    format!("{}{more}", shown.join(", "))
}

/// Validate a disc using an already-resolved export root (avoids
/// re-resolving inputs during preflight).
pub fn validate_one_disc_from_export_root(
    store: &CacheStore,
    label: &str,
    input_path: &Path,
    export_root: &Path,
    kind: &str,
    layout_warnings: &[String],
) -> DiscReport {
    let mut res = DiscReport::empty(label, input_path);
    res.kind = kind.to_string();
    res.export_root = export_root.to_path_buf();

    if !export_root.exists() {
        res.errors.push(ReportItem::new(
            "EXPORT_MISSING",
            format!("Export folder does not exist: {}", export_root.display()),
            "Re-extract the disc or fix the selected path so Export exists.",
        ));
        res.summary = "Export folder missing.".to_string();
        return res;
    }

    for w in layout_warnings {
        classify_layout_warning(&mut res, w);
    }

    match inspect_export(export_root) {
        Ok(report) => {
            res.counts = report.counts.clone();
            res.product = report.product_desc.clone().or(report.product_code.clone()).unwrap_or_default();
            res.missing_refs = report.missing_refs.clone();
            for w in &report.warnings {
                res.warnings.push(ReportItem::new(
                    "INSPECT",
                    w,
                    "Re-extract if this looks wrong; partial donors may be OK.",
                ));
            }
        }
        Err(SpcdbError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            res.warnings.push(ReportItem::new(
                "MISSING_CONFIG_XML",
                e.to_string(),
                "If this should be a full disc, re-extract the starting pack so Export/config.xml exists. For XML-only donors this can be OK.",
            ));
            res.counts = minimal_export_scan(export_root);
        }
        Err(e) => {
            res.errors.push(ReportItem::new(
                "INSPECT_FAILED",
                format!("Inspect failed: {e}"),
                "Re-extract the disc (starting pack) and try again.",
            ));
            res.summary = "Inspect failed.".to_string();
            return res;
        }
    }

    if !res.missing_refs.is_empty() {
        let shown: Vec<&str> = res.missing_refs.iter().take(6).map(|s| s.as_str()).collect();
        let more = if res.missing_refs.len() > 6 {
            format!(" (+{} more)", res.missing_refs.len() - 6)
        } else {
            String::new()
        };
        res.warnings.push(ReportItem::new(
            "MISSING_REFERENCED_FILES",
            format!("Missing referenced files: {}{more}", shown.join(", ")),
            "Re-extract the disc and ensure the referenced files exist under Export (some partial donors may omit them).",
        ));
    }

    // Covers/pages check (best-effort).
    let song_to_page = covers_song_to_page(export_root);
    let pages: BTreeSet<u32> = song_to_page.values().copied().collect();
    res.covers.covers = song_to_page.len() as u64;
    res.covers.unique_pages = pages.len() as u64;
    let textures_dir = export_root.join("textures");
    res.covers.missing_pages = if textures_dir.exists() {
        pages.iter().filter(|p| !texture_page_exists(&textures_dir, **p)).count() as u64
    } else {
        pages.len() as u64
    };
    if res.covers.missing_pages > 0 {
        res.warnings.push(ReportItem::new(
            "MISSING_COVER_PAGES",
            format!(
                "Some cover pages are missing in Export/textures (missing pages: {}).",
                res.covers.missing_pages
            ),
            "Re-extract textures and ensure page_*.jpg exists under Export/textures.",
        ));
    }

    // Media sanity checks. Missing or corrupt preview/video means the
    // extraction is not usable, so these are ERRORs.
    let song_ids: BTreeSet<u32> = index_disc(store, input_path)
        .ok()
        .and_then(|idx| load_songs_for_disc_cached(store, &idx).ok())
        .map(|songs| songs.keys().copied().collect())
        .unwrap_or_default();
    if !song_ids.is_empty() {
        let media = scan_missing_or_corrupt_media(export_root, &song_ids, MIN_MEDIA_BYTES);
        if !media.is_clean() {
            res.counts.insert("missing_preview_files".to_string(), media.missing_preview_ids.len() as u64);
            res.counts.insert("missing_video_files".to_string(), media.missing_video_ids.len() as u64);
            res.counts.insert("corrupt_preview_files".to_string(), media.corrupt_preview.len() as u64);
            res.counts.insert("corrupt_video_files".to_string(), media.corrupt_video.len() as u64);
            let bad = media.any_bad_ids();
            res.errors.push(ReportItem::new(
                "MISSING_MEDIA_FILES",
                format!("Missing/corrupt preview/video files for {} song(s): {}", bad.len(), show_ids(&bad, 10)),
                "Re-extract this disc (starting pack) and re-run Verify/Validate. If this is an extracted disc, your extractor output is incomplete/corrupt.",
            ));
        }
    }

    if res.counts.get("songs_xml_files").copied().unwrap_or(0) == 0 {
        res.errors.push(ReportItem::new(
            "NO_SONGS_XML",
            "No songs_*_0.xml files found at Export root.",
            "Ensure you are pointing at the extracted starting pack Export folder and that songs_<bank>_0.xml exists.",
        ));
    }

    res.rollup();
    res
}

/// Validate a disc path end to end (resolve + inspect + checks).
pub fn validate_one_disc(store: &CacheStore, label: &str, input_path: &Path) -> DiscReport {
    match resolve_input(&input_path.to_string_lossy()) {
        Ok(ri) => {
            let mut res = validate_one_disc_from_export_root(
                store,
                label,
                input_path,
                &ri.export_root,
                ri.kind.as_str(),
                &ri.warnings,
            );
            res.resolved_root = ri.resolved_root.clone();
            res
        }
        Err(e) => {
            let mut res = DiscReport::empty(label, input_path);
            res.errors.push(ReportItem::new(
                "RESOLVE_EXPORT_ROOT",
                format!("Could not locate Export root: {e}"),
                "Make sure the disc is extracted and points to a folder containing PS3_GAME/USRDIR/FileSystem/Export, or point directly at an Export folder.",
            ));
            res.summary = "Could not locate Export root (needs extraction or wrong path).".to_string();
            res
        }
    }
}

/// Copyable report block for one disc (no timestamps).
pub fn report_block_lines(r: &DiscReport) -> Vec<String> {
    let mut block: Vec<String> = Vec::new();
    block.push(format!("=== {} ===", r.label));
    block.push(format!("Path: {}", r.input_path.display()));
    if !r.product.is_empty() {
        block.push(format!("Product: {}", r.product));
    }
    block.push(format!("Result: {} - {}", r.severity.as_str(), r.summary));
    if !r.errors.is_empty() {
        block.push("Errors:".to_string());
        for it in &r.errors {
            block.push(format!(" - {}", it.message));
            block.push(format!("   Fix: {}", it.fix));
        }
    }
    if !r.warnings.is_empty() {
        block.push("Warnings:".to_string());
        for it in &r.warnings {
            block.push(format!(" - {}", it.message));
            block.push(format!("   Fix: {}", it.fix));
        }
    }
    block.push(format!(
        "Info: songs_xml={}, banks={}, textures={}, missing_refs={}, missing_cover_pages={}",
        r.counts.get("songs_xml_files").copied().unwrap_or(0),
        r.counts.get("banks_from_songs_xml").copied().unwrap_or(0),
        r.counts.get("texture_pages").copied().unwrap_or(0),
        r.missing_refs.len(),
        r.covers.missing_pages
    ));
    block.push(String::new());
    block
}

pub fn format_validate_report(results: &[DiscReport], preflight: bool) -> String {
    let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
    let mut lines: Vec<String> = Vec::new();
    if preflight {
        lines.push(format!("Validate Disc report (preflight) (v{VERSION}) - {ts}"));
    } else {
        lines.push(format!("Validate Disc report (v{VERSION}) - {ts}"));
    }
    lines.push(String::new());
    for r in results {
        lines.extend(report_block_lines(r));
    }
    format!("{}\n", lines.join("\n").trim_end())
}

/// Validate multiple discs by `(label, input_path)`. Per-disc report blocks
/// stream to `log_cb` as they are produced.
pub fn validate_discs(
    store: &CacheStore,
    targets: &[(String, PathBuf)],
    mut log_cb: Option<&mut dyn FnMut(&str)>,
    cancel: Option<&CancelToken>,
) -> Result<(Vec<DiscReport>, String)> {
    let mut results: Vec<DiscReport> = Vec::new();
    for (label, path) in targets {
        if let Some(cancel) = cancel {
            cancel.raise_if_cancelled()?;
        }
        let r = validate_one_disc(store, label, path);
        if let Some(log) = log_cb.as_deref_mut() {
            for line in report_block_lines(&r) {
                log(line.trim_end());
            }
        }
        results.push(r);
    }
    let report_text = format_validate_report(&results, false);
    Ok((results, report_text))
}
