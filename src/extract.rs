/// Packed-disc extraction orchestration: run the external extractor per
/// `Pack*.pkd`, detect and move aside partial outputs, stream the child's
/// console output through a reader thread, then harvest the extracted
/// `filesystem/export` trees into the disc's canonical Export folder.
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use chrono::Local;
use serde::Serialize;
use tracing::warn;

use crate::cleanup::{find_extraction_artifacts, Artifacts};
use crate::common::{decode_console_bytes, sanitize_console_line};
use crate::error::{Result, SpcdbError};
use crate::index::{index_disc, load_songs_for_disc_cached, CacheStore};
use crate::inspect::{covers_song_to_page, scan_missing_or_corrupt_media, texture_page_exists};
use crate::layout::{is_pruned_dir_name, locate_ps3_usrdir_under};
use crate::progress::CancelToken;
use crate::validate::MIN_MEDIA_BYTES;

const CHILD_KILL_GRACE: Duration = Duration::from_secs(2);
const LOG_TAIL_LINES: usize = 40;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractStats {
    pub pkds_found: u64,
    pub pkds_to_extract: u64,
    pub pkds_skipped: u64,
    pub pkd_out_incomplete: u64,
    pub pkd_out_moved_aside: u64,
    pub pkd_out_moved_aside_samples: Vec<(PathBuf, PathBuf)>,
    pub harvested: u64,
    pub dest_export: PathBuf,
    pub has_config_xml: bool,
}

fn extract_err(msg: impl Into<String>) -> SpcdbError {
    SpcdbError::Extract(msg.into())
}

/// A successful extractor run produces a non-empty `*_out` folder containing
/// `filesystem`/`FileSystem` with an `export`/`Export` beneath.
fn looks_like_extractor_output(out_dir: &Path) -> bool {
    if !out_dir.is_dir() {
        return false;
    }
    match fs::read_dir(out_dir) {
        Ok(mut it) => {
            if it.next().is_none() {
                return false;
            }
        }
        Err(_) => return false,
    }
    for fs_name in ["filesystem", "FileSystem"] {
        let fsd = out_dir.join(fs_name);
        if !fsd.is_dir() {
            continue;
        }
        for ex_name in ["export", "Export"] {
            if fsd.join(ex_name).is_dir() {
                return true;
            }
        }
    }
    false
}

/// Rename a partial pkd_out folder aside so it cannot cause a false
/// "already extracted" skip later.
fn move_aside_incomplete_out(out_dir: &Path) -> Option<PathBuf> {
    let ts = Local::now().format("%Y%m%d_%H%M%S");
    let name = out_dir.file_name()?.to_string_lossy().into_owned();
    let base = out_dir.with_file_name(format!("{name}_incomplete_{ts}"));
    let mut target = base.clone();
    for i in 1..=50u32 {
        if !target.exists() {
            break;
        }
        target = PathBuf::from(format!("{}_{i}", base.display()));
    }
    match fs::rename(out_dir, &target) {
        Ok(()) => Some(target),
        Err(e) => {
            warn!("could not move aside incomplete output {}: {e}", out_dir.display());
            None
        }
    }
}

fn find_pkds_under(usrdir: &Path, cancel: Option<&CancelToken>) -> Result<Vec<PathBuf>> {
    let mut pkds: Vec<PathBuf> = Vec::new();
    if let Ok(entries) = fs::read_dir(usrdir) {
        for entry in entries.flatten() {
            let p = entry.path();
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if p.is_file() && name.starts_with("pack") && name.ends_with(".pkd") {
                pkds.push(p);
            }
        }
    }

    // Not directly under USRDIR: search deeper, but stop at the first folder
    // that contains Pack*.pkd.
    if pkds.is_empty() {
        let mut stack = vec![usrdir.to_path_buf()];
        'walk: while let Some(dir) = stack.pop() {
            if let Some(cancel) = cancel {
                cancel.raise_if_cancelled()?;
            }
            let entries = match fs::read_dir(&dir) {
                Ok(e) => e,
                Err(_) => continue,
            };
            let mut subdirs: Vec<PathBuf> = Vec::new();
            let mut hits: Vec<PathBuf> = Vec::new();
            for entry in entries.flatten() {
                let p = entry.path();
                let name = entry.file_name().to_string_lossy().into_owned();
                let lower = name.to_lowercase();
                if p.is_dir() {
                    if !is_pruned_dir_name(&name) && lower != "filesystem" && lower != "export" {
                        subdirs.push(p);
                    }
                } else if lower.starts_with("pack") && lower.ends_with(".pkd") {
                    hits.push(p);
                }
            }
            if !hits.is_empty() {
                hits.sort_by_key(|p| p.to_string_lossy().to_lowercase());
                pkds.extend(hits);
                break 'walk;
            }
            stack.extend(subdirs);
        }
    }

    pkds.sort_by_key(|p| p.to_string_lossy().to_lowercase());
    pkds.dedup();
    Ok(pkds)
}

/// Run one extractor child, streaming decoded/sanitized output lines to the
/// log, with cooperative cancellation when allowed.
fn run_extractor_once(
    exe: &Path,
    pkd: &Path,
    log_cb: &mut dyn FnMut(&str),
    cancel: Option<&CancelToken>,
    allow_mid_disc_cancel: bool,
) -> Result<()> {
    let cwd = pkd.parent().unwrap_or(Path::new("."));
    let mut child = Command::new(exe)
        .arg(pkd)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| extract_err(format!("could not start extractor {}: {e}", exe.display())))?;

    // Reader threads drain stdout/stderr into one queue so the main thread
    // can poll for cancellation while the child runs. The readers never
    // touch the filesystem.
    let (tx, rx) = mpsc::channel::<Option<Vec<u8>>>();
    let mut readers = 0;
    if let Some(stdout) = child.stdout.take() {
        readers += 1;
        let tx = tx.clone();
        std::thread::spawn(move || read_lines_into(stdout, tx));
    }
    if let Some(stderr) = child.stderr.take() {
        readers += 1;
        let tx = tx.clone();
        std::thread::spawn(move || read_lines_into(stderr, tx));
    }
    drop(tx);

    let mut last_lines: Vec<String> = Vec::new();
    let mut done_readers = 0;
    let mut cancelled_here = false;
    loop {
        if allow_mid_disc_cancel && !cancelled_here {
            if let Some(cancel) = cancel {
                if cancel.cancelled() {
                    cancelled_here = true;
                    log_cb("Cancelled: terminating extractor process...");
                    let _ = child.kill();
                }
            }
        }

        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Some(raw)) => {
                let line = sanitize_console_line(&decode_console_bytes(&raw));
                if line.is_empty() {
                    continue;
                }
                last_lines.push(line.clone());
                if last_lines.len() > 200 {
                    let overflow = last_lines.len() - 200;
                    last_lines.drain(..overflow);
                }
                log_cb(&line);
            }
            Ok(None) => {
                done_readers += 1;
                if done_readers >= readers {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if child.try_wait().ok().flatten().is_some() && done_readers >= readers {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    if cancelled_here {
        // Give the child a short grace period, then make sure it is gone.
        let deadline = Instant::now() + CHILD_KILL_GRACE;
        while Instant::now() < deadline {
            if child.try_wait().ok().flatten().is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        let _ = child.kill();
        let _ = child.wait();
        return Err(SpcdbError::Cancelled("Cancelled".to_string()));
    }

    let status = child.wait()?;
    if !status.success() {
        let tail: Vec<&str> = last_lines.iter().rev().take(LOG_TAIL_LINES).map(|s| s.as_str()).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        return Err(extract_err(format!(
            "Extractor failed for {} (code {})\n\n{}",
            pkd.file_name().unwrap_or_default().to_string_lossy(),
            status.code().unwrap_or(-1),
            tail.join("\n")
        )));
    }
    Ok(())
}

fn read_lines_into(stream: impl std::io::Read, tx: mpsc::Sender<Option<Vec<u8>>>) {
    use std::io::BufRead;
    let reader = std::io::BufReader::new(stream);
    for raw in reader.split(b'\n') {
        match raw {
            Ok(bytes) => {
                if tx.send(Some(bytes)).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    let _ = tx.send(None);
}

fn find_filesystem_export(out_dir: &Path) -> Option<PathBuf> {
    for fs_name in ["filesystem", "FileSystem"] {
        for ex_name in ["export", "Export"] {
            let cand = out_dir.join(fs_name).join(ex_name);
            if cand.is_dir() {
                return Some(cand);
            }
        }
    }
    // Depth-limited fallback: look for a 'filesystem' dir with an 'export'
    // child anywhere within 3 levels.
    for entry in walkdir::WalkDir::new(out_dir).max_depth(3).into_iter().flatten() {
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if name == "filesystem" {
            for ex_name in ["export", "Export"] {
                let cand = entry.path().join(ex_name);
                if cand.is_dir() {
                    return Some(cand);
                }
            }
        }
    }
    None
}

/// Extract all `Pack*.pkd` files for a disc using the external extractor and
/// harvest the resulting Export trees.
///
/// Returns `(dest_export_path, harvested_file_count, stats)`.
///
/// Cancellation: by default an in-flight disc extraction is not interrupted.
/// With `allow_mid_disc_cancel`, cancellation is honoured between PKDs, while
/// the child runs, and during harvest loops.
pub fn extract_disc_pkds(
    extractor_exe: &Path,
    disc_root: &Path,
    log_cb: &mut dyn FnMut(&str),
    cancel: Option<&CancelToken>,
    allow_mid_disc_cancel: bool,
) -> Result<(PathBuf, u64, ExtractStats)> {
    let mut stats = ExtractStats::default();

    if extractor_exe.as_os_str().is_empty() {
        return Err(extract_err("Extractor not configured. Select the extractor executable first.".to_string()));
    }
    if !extractor_exe.exists() {
        return Err(extract_err(format!("Extractor exe not found: {}", extractor_exe.display())));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let exec_ok = fs::metadata(extractor_exe).map(|md| md.permissions().mode() & 0o111 != 0).unwrap_or(true);
        if !exec_ok {
            return Err(extract_err(format!(
                "Extractor is not executable: {}\nRun `chmod +x` on the selected file.",
                extractor_exe.display()
            )));
        }
    }

    // Extraction must look under PS3_GAME/USRDIR, not the top-level root.
    let mut disc_root = disc_root.to_path_buf();
    let mut usrdir = disc_root.join("PS3_GAME").join("USRDIR");
    if !usrdir.is_dir() {
        match locate_ps3_usrdir_under(&disc_root, 4) {
            Some(found) => {
                usrdir = found;
                if let Some(root) = usrdir.parent().and_then(|p| p.parent()) {
                    disc_root = root.to_path_buf();
                }
            }
            None => {
                return Err(extract_err(format!(
                    "PS3_GAME/USRDIR not found under: {}\nTip: the disc folder you add should contain PS3_GAME at its top level.",
                    disc_root.display()
                )));
            }
        }
    }

    let pkds = find_pkds_under(&usrdir, cancel.filter(|_| allow_mid_disc_cancel))?;
    if pkds.is_empty() {
        return Err(extract_err(format!(
            "No Pack*.pkd files found under: {} (disc root: {})",
            usrdir.display(),
            disc_root.display()
        )));
    }
    stats.pkds_found = pkds.len() as u64;

    log_cb(&format!("Using extractor: {}", extractor_exe.display()));
    log_cb(&format!("Disc root: {}", disc_root.display()));
    log_cb(&format!("USRDIR: {}", usrdir.display()));
    log_cb(&format!("Found {} PKD file(s)", pkds.len()));

    // Decide which PKDs actually need extraction.
    let mut pkds_to_extract: Vec<PathBuf> = Vec::new();
    let mut skipped: Vec<(PathBuf, PathBuf)> = Vec::new();
    for pkd in &pkds {
        let out_dir = pkd.with_file_name(format!("{}_out", pkd.file_name().unwrap_or_default().to_string_lossy()));
        if out_dir.is_dir() {
            if looks_like_extractor_output(&out_dir) {
                skipped.push((pkd.clone(), out_dir));
            } else {
                stats.pkd_out_incomplete += 1;
                if let Some(moved) = move_aside_incomplete_out(&out_dir) {
                    stats.pkd_out_moved_aside += 1;
                    stats.pkd_out_moved_aside_samples.push((out_dir.clone(), moved));
                }
                pkds_to_extract.push(pkd.clone());
            }
        } else {
            pkds_to_extract.push(pkd.clone());
        }
    }
    stats.pkds_to_extract = pkds_to_extract.len() as u64;
    stats.pkds_skipped = skipped.len() as u64;

    for (pkd, out_dir) in &skipped {
        log_cb(&format!(
            "Skipping already extracted: {} (found {})",
            pkd.file_name().unwrap_or_default().to_string_lossy(),
            out_dir.file_name().unwrap_or_default().to_string_lossy()
        ));
    }
    if stats.pkd_out_incomplete > 0 {
        log_cb(&format!(
            "Found {} incomplete pkd_out folder(s); will re-extract those PKD(s).",
            stats.pkd_out_incomplete
        ));
    }
    if stats.pkd_out_moved_aside > 0 {
        log_cb(&format!(
            "Moved aside {} incomplete pkd_out folder(s) (suffix _incomplete_*).",
            stats.pkd_out_moved_aside
        ));
    }
    log_cb(&format!(
        "Will extract {} PKD(s) (skipping {} already extracted).",
        pkds_to_extract.len(),
        skipped.len()
    ));
    if pkds_to_extract.is_empty() {
        log_cb("All PKD(s) already extracted; skipping extractor step.");
    }

    for (i, pkd) in pkds_to_extract.iter().enumerate() {
        if allow_mid_disc_cancel {
            if let Some(cancel) = cancel {
                cancel.raise_if_cancelled()?;
            }
        }
        log_cb(&format!(
            "Extracting ({}/{}): {}",
            i + 1,
            pkds_to_extract.len(),
            pkd.file_name().unwrap_or_default().to_string_lossy()
        ));
        run_extractor_once(extractor_exe, pkd, log_cb, cancel, allow_mid_disc_cancel)?;
    }

    // Harvest Pack*.pkd_out/filesystem/export into PS3_GAME/USRDIR/FileSystem/Export.
    let dest_export = disc_root.join("PS3_GAME").join("USRDIR").join("FileSystem").join("Export");
    fs::create_dir_all(&dest_export)?;

    let mut out_dirs: Vec<PathBuf> = pkds
        .iter()
        .map(|pkd| pkd.with_file_name(format!("{}_out", pkd.file_name().unwrap_or_default().to_string_lossy())))
        .filter(|od| od.is_dir())
        .collect();
    if out_dirs.is_empty() {
        out_dirs = find_extraction_artifacts(&disc_root).pkd_out_dirs;
    }
    if out_dirs.is_empty() {
        return Err(extract_err(format!("No Pack*.pkd_out folders found under: {}", disc_root.display())));
    }
    out_dirs.sort();
    out_dirs.dedup();

    let mut harvested = 0u64;
    for od in &out_dirs {
        if allow_mid_disc_cancel {
            if let Some(cancel) = cancel {
                cancel.raise_if_cancelled()?;
            }
        }
        let fs_dir = match find_filesystem_export(od) {
            Some(d) => d,
            None => continue,
        };
        log_cb(&format!("Harvesting: {} -> {}", fs_dir.display(), dest_export.display()));

        let mut copied = 0u64;
        for entry in walkdir::WalkDir::new(&fs_dir).into_iter().flatten() {
            if allow_mid_disc_cancel && harvested % 256 == 0 {
                if let Some(cancel) = cancel {
                    cancel.raise_if_cancelled()?;
                }
            }
            let rel = match entry.path().strip_prefix(&fs_dir) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let dst = dest_export.join(rel);
            if entry.file_type().is_dir() {
                let _ = fs::create_dir_all(&dst);
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            // Count the file as harvested even when an identical-sized copy
            // already exists at the destination.
            harvested += 1;
            if let (Ok(src_md), Ok(dst_md)) = (entry.metadata(), fs::metadata(&dst)) {
                if src_md.len() == dst_md.len() {
                    continue;
                }
            }
            if let Some(parent) = dst.parent() {
                let _ = fs::create_dir_all(parent);
            }
            if fs::copy(entry.path(), &dst).is_ok() {
                copied += 1;
            }
        }
        if copied > 0 {
            log_cb(&format!("Harvested {harvested} file(s) ({copied} copied) into {}", dest_export.display()));
        }
    }

    if harvested == 0 {
        return Err(extract_err("No files harvested from pkd_out filesystem/export folders.".to_string()));
    }
    log_cb(&format!("Harvested {harvested} file(s) into {}", dest_export.display()));

    stats.harvested = harvested;
    stats.dest_export = dest_export.clone();
    stats.has_config_xml = dest_export.join("config.xml").is_file();
    if !stats.has_config_xml {
        log_cb("Warning: Export/config.xml not found after harvest. Check extractor output.");
    }

    Ok((dest_export, harvested, stats))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifySamples {
    pub missing_song_dir_ids: Vec<u32>,
    pub missing_texture_pages: Vec<u32>,
    pub missing_preview_ids: Vec<u32>,
    pub missing_video_ids: Vec<u32>,
    pub corrupt_preview_ids: Vec<u32>,
    pub corrupt_video_ids: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyResult {
    pub ok: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub counts: std::collections::BTreeMap<String, u64>,
    pub samples: VerifySamples,
    pub artifacts: Artifacts,
}

/// Verify a disc looks correctly extracted (safe to clean up PKD artifacts):
/// songs/acts XMLs parse, every SONG id has a folder, referenced cover pages
/// exist, and preview/video media pass the sanity probe.
pub fn verify_disc_extraction(store: &CacheStore, disc_root: &Path, mut log_cb: Option<&mut dyn FnMut(&str)>) -> VerifyResult {
    let mut emit = |msg: String| {
        if let Some(log) = log_cb.as_deref_mut() {
            log(&msg);
        }
    };

    let mut res = VerifyResult::default();

    let idx = match index_disc(store, disc_root) {
        Ok(idx) => idx,
        Err(e) => {
            res.errors.push(format!("Index failed: {e}"));
            res.artifacts = find_extraction_artifacts(disc_root);
            return res;
        }
    };
    res.warnings.extend(idx.warnings.iter().cloned());

    let export_root = idx.export_root.clone();
    if !export_root.exists() {
        res.errors.push("Export root not found (disc does not appear extracted).".to_string());
        res.artifacts = find_extraction_artifacts(disc_root);
        return res;
    }

    if idx.songs_xml.is_none() {
        res.errors.push("songs XML not found (songs_<bank>_0.xml missing).".to_string());
    }
    if idx.acts_xml.is_none() {
        res.errors.push("acts XML not found (acts_<bank>_0.xml missing).".to_string());
    }

    let song_ids: BTreeSet<u32> = match load_songs_for_disc_cached(store, &idx) {
        Ok(songs) => songs.keys().copied().collect(),
        Err(e) => {
            res.errors.push(format!("songs XML parse failed: {e}"));
            BTreeSet::new()
        }
    };

    let missing_song_dirs: Vec<u32> =
        song_ids.iter().copied().filter(|sid| !export_root.join(sid.to_string()).is_dir()).collect();

    let media = scan_missing_or_corrupt_media(&export_root, &song_ids, MIN_MEDIA_BYTES);
    emit(format!(
        "[verify] Media: missing_preview={} missing_video={} corrupt_preview={} corrupt_video={}",
        media.missing_preview_ids.len(),
        media.missing_video_ids.len(),
        media.corrupt_preview.len(),
        media.corrupt_video.len()
    ));

    // Covers / textures.
    let covers_map = covers_song_to_page(&export_root);
    let missing_cover_entries = song_ids.iter().filter(|sid| !covers_map.contains_key(sid)).count() as u64;
    let mut textures_dir = export_root.join("textures");
    if !textures_dir.exists() {
        textures_dir = export_root.join("Textures");
    }
    let missing_texture_pages: BTreeSet<u32> =
        covers_map.values().copied().filter(|page| !texture_page_exists(&textures_dir, *page)).collect();

    emit(format!("[verify] Export root: {}", export_root.display()));
    emit(format!("[verify] Songs: {} | Missing song folders: {}", song_ids.len(), missing_song_dirs.len()));
    emit(format!(
        "[verify] Covers missing for songs: {missing_cover_entries} | Missing texture pages: {}",
        missing_texture_pages.len()
    ));

    let mut ok = res.errors.is_empty();
    if !missing_song_dirs.is_empty() {
        ok = false;
        res.warnings.push(format!("Missing Export/<song_id> folders: {}", missing_song_dirs.len()));
    }
    if !missing_texture_pages.is_empty() {
        ok = false;
        res.warnings.push(format!("Missing cover texture pages: {}", missing_texture_pages.len()));
    }
    if !media.is_clean() {
        ok = false;
        if !media.missing_preview_ids.is_empty() {
            res.warnings.push(format!("Missing preview media files: {}", media.missing_preview_ids.len()));
        }
        if !media.missing_video_ids.is_empty() {
            res.warnings.push(format!("Missing video media files: {}", media.missing_video_ids.len()));
        }
        if !media.corrupt_preview.is_empty() {
            res.warnings.push(format!("Corrupt/unreadable preview media files: {}", media.corrupt_preview.len()));
        }
        if !media.corrupt_video.is_empty() {
            res.warnings.push(format!("Corrupt/unreadable video media files: {}", media.corrupt_video.len()));
        }
    }

    res.ok = ok;
    res.counts = std::collections::BTreeMap::from([
        ("songs".to_string(), song_ids.len() as u64),
        ("missing_song_dirs".to_string(), missing_song_dirs.len() as u64),
        ("missing_cover_entries".to_string(), missing_cover_entries),
        ("missing_texture_pages".to_string(), missing_texture_pages.len() as u64),
        ("missing_preview_files".to_string(), media.missing_preview_ids.len() as u64),
        ("missing_video_files".to_string(), media.missing_video_ids.len() as u64),
        ("corrupt_preview_files".to_string(), media.corrupt_preview.len() as u64),
        ("corrupt_video_files".to_string(), media.corrupt_video.len() as u64),
    ]);
    res.samples = VerifySamples {
        missing_song_dir_ids: missing_song_dirs.into_iter().take(20).collect(),
        missing_texture_pages: missing_texture_pages.into_iter().take(20).collect(),
        missing_preview_ids: media.missing_preview_ids.iter().copied().take(20).collect(),
        missing_video_ids: media.missing_video_ids.iter().copied().take(20).collect(),
        corrupt_preview_ids: media.corrupt_preview.keys().copied().take(20).collect(),
        corrupt_video_ids: media.corrupt_video.keys().copied().take(20).collect(),
    };
    res.artifacts = find_extraction_artifacts(disc_root);
    res
}
