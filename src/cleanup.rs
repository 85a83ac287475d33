/// Discovery and cleanup of packed-disc extraction artifacts (`Pack*.pkd`
/// files and `Pack*.pkd_out/` trees).
///
/// The default cleanup mode is reversible: artifacts move into a trash
/// folder that sits next to the disc folders, preserving relative paths, so
/// a plain rename puts everything back.
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;
use tracing::info;

use crate::error::{Result, SpcdbError};
use crate::layout::is_pruned_dir_name;

pub const TRASH_DIRNAME: &str = "_trash";

#[derive(Debug, Clone, Default, Serialize)]
pub struct Artifacts {
    pub pkd_files: Vec<PathBuf>,
    pub pkd_out_dirs: Vec<PathBuf>,
}

fn is_pkd_file_name(name: &str) -> bool {
    let l = name.to_lowercase();
    l.starts_with("pack") && l.ends_with(".pkd")
}

fn is_pkd_out_dir_name(name: &str) -> bool {
    let l = name.to_lowercase();
    l.starts_with("pack") && l.ends_with(".pkd_out")
}

/// Find extraction artifacts under a disc root.
///
/// `Pack*.pkd` files are looked for under `PS3_GAME/USRDIR` first, then the
/// disc root. `Pack*.pkd_out/` dirs are collected anywhere under the disc
/// root, but the walk prunes the known-huge `FileSystem`/`Export` trees
/// (pkd_out folders sit alongside the pkds, never inside Export).
pub fn find_extraction_artifacts(disc_root: &Path) -> Artifacts {
    let mut artifacts = Artifacts::default();
    let usrdir = disc_root.join("PS3_GAME").join("USRDIR");

    for dir in [&usrdir, &disc_root.to_path_buf()] {
        if !dir.is_dir() {
            continue;
        }
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let p = entry.path();
                if p.is_file() && entry.file_name().to_str().map(is_pkd_file_name).unwrap_or(false) {
                    artifacts.pkd_files.push(p);
                }
            }
        }
        if !artifacts.pkd_files.is_empty() {
            break;
        }
    }

    let mut stack = vec![disc_root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let p = entry.path();
            if !p.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let lower = name.to_lowercase();
            if is_pruned_dir_name(&name) || lower == "filesystem" || lower == "export" {
                continue;
            }
            if is_pkd_out_dir_name(&name) {
                // Collect and do not descend into the output tree itself.
                artifacts.pkd_out_dirs.push(p);
            } else {
                stack.push(p);
            }
        }
    }

    artifacts.pkd_files.sort_by_key(|p| p.to_string_lossy().to_lowercase());
    artifacts.pkd_files.dedup();
    artifacts.pkd_out_dirs.sort_by_key(|p| p.to_string_lossy().to_lowercase());
    artifacts.pkd_out_dirs.dedup();
    artifacts
}

/// Result of one cleanup operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupResult {
    pub trash_dir: Option<PathBuf>,
    pub moved_files: u64,
    pub moved_dirs: u64,
    pub deleted_files: u64,
    pub deleted_dirs: u64,
    pub moved: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CleanupOptions {
    pub include_pkd_out_dirs: bool,
    pub include_pkd_files: bool,
    /// Permanent delete instead of move-to-trash. Explicit opt-in.
    pub delete_instead: bool,
    /// Where the trash session folder is created; defaults to the disc
    /// root's parent (the scanned discs folder).
    pub trash_root_dir: Option<PathBuf>,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            include_pkd_out_dirs: true,
            include_pkd_files: false,
            delete_instead: false,
            trash_root_dir: None,
        }
    }
}

fn collision_free(dst: PathBuf) -> PathBuf {
    if !dst.exists() {
        return dst;
    }
    let name = dst.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let parent = dst.parent().map(|p| p.to_path_buf()).unwrap_or_default();
    let mut i = 2u32;
    loop {
        let cand = parent.join(format!("{name}_{i}"));
        if !cand.exists() {
            return cand;
        }
        i += 1;
    }
}

/// Remove extraction artifacts from a disc folder, either by moving them to
/// `<base>/_trash/<timestamp>/<disc_name>/<relative path>` (reversible) or
/// by permanent delete.
pub fn cleanup_extraction_artifacts(
    disc_root: &Path,
    opts: &CleanupOptions,
    mut log_cb: Option<&mut dyn FnMut(&str)>,
) -> Result<CleanupResult> {
    let mut emit = |msg: String| {
        if let Some(log) = log_cb.as_deref_mut() {
            log(&msg);
        }
    };

    let artifacts = find_extraction_artifacts(disc_root);
    let mut candidates: Vec<PathBuf> = Vec::new();
    if opts.include_pkd_out_dirs {
        candidates.extend(artifacts.pkd_out_dirs.iter().cloned());
    }
    if opts.include_pkd_files {
        candidates.extend(artifacts.pkd_files.iter().cloned());
    }
    candidates.retain(|p| p.exists());

    let mut result = CleanupResult::default();
    if candidates.is_empty() {
        return Ok(result);
    }

    if opts.delete_instead {
        emit("[cleanup] PERMANENT DELETE mode enabled".to_string());
        for src in candidates {
            if src.is_dir() {
                emit(format!("[cleanup] Deleting dir: {}", src.display()));
                fs::remove_dir_all(&src).map_err(|e| SpcdbError::Cleanup(format!("delete {}: {e}", src.display())))?;
                result.deleted_dirs += 1;
            } else {
                emit(format!("[cleanup] Deleting file: {}", src.display()));
                fs::remove_file(&src).map_err(|e| SpcdbError::Cleanup(format!("delete {}: {e}", src.display())))?;
                result.deleted_files += 1;
            }
            result.deleted.push(src);
        }
        return Ok(result);
    }

    // MOVE-to-trash mode (default). The trash sits alongside the disc
    // folders, not inside one, so extracted/unextracted layouts stay intact.
    let ts = Local::now().format("%Y%m%d_%H%M%S").to_string();
    let base_dir = opts.trash_root_dir.clone().unwrap_or_else(|| disc_root.parent().unwrap_or(disc_root).to_path_buf());
    let trash_session_dir = base_dir.join(TRASH_DIRNAME).join(&ts);
    let disc_name = disc_root.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "disc".to_string());
    let trash_disc_dir = trash_session_dir.join(&disc_name);
    fs::create_dir_all(&trash_disc_dir)?;

    for src in candidates {
        let rel = src.strip_prefix(disc_root).map(|p| p.to_path_buf()).unwrap_or_else(|_| {
            PathBuf::from(src.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default())
        });
        let dst = collision_free(trash_disc_dir.join(rel));
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        emit(format!("[cleanup] Moving: {} -> {}", src.display(), dst.display()));
        fs::rename(&src, &dst).map_err(|e| SpcdbError::Cleanup(format!("move {}: {e}", src.display())))?;
        if dst.is_dir() {
            result.moved_dirs += 1;
        } else {
            result.moved_files += 1;
        }
        result.moved.push(dst);
    }

    result.trash_dir = Some(trash_session_dir.clone());
    info!("cleanup moved {} dir(s), {} file(s) into {}", result.moved_dirs, result.moved_files, trash_session_dir.display());
    Ok(result)
}
