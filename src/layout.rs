/// Disc layout resolution: map whatever folder the operator points at to a
/// canonical `Export/` root.
///
/// Accepted inputs:
///   - an extracted full disc root (`PS3_GAME/USRDIR/FileSystem/Export` exists)
///   - a wrapper folder containing such a disc up to 4 levels deep
///   - an `Export/` folder directly (including config-less XML-only donors)
///   - a still-packed disc (only `Pack*.pkd` under `USRDIR`)
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

use crate::common::normalize_input_path;
use crate::error::{Result, SpcdbError};

pub const WALK_PRUNE_DIRS: [&str; 4] = ["_trash", "_spcdb_trash", ".git", "__pycache__"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedKind {
    FullDisc,
    ExportOnly,
    Wrapper,
    Packed,
}

impl ResolvedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolvedKind::FullDisc => "full_disc",
            ResolvedKind::ExportOnly => "export_only",
            ResolvedKind::Wrapper => "wrapper",
            ResolvedKind::Packed => "packed",
        }
    }
}

/// Outcome of resolving an operator-supplied path. Owns its scratch
/// directory (if any); dropping the value releases it.
#[derive(Debug)]
pub struct ResolvedInput {
    pub original: PathBuf,
    pub resolved_root: PathBuf,
    pub export_root: PathBuf,
    pub kind: ResolvedKind,
    pub warnings: Vec<String>,
    pub temp_dir: Option<TempDir>,
}

pub fn is_pruned_dir_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    WALK_PRUNE_DIRS.iter().any(|p| lower == *p)
}

/// Case-insensitive single-level child lookup. Exact-case match wins.
fn child_ci(dir: &Path, name: &str) -> Option<PathBuf> {
    let exact = dir.join(name);
    if exact.is_dir() {
        return Some(exact);
    }
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let p = entry.path();
        if p.is_dir() && p.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.eq_ignore_ascii_case(name)) {
            return Some(p);
        }
    }
    None
}

fn has_file_matching(dir: &Path, pred: impl Fn(&str) -> bool) -> bool {
    match fs::read_dir(dir) {
        Ok(entries) => entries.flatten().any(|e| {
            e.path().is_file() && e.file_name().to_str().map(|n| pred(&n.to_lowercase())).unwrap_or(false)
        }),
        Err(_) => false,
    }
}

fn looks_like_export_root(dir: &Path) -> bool {
    has_file_matching(dir, |n| n == "config.xml")
        || has_file_matching(dir, |n| n.starts_with("songs_") && n.ends_with("_0.xml"))
}

fn has_pkd_files(dir: &Path) -> bool {
    has_file_matching(dir, |n| n.starts_with("pack") && n.ends_with(".pkd"))
}

/// Best-effort locate a `PS3_GAME/USRDIR` directory under a root. Users
/// sometimes point at a wrapper folder that contains the real disc folder, so
/// we search a few levels deep with known-irrelevant trees pruned.
pub fn locate_ps3_usrdir_under(root: &Path, max_depth: usize) -> Option<PathBuf> {
    let direct = root.join("PS3_GAME").join("USRDIR");
    if direct.is_dir() {
        return Some(direct);
    }

    let walker = WalkDir::new(root).max_depth(max_depth).into_iter().filter_entry(|e| {
        !(e.file_type().is_dir() && e.depth() > 0 && e.file_name().to_str().map(is_pruned_dir_name).unwrap_or(false))
    });
    for entry in walker.flatten() {
        if !entry.file_type().is_dir() {
            continue;
        }
        let name_ok = entry.file_name().to_str().map(|n| n.eq_ignore_ascii_case("PS3_GAME")).unwrap_or(false);
        if name_ok {
            if let Some(usrdir) = child_ci(entry.path(), "USRDIR") {
                return Some(usrdir);
            }
        }
    }
    None
}

fn push_casing_warning(warnings: &mut Vec<String>, expected: &str, actual: &Path) {
    if let Some(name) = actual.file_name().and_then(|n| n.to_str()) {
        if name != expected {
            warnings.push(format!(
                "{expected} folder name casing deviates from convention: found '{name}' at {}",
                actual.display()
            ));
        }
    }
}

fn export_content_warnings(export_root: &Path, warnings: &mut Vec<String>) {
    if child_ci(export_root, "textures").is_none() {
        warnings.push("No textures folder found under Export.".to_string());
    }
    if !has_file_matching(export_root, |n| n == "config.xml") {
        warnings.push("No config.xml under Export (partial/XML-only donor?).".to_string());
    }
}

/// Resolve an operator-supplied path into a canonical export root.
pub fn resolve_input(input_path: &str) -> Result<ResolvedInput> {
    let original = PathBuf::from(input_path);
    let norm = normalize_input_path(input_path);
    let root = if norm.is_empty() { original.clone() } else { PathBuf::from(&norm) };

    if !root.is_dir() {
        return Err(SpcdbError::Resolve {
            input: original,
            reason: "input folder does not exist".to_string(),
        });
    }

    let mut warnings: Vec<String> = Vec::new();

    // Direct Export folder (by name, or by content for odd casings).
    let named_export = root.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.eq_ignore_ascii_case("Export"));
    if named_export || looks_like_export_root(&root) {
        if named_export {
            push_casing_warning(&mut warnings, "Export", &root);
        }
        export_content_warnings(&root, &mut warnings);
        debug!("resolved {} as export-only root", root.display());
        return Ok(ResolvedInput {
            original,
            resolved_root: root.clone(),
            export_root: root,
            kind: ResolvedKind::ExportOnly,
            warnings,
            temp_dir: None,
        });
    }

    // Pointed inside the disc: climb back out to the folder holding PS3_GAME.
    let mut search_root = root.clone();
    for _ in 0..3 {
        let name = search_root.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name.eq_ignore_ascii_case("USRDIR") || name.eq_ignore_ascii_case("PS3_GAME") || name.eq_ignore_ascii_case("FileSystem") {
            match search_root.parent() {
                Some(parent) => search_root = parent.to_path_buf(),
                None => break,
            }
        } else {
            break;
        }
    }

    let usrdir = match locate_ps3_usrdir_under(&search_root, 4) {
        Some(u) => u,
        None => {
            // No PS3_GAME anywhere; accept a folder that wraps a bare Export.
            if let Some(export) = child_ci(&search_root, "Export") {
                push_casing_warning(&mut warnings, "Export", &export);
                export_content_warnings(&export, &mut warnings);
                return Ok(ResolvedInput {
                    original,
                    resolved_root: search_root,
                    export_root: export,
                    kind: ResolvedKind::ExportOnly,
                    warnings,
                    temp_dir: None,
                });
            }
            return Err(SpcdbError::Resolve {
                input: original,
                reason: format!("no PS3_GAME/USRDIR or Export folder found under {}", search_root.display()),
            });
        }
    };

    // Canonical disc root is the parent of PS3_GAME.
    let ps3_game = usrdir.parent().unwrap_or(&usrdir).to_path_buf();
    let disc_root = ps3_game.parent().unwrap_or(&ps3_game).to_path_buf();
    let kind = if disc_root == root { ResolvedKind::FullDisc } else { ResolvedKind::Wrapper };

    if let Some(filesystem) = child_ci(&usrdir, "FileSystem") {
        push_casing_warning(&mut warnings, "FileSystem", &filesystem);
        if let Some(export) = child_ci(&filesystem, "Export") {
            push_casing_warning(&mut warnings, "Export", &export);
            export_content_warnings(&export, &mut warnings);
            debug!("resolved {} as {} (export {})", root.display(), kind.as_str(), export.display());
            return Ok(ResolvedInput {
                original,
                resolved_root: disc_root,
                export_root: export,
                kind,
                warnings,
                temp_dir: None,
            });
        }
    }

    // No extracted Export; a packed disc still resolves, pointing at the
    // future extraction location.
    if has_pkd_files(&usrdir) {
        let export = usrdir.join("FileSystem").join("Export");
        warnings.push("Disc appears packed (Pack*.pkd present, no extracted Export).".to_string());
        return Ok(ResolvedInput {
            original,
            resolved_root: disc_root,
            export_root: export,
            kind: ResolvedKind::Packed,
            warnings,
            temp_dir: None,
        });
    }

    Err(SpcdbError::Resolve {
        input: original,
        reason: format!("no FileSystem/Export found under {}", usrdir.display()),
    })
}
