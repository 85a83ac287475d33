/// The subset build pipeline: copy the base disc to a temp tree, prune it to
/// the selected songs, overlay donor-won songs and their cover assets,
/// rewrite the catalog indexes for the target bank, then atomically replace
/// the output directory (rotating a backup when asked).
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use filetime::FileTime;
use quick_xml::Writer;
use tracing::{info, warn};

use crate::catalog::BASE_LABEL;
use crate::error::{Result, SpcdbError};
use crate::inspect::{best_bank_files, covers_song_to_page, parse_config, texture_page_exists, TEXTURE_EXTS};
use crate::layout::{ResolvedInput, ResolvedKind};
use crate::progress::{CancelToken, ProgressEvent};
use crate::xmlread::{read_document, read_root_meta, stream_elements, XmlElem};

pub const BUILDING_SUFFIX: &str = ".building";

#[derive(Debug, Clone)]
pub struct SubsetOptions {
    /// Bank number the output catalog is written under.
    pub target_version: u32,
    pub allow_overwrite: bool,
    pub keep_backup: bool,
    pub fast_update: bool,
}

impl Default for SubsetOptions {
    fn default() -> Self {
        Self {
            target_version: 6,
            allow_overwrite: false,
            keep_backup: true,
            fast_update: false,
        }
    }
}

pub type ProgressFn<'a> = &'a mut dyn FnMut(&ProgressEvent);

fn fatal(msg: impl Into<String>) -> SpcdbError {
    SpcdbError::BuildFatal(msg.into())
}

fn copy_file_preserving_mtime(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst)?;
    let md = fs::metadata(src)?;
    let mtime = FileTime::from_last_modification_time(&md);
    filetime::set_file_mtime(dst, mtime)?;
    Ok(())
}

fn count_files(root: &Path) -> u64 {
    walkdir::WalkDir::new(root).into_iter().flatten().filter(|e| e.file_type().is_file()).count() as u64
}

fn copy_tree(
    src: &Path,
    dst: &Path,
    cancel: &CancelToken,
    mut on_file: impl FnMut(u64) -> Result<()>,
) -> Result<u64> {
    let mut copied = 0u64;
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| fatal(format!("walk failed under {}: {e}", src.display())))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| fatal(format!("path outside copy root: {e}")))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            copy_file_preserving_mtime(entry.path(), &target)?;
            copied += 1;
            if copied % 64 == 0 {
                cancel.raise_if_cancelled()?;
            }
            on_file(copied)?;
        }
    }
    Ok(copied)
}

/// Where the export root lives inside the copied output tree.
fn export_rel(ri: &ResolvedInput) -> Result<PathBuf> {
    match ri.kind {
        ResolvedKind::ExportOnly => Ok(PathBuf::new()),
        _ => ri
            .export_root
            .strip_prefix(&ri.resolved_root)
            .map(|p| p.to_path_buf())
            .map_err(|_| fatal("base export root is not under its resolved root".to_string())),
    }
}

struct SourceCatalog {
    export_root: PathBuf,
    songs_xml: Option<PathBuf>,
    acts_xml: Option<PathBuf>,
}

impl SourceCatalog {
    fn open(export_root: &Path) -> Self {
        let pair = best_bank_files(export_root, u32::MAX);
        Self {
            export_root: export_root.to_path_buf(),
            songs_xml: pair.as_ref().map(|(_, s, _)| s.clone()),
            acts_xml: pair.as_ref().map(|(_, _, a)| a.clone()),
        }
    }

    fn song_elements(&self, wanted: &BTreeSet<u32>) -> Result<BTreeMap<u32, XmlElem>> {
        let mut out = BTreeMap::new();
        let songs_xml = match &self.songs_xml {
            Some(p) => p,
            None => return Ok(out),
        };
        stream_elements(songs_xml, "SONG", &mut |el| {
            if let Some(sid) = el.parse_id() {
                if wanted.contains(&sid) {
                    out.insert(sid, el);
                }
            }
            Ok(())
        })?;
        Ok(out)
    }

    fn act_elements(&self) -> Result<BTreeMap<u32, XmlElem>> {
        let mut out = BTreeMap::new();
        let acts_xml = match &self.acts_xml {
            Some(p) => p,
            None => return Ok(out),
        };
        stream_elements(acts_xml, "ACT", &mut |el| {
            if let Some(aid) = el.parse_id() {
                out.insert(aid, el);
            }
            Ok(())
        })?;
        Ok(out)
    }

    fn cover_elements(&self) -> BTreeMap<u32, XmlElem> {
        let covers = self.export_root.join("covers.xml");
        let mut out = BTreeMap::new();
        if !covers.is_file() {
            return out;
        }
        let _ = stream_elements(&covers, "TPAGE_BIT", &mut |el| {
            let name = el.attr_ci(&["NAME"]).unwrap_or("");
            if let Some(sid) = name
                .to_lowercase()
                .strip_prefix("cover_")
                .and_then(|rest| rest.parse::<u32>().ok())
            {
                out.insert(sid, el);
            }
            Ok(())
        });
        out
    }
}

fn write_xml_doc(path: &Path, root: &XmlElem) -> Result<()> {
    let mut buf: Vec<u8> = Vec::new();
    buf.extend_from_slice(b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    let mut writer = Writer::new_with_indent(&mut buf, b' ', 2);
    root.write_into(&mut writer)?;
    buf.push(b'\n');
    fs::write(path, &buf)?;
    Ok(())
}

fn remove_bank_files(export_dir: &Path) -> Result<()> {
    for entry in fs::read_dir(export_dir)?.flatten() {
        let p = entry.path();
        if !p.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        let is_bank_xml = (name.starts_with("songs_") || name.starts_with("acts_")) && name.ends_with("_0.xml");
        if is_bank_xml {
            fs::remove_file(&p)?;
        }
    }
    Ok(())
}

/// Collect PERFORMED_BY act references from a set of song elements.
fn referenced_act_ids(songs: &BTreeMap<u32, XmlElem>) -> BTreeSet<u32> {
    let mut ids = BTreeSet::new();
    for el in songs.values() {
        for d in el.descendants() {
            if d.name_is("PERFORMED_BY") {
                if let Some(aid) = d.parse_id() {
                    ids.insert(aid);
                }
            }
        }
    }
    ids
}

struct Pipeline<'a> {
    base_ri: &'a ResolvedInput,
    donors: Vec<(String, &'a ResolvedInput)>,
    out_dir: &'a Path,
    selected: &'a BTreeSet<u32>,
    winners: BTreeMap<u32, String>,
    opts: &'a SubsetOptions,
    cancel: &'a CancelToken,
}

impl<'a> Pipeline<'a> {
    fn winner_of(&self, sid: u32) -> &str {
        self.winners.get(&sid).map(|s| s.as_str()).unwrap_or(BASE_LABEL)
    }

    fn donor_won(&self, label: &str) -> BTreeSet<u32> {
        self.selected.iter().copied().filter(|sid| self.winner_of(*sid) == label).collect()
    }

    fn base_won(&self) -> BTreeSet<u32> {
        self.selected
            .iter()
            .copied()
            .filter(|sid| {
                let w = self.winner_of(*sid);
                w == BASE_LABEL || !self.donors.iter().any(|(l, _)| l == w)
            })
            .collect()
    }

    fn prune(&self, export_dir: &Path, progress: ProgressFn) -> Result<()> {
        let mut victims: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(export_dir)?.flatten() {
            let p = entry.path();
            if !p.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(sid) = name.parse::<u32>() {
                if !self.selected.contains(&sid) {
                    victims.push(p);
                }
            }
        }
        let total = victims.len() as u64;
        for (i, p) in victims.iter().enumerate() {
            self.cancel.raise_if_cancelled()?;
            fs::remove_dir_all(p)?;
            progress(&ProgressEvent::counted("prune", format!("Removed {}", p.display()), i as u64 + 1, total));
        }
        Ok(())
    }

    fn merge_donor_songs(&self, export_dir: &Path, progress: ProgressFn) -> Result<()> {
        for (label, ri) in &self.donors {
            let wanted = self.donor_won(label);
            if wanted.is_empty() {
                continue;
            }
            let total = wanted.len() as u64;
            for (i, sid) in wanted.iter().enumerate() {
                self.cancel.raise_if_cancelled()?;
                let src = ri.export_root.join(sid.to_string());
                if !src.is_dir() {
                    warn!("donor {label} is winner for song {sid} but has no folder; keeping base copy");
                    continue;
                }
                let dst = export_dir.join(sid.to_string());
                if dst.exists() {
                    fs::remove_dir_all(&dst)?;
                }
                copy_tree(&src, &dst, self.cancel, |_| Ok(()))?;
                progress(&ProgressEvent::counted(
                    "copy songs",
                    format!("{label}: song {sid}"),
                    i as u64 + 1,
                    total,
                ));
            }
        }
        Ok(())
    }

    fn merge_textures(&self, export_dir: &Path, progress: ProgressFn) -> Result<()> {
        // Copy over texture pages referenced by selected songs that the base
        // tree does not already provide.
        let dst_textures = export_dir.join("textures");
        for (label, ri) in &self.donors {
            let wanted = self.donor_won(label);
            if wanted.is_empty() {
                continue;
            }
            let covers = covers_song_to_page(&ri.export_root);
            let pages: BTreeSet<u32> = wanted.iter().filter_map(|sid| covers.get(sid).copied()).collect();
            let src_textures = ri.export_root.join("textures");
            for page in pages {
                self.cancel.raise_if_cancelled()?;
                if texture_page_exists(&dst_textures, page) {
                    continue;
                }
                for ext in TEXTURE_EXTS {
                    let src = src_textures.join(format!("page_{page}.{ext}"));
                    if src.is_file() {
                        fs::create_dir_all(&dst_textures)?;
                        copy_file_preserving_mtime(&src, &dst_textures.join(format!("page_{page}.{ext}")))?;
                        progress(&ProgressEvent::indeterminate("textures", format!("{label}: page {page}")));
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn rewrite_indexes(&self, export_dir: &Path, progress: ProgressFn) -> Result<()> {
        progress(&ProgressEvent::indeterminate("write", "Rewriting song and act indexes"));

        let base_catalog = SourceCatalog::open(&self.base_ri.export_root);
        let donor_catalogs: Vec<(String, SourceCatalog)> = self
            .donors
            .iter()
            .map(|(label, ri)| (label.clone(), SourceCatalog::open(&ri.export_root)))
            .collect();

        // SONG elements come from each song's winning source.
        let mut songs: BTreeMap<u32, XmlElem> = base_catalog.song_elements(&self.base_won())?;
        for (label, cat) in &donor_catalogs {
            let wanted = self.donor_won(label);
            for (sid, el) in cat.song_elements(&wanted)? {
                songs.insert(sid, el);
            }
        }
        if songs.is_empty() {
            return Err(fatal("no catalog entries found for the selected songs".to_string()));
        }

        // ACT elements for every referenced performer, donors overriding the
        // base only for ids the base does not define.
        let wanted_acts = referenced_act_ids(&songs);
        let mut acts: BTreeMap<u32, XmlElem> = BTreeMap::new();
        for (_, cat) in donor_catalogs.iter().rev() {
            for (aid, el) in cat.act_elements()? {
                if wanted_acts.contains(&aid) {
                    acts.insert(aid, el);
                }
            }
        }
        for (aid, el) in base_catalog.act_elements()? {
            if wanted_acts.contains(&aid) {
                acts.insert(aid, el);
            }
        }

        let songs_root_meta = base_catalog
            .songs_xml
            .as_deref()
            .or(donor_catalogs.iter().find_map(|(_, c)| c.songs_xml.as_deref()))
            .map(read_root_meta)
            .transpose()?
            .unwrap_or_else(|| XmlElem::new("SONGS"));
        let acts_root_meta = base_catalog
            .acts_xml
            .as_deref()
            .or(donor_catalogs.iter().find_map(|(_, c)| c.acts_xml.as_deref()))
            .map(read_root_meta)
            .transpose()?
            .unwrap_or_else(|| XmlElem::new("ACTS"));

        let mut songs_root = XmlElem::new(&songs_root_meta.name);
        songs_root.attrs = songs_root_meta.attrs.clone();
        songs_root.children = songs.into_values().collect();
        let mut acts_root = XmlElem::new(&acts_root_meta.name);
        acts_root.attrs = acts_root_meta.attrs.clone();
        acts_root.children = acts.into_values().collect();

        remove_bank_files(export_dir)?;
        let v = self.opts.target_version;
        write_xml_doc(&export_dir.join(format!("songs_{v}_0.xml")), &songs_root)?;
        write_xml_doc(&export_dir.join(format!("acts_{v}_0.xml")), &acts_root)?;

        self.rewrite_covers(export_dir, &base_catalog, &donor_catalogs)?;
        self.rewrite_chc(export_dir, progress)?;
        self.rewrite_config(export_dir, progress)?;
        Ok(())
    }

    fn rewrite_covers(
        &self,
        export_dir: &Path,
        base_catalog: &SourceCatalog,
        donor_catalogs: &[(String, SourceCatalog)],
    ) -> Result<()> {
        let out_covers = export_dir.join("covers.xml");
        let base_rows = base_catalog.cover_elements();
        let donor_rows: BTreeMap<&str, BTreeMap<u32, XmlElem>> =
            donor_catalogs.iter().map(|(l, c)| (l.as_str(), c.cover_elements())).collect();

        let mut rows: BTreeMap<u32, XmlElem> = BTreeMap::new();
        for &sid in self.selected {
            let winner = self.winner_of(sid);
            let row = donor_rows
                .get(winner)
                .and_then(|m| m.get(&sid))
                .or_else(|| base_rows.get(&sid))
                .or_else(|| donor_rows.values().find_map(|m| m.get(&sid)));
            if let Some(row) = row {
                rows.insert(sid, row.clone());
            }
        }
        if rows.is_empty() {
            // Nothing referenced; drop a stale covers.xml rather than ship one
            // that names pruned songs.
            if out_covers.is_file() {
                fs::remove_file(&out_covers)?;
            }
            return Ok(());
        }

        let root_meta = if base_catalog.export_root.join("covers.xml").is_file() {
            read_root_meta(&base_catalog.export_root.join("covers.xml"))?
        } else {
            XmlElem::new("TPAGES")
        };
        let mut root = XmlElem::new(&root_meta.name);
        root.attrs = root_meta.attrs;
        root.children = rows.into_values().collect();
        write_xml_doc(&out_covers, &root)
    }

    fn rewrite_chc(&self, export_dir: &Path, progress: ProgressFn) -> Result<()> {
        // Opaque melody banks: carry them under the target bank's name so the
        // rewritten config stays self-consistent.
        let base_bank = parse_config(&self.base_ri.export_root)
            .ok()
            .and_then(|(_, _, versions)| versions.into_iter().max())
            .unwrap_or(1);
        let v = self.opts.target_version;
        if base_bank == v {
            return Ok(());
        }
        let needle = format!("_{base_bank}");
        let replacement = format!("_{v}");
        let mut renames: Vec<(PathBuf, PathBuf)> = Vec::new();
        for entry in fs::read_dir(export_dir)?.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let lower = name.to_lowercase();
            if lower.starts_with("melodies_") && lower.ends_with(".chc") && name.contains(&needle) {
                let new_name = name.replacen(&needle, &replacement, 1);
                renames.push((entry.path(), export_dir.join(new_name)));
            }
        }
        for (src, dst) in renames {
            progress(&ProgressEvent::indeterminate("chc", format!("Renaming {}", src.display())));
            fs::rename(&src, &dst)?;
        }
        Ok(())
    }

    fn rewrite_config(&self, export_dir: &Path, progress: ProgressFn) -> Result<()> {
        let cfg = export_dir.join("config.xml");
        if !cfg.is_file() {
            return Ok(());
        }
        progress(&ProgressEvent::indeterminate("config", "Rewriting config.xml"));
        let mut root = read_document(&cfg)?;
        let template = root.children.iter().find(|c| c.name_is("VERSION")).cloned();
        root.children.retain(|c| !c.name_is("VERSION"));
        let mut version = template.unwrap_or_else(|| XmlElem::new("VERSION"));
        version.attrs.retain(|(k, _)| !k.eq_ignore_ascii_case("version"));
        version.attrs.push(("version".to_string(), self.opts.target_version.to_string()));
        root.children.push(version);
        write_xml_doc(&cfg, &root)
    }

    fn finalize_replace(&self, temp_dir: &Path, progress: ProgressFn) -> Result<Option<PathBuf>> {
        progress(&ProgressEvent::indeterminate("finalize", "Replacing output folder"));
        let mut backup: Option<PathBuf> = None;
        if self.out_dir.exists() {
            if self.opts.keep_backup {
                let ts = Local::now().format("%Y%m%d_%H%M%S");
                let name = self.out_dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "disc".to_string());
                let aside = self.out_dir.with_file_name(format!("{name}.backup.{ts}"));
                fs::rename(self.out_dir, &aside)?;
                backup = Some(aside);
            } else {
                fs::remove_dir_all(self.out_dir)?;
            }
        }
        if let Err(first) = fs::rename(temp_dir, self.out_dir) {
            // Rename fallback: clear any racing target and retry once.
            if self.out_dir.exists() {
                fs::remove_dir_all(self.out_dir)?;
            }
            fs::rename(temp_dir, self.out_dir).map_err(|e| {
                fatal(format!(
                    "atomic replace failed ({first}; retry: {e}); finished build left at {}",
                    temp_dir.display()
                ))
            })?;
        }
        Ok(backup)
    }
}

/// Run the subset build. `source_ris` is `(label, resolved donor)` in donor
/// order; `preferred_source_by_song_id` routes individual songs.
#[allow(clippy::too_many_arguments)]
pub fn build_subset(
    base_ri: &ResolvedInput,
    source_ris: &[(String, &ResolvedInput)],
    out_dir: &Path,
    selected_song_ids: &BTreeSet<u32>,
    preferred_source_by_song_id: &BTreeMap<u32, String>,
    opts: &SubsetOptions,
    progress: ProgressFn,
    cancel: &CancelToken,
) -> Result<()> {
    if selected_song_ids.is_empty() {
        return Err(fatal("no songs selected; refusing to build an empty disc".to_string()));
    }
    if out_dir.exists() && !opts.allow_overwrite && !opts.fast_update {
        return Err(fatal(format!(
            "output folder already exists: {} (enable overwrite to replace it)",
            out_dir.display()
        )));
    }
    cancel.raise_if_cancelled()?;

    let winners: BTreeMap<u32, String> = selected_song_ids
        .iter()
        .map(|&sid| {
            let w = preferred_source_by_song_id.get(&sid).cloned().unwrap_or_else(|| BASE_LABEL.to_string());
            (sid, w)
        })
        .collect();

    let pipeline = Pipeline {
        base_ri,
        donors: source_ris.iter().map(|(l, ri)| (l.clone(), *ri)).collect(),
        out_dir,
        selected: selected_song_ids,
        winners,
        opts,
        cancel,
    };

    if opts.fast_update {
        return run_fast_update(&pipeline, progress);
    }

    let parent = out_dir.parent().ok_or_else(|| fatal("output folder has no parent".to_string()))?;
    fs::create_dir_all(parent)?;
    let name = out_dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "disc".to_string());
    let temp_dir = parent.join(format!("{name}{BUILDING_SUFFIX}"));
    if temp_dir.exists() {
        fs::remove_dir_all(&temp_dir)?;
    }

    let mut finalized = false;
    let result = (|| -> Result<()> {
        // Copy base -> temp, preserving modification times.
        let copy_src = match base_ri.kind {
            ResolvedKind::ExportOnly => base_ri.export_root.clone(),
            _ => base_ri.resolved_root.clone(),
        };
        let total = count_files(&copy_src);
        progress(&ProgressEvent::counted("copy", format!("Copying base from {}", copy_src.display()), 0, total));
        copy_tree(&copy_src, &temp_dir, cancel, |n| {
            if n % 50 == 0 || n == total {
                progress(&ProgressEvent::counted("copy", "Copying base", n, total));
            }
            Ok(())
        })?;

        let export_dir = temp_dir.join(export_rel(base_ri)?);
        if !export_dir.is_dir() {
            return Err(fatal(format!("copied tree has no export folder at {}", export_dir.display())));
        }

        pipeline.prune(&export_dir, progress)?;
        pipeline.merge_donor_songs(&export_dir, progress)?;
        pipeline.merge_textures(&export_dir, progress)?;
        pipeline.rewrite_indexes(&export_dir, progress)?;

        let backup = pipeline.finalize_replace(&temp_dir, progress)?;
        finalized = true;
        if let Some(b) = backup {
            info!("previous output kept at {}", b.display());
        }
        progress(&ProgressEvent::indeterminate("done", format!("Build complete: {}", out_dir.display())));
        Ok(())
    })();

    if result.is_err() && !finalized && temp_dir.exists() {
        // Default cleanup policy: remove the temp tree, keep any backup.
        // A failure during the replace itself leaves temp in place above.
        if let Err(e) = fs::remove_dir_all(&temp_dir) {
            warn!("could not remove temp build dir {}: {e}", temp_dir.display());
        }
    }
    result
}

/// Overwrite-target-only mode: back up the existing output, then apply
/// prune/merge/rewrite directly inside it. Refuses when the existing output
/// does not look like it came from this base.
fn run_fast_update(pipeline: &Pipeline<'_>, progress: ProgressFn) -> Result<()> {
    let out_dir = pipeline.out_dir;
    if !out_dir.is_dir() {
        return Err(fatal(format!("fast update requires an existing output folder: {}", out_dir.display())));
    }

    let existing = crate::layout::resolve_input(&out_dir.to_string_lossy())
        .map_err(|e| fatal(format!("fast update: existing output unreadable: {e}")))?;
    let existing_product = parse_config(&existing.export_root).ok().and_then(|(code, _, _)| code);
    let base_product = parse_config(&pipeline.base_ri.export_root).ok().and_then(|(code, _, _)| code);
    if existing_product != base_product {
        return Err(fatal(format!(
            "fast update refused: existing output product {:?} does not match base {:?}",
            existing_product, base_product
        )));
    }

    if pipeline.opts.keep_backup {
        let ts = Local::now().format("%Y%m%d_%H%M%S");
        let name = out_dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "disc".to_string());
        let backup = out_dir.with_file_name(format!("{name}.backup.{ts}"));
        progress(&ProgressEvent::indeterminate("copy", "Backing up existing output"));
        copy_tree(out_dir, &backup, pipeline.cancel, |_| Ok(()))?;
        info!("fast update: backup at {}", backup.display());
    }

    let export_dir = existing.export_root.clone();
    pipeline.prune(&export_dir, progress)?;
    pipeline.merge_donor_songs(&export_dir, progress)?;
    pipeline.merge_textures(&export_dir, progress)?;
    pipeline.rewrite_indexes(&export_dir, progress)?;
    progress(&ProgressEvent::indeterminate("done", format!("Fast update complete: {}", out_dir.display())));
    Ok(())
}
