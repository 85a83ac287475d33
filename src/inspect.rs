/// Disc inspection: config.xml parsing, bank discovery, covers/texture
/// cross-checks, and the media sanity scan.
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::common::{find_media_file, is_probably_valid_mp4};
use crate::error::Result;
use crate::xmlread::{read_document, stream_elements};

lazy_static::lazy_static! {
    static ref COVER_NAME_REGEX: Regex = Regex::new(r"(?i)^cover_(\d+)$").unwrap();
    static ref COVER_PAGE_REGEX: Regex = Regex::new(r"(?i)^page_(\d+)$").unwrap();
    static ref SONGS_XML_REGEX: Regex = Regex::new(r"(?i)^songs_(\d+)_0\.xml$").unwrap();
}

pub const TEXTURE_EXTS: [&str; 5] = ["jpg", "png", "gtf", "dds", "bmp"];

/// Parse `Export/config.xml`: product code, product description, and the set
/// of `VERSION@version` banks. Missing config.xml surfaces as an IO
/// not-found error so callers can distinguish it from a parse failure.
pub fn parse_config(export_root: &Path) -> Result<(Option<String>, Option<String>, Vec<u32>)> {
    let cfg = export_root.join("config.xml");
    if !cfg.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("config.xml not found under {}", export_root.display()),
        )
        .into());
    }

    let root = read_document(&cfg)?;
    let product_code = root.find_text_by_tags_ci(&["PRODUCT_CODE"]);
    let product_desc = root.find_text_by_tags_ci(&["PRODUCT_DESC"]);

    let mut versions: BTreeSet<u32> = BTreeSet::new();
    for child in &root.children {
        if child.name_is("VERSION") {
            if let Some(v) = child.attr_ci(&["version"]) {
                if let Ok(n) = v.trim().parse::<u32>() {
                    versions.insert(n);
                }
            }
        }
    }
    Ok((product_code, product_desc, versions.into_iter().collect()))
}

/// Return `(bank, songs_xml, acts_xml)`: the preferred bank when its pair is
/// complete, else the highest bank with both files present.
pub fn best_bank_files(export_root: &Path, preferred_bank: u32) -> Option<(u32, PathBuf, PathBuf)> {
    let songs_p = export_root.join(format!("songs_{preferred_bank}_0.xml"));
    let acts_p = export_root.join(format!("acts_{preferred_bank}_0.xml"));
    if songs_p.is_file() && acts_p.is_file() {
        return Some((preferred_bank, songs_p, acts_p));
    }

    let mut best: Option<(u32, PathBuf, PathBuf)> = None;
    if let Ok(entries) = fs::read_dir(export_root) {
        for entry in entries.flatten() {
            let p = entry.path();
            let name = match p.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            let v: u32 = match SONGS_XML_REGEX.captures(name).and_then(|c| c.get(1)).and_then(|m| m.as_str().parse().ok()) {
                Some(v) => v,
                None => continue,
            };
            let acts = export_root.join(format!("acts_{v}_0.xml"));
            if !acts.is_file() {
                continue;
            }
            if best.as_ref().map(|(bv, _, _)| v > *bv).unwrap_or(true) {
                best = Some((v, p, acts));
            }
        }
    }
    best
}

/// Parse `Export/covers.xml` into `song_id -> page_num`. Parse failures yield
/// whatever mapped cleanly before the failure.
pub fn covers_song_to_page(export_root: &Path) -> BTreeMap<u32, u32> {
    let covers = export_root.join("covers.xml");
    let mut out = BTreeMap::new();
    if !covers.is_file() {
        return out;
    }
    let _ = stream_elements(&covers, "TPAGE_BIT", &mut |el| {
        let name = el.attr_ci(&["NAME"]).unwrap_or("").trim().to_string();
        let tex = el.attr_ci(&["TEXTURE"]).unwrap_or("").trim().to_string();
        let sid: Option<u32> = COVER_NAME_REGEX.captures(&name).and_then(|c| c.get(1)).and_then(|m| m.as_str().parse().ok());
        let page: Option<u32> = COVER_PAGE_REGEX.captures(&tex).and_then(|c| c.get(1)).and_then(|m| m.as_str().parse().ok());
        if let (Some(sid), Some(page)) = (sid, page) {
            out.insert(sid, page);
        }
        Ok(())
    });
    out
}

pub fn texture_page_exists(textures_dir: &Path, page_num: u32) -> bool {
    TEXTURE_EXTS.iter().any(|ext| textures_dir.join(format!("page_{page_num}.{ext}")).exists())
}

/// Collect the distinct SONG ids from a songs XML.
pub fn song_ids_from_songs_xml(songs_xml: &Path) -> Result<BTreeSet<u32>> {
    let mut ids = BTreeSet::new();
    stream_elements(songs_xml, "SONG", &mut |el| {
        if let Some(sid) = el.parse_id() {
            ids.insert(sid);
        }
        Ok(())
    })?;
    Ok(ids)
}

/// Best-effort scan when config.xml is missing (common for partial XML-only
/// donors).
pub fn minimal_export_scan(export_root: &Path) -> BTreeMap<String, u64> {
    let mut numeric_dirs = 0u64;
    let mut songs_xml_files = 0u64;
    let mut banks: BTreeSet<u32> = BTreeSet::new();
    let mut chc_files = 0u64;

    if let Ok(entries) = fs::read_dir(export_root) {
        for entry in entries.flatten() {
            let p = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if p.is_dir() && name.chars().all(|c| c.is_ascii_digit()) && !name.is_empty() {
                numeric_dirs += 1;
            } else if p.is_file() {
                if let Some(c) = SONGS_XML_REGEX.captures(&name) {
                    songs_xml_files += 1;
                    if let Some(v) = c.get(1).and_then(|m| m.as_str().parse().ok()) {
                        banks.insert(v);
                    }
                } else if name.to_lowercase().starts_with("melodies_") && name.to_lowercase().ends_with(".chc") {
                    chc_files += 1;
                }
            }
        }
    }

    let mut texture_pages = 0u64;
    let textures_dir = export_root.join("textures");
    if let Ok(entries) = fs::read_dir(&textures_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if name.starts_with("page_") && TEXTURE_EXTS.iter().any(|ext| name.ends_with(&format!(".{ext}"))) {
                texture_pages += 1;
            }
        }
    }

    BTreeMap::from([
        ("numeric_song_folders".to_string(), numeric_dirs),
        ("songs_xml_files".to_string(), songs_xml_files),
        ("banks_from_songs_xml".to_string(), banks.len() as u64),
        ("melodies_chc_files".to_string(), chc_files),
        ("texture_pages".to_string(), texture_pages),
    ])
}

/// Missing/corrupt preview+video info for a set of song ids.
#[derive(Debug, Clone, Default)]
pub struct MediaScan {
    pub missing_preview_ids: Vec<u32>,
    pub missing_video_ids: Vec<u32>,
    pub corrupt_preview: BTreeMap<u32, String>,
    pub corrupt_video: BTreeMap<u32, String>,
}

impl MediaScan {
    pub fn any_bad_ids(&self) -> Vec<u32> {
        let mut ids: BTreeSet<u32> = BTreeSet::new();
        ids.extend(&self.missing_preview_ids);
        ids.extend(&self.missing_video_ids);
        ids.extend(self.corrupt_preview.keys());
        ids.extend(self.corrupt_video.keys());
        ids.into_iter().collect()
    }

    pub fn is_clean(&self) -> bool {
        self.missing_preview_ids.is_empty()
            && self.missing_video_ids.is_empty()
            && self.corrupt_preview.is_empty()
            && self.corrupt_video.is_empty()
    }
}

/// Probe `{song_dir}/preview.*` and `{song_dir}/video.*` for each song id.
/// Song ids with no folder at all are skipped (the missing-folder check is a
/// separate concern).
pub fn scan_missing_or_corrupt_media(export_root: &Path, song_ids: &BTreeSet<u32>, min_media_bytes: u64) -> MediaScan {
    let mut scan = MediaScan::default();
    for &sid in song_ids {
        let song_dir = export_root.join(sid.to_string());
        if !song_dir.is_dir() {
            continue;
        }
        match find_media_file(&song_dir, "preview") {
            None => scan.missing_preview_ids.push(sid),
            Some(p) => {
                let (ok, reason) = is_probably_valid_mp4(&p, min_media_bytes);
                if !ok {
                    scan.corrupt_preview.insert(sid, reason);
                }
            }
        }
        match find_media_file(&song_dir, "video") {
            None => scan.missing_video_ids.push(sid),
            Some(p) => {
                let (ok, reason) = is_probably_valid_mp4(&p, min_media_bytes);
                if !ok {
                    scan.corrupt_video.insert(sid, reason);
                }
            }
        }
    }
    scan
}

/// Full inspection of an export root (requires config.xml).
#[derive(Debug, Clone, Default)]
pub struct ExportReport {
    pub product_code: Option<String>,
    pub product_desc: Option<String>,
    pub banks: Vec<u32>,
    pub best_bank: Option<u32>,
    pub song_count: u64,
    pub counts: BTreeMap<String, u64>,
    pub missing_refs: Vec<String>,
    pub warnings: Vec<String>,
}

pub fn inspect_export(export_root: &Path) -> Result<ExportReport> {
    let (product_code, product_desc, banks) = parse_config(export_root)?;

    let mut report = ExportReport {
        product_code,
        product_desc,
        banks: banks.clone(),
        counts: minimal_export_scan(export_root),
        ..Default::default()
    };

    let preferred = banks.iter().max().copied().unwrap_or(1);
    if let Some((bank, songs_xml, _acts_xml)) = best_bank_files(export_root, preferred) {
        report.best_bank = Some(bank);
        match song_ids_from_songs_xml(&songs_xml) {
            Ok(ids) => {
                report.song_count = ids.len() as u64;
                for sid in &ids {
                    let song_dir = export_root.join(sid.to_string());
                    if !song_dir.is_dir() {
                        report.missing_refs.push(format!("{sid}/"));
                    } else if !song_dir.join("melody_1.xml").is_file() {
                        report.missing_refs.push(format!("{sid}/melody_1.xml"));
                    }
                }
            }
            Err(e) => report.warnings.push(format!("songs XML unreadable: {e}")),
        }
    } else {
        report.warnings.push("No songs_<bank>_0.xml + acts_<bank>_0.xml pair found under Export root.".to_string());
    }

    report.counts.insert("songs_in_best_bank".to_string(), report.song_count);
    report.missing_refs.sort();
    report.missing_refs.dedup();
    Ok(report)
}
