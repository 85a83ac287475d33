/// The common module is the grab bag of small shared helpers: file hashing,
/// the MP4 sanity probe, console text cleanup, and logging initialization.
use std::collections::HashSet;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use directories::ProjectDirs;
use regex::Regex;
use sha1::{Digest, Sha1};

use crate::error::{Result, SpcdbError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const TOOL_NAME: &str = "SPCDB";

const HASH_CHUNK_SIZE: usize = 1024 * 1024;

/// SHA-1 hexdigest of a file, or None if missing/unreadable.
pub fn sha1_file(path: &Path) -> Option<String> {
    if !path.is_file() {
        return None;
    }
    let mut f = fs::File::open(path).ok()?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = f.read(&mut buf).ok()?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Some(format!("{:x}", hasher.finalize()))
}

/// SHA-1 hexdigest of a UTF-8 string.
pub fn sha1_hex(s: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(s.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Return a candidate media file for a song folder.
///
/// We prefer `<stem>.mp4`, but accept common case variants and `.m4v`.
pub fn find_media_file(song_dir: &Path, stem: &str) -> Option<PathBuf> {
    for ext in ["mp4", "m4v"] {
        let cand = song_dir.join(format!("{stem}.{ext}"));
        if cand.is_file() {
            return Some(cand);
        }
    }
    let want: HashSet<String> = [format!("{stem}.mp4"), format!("{stem}.m4v")]
        .iter()
        .map(|s| s.to_lowercase())
        .collect();
    let entries = fs::read_dir(song_dir).ok()?;
    for entry in entries.flatten() {
        let p = entry.path();
        if !p.is_file() {
            continue;
        }
        if let Some(name) = p.file_name().and_then(|n| n.to_str()) {
            if want.contains(&name.to_lowercase()) {
                return Some(p);
            }
        }
    }
    None
}

/// Fast, dependency-free MP4 sanity check.
///
/// This does NOT guarantee the file is fully decodable, but it catches common
/// extraction failures (missing/zero-byte/truncated/garbled files) without
/// decoding anything.
///
/// Checks:
///   - exists + size >= min_bytes
///   - `ftyp` marker in the first ~2KB
///   - `moov` or `mdat` marker in the head (64KB) or tail (256KB) window
pub fn is_probably_valid_mp4(path: &Path, min_bytes: u64) -> (bool, String) {
    let size = match fs::metadata(path) {
        Ok(md) => md.len(),
        Err(e) => return (false, format!("read failed: {e}")),
    };
    if size < min_bytes {
        return (false, format!("too small ({size} bytes)"));
    }

    let mut f = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) => return (false, format!("read failed: {e}")),
    };

    let mut head = vec![0u8; 65536.min(size as usize)];
    if let Err(e) = f.read_exact(&mut head) {
        return (false, format!("read failed: {e}"));
    }

    let tail: Vec<u8> = if size > 262144 {
        let mut t = vec![0u8; 262144];
        match f.seek(SeekFrom::Start(size - 262144)).and_then(|_| f.read_exact(&mut t)) {
            Ok(()) => t,
            Err(_) => Vec::new(),
        }
    } else {
        head.clone()
    };

    let probe = |hay: &[u8], needle: &[u8]| hay.windows(needle.len()).any(|w| w == needle);

    if !probe(&head[..2048.min(head.len())], b"ftyp") {
        return (false, "missing ftyp marker".to_string());
    }
    if !probe(&head, b"moov") && !probe(&tail, b"moov") && !probe(&head, b"mdat") && !probe(&tail, b"mdat") {
        return (false, "missing moov/mdat markers".to_string());
    }
    (true, String::new())
}

lazy_static::lazy_static! {
    static ref ANSI_CSI_REGEX: Regex = Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap();
    static ref ANSI_OSC_REGEX: Regex = Regex::new(r"\x1b\][^\x07]*\x07").unwrap();
}

/// Remove control chars / ANSI escapes and replacement glyphs from a console line.
pub fn sanitize_console_line(s: &str) -> String {
    let s = ANSI_CSI_REGEX.replace_all(s, "");
    let s = ANSI_OSC_REGEX.replace_all(&s, "");
    s.chars()
        .filter(|&ch| ch != '\u{fffd}' && (ch == '\t' || ch as u32 >= 32))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Decode raw subprocess output bytes. UTF-8 when valid, else Windows-1252,
/// which never fails (DOS codepage output degrades to mojibake-free text).
pub fn decode_console_bytes(b: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(b) {
        return s.to_string();
    }
    let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(b);
    decoded.into_owned()
}

/// Collapse runs of whitespace (incl. NBSP) into single spaces and trim.
pub fn norm_song_text(s: &str) -> String {
    s.replace('\u{a0}', " ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercased, whitespace-collapsed form for case-insensitive comparisons.
pub fn norm_ci(s: &str) -> String {
    norm_song_text(s).to_lowercase()
}

/// Format seconds as `m:ss` or `h:mm:ss`.
pub fn format_seconds_hhmmss(seconds: f64) -> String {
    let s = seconds.round().max(0.0) as u64;
    let hh = s / 3600;
    let mm = (s % 3600) / 60;
    let ss = s % 60;
    if hh > 0 {
        format!("{hh}:{mm:02}:{ss:02}")
    } else {
        format!("{mm}:{ss:02}")
    }
}

/// Normalize an input path for stable cache keys.
pub fn normalize_input_path(p: &str) -> String {
    let s = p.trim();
    if s.is_empty() {
        return String::new();
    }
    let expanded = shellexpand::tilde(s).into_owned();
    let pb = PathBuf::from(&expanded);
    if let Ok(canon) = pb.canonicalize() {
        return canon.to_string_lossy().into_owned();
    }
    if pb.is_absolute() {
        return expanded;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(pb).to_string_lossy().into_owned(),
        Err(_) => expanded,
    }
}

static LOGGING_INITIALIZED: Mutex<bool> = Mutex::new(false);
static LOG_GUARD: Mutex<Option<tracing_appender::non_blocking::WorkerGuard>> = Mutex::new(None);

/// Initialize the global tracing subscriber once. `output` is "stderr" or "file".
pub fn initialize_logging(output: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let mut initialized = LOGGING_INITIALIZED
        .lock()
        .map_err(|_| SpcdbError::Generic("logging init lock poisoned".to_string()))?;
    if *initialized {
        return Ok(());
    }
    *initialized = true;
    drop(initialized);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if output == "file" {
        let proj_dirs = ProjectDirs::from("", "", "spcdb")
            .ok_or_else(|| SpcdbError::Generic("failed to resolve project directories".to_string()))?;
        let log_dir = proj_dirs.state_dir().unwrap_or(proj_dirs.cache_dir()).to_path_buf();
        fs::create_dir_all(&log_dir)?;

        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::NEVER)
            .max_log_files(10)
            .filename_prefix("spcdb")
            .filename_suffix("log")
            .build(&log_dir)
            .map_err(|e| SpcdbError::Generic(format!("log file appender: {e}")))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        if let Ok(mut slot) = LOG_GUARD.lock() {
            *slot = Some(guard);
        }

        let subscriber = fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .with_writer(non_blocking)
            .with_target(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| SpcdbError::Generic(format!("set logging subscriber: {e}")))?;
    } else {
        let subscriber = fmt::Subscriber::builder().with_env_filter(env_filter).finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| SpcdbError::Generic(format!("set logging subscriber: {e}")))?;
    }

    Ok(())
}
