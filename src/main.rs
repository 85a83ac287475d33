use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use spcdb::build::{run_build_subset, BuildRequest};
use spcdb::catalog::build_song_catalog;
use spcdb::cleanup::{cleanup_extraction_artifacts, CleanupOptions};
use spcdb::common::initialize_logging;
use spcdb::conflicts::compute_song_id_conflicts;
use spcdb::error::SpcdbError;
use spcdb::extract::{extract_disc_pkds, verify_disc_extraction};
use spcdb::index::{index_disc, load_songs_for_disc_cached, CacheStore};
use spcdb::layout::resolve_input;
use spcdb::validate::validate_discs;

#[derive(Parser)]
#[command(name = "spcdb", version, about = "Assemble merged SingStar disc folders from a base disc plus donors")]
struct Cli {
    /// Override the index cache directory.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index a disc folder and print its DiscIndex.
    Index { path: PathBuf },
    /// Show or clear the persistent index cache entry for a path.
    Cache {
        path: Option<PathBuf>,
        #[arg(long)]
        clear: bool,
    },
    /// Aggregate the song catalog across a base disc and donors.
    Catalog {
        base: PathBuf,
        /// Donor discs as label=path.
        #[arg(long = "donor", value_parser = parse_labeled)]
        donors: Vec<(String, PathBuf)>,
    },
    /// Detect and list song-id conflicts across sources.
    Conflicts {
        base: PathBuf,
        #[arg(long = "donor", value_parser = parse_labeled)]
        donors: Vec<(String, PathBuf)>,
    },
    /// Validate discs given as label=path.
    Validate {
        #[arg(value_parser = parse_labeled)]
        targets: Vec<(String, PathBuf)>,
    },
    /// Extract all Pack*.pkd files of a disc with the external extractor.
    Extract {
        extractor: PathBuf,
        disc_root: PathBuf,
    },
    /// Verify a disc looks correctly extracted.
    Verify { disc_root: PathBuf },
    /// Remove extraction artifacts (move-to-trash by default).
    Cleanup {
        disc_root: PathBuf,
        /// Also remove Pack*.pkd archive files.
        #[arg(long)]
        pkd_files: bool,
        /// Permanently delete instead of moving to trash.
        #[arg(long)]
        delete: bool,
        #[arg(long)]
        trash_root: Option<PathBuf>,
    },
    /// Build a subset disc from a base plus donors.
    Build {
        #[arg(long)]
        base: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long = "donor", value_parser = parse_labeled)]
        donors: Vec<(String, PathBuf)>,
        /// Selected song ids (repeatable, comma lists accepted).
        #[arg(long = "select", value_delimiter = ',')]
        select: Vec<u32>,
        /// Explicit winner per song as id=label.
        #[arg(long = "prefer", value_parser = parse_preference)]
        prefer: Vec<(u32, String)>,
        #[arg(long)]
        preflight: bool,
        #[arg(long)]
        block_on_errors: bool,
        #[arg(long)]
        overwrite: bool,
        #[arg(long)]
        no_backup: bool,
        #[arg(long)]
        fast_update: bool,
        #[arg(long, default_value_t = 6)]
        target_version: u32,
    },
}

fn parse_labeled(s: &str) -> Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((label, path)) if !label.is_empty() && !path.is_empty() => Ok((label.to_string(), PathBuf::from(path))),
        _ => Err(format!("expected label=path, got '{s}'")),
    }
}

fn parse_preference(s: &str) -> Result<(u32, String), String> {
    match s.split_once('=') {
        Some((id, label)) if !label.is_empty() => {
            let id: u32 = id.parse().map_err(|_| format!("bad song id in '{s}'"))?;
            Ok((id, label.to_string()))
        }
        _ => Err(format!("expected id=label, got '{s}'")),
    }
}

fn open_store(cache_dir: &Option<PathBuf>) -> spcdb::Result<CacheStore> {
    match cache_dir {
        Some(dir) => Ok(CacheStore::open(dir.clone())),
        None => CacheStore::open_default(),
    }
}

fn load_catalog(
    store: &CacheStore,
    base: &PathBuf,
    donors: &[(String, PathBuf)],
) -> spcdb::Result<(Vec<spcdb::SongAgg>, BTreeMap<String, PathBuf>)> {
    let mut discs = Vec::new();
    let mut roots: BTreeMap<String, PathBuf> = BTreeMap::new();

    let base_idx = index_disc(store, base)?;
    roots.insert("Base".to_string(), base_idx.export_root.clone());
    discs.push(("Base".to_string(), base_idx, true));
    for (label, path) in donors {
        let idx = index_disc(store, path)?;
        roots.insert(label.clone(), idx.export_root.clone());
        discs.push((label.clone(), idx, false));
    }

    let mut log = |line: &str| println!("{line}");
    let (songs, _ids) = build_song_catalog(store, &discs, None, Some(&mut log))?;
    Ok((songs, roots))
}

fn run(cli: Cli) -> spcdb::Result<()> {
    let store = open_store(&cli.cache_dir)?;
    let mut log = |line: &str| println!("{line}");

    match cli.command {
        Command::Index { path } => {
            let idx = index_disc(&store, &path)?;
            let songs = load_songs_for_disc_cached(&store, &idx)?;
            println!("Input:        {}", idx.input_path.display());
            println!("Export root:  {}", idx.export_root.display());
            println!("Product:      {}", idx.product_desc.or(idx.product_code).unwrap_or_default());
            println!("Bank:         {}/{}", idx.chosen_bank, idx.max_bank);
            println!("Songs:        {}", songs.len());
            for w in &idx.warnings {
                println!("Warning:      {w}");
            }
        }
        Command::Cache { path, clear } => {
            if clear {
                let (ok, msg) = store.clear();
                println!("{}: {msg}", if ok { "ok" } else { "failed" });
            } else if let Some(path) = path {
                let status = store.status(&path);
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("cache dir: {}", store.dir().display());
            }
        }
        Command::Catalog { base, donors } => {
            let (songs, _roots) = load_catalog(&store, &base, &donors)?;
            for s in &songs {
                println!("{}\t{}\t{}\t[{}] {}", s.song_id, s.title, s.artist, s.preferred_source, s.sources.join(","));
            }
            println!("{} song(s) total", songs.len());
        }
        Command::Conflicts { base, donors } => {
            let (songs, roots) = load_catalog(&store, &base, &donors)?;
            let conflicts = compute_song_id_conflicts(&songs, &roots);
            for (sid, occs) in &conflicts {
                println!("song {sid}:");
                for o in occs {
                    println!(
                        "  {}: sha1={} fp={}",
                        o.source_label,
                        o.melody1_sha1.as_deref().unwrap_or("MISSING"),
                        o.melody1_fp.as_deref().unwrap_or("MISSING")
                    );
                }
            }
            println!("{} conflict(s)", conflicts.len());
        }
        Command::Validate { targets } => {
            let (_results, report) = validate_discs(&store, &targets, Some(&mut log), None)?;
            println!("{report}");
        }
        Command::Extract { extractor, disc_root } => {
            let (dest, harvested, _stats) = extract_disc_pkds(&extractor, &disc_root, &mut log, None, false)?;
            println!("Harvested {harvested} file(s) into {}", dest.display());
        }
        Command::Verify { disc_root } => {
            let res = verify_disc_extraction(&store, &disc_root, Some(&mut log));
            println!("{}", serde_json::to_string_pretty(&res)?);
            if !res.ok {
                return Err(SpcdbError::Generic("disc verification reported problems".to_string()));
            }
        }
        Command::Cleanup {
            disc_root,
            pkd_files,
            delete,
            trash_root,
        } => {
            let opts = CleanupOptions {
                include_pkd_out_dirs: true,
                include_pkd_files: pkd_files,
                delete_instead: delete,
                trash_root_dir: trash_root,
            };
            let res = cleanup_extraction_artifacts(&disc_root, &opts, Some(&mut log))?;
            println!("{}", serde_json::to_string_pretty(&res)?);
        }
        Command::Build {
            base,
            out,
            donors,
            select,
            prefer,
            preflight,
            block_on_errors,
            overwrite,
            no_backup,
            fast_update,
            target_version,
        } => {
            // Refuse packed inputs up front so the failure names the missing
            // extractor step instead of a mysterious copy error.
            let base_ri = resolve_input(&base.to_string_lossy())?;
            if base_ri.kind == spcdb::layout::ResolvedKind::Packed {
                return Err(SpcdbError::Generic(
                    "base disc is still packed; run `spcdb extract` on it first".to_string(),
                ));
            }

            let mut req = BuildRequest::new(base, out);
            req.needed_donors = donors.iter().map(|(l, _)| l.clone()).collect::<BTreeSet<_>>();
            req.src_label_paths = donors;
            req.selected_song_ids = select.into_iter().collect();
            req.preferred_source_by_song_id = prefer.into_iter().collect();
            req.preflight_validate = preflight;
            req.block_on_errors = block_on_errors;
            req.allow_overwrite_output = overwrite;
            req.keep_backup_of_existing_output = !no_backup;
            req.fast_update_existing_output = fast_update;
            req.target_version = target_version;

            let mut report_sink = |text: &str| print!("{text}");
            run_build_subset(&store, &req, &mut log, Some(&mut report_sink), None, None)?;
            println!("Build complete: {}", req.out_dir.display());
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    if let Err(e) = initialize_logging("stderr") {
        eprintln!("warning: logging init failed: {e}");
    }
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(SpcdbError::Blocked(msg)) => {
            eprintln!("BUILD BLOCKED: {msg}");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
