use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub struct FakeDisc {
    pub disc_root: PathBuf,
    pub ps3_game: PathBuf,
    pub export_root: PathBuf,
}

pub struct FakeDiscOptions {
    /// "ps3_game" (full disc wrapper) or "export_only".
    pub layout: &'static str,
    pub bank: u32,
    pub song_ids: Vec<u32>,
    pub include_textures: bool,
    pub include_covers: bool,
    pub include_chc: bool,
    pub include_media: bool,
    /// Per-song custom SENTENCE body for melody_1.xml; songs absent from the
    /// map get a default melody, songs mapped to None get no melody at all.
    pub melodies: BTreeMap<u32, Option<String>>,
}

impl Default for FakeDiscOptions {
    fn default() -> Self {
        Self {
            layout: "ps3_game",
            bank: 1,
            song_ids: vec![1, 2],
            include_textures: true,
            include_covers: true,
            include_chc: true,
            include_media: true,
            melodies: BTreeMap::new(),
        }
    }
}

/// A byte blob that passes the MP4 sanity probe: ftyp in the first 2KB, a
/// moov marker, and comfortably more than 1024 bytes.
pub fn fake_mp4_bytes() -> Vec<u8> {
    let mut v = Vec::with_capacity(2048);
    v.extend_from_slice(b"\x00\x00\x00\x18ftypmp42\x00\x00\x00\x00mp42isom");
    v.extend_from_slice(b"\x00\x00\x00\x08moov");
    v.resize(2048, 0);
    v
}

pub fn default_melody_sentences() -> String {
    r#"  <SENTENCE>
    <NOTE MidiNote="60" Duration="100" Lyric="la" Delay="0" />
    <NOTE MidiNote="62" Duration="50" Lyric="da" Delay="10" />
  </SENTENCE>
"#
    .to_string()
}

pub fn write_melody(song_dir: &Path, sentences: &str) {
    let xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<MELODY xmlns=\"http://www.singstargame.com\" Tempo=\"120\" Resolution=\"crotchet\">\n{sentences}</MELODY>\n"
    );
    fs::write(song_dir.join("melody_1.xml"), xml).unwrap();
}

/// Create a fake disc tree under `parent/<label>` with enough structure for
/// the resolver, inspector, indexer, and builder to operate on.
pub fn make_fake_disc(parent: &Path, label: &str, opts: &FakeDiscOptions) -> FakeDisc {
    let disc_root = parent.join(label);
    let (ps3_game, export_root) = if opts.layout == "export_only" {
        (disc_root.clone(), disc_root.join("Export"))
    } else {
        let ps3_game = disc_root.join("PS3_GAME");
        let export_root = ps3_game.join("USRDIR").join("FileSystem").join("Export");
        (ps3_game, export_root)
    };
    fs::create_dir_all(&export_root).unwrap();

    let bank = opts.bank;

    let config = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<CONFIG xmlns=\"http://www.singstargame.com\">\n  <PRODUCT_CODE>{label}</PRODUCT_CODE>\n  <PRODUCT_DESC>{label} disc</PRODUCT_DESC>\n  <VERSION version=\"{bank}\" />\n</CONFIG>\n"
    );
    fs::write(export_root.join("config.xml"), config).unwrap();

    let mut songs = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<SONGS xmlns=\"http://www.singstargame.com\">\n");
    let mut acts = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<ACTS xmlns=\"http://www.singstargame.com\">\n");
    for &sid in &opts.song_ids {
        songs.push_str(&format!(
            "  <SONG ID=\"{sid}\">\n    <TITLE>Song {sid}</TITLE>\n    <PERFORMED_BY ID=\"{sid}\" />\n  </SONG>\n"
        ));
        acts.push_str(&format!("  <ACT ID=\"{sid}\">\n    <NAME>Artist {sid}</NAME>\n  </ACT>\n"));
    }
    songs.push_str("</SONGS>\n");
    acts.push_str("</ACTS>\n");
    fs::write(export_root.join(format!("songs_{bank}_0.xml")), songs).unwrap();
    fs::write(export_root.join(format!("acts_{bank}_0.xml")), acts).unwrap();

    for &sid in &opts.song_ids {
        let song_dir = export_root.join(sid.to_string());
        fs::create_dir_all(&song_dir).unwrap();
        match opts.melodies.get(&sid) {
            Some(Some(sentences)) => write_melody(&song_dir, sentences),
            Some(None) => {}
            None => write_melody(&song_dir, &default_melody_sentences()),
        }
        if opts.include_media {
            fs::write(song_dir.join("preview.mp4"), fake_mp4_bytes()).unwrap();
            fs::write(song_dir.join("video.mp4"), fake_mp4_bytes()).unwrap();
        }
    }

    if opts.include_covers {
        let mut covers = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<TPAGES xmlns=\"http://www.singstargame.com\">\n");
        for &sid in &opts.song_ids {
            covers.push_str(&format!("  <TPAGE_BIT NAME=\"cover_{sid}\" TEXTURE=\"page_0\" />\n"));
        }
        covers.push_str("</TPAGES>\n");
        fs::write(export_root.join("covers.xml"), covers).unwrap();
    }

    if opts.include_textures {
        let textures = export_root.join("textures");
        fs::create_dir_all(&textures).unwrap();
        fs::write(textures.join("page_0.jpg"), b"\xff\xd8\xff\xe0fakejpg").unwrap();
    }

    if opts.include_chc {
        fs::write(export_root.join(format!("melodies_{bank}_0.chc")), b"\x00CHC\x01opaque").unwrap();
    }

    FakeDisc {
        disc_root,
        ps3_game,
        export_root,
    }
}
