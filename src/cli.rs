use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "loopgraph", about = "Turn a song into an endlessly remixing beat graph")]
pub struct Cli {
    /// Input audio file (WAV, MP3, FLAC, OGG)
    pub input: PathBuf,

    /// Number of clusters (0 = choose automatically)
    #[arg(short, long, default_value_t = 0)]
    pub clusters: usize,

    /// Leading beats to skip; also where playback loops back to
    #[arg(long, default_value_t = 1)]
    pub start_beat: usize,

    /// Smallest cluster count tried by the automatic scan
    #[arg(long, default_value_t = 4)]
    pub min_clusters: usize,

    /// Largest cluster count tried by the automatic scan
    #[arg(long, default_value_t = 50)]
    pub max_clusters: usize,

    /// Seed for clustering and the play vector (random if unset)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of play vector entries to generate
    #[arg(long, default_value_t = 1 << 20)]
    pub walk_length: usize,

    /// Force a jump attempt after this many beats without one
    #[arg(long)]
    pub max_beats_between_jumps: Option<usize>,

    /// Drop beats after the song starts fading out
    #[arg(long)]
    pub truncate_at_fade: bool,

    /// Write the beat graph and play vector as JSON
    #[arg(long)]
    pub json: Option<PathBuf>,

    /// Play vector entries to include in the JSON export
    #[arg(long, default_value_t = 4096)]
    pub json_walk: usize,

    /// Print the first N play vector entries
    #[arg(long, default_value_t = 0)]
    pub preview: usize,

    /// Config file (defaults to ./loopgraph.toml or the user config dir)
    #[arg(long)]
    pub config: Option<PathBuf>,
}
