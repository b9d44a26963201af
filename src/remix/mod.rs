pub mod cluster;
pub mod graph;
pub mod jukebox;
pub mod similarity;
pub mod walk;

pub use cluster::{select_clusters, ClusterSelection};
pub use graph::{Beat, BeatLayout, GraphOptions, PlayGraph};
pub use jukebox::{Jukebox, JukeboxOptions, PendingJukebox, ProgressFn};
pub use similarity::{build_embedding, SpectralEmbedding};
pub use walk::{generate_walk, RecentSegments, WalkConfig, WalkEntry, Walker};
