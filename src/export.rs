use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;
use crate::remix::{Jukebox, PlayGraph, WalkEntry};

#[derive(Serialize)]
struct Document<'a> {
    version: u32,
    #[serde(flatten)]
    graph: &'a PlayGraph,
    play_vector_len: usize,
    play_vector: &'a [WalkEntry],
}

/// Serialize `graph` and the first `walk_limit` walk entries to `writer`.
pub fn write_graph<W: Write>(
    writer: W,
    graph: &PlayGraph,
    play_vector: &[WalkEntry],
    walk_limit: usize,
) -> Result<()> {
    let doc = Document {
        version: 1,
        graph,
        play_vector_len: play_vector.len(),
        play_vector: &play_vector[..walk_limit.min(play_vector.len())],
    };
    serde_json::to_writer_pretty(writer, &doc)?;
    Ok(())
}

pub fn export_jukebox(jukebox: &Jukebox, path: &Path, walk_limit: usize) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_graph(&mut writer, jukebox.graph(), jukebox.play_vector(), walk_limit)?;
    writer.flush()?;
    log::info!(
        "Exported {} beats and {} walk entries to {}",
        jukebox.beats().len(),
        walk_limit.min(jukebox.play_vector().len()),
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remix::{generate_walk, BeatLayout, GraphOptions, WalkConfig};

    fn graph() -> PlayGraph {
        let labels = [0, 1, 0, 1, 0, 1, 0, 1];
        let beat_times: Vec<f32> = (0..8).map(|i| i as f32 * 0.5).collect();
        let layout = BeatLayout {
            beat_times: &beat_times,
            labels: &labels,
            amplitudes: &[0.5; 8],
            tempo: 120.0,
            clusters: 2,
        };
        let options = GraphOptions {
            start_beat: 0,
            truncate_at_fade: false,
        };
        PlayGraph::assemble(&layout, vec![0.25; 400], 100, &options).unwrap()
    }

    #[test]
    fn export_carries_beats_and_a_walk_prefix() {
        let graph = graph();
        let walk = generate_walk(
            &graph,
            &WalkConfig {
                length: 50,
                max_beats_between_jumps: None,
                seed: Some(2),
            },
        )
        .unwrap();

        let mut out = Vec::new();
        write_graph(&mut out, &graph, &walk, 10).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();

        assert_eq!(value["version"], 1);
        assert_eq!(value["beats"].as_array().unwrap().len(), 8);
        assert_eq!(value["beats"][0]["is"], 0);
        assert_eq!(value["beats"][0]["jump_candidates"][0], 5);
        assert_eq!(value["play_vector"].as_array().unwrap().len(), 10);
        assert_eq!(value["play_vector_len"], 50);
        assert_eq!(value["segments"], 8);
        assert!(value.get("samples").is_none());
    }

    #[test]
    fn export_to_file() {
        let graph = graph();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        let file = File::create(&path).unwrap();
        write_graph(file, &graph, &[], 100).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"last_chance\": 7"));
    }
}
