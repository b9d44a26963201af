use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::graph::PlayGraph;
use crate::error::{RemixError, Result};

pub const DEFAULT_WALK_LENGTH: usize = 1 << 20;

/// Shortest run between scheduled jumps, and the run granularity.
const MIN_RUN: usize = 8;
const RUN_STEP: usize = 4;

/// One step of the walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct WalkEntry {
    pub beat: usize,
    /// Target length of the current run before the next jump attempt.
    pub seq_len: usize,
    /// Position in the current run. Equal to `seq_len` when a jump is overdue.
    pub seq_pos: usize,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct WalkConfig {
    pub length: usize,
    /// Force a jump attempt after this many beats without one. Defaults to a
    /// tenth of the song.
    pub max_beats_between_jumps: Option<usize>,
    /// Fixed seed for a reproducible walk; drawn from the OS otherwise.
    pub seed: Option<u64>,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            length: DEFAULT_WALK_LENGTH,
            max_beats_between_jumps: None,
            seed: None,
        }
    }
}

/// The last few distinct segments played, oldest first.
#[derive(Clone, Debug)]
pub struct RecentSegments {
    segments: VecDeque<usize>,
    capacity: usize,
}

impl RecentSegments {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            segments: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// A quarter of the song's segments, at least one.
    pub fn for_graph(graph: &PlayGraph) -> Self {
        Self::new((graph.segments() as f64 * 0.25).round() as usize)
    }

    /// Remember `segment` unless it's already remembered, evicting the oldest.
    pub fn push(&mut self, segment: usize) {
        if self.contains(segment) {
            return;
        }
        if self.segments.len() == self.capacity {
            self.segments.pop_front();
        }
        self.segments.push_back(segment);
    }

    pub fn contains(&self, segment: usize) -> bool {
        self.segments.contains(&segment)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Step-at-a-time walk generator.
pub struct Walker<'g> {
    graph: &'g PlayGraph,
    rng: StdRng,
    max_sequence_len: usize,
    max_between: usize,
    recent: RecentSegments,
    beat: usize,
    seq_len: usize,
    seq_pos: usize,
    beats_since_jump: usize,
    failed_jumps: usize,
    started: bool,
}

impl<'g> Walker<'g> {
    pub fn new(graph: &'g PlayGraph, config: &WalkConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        // faster songs get longer runs; 32 beats at 120 BPM
        let max_sequence_len = ((graph.tempo() as f64 / 120.0 * 32.0).round() as usize)
            .max(MIN_RUN + RUN_STEP);
        let max_between = config
            .max_beats_between_jumps
            .unwrap_or_else(|| (graph.len() as f64 * 0.1).round() as usize);

        let mut walker = Self {
            graph,
            rng,
            max_sequence_len,
            max_between,
            recent: RecentSegments::for_graph(graph),
            beat: 0,
            seq_len: 0,
            seq_pos: 0,
            beats_since_jump: 0,
            failed_jumps: 0,
            started: false,
        };
        walker.seq_len = walker.random_run().max(graph.loop_start());
        walker
    }

    fn random_run(&mut self) -> usize {
        let choices = (self.max_sequence_len - MIN_RUN).div_ceil(RUN_STEP);
        MIN_RUN + RUN_STEP * self.rng.gen_range(0..choices)
    }

    /// Produce the next entry. The first call yields beat 0.
    pub fn step(&mut self) -> Result<WalkEntry> {
        if !self.started {
            self.started = true;
            return Ok(self.entry());
        }

        let graph = self.graph;
        let current = graph.beat(self.beat).map_err(invariant)?;
        self.recent.push(current.segment);
        self.seq_pos += 1;

        let will_jump = self.seq_pos == self.seq_len || self.beats_since_jump >= self.max_between;
        if !will_jump {
            self.advance_to(current.next)?;
            self.beats_since_jump += 1;
            return Ok(self.entry());
        }

        let fresh: Vec<usize> = current
            .jump_candidates
            .iter()
            .copied()
            .filter(|&c| graph.beats().get(c).map_or(false, |b| !self.recent.contains(b.segment)))
            .collect();

        if let Some(&target) = fresh.choose(&mut self.rng) {
            self.beats_since_jump = 0;
            self.failed_jumps = 0;
            self.advance_to(target)?;
        } else {
            self.beats_since_jump += 1;
            self.failed_jumps += 1;
            let failed = self.failed_jumps as f64;
            let len = graph.len() as f64;

            let escape = if failed >= 0.1 * len {
                farthest_other_quartile(graph, self.beat)
            } else {
                None
            };

            if let Some(target) = escape {
                log::debug!("Relaxed jump from beat {} to distant beat {}", self.beat, target);
                self.beats_since_jump = 0;
                self.failed_jumps = 0;
                self.advance_to(target)?;
            } else if failed >= 0.2 * len {
                log::debug!(
                    "No jump for {} attempts at beat {}; restarting at {}",
                    self.failed_jumps,
                    self.beat,
                    graph.loop_start()
                );
                self.beats_since_jump = 0;
                self.failed_jumps = 0;
                self.advance_to(graph.loop_start())?;
            } else {
                self.advance_to(current.next)?;
            }
        }

        self.seq_pos = 0;
        self.seq_len = self.random_run();
        if self.beats_since_jump >= self.max_between {
            // overdue: zero beats left, jump at the next chance
            self.seq_pos = self.seq_len;
        }
        Ok(self.entry())
    }

    fn advance_to(&mut self, id: usize) -> Result<()> {
        if id >= self.graph.len() {
            return Err(RemixError::Internal(format!(
                "beat {} points at missing beat {}",
                self.beat, id
            )));
        }
        self.beat = id;
        Ok(())
    }

    fn entry(&self) -> WalkEntry {
        WalkEntry {
            beat: self.beat,
            seq_len: self.seq_len,
            seq_pos: self.seq_pos,
        }
    }
}

fn invariant(err: RemixError) -> RemixError {
    RemixError::Internal(err.to_string())
}

/// Among `id`'s candidates outside its song quartile, the one farthest from
/// it (first on ties).
pub fn farthest_other_quartile(graph: &PlayGraph, id: usize) -> Option<usize> {
    let beats = graph.beats();
    let beat = beats.get(id)?;
    let mut best: Option<(usize, usize)> = None;
    for &c in &beat.jump_candidates {
        let Some(cand) = beats.get(c) else { continue };
        if cand.quartile == beat.quartile {
            continue;
        }
        let distance = c.abs_diff(id);
        if best.map_or(true, |(_, d)| distance > d) {
            best = Some((c, distance));
        }
    }
    best.map(|(c, _)| c)
}

/// Generate `config.length` walk entries.
pub fn generate_walk(graph: &PlayGraph, config: &WalkConfig) -> Result<Vec<WalkEntry>> {
    let mut walker = Walker::new(graph, config);
    log::info!(
        "Generating play vector: {} entries, runs of {}..{} beats, jump forced after {}",
        config.length,
        MIN_RUN,
        walker.max_sequence_len,
        walker.max_between
    );
    (0..config.length).map(|_| walker.step()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remix::graph::{Beat, BeatLayout, GraphOptions};

    /// A straight chain with no jump candidates anywhere.
    fn chain(len: usize) -> PlayGraph {
        let beats = (0..len)
            .map(|id| Beat {
                id,
                start: id as f32 * 0.5,
                duration: 0.5,
                start_index: 0,
                stop_index: 0,
                cluster: 0,
                segment: id,
                intra_segment_index: 0,
                quartile: id * 4 / len,
                amplitude: 1.0,
                next: if id + 1 < len { id + 1 } else { 0 },
                jump_candidates: Vec::new(),
            })
            .collect();
        PlayGraph {
            beats,
            tempo: 120.0,
            sample_rate: 100,
            duration: len as f32 * 0.5,
            clusters: 1,
            segments: len,
            outro: Vec::new(),
            last_chance: len - 1,
            loop_start: 0,
            max_amplitude: 1.0,
            fade: len - 1,
            samples: Vec::new(),
        }
    }

    fn assembled(repeats: usize) -> PlayGraph {
        let labels: Vec<usize> = (0..repeats * 4).map(|i| (i / 2) % 2).collect();
        let beat_times: Vec<f32> = (0..labels.len()).map(|i| i as f32 * 0.5).collect();
        let amplitudes = vec![1.0; labels.len()];
        let layout = BeatLayout {
            beat_times: &beat_times,
            labels: &labels,
            amplitudes: &amplitudes,
            tempo: 120.0,
            clusters: 2,
        };
        PlayGraph::assemble(
            &layout,
            vec![0.0; labels.len() * 50],
            100,
            &GraphOptions {
                start_beat: 0,
                truncate_at_fade: false,
            },
        )
        .unwrap()
    }

    fn config(length: usize, seed: u64) -> WalkConfig {
        WalkConfig {
            length,
            max_beats_between_jumps: None,
            seed: Some(seed),
        }
    }

    #[test]
    fn recent_segments_evict_oldest_and_ignore_repeats() {
        let mut recent = RecentSegments::new(2);
        recent.push(3);
        recent.push(3);
        recent.push(5);
        assert_eq!(recent.len(), 2);
        recent.push(7);
        assert!(!recent.contains(3));
        assert!(recent.contains(5) && recent.contains(7));
        assert_eq!(RecentSegments::new(0).capacity(), 1);
    }

    #[test]
    fn overdue_jump_marks_zero_beats_remaining() {
        let graph = chain(100);
        let walk = generate_walk(
            &graph,
            &WalkConfig {
                length: 12,
                max_beats_between_jumps: Some(5),
                seed: Some(3),
            },
        )
        .unwrap();

        for (i, entry) in walk.iter().enumerate().take(6) {
            assert_eq!(entry.beat, i);
            assert_eq!(entry.seq_pos, i);
        }
        assert_eq!(walk[6].beat, 6);
        assert_eq!(walk[6].seq_pos, walk[6].seq_len);
        // still overdue, so every later step is a failed attempt
        assert_eq!(walk[7].seq_pos, walk[7].seq_len);
    }

    #[test]
    fn repeated_failures_restart_at_loop_start() {
        let graph = chain(100);
        let walk = generate_walk(
            &graph,
            &WalkConfig {
                length: 30,
                max_beats_between_jumps: Some(5),
                seed: Some(9),
            },
        )
        .unwrap();
        // attempts fail from step 6 on; the 20th failure lands on step 25
        assert_eq!(walk[24].beat, 24);
        assert_eq!(walk[25].beat, graph.loop_start());
        assert_eq!(walk[25].seq_pos, 0);
        assert_eq!(walk[26].beat, 1);
    }

    #[test]
    fn relaxed_jump_prefers_the_farthest_other_quartile() {
        let mut graph = chain(40);
        graph.beats[30].jump_candidates = vec![2, 12, 31, 5];
        // 31 shares beat 30's quartile; 2 is farthest of the rest
        assert_eq!(farthest_other_quartile(&graph, 30), Some(2));
        graph.beats[30].jump_candidates = vec![31, 33];
        assert_eq!(farthest_other_quartile(&graph, 30), None);
        assert_eq!(farthest_other_quartile(&graph, 99), None);
    }

    #[test]
    fn first_entry_starts_at_beat_zero() {
        let graph = assembled(6);
        let walk = generate_walk(&graph, &config(1, 1)).unwrap();
        assert_eq!(walk.len(), 1);
        assert_eq!(walk[0].beat, 0);
        assert_eq!(walk[0].seq_pos, 0);
        assert!(walk[0].seq_len >= 8 && walk[0].seq_len < 32);
        assert_eq!(walk[0].seq_len % 4, 0);
    }

    #[test]
    fn every_transition_follows_the_graph() {
        let graph = assembled(6);
        let walk = generate_walk(&graph, &config(5000, 42)).unwrap();
        let beats = graph.beats();
        let mut jumps = 0;
        for pair in walk.windows(2) {
            let from = &beats[pair[0].beat];
            let to = pair[1].beat;
            if to != from.next {
                jumps += 1;
            }
            assert!(
                to == from.next || from.jump_candidates.contains(&to) || to == graph.loop_start(),
                "{} -> {} is not an edge",
                from.id,
                to
            );
        }
        assert!(jumps > 0);
    }

    #[test]
    fn seq_pos_counts_up_and_resets_only_at_attempts() {
        let graph = assembled(6);
        let walk = generate_walk(&graph, &config(5000, 7)).unwrap();
        for pair in walk.windows(2) {
            let (prev, cur) = (pair[0], pair[1]);
            let continued = cur.seq_pos == prev.seq_pos + 1 && cur.seq_len == prev.seq_len;
            let attempted = cur.seq_pos == 0 || cur.seq_pos == cur.seq_len;
            assert!(continued || attempted, "{:?} -> {:?}", prev, cur);
            assert!(cur.seq_len >= 8 && cur.seq_len < 32 && cur.seq_len % 4 == 0);
        }
    }

    #[test]
    fn fixed_seed_reproduces_the_walk() {
        let graph = assembled(8);
        let a = generate_walk(&graph, &config(2000, 123)).unwrap();
        let b = generate_walk(&graph, &config(2000, 123)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn dangling_next_is_an_internal_error() {
        let mut graph = chain(10);
        graph.beats[3].next = 77;
        let result = generate_walk(
            &graph,
            &WalkConfig {
                length: 20,
                max_beats_between_jumps: Some(100),
                seed: Some(1),
            },
        );
        assert!(matches!(result, Err(RemixError::Internal(_))));
    }
}
