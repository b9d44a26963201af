use serde::Serialize;

use super::walk::RecentSegments;
use crate::error::{RemixError, Result};

/// A beat is a fade point candidate while it stays within this share of the
/// loudest beat.
const FADE_RATIO: f32 = 0.75;

/// One beat of the cleaned sequence.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Beat {
    pub id: usize,
    /// Seconds into the trimmed audio.
    pub start: f32,
    pub duration: f32,
    pub start_index: usize,
    pub stop_index: usize,
    pub cluster: usize,
    pub segment: usize,
    /// Position inside the segment, 0 = first beat of the run.
    #[serde(rename = "is")]
    pub intra_segment_index: usize,
    pub quartile: usize,
    pub amplitude: f32,
    pub next: usize,
    pub jump_candidates: Vec<usize>,
}

/// Per-beat inputs to assembly. All slices are one entry per detected beat.
pub struct BeatLayout<'a> {
    pub beat_times: &'a [f32],
    pub labels: &'a [usize],
    pub amplitudes: &'a [f32],
    pub tempo: f32,
    pub clusters: usize,
}

#[derive(Clone, Debug)]
pub struct GraphOptions {
    /// Leading beats to drop; also the loop-back point.
    pub start_beat: usize,
    /// Drop everything after the last loud beat.
    pub truncate_at_fade: bool,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            start_beat: 1,
            truncate_at_fade: false,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PlayGraph {
    pub(crate) beats: Vec<Beat>,
    pub(crate) tempo: f32,
    pub(crate) sample_rate: u32,
    pub(crate) duration: f32,
    pub(crate) clusters: usize,
    pub(crate) segments: usize,
    pub(crate) outro: Vec<usize>,
    pub(crate) last_chance: usize,
    pub(crate) loop_start: usize,
    pub(crate) max_amplitude: f32,
    pub(crate) fade: usize,
    #[serde(skip)]
    pub(crate) samples: Vec<f32>,
}

impl PlayGraph {
    /// Link labeled beats into a playable graph.
    ///
    /// `samples` is the trimmed audio the beat times refer to; the graph
    /// takes ownership and hands beats out as views into it.
    pub fn assemble(
        layout: &BeatLayout<'_>,
        samples: Vec<f32>,
        sample_rate: u32,
        options: &GraphOptions,
    ) -> Result<Self> {
        let n = layout.beat_times.len();
        if n < 2 {
            return Err(RemixError::TooFewBeats { found: n });
        }
        if layout.labels.len() != n || layout.amplitudes.len() != n {
            return Err(RemixError::FeatureMismatch(format!(
                "{} beat times, {} labels, {} amplitudes",
                n,
                layout.labels.len(),
                layout.amplitudes.len()
            )));
        }
        if sample_rate == 0 {
            return Err(RemixError::Decode("sample rate is zero".into()));
        }

        let sps = sample_rate as f64;
        let duration = samples.len() as f32 / sample_rate as f32;

        let max_amplitude = layout
            .amplitudes
            .iter()
            .copied()
            .fold(f32::MIN, f32::max);
        let fade = layout
            .amplitudes
            .iter()
            .rposition(|&a| a >= FADE_RATIO * max_amplitude)
            .unwrap_or(n - 1);

        let keep = if options.truncate_at_fade { fade + 1 } else { n };
        let first = options.start_beat.min(keep);
        let len = keep - first;
        if len < 2 {
            return Err(RemixError::TooFewBeats { found: len });
        }
        log::debug!(
            "Assembling beats {}..{} of {} (fade at {}, max amplitude {:.4})",
            first,
            keep,
            n,
            fade,
            max_amplitude
        );

        let mut beats = Vec::with_capacity(len);
        let mut segment = 0usize;
        let mut position = 0usize;
        for (id, src) in (first..keep).enumerate() {
            let start = layout.beat_times[src];
            let end = if src + 1 < n {
                layout.beat_times[src + 1]
            } else {
                duration
            };
            let beat_duration = (end - start).max(0.0);
            let (start_index, stop_index) = sample_span(start, beat_duration, sps, samples.len());

            let cluster = layout.labels[src];
            if id > 0 {
                if cluster != layout.labels[src - 1] {
                    segment += 1;
                    position = 0;
                } else {
                    position += 1;
                }
            }

            beats.push(Beat {
                id,
                start,
                duration: beat_duration,
                start_index,
                stop_index,
                cluster,
                segment,
                intra_segment_index: position,
                quartile: id * 4 / len,
                amplitude: layout.amplitudes[src],
                next: id + 1,
                jump_candidates: Vec::new(),
            });
        }

        let loop_start = options.start_beat.min(len - 1);
        let last = len - 1;
        beats[last].next = loop_back_target(&beats, loop_start);

        for id in 0..len {
            let candidates = jump_candidates(&beats, id, loop_start);
            beats[id].jump_candidates = candidates;
        }

        let last_chance = beats
            .iter()
            .rposition(|b| !b.jump_candidates.is_empty())
            .ok_or(RemixError::NotRemixable)?;
        if let Some(&earliest) = beats[last_chance].jump_candidates.iter().min() {
            beats[last_chance].next = earliest;
        }

        let segments = beats.iter().map(|b| b.segment).max().unwrap_or(0) + 1;
        let outro = (last_chance + 1..len).collect();

        Ok(Self {
            beats,
            tempo: layout.tempo,
            sample_rate,
            duration,
            clusters: layout.clusters,
            segments,
            outro,
            last_chance,
            loop_start,
            max_amplitude,
            fade,
            samples,
        })
    }

    pub fn beats(&self) -> &[Beat] {
        &self.beats
    }

    pub fn beat(&self, id: usize) -> Result<&Beat> {
        self.beats.get(id).ok_or(RemixError::InvalidBeat {
            id,
            len: self.beats.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.beats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beats.is_empty()
    }

    pub fn buffer(&self, beat: &Beat) -> &[f32] {
        self.samples
            .get(beat.start_index..beat.stop_index)
            .unwrap_or(&[])
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn tempo(&self) -> f32 {
        self.tempo
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration(&self) -> f32 {
        self.duration
    }

    pub fn clusters(&self) -> usize {
        self.clusters
    }

    pub fn segments(&self) -> usize {
        self.segments
    }

    /// Beats after the last jumpable point; only ever played as an ending.
    pub fn outro(&self) -> &[usize] {
        &self.outro
    }

    pub fn last_chance(&self) -> usize {
        self.last_chance
    }

    pub fn loop_start(&self) -> usize {
        self.loop_start
    }

    pub fn max_amplitude(&self) -> f32 {
        self.max_amplitude
    }

    /// Index (among all detected beats) of the last beat at 75% of peak loudness.
    pub fn fade(&self) -> usize {
        self.fade
    }

    /// Point every `next` back at the following beat, so sequential playback
    /// runs straight through. The last beat keeps its loop-back target.
    pub fn linearize(&mut self) {
        let len = self.beats.len();
        for beat in self.beats.iter_mut().take(len.saturating_sub(1)) {
            beat.next = beat.id + 1;
        }
    }

    pub fn set_next(&mut self, id: usize, next: usize) -> Result<()> {
        let len = self.beats.len();
        if next >= len {
            return Err(RemixError::InvalidBeat { id: next, len });
        }
        let beat = self
            .beats
            .get_mut(id)
            .ok_or(RemixError::InvalidBeat { id, len })?;
        beat.next = next;
        Ok(())
    }

    /// Jump candidates of `id` whose segment hasn't played recently. When
    /// every candidate is recent, all of them are returned.
    pub fn live_candidates(&self, id: usize, recent: &RecentSegments) -> Vec<usize> {
        let Some(beat) = self.beats.get(id) else {
            return Vec::new();
        };
        let fresh: Vec<usize> = beat
            .jump_candidates
            .iter()
            .copied()
            .filter(|&c| !recent.contains(self.beats[c].segment))
            .collect();
        if fresh.is_empty() {
            beat.jump_candidates.clone()
        } else {
            fresh
        }
    }

    /// The relinked `last_chance` beat is exempt from the candidate checks.
    pub fn validate(&self) -> Result<()> {
        let len = self.beats.len();
        for (i, beat) in self.beats.iter().enumerate() {
            if beat.id != i {
                return Err(RemixError::Internal(format!("beat {} carries id {}", i, beat.id)));
            }
            let next = self.beats.get(beat.next).ok_or_else(|| {
                RemixError::Internal(format!("beat {} has next {} of {}", i, beat.next, len))
            })?;
            for &c in &beat.jump_candidates {
                let cand = self.beats.get(c).ok_or_else(|| {
                    RemixError::Internal(format!("beat {} has candidate {} of {}", i, c, len))
                })?;
                if i == self.last_chance {
                    continue;
                }
                if cand.cluster != next.cluster
                    || cand.intra_segment_index != next.intra_segment_index
                    || c % 4 != beat.next % 4
                    || cand.segment == beat.segment
                    || c == beat.next
                {
                    return Err(RemixError::Internal(format!(
                        "beat {} has incompatible candidate {}",
                        i, c
                    )));
                }
            }
        }
        Ok(())
    }
}

// start rounds up only when the scaled position modulo 2 is past 1.5
fn sample_span(start: f32, duration: f32, sps: f64, total: usize) -> (usize, usize) {
    let scaled = start as f64 * sps;
    let start_index = if scaled % 2.0 > 1.5 {
        scaled.ceil()
    } else {
        scaled.floor()
    };
    let stop_index = ((start as f64 + duration as f64) * sps).ceil();

    let stop = (stop_index.max(0.0) as usize).min(total);
    let start = (start_index.max(0.0) as usize).min(stop);
    (start, stop)
}

fn loop_back_target(beats: &[Beat], loop_start: usize) -> usize {
    let len = beats.len();
    let last = &beats[len - 1];
    let phase = (last.id + 1) % 4;
    beats
        .iter()
        .find(|b| {
            b.cluster == last.cluster
                && b.id % 4 == phase
                && (b.id as f64) <= 0.5 * len as f64
                && b.id >= loop_start
        })
        .map_or(loop_start, |b| b.id)
}

fn jump_candidates(beats: &[Beat], id: usize, loop_start: usize) -> Vec<usize> {
    let beat = &beats[id];
    let next = &beats[beat.next];
    beats[loop_start..]
        .iter()
        .filter(|bx| {
            bx.cluster == next.cluster
                && bx.intra_segment_index == next.intra_segment_index
                && bx.id % 4 == next.id % 4
                && bx.segment != beat.segment
                && bx.id != beat.next
        })
        .map(|bx| bx.id)
        .collect()
}
