use crossbeam::channel::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::ops::RangeInclusive;
use std::thread::JoinHandle;
use std::time::Duration;

use super::cluster::{self, DEFAULT_CLUSTER_RANGE};
use super::graph::{Beat, BeatLayout, GraphOptions, PlayGraph};
use super::similarity;
use super::walk::{self, WalkConfig, WalkEntry};
use crate::audio::{extract_beat_features, AnalysisParams, BeatFeatures};
use crate::error::{RemixError, Result};

/// Progress callback: completion fraction in `0.0..=1.0` and a status line.
/// Runs on whichever thread does the work.
pub type ProgressFn = dyn Fn(f32, &str) + Send + Sync;

#[derive(Clone, Debug)]
pub struct JukeboxOptions {
    /// Leading beats to skip. Almost always 1; the first detected beat
    /// covers whatever came before the first real onset.
    pub start_beat: usize,
    /// Cluster count, or 0 to pick one automatically.
    pub clusters: usize,
    /// Counts tried when `clusters == 0`.
    pub cluster_range: RangeInclusive<usize>,
    pub truncate_at_fade: bool,
    pub walk: WalkConfig,
    pub analysis: AnalysisParams,
}

impl Default for JukeboxOptions {
    fn default() -> Self {
        Self {
            start_beat: 1,
            clusters: 0,
            cluster_range: DEFAULT_CLUSTER_RANGE,
            truncate_at_fade: false,
            walk: WalkConfig::default(),
            analysis: AnalysisParams::default(),
        }
    }
}

struct Progress<'a> {
    callback: Option<&'a ProgressFn>,
    last: f32,
}

impl<'a> Progress<'a> {
    fn new(callback: Option<&'a ProgressFn>) -> Self {
        Self { callback, last: 0.0 }
    }

    fn report(&mut self, fraction: f32, message: &str) {
        let fraction = fraction.clamp(self.last, 1.0);
        self.last = fraction;
        log::info!("[{:>3.0}%] {}", fraction * 100.0, message);
        if let Some(callback) = self.callback {
            callback(fraction, message);
        }
    }
}

/// A finished remix: the beat graph plus its precomputed walk.
#[derive(Debug)]
pub struct Jukebox {
    graph: PlayGraph,
    play_vector: Vec<WalkEntry>,
    segment_ratio: f64,
}

impl Jukebox {
    /// Run the whole pipeline on the calling thread.
    ///
    /// `samples` is mono audio at `sample_rate`. Leading and trailing silence
    /// is cut off and the rest is kept inside the graph for playback.
    pub fn build(
        mut samples: Vec<f32>,
        sample_rate: u32,
        options: &JukeboxOptions,
        progress: Option<&ProgressFn>,
    ) -> Result<Self> {
        let mut progress = Progress::new(progress);
        progress.report(0.1, "loading file and extracting raw audio");
        if samples.is_empty() {
            return Err(RemixError::EmptyAudio);
        }

        progress.report(0.2, "computing pitch data...");
        let (features, kept) = extract_beat_features(&samples, sample_rate, &options.analysis)?;
        samples.truncate(kept.end);
        samples.drain(..kept.start);

        progress.report(
            0.3,
            &format!("finding beats... {} at {:.1} BPM", features.len(), features.tempo),
        );
        assemble(&features, samples, sample_rate, options, &mut progress)
    }

    /// Run everything after feature extraction. `samples` must be the audio
    /// the beat times refer to.
    pub fn from_features(
        features: &BeatFeatures,
        samples: Vec<f32>,
        sample_rate: u32,
        options: &JukeboxOptions,
        progress: Option<&ProgressFn>,
    ) -> Result<Self> {
        let mut progress = Progress::new(progress);
        assemble(features, samples, sample_rate, options, &mut progress)
    }

    /// Run [`Jukebox::build`] on a background thread. Dropping the handle
    /// discards the result.
    pub fn spawn(
        samples: Vec<f32>,
        sample_rate: u32,
        options: JukeboxOptions,
        progress: Option<Box<ProgressFn>>,
    ) -> Result<PendingJukebox> {
        let (tx, rx) = channel::bounded(1);
        let handle = std::thread::Builder::new()
            .name("loopgraph-analysis".into())
            .spawn(move || {
                let result = Jukebox::build(samples, sample_rate, &options, progress.as_deref());
                // receiver gone means nobody wants the result
                let _ = tx.send(result);
            })?;
        Ok(PendingJukebox {
            rx,
            handle: Some(handle),
            taken: false,
        })
    }

    pub fn graph(&self) -> &PlayGraph {
        &self.graph
    }

    pub fn play_vector(&self) -> &[WalkEntry] {
        &self.play_vector
    }

    pub fn beats(&self) -> &[Beat] {
        self.graph.beats()
    }

    pub fn duration(&self) -> f32 {
        self.graph.duration()
    }

    pub fn sample_rate(&self) -> u32 {
        self.graph.sample_rate()
    }

    pub fn tempo(&self) -> f32 {
        self.graph.tempo()
    }

    pub fn clusters(&self) -> usize {
        self.graph.clusters()
    }

    pub fn segments(&self) -> usize {
        self.graph.segments()
    }

    pub fn outro(&self) -> &[usize] {
        self.graph.outro()
    }

    pub fn segment_ratio(&self) -> f64 {
        self.segment_ratio
    }

    pub fn into_parts(self) -> (PlayGraph, Vec<WalkEntry>) {
        (self.graph, self.play_vector)
    }
}

fn assemble(
    features: &BeatFeatures,
    samples: Vec<f32>,
    sample_rate: u32,
    options: &JukeboxOptions,
    progress: &mut Progress<'_>,
) -> Result<Jukebox> {
    features.validate()?;

    progress.report(0.4, "building recurrence matrix...");
    let embedding = similarity::build_embedding(features)?;

    progress.report(0.5, "clustering...");
    let seed = options.walk.seed.unwrap_or_else(rand::random);
    let selection = cluster::select_clusters(
        &embedding,
        options.clusters,
        options.cluster_range.clone(),
        seed,
    );
    progress.report(0.51, &format!("using {} clusters", selection.clusters));

    progress.report(0.6, "getting amplitudes");
    let layout = BeatLayout {
        beat_times: &features.beat_times,
        labels: &selection.labels,
        amplitudes: &features.amplitude,
        tempo: features.tempo,
        clusters: selection.clusters,
    };
    let graph_options = GraphOptions {
        start_beat: options.start_beat,
        truncate_at_fade: options.truncate_at_fade,
    };

    progress.report(0.8, "computing final beat array...");
    let graph = PlayGraph::assemble(&layout, samples, sample_rate, &graph_options)?;
    log::info!(
        "Beat graph: {} beats, {} clusters, {} segments, last jump at beat {}, {} outro beats",
        graph.len(),
        graph.clusters(),
        graph.segments(),
        graph.last_chance(),
        graph.outro().len()
    );

    progress.report(0.9, "creating play vector");
    let play_vector = walk::generate_walk(&graph, &options.walk)?;

    let jukebox = Jukebox {
        graph,
        play_vector,
        segment_ratio: selection.segment_ratio,
    };
    progress.report(1.0, "ready");
    Ok(jukebox)
}

/// Handle to a jukebox being built on a background thread.
pub struct PendingJukebox {
    rx: Receiver<Result<Jukebox>>,
    handle: Option<JoinHandle<()>>,
    taken: bool,
}

impl PendingJukebox {
    pub fn wait(mut self) -> Result<Jukebox> {
        let result = self.rx.recv().unwrap_or(Err(RemixError::WorkerPanicked));
        self.join();
        result
    }

    /// Block for at most `timeout`. `None` means still working.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<Jukebox>> {
        if self.taken {
            return Some(Err(already_taken()));
        }
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(self.finish(result)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(self.finish(Err(RemixError::WorkerPanicked))),
        }
    }

    pub fn try_ready(&mut self) -> Option<Result<Jukebox>> {
        if self.taken {
            return Some(Err(already_taken()));
        }
        match self.rx.try_recv() {
            Ok(result) => Some(self.finish(result)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(self.finish(Err(RemixError::WorkerPanicked))),
        }
    }

    fn finish(&mut self, result: Result<Jukebox>) -> Result<Jukebox> {
        self.taken = true;
        self.join();
        result
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("Analysis worker panicked");
            }
        }
    }
}

fn already_taken() -> RemixError {
    RemixError::Internal("jukebox result was already taken".into())
}
