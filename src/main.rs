mod cli;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use cli::Cli;
use loopgraph::audio::decode::decode_audio;
use loopgraph::error::RemixError;
use loopgraph::export;
use loopgraph::remix::{Jukebox, JukeboxOptions, ProgressFn, WalkConfig};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let mut cli = Cli::parse();
    let mut options = JukeboxOptions::default();

    // Load config: explicit --config path, or auto-detect loopgraph.toml / user config
    let cwd = std::env::current_dir().context("Cannot read working directory")?;
    if let Some(ref path) = config::find_config_path(cli.config.clone(), &cwd) {
        if let Some(cfg) = config::load_config(path) {
            log::info!("Loaded config from {}", path.display());
            // Merge: config values apply only when CLI is at its default
            if cli.clusters == 0 { cli.clusters = cfg.analysis.clusters; }
            if cli.start_beat == 1 { cli.start_beat = cfg.analysis.start_beat; }
            if cli.min_clusters == 4 { cli.min_clusters = cfg.analysis.min_clusters; }
            if cli.max_clusters == 50 { cli.max_clusters = cfg.analysis.max_clusters; }
            if !cli.truncate_at_fade { cli.truncate_at_fade = cfg.analysis.truncate_at_fade; }
            if cli.walk_length == 1 << 20 { cli.walk_length = cfg.walk.length; }
            if cli.seed.is_none() { cli.seed = cfg.walk.seed; }
            if cli.max_beats_between_jumps.is_none() {
                cli.max_beats_between_jumps = cfg.walk.max_beats_between_jumps;
            }
            options.analysis.trim_db = cfg.analysis.trim_db;
        } else {
            log::warn!("Failed to load config from {}", path.display());
        }
    }

    if !cli.input.exists() {
        anyhow::bail!("Input file not found: {}", cli.input.display());
    }
    if cli.min_clusters == 0 || cli.min_clusters > cli.max_clusters {
        anyhow::bail!(
            "Invalid cluster range {}..={}",
            cli.min_clusters,
            cli.max_clusters
        );
    }

    options.start_beat = cli.start_beat;
    options.clusters = cli.clusters;
    options.cluster_range = cli.min_clusters..=cli.max_clusters;
    options.truncate_at_fade = cli.truncate_at_fade;
    options.walk = WalkConfig {
        length: cli.walk_length,
        max_beats_between_jumps: cli.max_beats_between_jumps,
        seed: cli.seed,
    };

    log::info!("loopgraph - infinite remix beat graph builder");
    log::info!("Input: {}", cli.input.display());
    if cli.clusters == 0 {
        log::info!("Clusters: auto ({}..={})", cli.min_clusters, cli.max_clusters);
    } else {
        log::info!("Clusters: {}", cli.clusters);
    }

    // 1. Decode audio
    log::info!("Decoding audio...");
    let audio = decode_audio(&cli.input)
        .with_context(|| format!("Failed to decode {}", cli.input.display()))?;

    // 2. Analyze on the worker thread, drive the progress bar from its callback
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}% {msg}")?
            .progress_chars("=>-"),
    );
    let bar = pb.clone();
    let progress: Box<ProgressFn> = Box::new(move |fraction: f32, message: &str| {
        bar.set_position((fraction * 100.0).round() as u64);
        bar.set_message(message.to_string());
    });

    let pending = Jukebox::spawn(audio.samples, audio.sample_rate, options, Some(progress))
        .context("Failed to start analysis worker")?;
    let jukebox = match pending.wait() {
        Ok(jukebox) => jukebox,
        Err(RemixError::NotRemixable) => {
            pb.abandon_with_message("not remixable");
            anyhow::bail!(
                "{} has no beat with a jump candidate; try a different cluster count or plain looped playback",
                cli.input.display()
            );
        }
        Err(err) => {
            pb.abandon();
            return Err(err).context("Analysis failed");
        }
    };
    pb.finish_with_message("ready");

    // 3. Summary
    let graph = jukebox.graph();
    println!("Tempo:        {:.1} BPM", jukebox.tempo());
    println!("Duration:     {:.1}s @ {}Hz", jukebox.duration(), jukebox.sample_rate());
    println!("Beats:        {}", jukebox.beats().len());
    println!(
        "Clusters:     {} ({} segments, ratio {:.2})",
        jukebox.clusters(),
        jukebox.segments(),
        jukebox.segment_ratio()
    );
    println!("Loop start:   beat {}", graph.loop_start());
    println!("Last chance:  beat {}", graph.last_chance());
    println!("Outro:        {} beats", jukebox.outro().len());
    let jumpable = jukebox
        .beats()
        .iter()
        .filter(|b| !b.jump_candidates.is_empty())
        .count();
    println!("Jumpable:     {} of {} beats", jumpable, jukebox.beats().len());

    // 4. Preview the walk
    if cli.preview > 0 {
        println!();
        println!("{:>6}  {:>5}  {:>8}  {:>7}  {:>5}", "step", "beat", "start", "segment", "left");
        for (step, entry) in jukebox.play_vector().iter().take(cli.preview).enumerate() {
            let beat = graph.beat(entry.beat)?;
            println!(
                "{:>6}  {:>5}  {:>7.2}s  {:>7}  {:>5}",
                step,
                entry.beat,
                beat.start,
                beat.segment,
                entry.seq_len.saturating_sub(entry.seq_pos)
            );
        }
    }

    // 5. Export
    if let Some(ref path) = cli.json {
        export::export_jukebox(&jukebox, path, cli.json_walk)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    log::info!("Done! {} play vector entries", jukebox.play_vector().len());
    Ok(())
}
