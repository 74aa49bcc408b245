//! Runs voice activity detection and utterance segmentation over a WAV file
//! and prints one JSON object per detected utterance.

use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use talkloop::audio::{AudioSource, WavFileSource};
use talkloop::config::SessionConfig;
use talkloop::pipeline::segmenter::{Segmentation, UtteranceSegmenter};
use talkloop::stage::{StageComponent, StageOptions, VadDecision, VoiceActivityDetector};
use talkloop::vad::EnergyVad;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Print the utterances a session would hand to speech recognition.
#[derive(Parser)]
#[command(name = "talkloop-vad-probe", version, about)]
struct Cli {
    /// Mono WAV file to analyse.
    wav: PathBuf,

    /// Path to TOML session configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Serialize)]
struct UtteranceReport {
    id: u64,
    start_ms: u128,
    end_ms: u128,
    frames: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("talkloop=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };
    config.validate()?;

    let frame_ms = config.audio.min_frame_ms.max(20).min(config.audio.max_frame_ms);
    let mut source = WavFileSource::open(&cli.wav, frame_ms)?;
    let vad = EnergyVad::new(&config.vad);
    vad.initialize(&StageOptions {
        model_id: None,
        language: config.language.clone(),
        sample_rate: source.sample_rate(),
        voice: None,
        diarization: false,
        streaming: false,
    })
    .await?;

    let mut segmenter = UtteranceSegmenter::new(&config);
    let mut reported = 0usize;
    while let Some(chunk) = source.next_chunk().await {
        let decision = if config.enable_vad {
            match vad.detect(&chunk).await {
                Ok(decision) => decision,
                Err(e) => {
                    warn!("VAD failed at {:?}: {e}", chunk.timestamp);
                    VadDecision::Silence
                }
            }
        } else {
            VadDecision::Speech
        };
        if report(segmenter.push(chunk, decision))? {
            reported += 1;
        }
    }
    if let Some(segmentation) = segmenter.flush() {
        if report(segmentation)? {
            reported += 1;
        }
    }

    vad.release().await;
    info!(
        "{reported} utterance(s) in {}ms of audio",
        source.duration().as_millis()
    );
    Ok(())
}

/// Print a finalized utterance. Returns whether anything was printed.
fn report(segmentation: Segmentation) -> anyhow::Result<bool> {
    let Segmentation::Finalized(utterance) = segmentation else {
        return Ok(false);
    };
    let line = serde_json::to_string(&UtteranceReport {
        id: utterance.id,
        start_ms: utterance.start.as_millis(),
        end_ms: utterance.end.as_millis(),
        frames: utterance.chunks.len(),
    })?;
    println!("{line}");
    Ok(true)
}
