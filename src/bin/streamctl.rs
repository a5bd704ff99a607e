//! streamctl - record, probe and analyze streams from the command line

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use streamwatch::analysis::DEFAULT_FRAME_INTERVAL;
use streamwatch::record::RecordingOutcome;
use streamwatch::{
    analyze_recording, probe_recording, AnalysisReport, CategoryFilter, ProcessorKind, Recorder,
    RecorderSettings, SourceSettings, StreamSourceFactory,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a stream until the duration cap or Ctrl-C.
    Record {
        /// Stream address (stub://, rtsp://, rtmp://, http(s)://, file://).
        #[arg(long, env = "STREAMD_SOURCE_URL", default_value = "stub://default_stream")]
        address: String,
        /// Maximum recording length in seconds.
        #[arg(long, default_value_t = 3600)]
        max_duration: u64,
        /// Directory the recording is written to.
        #[arg(long, env = "STREAMD_RECORDING_DIR", default_value = "recordings")]
        output_dir: PathBuf,
        /// Analyze the recording once it stops.
        #[arg(long)]
        analyze: bool,
        /// Analyze every Nth frame.
        #[arg(long, default_value_t = DEFAULT_FRAME_INTERVAL)]
        frame_interval: u64,
        /// Frame processor used for analysis (motion|passthrough).
        #[arg(long, default_value = "motion")]
        processor: String,
    },
    /// Print frame count, size, rate and duration of a recording.
    Probe {
        file: PathBuf,
    },
    /// Run a frame processor over a recording.
    Analyze {
        file: PathBuf,
        /// Analyze every Nth frame.
        #[arg(long, default_value_t = DEFAULT_FRAME_INTERVAL)]
        frame_interval: u64,
        /// Frame processor (motion|passthrough).
        #[arg(long, default_value = "motion")]
        processor: String,
    },
}

#[derive(Serialize)]
struct RecordReport {
    output_path: PathBuf,
    outcome: Option<RecordingOutcome>,
    analysis: Option<AnalysisReport>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Command::Record {
            address,
            max_duration,
            output_dir,
            analyze,
            frame_interval,
            processor,
        } => {
            let kind = parse_processor(&processor)?;
            let report = record(&address, max_duration, output_dir)?;
            let analysis = if analyze {
                let mut processor = kind.build();
                Some(analyze_recording(
                    &report.output_path,
                    processor.as_mut(),
                    &CategoryFilter::all(),
                    frame_interval,
                    None,
                )?)
            } else {
                None
            };
            print_json(&RecordReport {
                analysis,
                ..report
            })
        }
        Command::Probe { file } => print_json(&probe_recording(&file)?),
        Command::Analyze {
            file,
            frame_interval,
            processor,
        } => {
            let mut processor = parse_processor(&processor)?.build();
            let report = analyze_recording(
                &file,
                processor.as_mut(),
                &CategoryFilter::all(),
                frame_interval,
                None,
            )?;
            print_json(&report)
        }
    }
}

fn record(address: &str, max_duration: u64, output_dir: PathBuf) -> Result<RecordReport> {
    if max_duration == 0 {
        return Err(anyhow!("--max-duration must be greater than zero"));
    }
    let factory = StreamSourceFactory::new(SourceSettings::default());
    let settings = RecorderSettings {
        output_dir,
        ..RecorderSettings::default()
    };
    let mut recorder = Recorder::start(
        &factory,
        address,
        Duration::from_secs(max_duration),
        &settings,
    )?;
    log::info!("recording to {}", recorder.output_path().display());

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    while !recorder.is_finished() {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::info!("stopping recording...");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    let output_path = recorder.stop();
    Ok(RecordReport {
        output_path,
        outcome: recorder.outcome().cloned(),
        analysis: None,
    })
}

fn parse_processor(name: &str) -> Result<ProcessorKind> {
    ProcessorKind::parse(name).ok_or_else(|| anyhow!("unknown processor: {}", name))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
