use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam::channel::Receiver;
use gpu_sonar::config::{parse_duration, Config};
use gpu_sonar::monitor::{
    Aggregator, DeviceEvent, DeviceReport, MetricSource, NvidiaSmiSource, Profile, SyntheticSource,
};
use gpu_sonar::replay::{self, RecordedSample};
use gpu_sonar::sample::Reading;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "gpu-sonar")]
#[command(about = "GPU telemetry sampler with built-in bottleneck classification", long_about = None)]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging verbosity (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct SourceArgs {
    /// Use synthetic GPUs instead of nvidia-smi (e.g., "compute,thermal,idle")
    #[arg(long)]
    synthetic: Option<String>,

    /// Seed for synthetic GPUs
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Path to the nvidia-smi binary
    #[arg(long, default_value = "nvidia-smi")]
    nvidia_smi: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample GPUs continuously and print bottleneck verdicts
    Watch {
        #[command(flatten)]
        source: SourceArgs,

        /// Sampling interval (e.g., 500ms, 1s)
        #[arg(short, long)]
        interval: Option<String>,

        /// Snapshots kept per device
        #[arg(short, long)]
        window: Option<usize>,

        /// Emit one JSON report per line
        #[arg(long)]
        json: bool,

        /// Exit after this many reports
        #[arg(short = 'n', long)]
        count: Option<u64>,

        /// Append every accepted snapshot to a JSON-lines recording
        #[arg(long)]
        record: Option<PathBuf>,
    },
    /// List available GPUs
    List {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Classify a recording made with `watch --record`
    Replay {
        file: PathBuf,

        /// Snapshots kept per device
        #[arg(short, long)]
        window: Option<usize>,

        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Watch {
            source,
            interval,
            window,
            json,
            count,
            record,
        } => {
            if let Some(interval) = interval {
                config.interval_ms = parse_duration(&interval)?.as_millis() as u64;
            }
            if let Some(window) = window {
                config.window_size = window;
            }
            config.validate()?;

            let source = build_source(&source, config.sample_timeout())?;
            watch(config, source, json, count, record).await?;
        }
        Commands::List { source } => {
            list_devices(build_source(&source, config.sample_timeout())?)?;
        }
        Commands::Replay { file, window, json } => {
            if let Some(window) = window {
                config.window_size = window;
            }
            config.validate()?;
            replay_file(&config, &file, json)?;
        }
    }

    Ok(())
}

fn build_source(args: &SourceArgs, timeout: Duration) -> Result<Arc<dyn MetricSource>> {
    match &args.synthetic {
        Some(list) => {
            let profiles = list
                .split(',')
                .map(str::parse::<Profile>)
                .collect::<Result<Vec<_>>>()?;
            Ok(Arc::new(SyntheticSource::new(args.seed, &profiles)))
        }
        None => Ok(Arc::new(
            NvidiaSmiSource::with_binary(&args.nvidia_smi).with_timeout(timeout),
        )),
    }
}

async fn watch(
    config: Config,
    source: Arc<dyn MetricSource>,
    json: bool,
    count: Option<u64>,
    record: Option<PathBuf>,
) -> Result<()> {
    let recorder = match &record {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => None,
    };

    let mut aggregator = Aggregator::new(source, config);
    let events = aggregator.subscribe();
    aggregator.start();

    let mut printer = tokio::task::spawn_blocking(move || print_events(events, json, count, recorder));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        result = &mut printer => {
            aggregator.stop().await;
            return result?;
        }
    }

    aggregator.stop().await;
    // Dropping the aggregator closes the event stream and ends the printer
    drop(aggregator);
    printer.await?
}

fn print_events(
    events: Receiver<DeviceEvent>,
    json: bool,
    count: Option<u64>,
    mut recorder: Option<BufWriter<File>>,
) -> Result<()> {
    let mut printed = 0u64;

    for event in events.iter() {
        match event {
            DeviceEvent::Added(info) if !json => println!("+ {} {}", info.id, info.name),
            DeviceEvent::Removed { id, reason } if !json => println!("- {} ({:?})", id, reason),
            DeviceEvent::Added(_) | DeviceEvent::Removed { .. } => {}
            DeviceEvent::Report(report) => {
                if let (Some(writer), false) = (recorder.as_mut(), report.is_stale()) {
                    if let Some(snapshot) = report.window.last() {
                        let sample = RecordedSample {
                            device: report.device.id,
                            snapshot: snapshot.clone(),
                        };
                        replay::write_sample(writer, &sample)?;
                    }
                }

                if json {
                    println!("{}", serde_json::to_string(&*report)?);
                } else {
                    print_report(&report);
                }

                printed += 1;
                if count.is_some_and(|limit| printed >= limit) {
                    break;
                }
            }
        }
    }

    if let Some(mut writer) = recorder {
        writer.flush()?;
    }
    Ok(())
}

fn reading(r: Reading, unit: &str) -> String {
    match r {
        Reading::Present(v) => format!("{:.0}{}", v, unit),
        Reading::Unavailable => "n/a".to_string(),
        Reading::Error => "err".to_string(),
    }
}

fn print_report(report: &DeviceReport) {
    println!("{}", report.verdict.summary());

    if let Some(latest) = report.window.last() {
        println!(
            "    util {} | mem {} | temp {} | power {}/{} | clock {}",
            reading(latest.gpu_util_pct, "%"),
            reading(latest.mem_util_pct, "%"),
            reading(latest.temp_c, "C"),
            reading(latest.power_w, "W"),
            reading(latest.power_limit_w, "W"),
            reading(latest.gpu_clock_mhz, "MHz"),
        );
    }

    if let Some(stale) = &report.stale {
        let age = report.age(chrono::Utc::now());
        println!(
            "    stale for {}s ({} failed samples): {}",
            age.num_seconds(),
            stale.consecutive_failures,
            stale.last_error
        );
    }
}

fn list_devices(source: Arc<dyn MetricSource>) -> Result<()> {
    let devices = source.devices().context("enumerating devices")?;
    if devices.is_empty() {
        println!("No GPUs found");
        return Ok(());
    }

    for device in devices {
        println!("{}: {}", device.id, device.name);
        if let Some(uuid) = &device.uuid {
            println!("    UUID: {}", uuid);
        }
        if let Some(bus) = &device.pci_bus_id {
            println!("    PCI bus: {}", bus);
        }
        if let Some(bytes) = device.memory_total_bytes {
            println!("    Memory: {:.1} GiB", bytes as f64 / (1024.0 * 1024.0 * 1024.0));
        }
        if let Some(driver) = &device.driver_version {
            println!("    Driver: {}", driver);
        }
        if let Some(cuda) = &device.cuda_version {
            println!("    CUDA: {}", cuda);
        }
        if let Some(temp) = device.slowdown_temp_c {
            println!("    Slowdown temperature: {:.0} C", temp);
        }
    }
    Ok(())
}

fn replay_file(config: &Config, path: &Path, json: bool) -> Result<()> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let samples = replay::read_recording(BufReader::new(file))
        .with_context(|| format!("reading recording {}", path.display()))?;
    info!(samples = samples.len(), "replaying recording");

    for summary in replay::replay(samples, config) {
        if json {
            println!("{}", serde_json::to_string(&summary)?);
            continue;
        }

        println!(
            "{}: {} samples ({} rejected), mostly {}",
            summary.device,
            summary.samples,
            summary.rejected,
            summary.dominant_label()
        );
        println!("    final: {}", summary.final_verdict.summary());
        for (label, n) in &summary.label_counts {
            println!("    {:>18}: {}", label.name(), n);
        }
        for line in summary.final_verdict.label.recommendations() {
            println!("    - {}", line);
        }
    }
    Ok(())
}
