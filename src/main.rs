use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::to_writer_pretty;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};
use vpu_pipeline::accel::CodecFormat;
use vpu_pipeline::accel::synth::SynthStream;
use vpu_pipeline::config::SessionConfig;
use vpu_pipeline::observability::{MetricsSnapshot, log_snapshot};
#[cfg(feature = "metrics-server")]
use vpu_pipeline::observability::server::MetricsServer;
use vpu_pipeline::session::{DecodeSession, FrameStatus, Packet};
use vpu_pipeline::stream::{StreamPacket, demux_stream, write_ivf};
use vpu_pipeline::validation::validate_config;
use vpu_pipeline::VpuError;

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

const PUT_RETRY_INTERVAL: Duration = Duration::from_millis(1);
const FRAME_POLL_INTERVAL: Duration = Duration::from_millis(50);

fn main() -> Result<()> {
    let Cli { command } = Cli::parse();

    let otlp_endpoint_for_tracing = match &command {
        Commands::Decode(args) => args.otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result = match command {
        Commands::Decode(args) => decode_command(args),
        Commands::Validate { config } => validate_config_cmd(config),
        Commands::Synth(args) => synth_command(args),
        Commands::ListFormats => {
            list_formats();
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "vpu-pipeline")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter.clone())
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

fn decode_command(args: DecodeArgs) -> Result<()> {
    let format = resolve_format(&args)?;
    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::new(format),
    };
    if config.format != format {
        warn!(
            configured = %config.format,
            selected = %format,
            "Overriding session format from the command line"
        );
        config.format = format;
    }

    let data = fs::read(&args.input)
        .with_context(|| format!("Failed to read input stream: {}", args.input.display()))?;
    let packets = demux_stream(format, &data)
        .with_context(|| format!("Failed to split input stream: {}", args.input.display()))?;
    info!(
        input = %args.input.display(),
        format = %format,
        packets = packets.len(),
        "Input stream loaded"
    );

    let session = DecodeSession::open(config)
        .with_context(|| format!("Failed to open {format} decode session"))?;
    let metrics_handle = session.metrics();

    #[cfg(feature = "metrics-server")]
    let metrics_server = if let Some(addr_str) = &args.metrics_listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
        Some(MetricsServer::start(addr, metrics_handle.clone())?)
    } else {
        None
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = &args.metrics_listen {
        warn!(
            "Metrics server feature not enabled; ignoring --metrics-listen={}.",
            addr_str
        );
    }

    let mut sink: Box<dyn Write> = match &args.frames_out {
        Some(path) => {
            ensure_parent_dir(path)?;
            let file = File::create(path)
                .with_context(|| format!("Failed to create frame log: {}", path.display()))?;
            Box::new(BufWriter::new(file))
        }
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let frames = thread::scope(|scope| -> Result<u64> {
        let producer = scope.spawn(|| feed_packets(&session, &packets));
        let consumed = consume_frames(&session, sink.as_mut());
        if consumed.is_err() {
            // Unblocks the producer if it is still retrying.
            session.close();
        }
        let produced = producer
            .join()
            .map_err(|_| anyhow!("Packet producer thread panicked"))?;
        let frames = consumed?;
        produced?;
        Ok(frames)
    });
    sink.flush().context("Failed to flush frame log")?;
    session.close();
    let frames = frames?;

    info!(
        input = %args.input.display(),
        packets = packets.len(),
        frames,
        "Decode completed"
    );

    if args.print_metrics || args.metrics_json.is_some() || args.metrics_prometheus.is_some() {
        write_metrics(
            &metrics_handle.snapshot(),
            args.print_metrics,
            args.metrics_json.as_deref(),
            args.metrics_prometheus.as_deref(),
        )?;
    }

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    Ok(())
}

fn resolve_format(args: &DecodeArgs) -> Result<CodecFormat> {
    if let Some(format) = args.format {
        return Ok(format);
    }
    if let Some(path) = &args.config {
        return Ok(SessionConfig::load(path)?.format);
    }
    args.input
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(format_from_extension)
        .ok_or_else(|| {
            anyhow!(
                "Cannot infer stream format from {}; pass --format",
                args.input.display()
            )
        })
}

fn format_from_extension(ext: &str) -> Option<CodecFormat> {
    let normalized = ext.trim_start_matches('.').to_lowercase();
    match normalized.as_str() {
        "h264" | "264" | "avc" => Some(CodecFormat::H264),
        "hevc" | "h265" | "265" => Some(CodecFormat::Hevc),
        "ivf" | "vp9" => Some(CodecFormat::Vp9),
        _ => None,
    }
}

/// Pushes every packet, then end of stream. Retries while the ring is full.
fn feed_packets(session: &DecodeSession, packets: &[StreamPacket]) -> Result<()> {
    for (index, stream_packet) in packets.iter().enumerate() {
        let mut packet = Packet::new(&stream_packet.data).with_tag(index as u64);
        if let Some(pts) = stream_packet.pts {
            packet = packet.with_pts(pts);
        }
        if let Some(dts) = stream_packet.dts {
            packet = packet.with_dts(dts);
        }
        loop {
            match session.put_packet(packet) {
                Ok(_) => break,
                Err(VpuError::WouldBlock { slot }) => {
                    debug!(slot, packet = index, "Stream ring full, retrying");
                    thread::sleep(PUT_RETRY_INTERVAL);
                }
                Err(VpuError::InvalidState(reason)) => {
                    info!(
                        packet = index,
                        reason = reason.as_str(),
                        "Session stopped accepting packets"
                    );
                    return Ok(());
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("Failed to queue packet {index}"));
                }
            }
        }
    }
    match session.put_packet(Packet::end_of_stream()) {
        Ok(_) | Err(VpuError::InvalidState(_)) => Ok(()),
        Err(err) => Err(err).context("Failed to queue end of stream"),
    }
}

/// Writes one JSON line per frame and hands each frame straight back.
fn consume_frames(session: &DecodeSession, sink: &mut dyn Write) -> Result<u64> {
    let mut frames = 0u64;
    loop {
        match session.get_frame_timeout(FRAME_POLL_INTERVAL)? {
            FrameStatus::Frame(frame) => {
                let id = frame.id;
                serde_json::to_writer(&mut *sink, &frame)
                    .context("Failed to write frame record")?;
                sink.write_all(b"\n")
                    .context("Failed to write frame record")?;
                session.return_frame(id)?;
                frames += 1;
            }
            FrameStatus::Pending => continue,
            FrameStatus::EndOfStream => return Ok(frames),
        }
    }
}

fn write_metrics(
    snapshot: &MetricsSnapshot,
    print_metrics: bool,
    metrics_json: Option<&Path>,
    metrics_prometheus: Option<&Path>,
) -> Result<()> {
    if print_metrics {
        log_snapshot(snapshot);
    }
    if let Some(path) = metrics_json {
        ensure_parent_dir(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = metrics_prometheus {
        ensure_parent_dir(path)?;
        fs::write(path, snapshot.to_prometheus()).with_context(|| {
            format!("Failed to write Prometheus metrics: {}", path.display())
        })?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn validate_config_cmd(config_path: PathBuf) -> Result<()> {
    let config = SessionConfig::load(&config_path)?;
    let report = validate_config(&config);

    for warning in &report.warnings {
        warn!(file = %config_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(
            file = %config_path.display(),
            format = %config.format,
            "Session config validation passed"
        );
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %config_path.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Session config validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn synth_command(args: SynthArgs) -> Result<()> {
    if args.frames == 0 {
        return Err(anyhow!("--frames must be at least 1"));
    }
    let stream = SynthStream::new(args.format, args.width, args.height)
        .bit_depth(args.bit_depth)
        .gop(&args.gop);
    let packets = stream.packets(args.frames);

    ensure_parent_dir(&args.output)?;
    let file = File::create(&args.output)
        .with_context(|| format!("Failed to create stream file: {}", args.output.display()))?;
    let mut out = BufWriter::new(file);
    match args.format {
        CodecFormat::Vp9 => {
            let width = u16::try_from(args.width).context("IVF width must fit in 16 bits")?;
            let height = u16::try_from(args.height).context("IVF height must fit in 16 bits")?;
            let frames: Vec<(i64, &[u8])> = packets
                .iter()
                .map(|packet| (packet.pts, packet.data.as_slice()))
                .collect();
            write_ivf(&mut out, width, height, &frames)?;
        }
        CodecFormat::H264 | CodecFormat::Hevc => {
            for packet in &packets {
                out.write_all(&packet.data)?;
            }
        }
    }
    out.flush()
        .with_context(|| format!("Failed to write stream file: {}", args.output.display()))?;

    info!(
        output = %args.output.display(),
        format = %args.format,
        frames = packets.len(),
        "Synthetic stream written"
    );
    Ok(())
}

fn list_formats() {
    println!("Supported formats:");
    for format in CodecFormat::value_variants() {
        println!(
            "- {format} (buffer margin {})",
            format.default_buffer_margin()
        );
    }
}

#[derive(Parser)]
#[command(
    name = "vpu-pipeline",
    version,
    about = "Hardware video decode orchestration with a software core model"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode an elementary stream and print one JSON record per frame.
    Decode(DecodeArgs),
    Validate {
        config: PathBuf,
    },
    /// Write a synthetic stream the software cores can decode.
    Synth(SynthArgs),
    ListFormats,
}

#[derive(clap::Args)]
struct DecodeArgs {
    input: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum)]
    format: Option<CodecFormat>,
    #[arg(long = "frames-out")]
    frames_out: Option<PathBuf>,
    #[arg(long)]
    print_metrics: bool,
    #[arg(long = "metrics-json")]
    metrics_json: Option<PathBuf>,
    #[arg(long = "metrics-prometheus")]
    metrics_prometheus: Option<PathBuf>,
    #[arg(long = "metrics-listen")]
    metrics_listen: Option<String>,
    #[arg(long = "otlp-endpoint")]
    otlp_endpoint: Option<String>,
}

#[derive(clap::Args)]
struct SynthArgs {
    output: PathBuf,
    #[arg(long, value_enum)]
    format: CodecFormat,
    #[arg(long, default_value_t = 8)]
    frames: usize,
    #[arg(long, default_value_t = 352)]
    width: u32,
    #[arg(long, default_value_t = 288)]
    height: u32,
    #[arg(long = "bit-depth", default_value_t = 8)]
    bit_depth: u8,
    #[arg(long, default_value = "IPBB")]
    gop: String,
}
