use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use mjpeg::{
    FrameBroadcaster, FrameScanner, FrameSource, FrameWorker, HttpConfig, JpegSequenceWriter,
    LoopConfig, LoopingSource, MjpegServer, RateMonitor, ScannerConfig, SequencePolicy,
    ServerConfig, StreamRecorder, WorkerConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mjpeg-tool", about = "Extract, measure, record and serve MJPEG streams")]
struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write every frame to a numbered JPEG file
    Extract {
        /// http(s):// URL or local file
        source: String,
        /// Output directory
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        /// File name prefix
        #[arg(long, default_value = "frame")]
        prefix: String,
        /// Stop after this many frames
        #[arg(long)]
        max_frames: Option<u64>,
        #[command(flatten)]
        input: InputArgs,
    },
    /// Print frame count and rate at a fixed interval
    Monitor {
        source: String,
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
        /// Seconds between reports
        #[arg(long, default_value_t = 1)]
        interval: u64,
        #[command(flatten)]
        input: InputArgs,
    },
    /// Capture a stream to a multipart file that `serve` can replay
    Record {
        source: String,
        /// Output file
        out: PathBuf,
        #[arg(long)]
        max_frames: Option<u64>,
        #[command(flatten)]
        input: InputArgs,
    },
    /// Replay a recording in a loop as an MJPEG HTTP camera
    Serve {
        file: PathBuf,
        /// Bind address (host:port)
        #[arg(long, short, default_value = "0.0.0.0:8080")]
        bind: String,
        /// Replay rate in frames per second
        #[arg(long)]
        fps: Option<u32>,
        /// Boundary announced to clients
        #[arg(long, default_value = "--myboundary")]
        boundary: String,
        /// Restart frame numbering on every pass over the file
        #[arg(long)]
        restart_sequence: bool,
    },
}

#[derive(Args)]
struct InputArgs {
    /// Boundary token; detected from the stream when omitted
    #[arg(long)]
    boundary: Option<String>,
    /// Largest accepted frame in bytes
    #[arg(long, default_value_t = mjpeg::scanner::DEFAULT_MAX_FRAME_SIZE)]
    max_frame_size: usize,
    /// HTTP basic auth user
    #[arg(long)]
    user: Option<String>,
    /// HTTP basic auth password
    #[arg(long, requires = "user")]
    password: Option<String>,
}

impl InputArgs {
    fn scanner_config(&self, retain_raw: bool) -> ScannerConfig {
        let config = ScannerConfig {
            max_frame_size: self.max_frame_size,
            retain_raw,
            ..ScannerConfig::default()
        };
        match &self.boundary {
            Some(token) => config.with_boundary(token),
            None => config,
        }
    }

    fn http_config(&self) -> HttpConfig {
        HttpConfig {
            credentials: self
                .user
                .clone()
                .map(|user| (user, self.password.clone().unwrap_or_default())),
            ..HttpConfig::default()
        }
    }

    fn open(&self, source: &str, retain_raw: bool) -> mjpeg::Result<Box<dyn FrameSource>> {
        let scanner = self.scanner_config(retain_raw);
        if source.starts_with("http://") || source.starts_with("https://") {
            let conn = mjpeg::http::connect(source, &self.http_config())?;
            Ok(Box::new(conn.into_scanner(scanner)))
        } else {
            let file = File::open(source)?;
            Ok(Box::new(FrameScanner::with_config(file, scanner)))
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Extract {
            source,
            dir,
            prefix,
            max_frames,
            input,
        } => extract(&source, dir, &prefix, max_frames, &input),
        Command::Monitor {
            source,
            seconds,
            interval,
            input,
        } => monitor(&source, seconds, interval, &input),
        Command::Record {
            source,
            out,
            max_frames,
            input,
        } => record(&source, out, max_frames, &input),
        Command::Serve {
            file,
            bind,
            fps,
            boundary,
            restart_sequence,
        } => serve(file, &bind, fps, boundary, restart_sequence),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn spawn_worker(source: Box<dyn FrameSource>, broadcaster: Arc<FrameBroadcaster>) -> mjpeg::Result<FrameWorker> {
    let worker = FrameWorker::with_config(
        source,
        broadcaster,
        WorkerConfig {
            name: "mjpeg-input".to_string(),
            announce_end: true,
        },
    );
    worker.start()?;
    Ok(worker)
}

/// Poll until the worker exits or `done` says to stop it.
fn wait_until(worker: &FrameWorker, mut done: impl FnMut() -> bool) {
    while worker.is_alive() && !done() {
        thread::sleep(Duration::from_millis(100));
    }
    worker.stop();
    worker.join();
    tracing::debug!(stats = ?worker.stats(), "input finished");
}

fn extract(
    source: &str,
    dir: PathBuf,
    prefix: &str,
    max_frames: Option<u64>,
    input: &InputArgs,
) -> mjpeg::Result<()> {
    std::fs::create_dir_all(&dir)?;
    let writer = Arc::new(JpegSequenceWriter::new(&dir, prefix, max_frames));
    let broadcaster = Arc::new(FrameBroadcaster::new());
    broadcaster.register(writer.clone());

    let worker = spawn_worker(input.open(source, false)?, broadcaster)?;
    wait_until(&worker, || writer.is_done());

    let stats = worker.stats();
    println!(
        "{} frames written to {} ({} skipped)",
        writer.written(),
        dir.display(),
        stats.skipped
    );
    Ok(())
}

fn monitor(source: &str, seconds: Option<u64>, interval: u64, input: &InputArgs) -> mjpeg::Result<()> {
    let monitor = Arc::new(RateMonitor::new());
    let broadcaster = Arc::new(FrameBroadcaster::new());
    broadcaster.register(monitor.clone());

    let worker = spawn_worker(input.open(source, false)?, broadcaster)?;
    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
    let interval = Duration::from_secs(interval.max(1));
    let mut next_report = Instant::now() + interval;

    wait_until(&worker, || {
        if Instant::now() >= next_report {
            println!("{} frames in {:.1}s, {:.2} fps", monitor.count(), monitor.elapsed().as_secs_f64(), monitor.fps());
            monitor.reset();
            next_report += interval;
        }
        deadline.is_some_and(|d| Instant::now() >= d)
    });

    let stats = worker.stats();
    println!("total: {} frames, {} skipped", stats.frames, stats.skipped);
    Ok(())
}

fn record(source: &str, out: PathBuf, max_frames: Option<u64>, input: &InputArgs) -> mjpeg::Result<()> {
    let file = BufWriter::new(File::create(&out)?);
    let recorder = Arc::new(StreamRecorder::new(file));
    let broadcaster = Arc::new(FrameBroadcaster::new());
    broadcaster.register(recorder.clone());

    let worker = spawn_worker(input.open(source, true)?, broadcaster)?;
    wait_until(&worker, || max_frames.is_some_and(|max| recorder.frames() >= max));
    recorder.flush()?;

    println!(
        "{} frames ({} bytes) recorded to {}",
        recorder.frames(),
        recorder.bytes_written(),
        out.display()
    );
    Ok(())
}

fn serve(
    file: PathBuf,
    bind: &str,
    fps: Option<u32>,
    boundary: String,
    restart_sequence: bool,
) -> mjpeg::Result<()> {
    let config = LoopConfig {
        frame_rate: fps,
        sequence_policy: if restart_sequence {
            SequencePolicy::Restart
        } else {
            SequencePolicy::Continue
        },
        ..LoopConfig::default()
    };
    let source = LoopingSource::open(&file, config)?;

    let server_config = ServerConfig {
        boundary,
        ..ServerConfig::default()
    };
    let mut server = MjpegServer::with_config(bind, source.broadcaster().clone(), server_config);
    server.start()?;
    source.start()?;

    println!(
        "Serving {} on http://{} (press Enter to stop)",
        file.display(),
        server.local_addr()?
    );
    let mut input = String::new();
    let _ = io::stdin().read_line(&mut input);
    tracing::info!(clients = server.client_count(), "shutting down");

    source.stop();
    server.stop();
    Ok(())
}
