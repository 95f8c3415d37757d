use anyhow::anyhow;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use npu_link::config::{LinkConfig, PollPolicy, RetryPolicy};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "npu-link",
    about = "Serial host link for an NPU: streaming and dual-session inference"
)]
pub struct Cli {
    /// Verbose protocol logging (RUST_LOG still applies)
    #[arg(long, global = true, default_value_t = false)]
    pub debug: bool,
    #[command(subcommand)]
    pub cmd: Cmd,
}

impl Cli {
    /// Default filter directive. `info` keeps the periodic stats line visible.
    pub fn log_level(&self) -> &'static str {
        if self.debug { "debug" } else { "info" }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Print firmware and system status
    Status(StatusOpts),
    /// Reset the device
    Reset(ResetOpts),
    /// Stream images through the windowed pipeline
    Stream(StreamOpts),
    /// Run images through two alternating sessions
    Session(SessionOpts),
    /// Decode a raw result dump and print its nodes
    Parse(ParseOpts),
}

#[derive(Args, Debug, Clone)]
pub struct SerialOpts {
    /// Serial device path
    #[arg(long, default_value = "/dev/ttyUSB0")]
    pub dev: String,
    /// Baud rate
    #[arg(long, default_value_t = 921_600)]
    pub baud: u32,
    /// Enable RTS/CTS
    #[arg(long, default_value_t = false)]
    pub rtscts: bool,
}

#[derive(Args, Debug, Clone)]
pub struct LinkOpts {
    /// Resends after a transient failure
    #[arg(long, default_value_t = 2)]
    pub retries: u32,
    /// Pause between resends in milliseconds
    #[arg(long)]
    pub backoff_ms: Option<u64>,
    /// Device status codes to treat as busy (repeatable)
    #[arg(long = "transient", value_parser = parse_int)]
    pub transient: Vec<u32>,
    /// Reply timeout in milliseconds; 0 waits forever
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,
    /// Give up polling a session after this many milliseconds
    #[arg(long)]
    pub poll_max_ms: Option<u64>,
    /// Sleep between session polls in milliseconds
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,
    /// Send CRC trailers
    #[arg(long, default_value_t = false)]
    pub crc: bool,
    /// Largest bulk write in bytes
    #[arg(long, default_value_t = 2 * 1024 * 1024)]
    pub chunk: usize,
    /// Largest raw result accepted in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    pub max_result: usize,
    /// Consecutive window disagreements tolerated before giving up
    #[arg(long, default_value_t = 3)]
    pub mismatch_limit: u32,
    /// Stats log interval in seconds
    #[arg(long, default_value_t = 1.0)]
    pub stats: f64,
}

impl LinkOpts {
    pub fn to_config(&self) -> LinkConfig {
        let ms = Duration::from_millis;
        LinkConfig {
            retry: RetryPolicy {
                retries: self.retries,
                backoff: self.backoff_ms.map(ms),
                transient_codes: self.transient.clone(),
            },
            poll: PollPolicy {
                max_wait: self.poll_max_ms.map(ms),
                interval: self.poll_interval_ms.map(ms),
            },
            response_timeout: (self.timeout_ms > 0).then(|| ms(self.timeout_ms)),
            crc: self.crc,
            bulk_chunk: self.chunk,
            max_result_len: self.max_result,
            window_mismatch_limit: self.mismatch_limit,
        }
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs_f64(self.stats.max(0.0))
    }
}

#[derive(Args, Debug, Clone)]
pub struct StatusOpts {
    #[command(flatten)]
    pub ser: SerialOpts,
    #[command(flatten)]
    pub link: LinkOpts,
}

#[derive(Args, Debug, Clone)]
pub struct ResetOpts {
    #[command(flatten)]
    pub ser: SerialOpts,
    #[command(flatten)]
    pub link: LinkOpts,
    /// Reset mode (255 leaves streaming/session mode)
    #[arg(long, default_value_t = 0, value_parser = parse_int)]
    pub mode: u32,
    #[arg(long, default_value_t = 0, value_parser = parse_int)]
    pub check_code: u32,
}

#[derive(Args, Debug, Clone)]
pub struct InputOpts {
    /// Image files, sent in order and repeated to reach --count
    #[arg(required = true)]
    pub images: Vec<PathBuf>,
    /// Total submissions; defaults to one per image, 0 runs until Ctrl-C
    #[arg(long)]
    pub count: Option<u64>,
    /// Raw image width
    #[arg(long, default_value_t = 640)]
    pub width: u16,
    /// Raw image height
    #[arg(long, default_value_t = 480)]
    pub height: u16,
    /// Model input width
    #[arg(long, default_value_t = 224)]
    pub model_width: u32,
    /// Model input height
    #[arg(long, default_value_t = 224)]
    pub model_height: u32,
    /// Print each result's node summary
    #[arg(long, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StreamOpts {
    #[command(flatten)]
    pub ser: SerialOpts,
    #[command(flatten)]
    pub link: LinkOpts,
    #[command(flatten)]
    pub input: InputOpts,
    /// Application profile on the device
    #[arg(long, default_value_t = 0, value_parser = parse_int)]
    pub app_id: u32,
    /// Image format word, e.g. 0x80000060 for RGB565
    #[arg(long, default_value = "0x80000060", value_parser = parse_int)]
    pub format: u32,
    /// Per-image result buffer to reserve on the device
    #[arg(long, default_value_t = 0x2000, value_parser = parse_int)]
    pub result_size: u32,
    /// Model to select after start
    #[arg(long, value_parser = parse_int)]
    pub model_id: Option<u32>,
    /// Parameter sent with --model-id
    #[arg(long, default_value_t = 0, value_parser = parse_int)]
    pub param: u32,
    /// Images to queue before the first retrieval; defaults to the full window
    #[arg(long)]
    pub window_target: Option<u32>,
}

#[derive(Args, Debug, Clone)]
pub struct SessionOpts {
    #[command(flatten)]
    pub ser: SerialOpts,
    #[command(flatten)]
    pub link: LinkOpts,
    #[command(flatten)]
    pub input: InputOpts,
    /// Model binary to load before running
    #[arg(long)]
    pub model: Option<PathBuf>,
    /// Firmware info blob sent with the model
    #[arg(long)]
    pub fw_info: Option<PathBuf>,
    /// Session configuration blob
    #[arg(long)]
    pub config: PathBuf,
    /// Send turns to run; overrides --count
    #[arg(long)]
    pub turns: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct ParseOpts {
    /// Raw result dump
    pub file: PathBuf,
}

/// Decimal or 0x-prefixed hex.
pub fn parse_int(s: &str) -> anyhow::Result<u32> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| anyhow!("expected a decimal or 0x-prefixed integer, got {s:?}"))
}
