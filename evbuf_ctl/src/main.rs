//! # evbuf_ctl
//!
//! Administrative front end for evbuf ring buffers and guarded segments.
//!
//! # Usage
//!
//! ```bash
//! # Create the default ring (<prefix>_<user>_<node>) and inspect it
//! evbuf_ctl create --recreate
//! evbuf_ctl stat --json-out
//!
//! # Push a record and pull it back
//! evbuf_ctl write 10 20 30
//! evbuf_ctl read --timeout-ms 500
//!
//! # Forward a ring to another host and fill a ring from the network
//! evbuf_ctl send --addr daq02:5101
//! evbuf_ctl recv --bind 0.0.0.0:5101
//!
//! # Administrative reset
//! evbuf_ctl run 12 345 0
//! evbuf_ctl clear
//! evbuf_ctl unlink
//! ```

use clap::{Parser, Subcommand};
use evbuf_common::config::{ConfigError, ConfigLoader, EvbufConfig};
use evbuf_common::consts::DEFAULT_CONFIG_PATH;
use evbuf_common::shm::naming::segment_name;
use evbuf_shared_memory::{
    BufferOptions, RetryPolicy, RunInfo, SemaphoreSegment, SharedEventBuffer, ShmError,
    StreamListener, StreamSocket, drain_to_stream, fill_from_stream, find_segment, list_segments,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Relay poll interval; bounds how long ctrl-c takes to be noticed.
const RELAY_POLL: Duration = Duration::from_millis(200);

/// evbuf control - manage shared-memory event ring buffers
#[derive(Parser, Debug)]
#[command(name = "evbuf_ctl")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Manage shared-memory event ring buffers and their transports")]
#[command(long_about = None)]
struct Args {
    /// Configuration file; defaults are used if it does not exist
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Segment name (default: <prefix>_<user>_<node> from the config)
    #[arg(short, long, global = true)]
    name: Option<String>,

    /// Ring capacity in words, overriding the config
    #[arg(long, global = true)]
    capacity: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create (or attach) the ring
    Create {
        /// Discard an existing segment of the same name
        #[arg(long)]
        recreate: bool,
    },
    /// Print the ring header
    Stat {
        /// Print the header as JSON
        #[arg(long)]
        json_out: bool,
    },
    /// Zero the header counters and the data region
    Clear,
    /// Remove the segment name
    Unlink,
    /// List segments by name prefix
    List {
        /// Prefix to match (default: the configured prefix)
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Append one record
    Write {
        /// Payload words
        #[arg(required = true, value_parser = parse_word)]
        words: Vec<u32>,
        /// Commit only as record number SERIAL
        #[arg(long)]
        serial: Option<u32>,
    },
    /// Remove and print the oldest record
    Read {
        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Set the run identification in the header
    Run {
        /// Experiment number
        exp: u32,
        /// Run number
        run: u32,
        /// Sub-run number
        #[arg(default_value_t = 0)]
        subrun: u32,
    },
    /// Forward ring records to a TCP peer until interrupted
    Send {
        /// Peer address (default: stream host:port from the config)
        #[arg(long)]
        addr: Option<String>,
    },
    /// Accept one TCP peer and write its records into the ring
    Recv {
        /// Listen address (default: 0.0.0.0:<stream port>)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Create a semaphore-guarded segment
    GuardedCreate {
        /// Segment name
        segment: String,
        /// Size in bytes (default: from the config)
        #[arg(long)]
        size: Option<usize>,
    },
    /// Show a guarded segment's ids and lock state
    GuardedStat {
        /// Segment name
        segment: String,
    },
    /// Remove a guarded segment and its id file
    GuardedDestroy {
        /// Segment name
        segment: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run() {
        // Tracing may not be up yet if the config failed to load
        eprintln!("evbuf_ctl failed: {}", e);
        error!("evbuf_ctl failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args)?;
    setup_tracing(&args, &config);

    let name = args
        .name
        .clone()
        .unwrap_or_else(|| segment_name(&config.buffer.prefix));

    match &args.command {
        Command::Create { recreate } => {
            let ring = open_ring(&name, &args, &config, *recreate || config.buffer.recreate)?;
            let role = if ring.is_creator() { "created" } else { "attached" };
            println!("{} {} ({} words)", role, ring.name(), ring.capacity_words());
        }
        Command::Stat { json_out } => {
            let ring = attach_ring(&name, &config)?;
            let header = ring.header()?;
            if *json_out {
                println!("{}", serde_json::to_string_pretty(&header)?);
            } else {
                println!("segment:   {}", ring.name());
                println!("capacity:  {} words", header.capacity_words);
                println!(
                    "run:       exp {} run {} subrun {}",
                    header.run.exp_number, header.run.run_number, header.run.subrun_number
                );
                println!(
                    "records:   in {} out {} pending {}",
                    header.count_in,
                    header.count_out,
                    header.pending_records()
                );
                println!(
                    "words:     in {} out {} buffered {} ({:.1}%)",
                    header.words_in,
                    header.words_out,
                    header.buffered_words(),
                    header.occupancy() * 100.0
                );
                println!(
                    "active:    {} writer(s), {} reader(s)",
                    header.writer_count, header.reader_count
                );
            }
        }
        Command::Clear => {
            attach_ring(&name, &config)?.clear()?;
            info!("Cleared {}", name);
        }
        Command::Unlink => {
            if !SharedEventBuffer::unlink_name(&name)? {
                warn!("Segment {} did not exist", name);
            }
        }
        Command::List { prefix } => {
            let prefix = prefix.as_deref().unwrap_or(&config.buffer.prefix);
            for seg in list_segments(prefix)? {
                let capacity = seg
                    .capacity_words
                    .map_or_else(|| "-".to_string(), |c| c.to_string());
                println!("{:<40} {:>12} bytes {:>12} words", seg.name, seg.size, capacity);
            }
        }
        Command::Write { words, serial } => {
            let ring = open_ring(&name, &args, &config, false)?;
            let count = ring.write(words, false, *serial)?;
            println!("{}", count);
        }
        Command::Read { timeout_ms } => {
            let ring = attach_ring(&name, &config)?;
            let record = match timeout_ms {
                Some(ms) => ring.read_record_timeout(false, Duration::from_millis(*ms))?,
                None => Some(ring.read_record(false)?),
            };
            match record {
                Some((words, info)) => {
                    let text: Vec<String> = words.iter().map(u32::to_string).collect();
                    println!("#{} [{}]", info.count, text.join(" "));
                }
                None => {
                    warn!("No record within the timeout");
                    std::process::exit(2);
                }
            }
        }
        Command::Run { exp, run, subrun } => {
            attach_ring(&name, &config)?.set_run(RunInfo {
                exp_number: *exp,
                run_number: *run,
                subrun_number: *subrun,
            })?;
        }
        Command::Send { addr } => {
            let ring = open_ring(&name, &args, &config, false)?;
            let addr = addr.clone().unwrap_or_else(|| config.stream.address());
            let policy = RetryPolicy {
                interval: config.stream.retry_interval(),
                max_attempts: config.stream.max_retries,
            };
            let stop = install_stop_handler()?;
            let mut socket = StreamSocket::connect(&addr, policy)?
                .with_max_frame(config.stream.max_frame_bytes);
            let stats = drain_to_stream(&ring, &mut socket, &stop, RELAY_POLL)?;
            println!("{}", serde_json::to_string(&stats)?);
        }
        Command::Recv { bind } => {
            let ring = open_ring(&name, &args, &config, false)?;
            let bind = bind
                .clone()
                .unwrap_or_else(|| format!("0.0.0.0:{}", config.stream.port));
            let stop = install_stop_handler()?;
            let listener =
                StreamListener::bind(bind.as_str())?.with_max_frame(config.stream.max_frame_bytes);
            let mut socket = listener.accept()?;
            let stats = fill_from_stream(&mut socket, &ring, &stop, RELAY_POLL)?;
            println!("{}", serde_json::to_string(&stats)?);
        }
        Command::GuardedCreate { segment, size } => {
            let size = size.unwrap_or(config.guarded.size_bytes);
            let seg = SemaphoreSegment::create(segment, size, &config.guarded.id_dir)?;
            println!("{}", serde_json::to_string_pretty(&seg.ids())?);
        }
        Command::GuardedStat { segment } => {
            let seg = SemaphoreSegment::attach(segment, &config.guarded.id_dir)?;
            println!("segment:   {}", seg.name());
            println!("id file:   {}", seg.id_file().display());
            println!("ids:       {}", serde_json::to_string(&seg.ids())?);
            println!("locked:    {}", seg.is_locked()?);
            println!("creator:   {}", if seg.creator_alive() { "alive" } else { "gone" });
        }
        Command::GuardedDestroy { segment } => {
            SemaphoreSegment::attach(segment, &config.guarded.id_dir)?.destroy()?;
        }
    }
    Ok(())
}

/// Load the config file, falling back to defaults when it is absent.
fn load_config(args: &Args) -> Result<EvbufConfig, ConfigError> {
    let mut config = match EvbufConfig::load(&args.config) {
        Ok(config) => config,
        Err(ConfigError::FileNotFound) => EvbufConfig::with_service_name("evbuf_ctl"),
        Err(e) => return Err(e),
    };
    if let Some(capacity) = args.capacity {
        config.buffer.capacity_words = capacity;
    }
    config.validate()?;
    Ok(config)
}

fn open_ring(
    name: &str,
    args: &Args,
    config: &EvbufConfig,
    recreate: bool,
) -> Result<SharedEventBuffer, ShmError> {
    // An existing ring keeps its own capacity unless one was asked for.
    let capacity = match (args.capacity, find_segment(name)?) {
        (None, Some(existing)) if !recreate => existing
            .capacity_words
            .unwrap_or(config.buffer.capacity_words),
        _ => config.buffer.capacity_words,
    };
    SharedEventBuffer::open_with(
        name,
        capacity,
        BufferOptions {
            recreate,
            robust: config.buffer.robust,
            attach_timeout: config.buffer.attach_timeout(),
        },
    )
}

/// Attach an existing ring, taking the capacity from the segment size.
fn attach_ring(name: &str, config: &EvbufConfig) -> Result<SharedEventBuffer, ShmError> {
    let info = find_segment(name)?.ok_or_else(|| ShmError::NotFound {
        name: name.to_string(),
    })?;
    let capacity = info
        .capacity_words
        .ok_or(ShmError::InvalidSize { size: info.size })?;
    SharedEventBuffer::open_with(
        name,
        capacity,
        BufferOptions {
            recreate: false,
            robust: config.buffer.robust,
            attach_timeout: config.buffer.attach_timeout(),
        },
    )
}

fn install_stop_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        flag.store(true, Ordering::SeqCst);
    })?;
    Ok(stop)
}

/// Accept decimal or `0x`-prefixed hexadecimal words.
fn parse_word(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid word {text:?}: {e}"))
}

/// Setup tracing subscriber based on CLI arguments and config.
fn setup_tracing(args: &Args, config: &EvbufConfig) {
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.shared.log_level.as_str()))
    };

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words_parse_decimal_and_hex() {
        assert_eq!(parse_word("42"), Ok(42));
        assert_eq!(parse_word("0xdeadbeef"), Ok(0xdead_beef));
        assert!(parse_word("-1").is_err());
        assert!(parse_word("0xzz").is_err());
    }

    #[test]
    fn test_write_requires_words() {
        assert!(Args::try_parse_from(["evbuf_ctl", "write"]).is_err());
        let args = Args::try_parse_from(["evbuf_ctl", "write", "1", "0x10", "--serial", "3"]).unwrap();
        match args.command {
            Command::Write { words, serial } => {
                assert_eq!(words, vec![1, 16]);
                assert_eq!(serial, Some(3));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let args = Args::try_parse_from([
            "evbuf_ctl",
            "--config",
            path.to_str().unwrap(),
            "--capacity",
            "1024",
            "stat",
        ])
        .unwrap();
        let config = load_config(&args).unwrap();
        assert_eq!(config.buffer.capacity_words, 1024);
        assert_eq!(config.shared.service_name, "evbuf_ctl");
    }

    #[test]
    fn test_capacity_below_minimum_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let args = Args::try_parse_from([
            "evbuf_ctl",
            "-c",
            path.to_str().unwrap(),
            "--capacity",
            "2",
            "clear",
        ])
        .unwrap();
        assert!(matches!(load_config(&args), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_capacity_above_maximum_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let huge = ((1usize << 62) + 16).to_string();
        let args = Args::try_parse_from([
            "evbuf_ctl",
            "-c",
            path.to_str().unwrap(),
            "--capacity",
            huge.as_str(),
            "create",
        ])
        .unwrap();
        assert!(matches!(load_config(&args), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_force_is_not_a_cli_flag() {
        assert!(Args::try_parse_from(["evbuf_ctl", "write", "1", "--force"]).is_err());
        assert!(Args::try_parse_from(["evbuf_ctl", "read", "--force"]).is_err());
    }
}
