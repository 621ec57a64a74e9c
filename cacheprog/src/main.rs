use anyhow::{Context, Result};
use cacheprog_core::{DiskStore, Server};
use clap::Parser;
use std::env;
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Directory created under the user cache directory when none is given.
const DEFAULT_DIR_NAME: &str = ".gocacheprog";

/// Single-dash spelling used by Go's `flag` package.
const GO_CACHE_DIR_FLAG: &str = "-cache-dir";

/// cacheprog - An external build cache speaking the GOCACHEPROG protocol
///
/// Reads requests on stdin and writes responses on stdout. Point the build
/// tool at it with `GOCACHEPROG=cacheprog`.
#[derive(Parser)]
#[command(name = "cacheprog")]
#[command(about = "External build cache backend for GOCACHEPROG", long_about = None)]
#[command(version)]
struct Cli {
    /// Cache directory (defaults to <user cache dir>/.gocacheprog)
    #[arg(long, env = "CACHEPROG_DIR")]
    cache_dir: Option<PathBuf>,

    /// Increase log verbosity on stderr (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse_from(normalize_args(env::args_os()));
    init_logging(cli.verbose);

    let cache_dir = match cli.cache_dir {
        Some(dir) => dir,
        None => default_cache_dir()?,
    };

    let store = DiskStore::open(&cache_dir).with_context(|| {
        format!(
            "Failed to initialize cache directory {}",
            cache_dir.display()
        )
    })?;
    info!(cache_dir = %store.root().display(), "cache directory ready");

    // stdout carries the protocol; everything else goes to stderr
    let server = Server::new(store, io::stdout());
    server
        .send_handshake()
        .context("Failed to send handshake")?;

    let stats = server
        .serve(io::stdin().lock())
        .context("Error processing requests")?;
    info!(requests = stats.requests(), "stdin closed, exiting");

    Ok(())
}

/// Rewrite `-cache-dir` and `-cache-dir=DIR` to `--cache-dir`, up to a `--`.
fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut options_done = false;
    args.into_iter()
        .map(|arg| {
            let bytes = arg.as_encoded_bytes();
            if bytes == b"--" {
                options_done = true;
            }
            let is_go_flag = bytes == GO_CACHE_DIR_FLAG.as_bytes()
                || bytes.starts_with(format!("{}=", GO_CACHE_DIR_FLAG).as_bytes());
            if options_done || !is_go_flag {
                return arg;
            }
            let mut long = OsString::from("-");
            long.push(&arg);
            long
        })
        .collect()
}

fn default_cache_dir() -> Result<PathBuf> {
    let user_cache = dirs::cache_dir().context("Failed to locate the user cache directory")?;
    Ok(user_cache.join(DEFAULT_DIR_NAME))
}

/// Log to stderr. `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_target(false)
        .init();
}
