//! token-cache CLI
//!
//! Inspects and exercises a synchronized token cache from the shell. Also
//! used by the integration tests to drive several processes at once.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use token_cache_sync::cache::MutatorError;
use token_cache_sync::{
    BackendKind, CacheStorage, CrossProcessLock, StorageConfig, StorageObserver, TracingObserver,
};

#[derive(Parser)]
#[command(name = "token-cache")]
#[command(about = "Cross-process synchronized token cache", version)]
struct Cli {
    /// JSON config file; flags below override its values
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Cache marker path (default: per-user identity service directory)
    #[arg(long, global = true)]
    cache_path: Option<PathBuf>,

    /// Secure store service name
    #[arg(long, global = true)]
    service: Option<String>,

    /// Secure store account name
    #[arg(long, global = true)]
    account: Option<String>,

    /// Backend: auto, keychain, credential-manager, keyring, dpapi-file, plaintext-file
    #[arg(long, global = true)]
    backend: Option<BackendKind>,

    /// Lock wait budget in milliseconds
    #[arg(long, global = true)]
    lock_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the persisted cache contents
    Show,

    /// Append one line to the cache under the lock
    Append {
        /// Token text to append
        token: String,
    },

    /// Delete the persisted cache
    Clear,

    /// Check that the secure store can write and read back data
    Verify,

    /// Write bracketed lines to a file while holding the cache lock
    Stress {
        /// File that receives "< pid" and "> pid" lines
        #[arg(long)]
        protected_file: PathBuf,

        /// Number of lock/write/unlock rounds
        #[arg(long, default_value_t = 1)]
        iterations: u32,

        /// Sleep between the two lines, in milliseconds
        #[arg(long, default_value_t = 10)]
        hold_ms: u64,
    },

    /// Take the cache lock, print "locked", and keep it for a while
    Hold {
        /// How long to hold the lock, in milliseconds
        #[arg(long, default_value_t = 60_000)]
        ms: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("token_cache_sync=info".parse()?)
                .add_directive("warn".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;
    let observer: Arc<dyn StorageObserver> = Arc::new(TracingObserver);

    match cli.command {
        Commands::Show => run_show(config, observer),
        Commands::Append { token } => run_append(config, observer, token),
        Commands::Clear => run_clear(config, observer),
        Commands::Verify => run_verify(config, observer),
        Commands::Stress {
            protected_file,
            iterations,
            hold_ms,
        } => run_stress(
            &config,
            observer,
            &protected_file,
            iterations,
            Duration::from_millis(hold_ms),
        ),
        Commands::Hold { ms } => run_hold(&config, observer, Duration::from_millis(ms)),
    }
}

fn build_config(cli: &Cli) -> Result<StorageConfig> {
    let mut config = match &cli.config {
        Some(path) => StorageConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => {
            let cache_path = match &cli.cache_path {
                Some(path) => path.clone(),
                None => StorageConfig::default_cache_dir()
                    .context("No default cache directory; pass --cache-path")?
                    .join("token.cache"),
            };
            StorageConfig::new(cache_path, "token-cache-sync", "default")
        }
    };

    if let Some(path) = &cli.cache_path {
        config.cache_path = path.clone();
    }
    if let Some(service) = &cli.service {
        config.service_name = service.clone();
    }
    if let Some(account) = &cli.account {
        config.account_name = account.clone();
    }
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(ms) = cli.lock_timeout_ms {
        config.lock_timeout_ms = ms;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn run_show(config: StorageConfig, observer: Arc<dyn StorageObserver>) -> Result<()> {
    let storage = CacheStorage::new(config, observer)?;
    let snapshot = storage.read()?;
    let mut stdout = io::stdout().lock();
    stdout.write_all(snapshot.data())?;
    stdout.flush()?;
    Ok(())
}

fn run_append(
    config: StorageConfig,
    observer: Arc<dyn StorageObserver>,
    token: String,
) -> Result<()> {
    let storage = CacheStorage::new(config, observer)?;
    storage
        .synchronized_update(|current: &[u8]| {
            let mut next = current.to_vec();
            next.extend_from_slice(token.as_bytes());
            next.push(b'\n');
            Ok::<_, MutatorError>(next)
        })
        .context("Failed to append token")?;
    Ok(())
}

fn run_clear(config: StorageConfig, observer: Arc<dyn StorageObserver>) -> Result<()> {
    let storage = CacheStorage::new(config, observer)?;
    storage.clear()?;
    println!("cleared");
    Ok(())
}

fn run_verify(config: StorageConfig, observer: Arc<dyn StorageObserver>) -> Result<()> {
    let storage = CacheStorage::new(config, observer)?;
    let backend = storage.accessor().kind();
    storage
        .verify_persistence()
        .with_context(|| format!("Persistence check failed for backend {}", backend))?;
    println!("ok ({})", backend);
    Ok(())
}

fn run_stress(
    config: &StorageConfig,
    observer: Arc<dyn StorageObserver>,
    protected_file: &Path,
    iterations: u32,
    hold: Duration,
) -> Result<()> {
    if iterations == 0 {
        bail!("--iterations must be at least 1");
    }
    let lock = CrossProcessLock::new(config.lock_path(), config.lock_retry, observer);
    let pid = std::process::id();

    for _ in 0..iterations {
        let handle = lock.acquire(config.lock_timeout())?;
        append_line(protected_file, &format!("< {}", pid))?;
        thread::sleep(hold);
        append_line(protected_file, &format!("> {}", pid))?;
        handle.release()?;
    }
    Ok(())
}

fn run_hold(
    config: &StorageConfig,
    observer: Arc<dyn StorageObserver>,
    duration: Duration,
) -> Result<()> {
    let lock = CrossProcessLock::new(config.lock_path(), config.lock_retry, observer);
    let handle = lock.acquire(config.lock_timeout())?;
    println!("locked");
    io::stdout().flush()?;
    thread::sleep(duration);
    handle.release()?;
    Ok(())
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    writeln!(file, "{}", line)?;
    Ok(())
}
