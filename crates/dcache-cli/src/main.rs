//! # dcache CLI
//!
//! Operator tool for a shared dcache root: pre-create the shard tree, inspect
//! entry paths, and read, populate or drop single entries.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dcache_config::logging::{init_logging, LogLevel};
use dcache_config::{log_cli_debug, log_cli_info, Config};
use dcache_store::{CacheStore, Content, StoreOptions};

/// dcache - lock-coordinated filesystem cache shared across processes and hosts
#[derive(Parser)]
#[command(name = "dcache")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Cache root directory (overrides config and DCACHE_ROOT)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Shard levels as digest ranges, e.g. "0:2,2:4"
    #[arg(long, global = true, value_parser = parse_shards)]
    shards: Option<Shards>,

    /// Pre-create every shard directory when opening the store
    #[arg(long, global = true)]
    create_dirs: bool,

    /// Load this config file instead of the standard locations
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pre-create the shard directory tree
    Init,

    /// Print the on-disk path of an entry
    Path {
        #[arg(value_name = "KEY")]
        key: String,
    },

    /// Write a cached entry (header and content) to stdout
    Get {
        #[arg(value_name = "KEY")]
        key: String,

        /// Seconds to wait for an entry that is being written
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Populate an entry from a file or stdin
    Put {
        #[arg(value_name = "KEY")]
        key: String,

        /// Read content from this file instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Opaque header stored in front of the content
        #[arg(long, default_value = "")]
        header: String,

        /// Replace an entry that is already cached
        #[arg(long)]
        force: bool,
    },

    /// Remove an entry
    Delete {
        #[arg(value_name = "KEY")]
        key: String,
    },
}

/// Digest ranges given on the command line.
#[derive(Debug, Clone, PartialEq)]
struct Shards(Vec<(usize, usize)>);

/// Parse `"0:2,2:4"` into digest ranges.
fn parse_shards(s: &str) -> Result<Shards, String> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(Shards(Vec::new()));
    }
    s.split(',')
        .map(|part| -> Result<(usize, usize), String> {
            let (start, end) = part
                .trim()
                .split_once(':')
                .ok_or_else(|| format!("expected START:END, got {part:?}"))?;
            let start = start
                .trim()
                .parse()
                .map_err(|e| format!("bad shard start {start:?}: {e}"))?;
            let end = end
                .trim()
                .parse()
                .map_err(|e| format!("bad shard end {end:?}: {e}"))?;
            Ok((start, end))
        })
        .collect::<Result<_, String>>()
        .map(Shards)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = resolve_config(&cli)?;
    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        config.logging.log_level()
    };
    init_logging(level);

    let hit = run(cli.command, &config, &mut io::stdout().lock())?;
    if !hit {
        std::process::exit(1);
    }
    Ok(())
}

/// Config file (explicit or standard locations) with command-line flags on top.
fn resolve_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = Config::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?;
            config.apply_env_overrides();
            config
        }
        None => dcache_config::config().clone(),
    };

    if let Some(root) = &cli.root {
        config.storage.root = dcache_config::path::absolute_root(root)?;
    }
    if let Some(Shards(shards)) = &cli.shards {
        config.storage.shards = shards.clone();
    }
    if cli.create_dirs {
        config.storage.create_dirs = true;
    }
    Ok(config)
}

fn open_store(config: &Config) -> Result<CacheStore> {
    let root = config.storage.resolved_root();
    let options = StoreOptions::from_config(config).context("Invalid shard layout")?;
    log_cli_debug!("Opening store", root = root.display().to_string());
    CacheStore::new(&root, options)
        .with_context(|| format!("Failed to open cache at {}", root.display()))
}

/// Run one command. Returns false when the command should exit non-zero.
fn run(command: Commands, config: &Config, out: &mut dyn Write) -> Result<bool> {
    match command {
        Commands::Init => cmd_init(config, out).map(|_| true),
        Commands::Path { key } => {
            let store = open_store(config)?;
            writeln!(out, "{}", store.path_for(&key).display())?;
            Ok(true)
        }
        Commands::Get { key, timeout } => {
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.locking.timeout());
            cmd_get(config, &key, timeout, out)
        }
        Commands::Put {
            key,
            file,
            header,
            force,
        } => cmd_put(config, &key, file, header.as_bytes(), force, out).map(|_| true),
        Commands::Delete { key } => {
            let store = open_store(config)?;
            store
                .delete(&key)
                .with_context(|| format!("Failed to delete {key}"))?;
            log_cli_info!("Deleted entry", key = key.as_str());
            Ok(true)
        }
    }
}

fn cmd_init(config: &Config, out: &mut dyn Write) -> Result<()> {
    let mut config = config.clone();
    config.storage.create_dirs = true;
    let store = open_store(&config)?;
    let levels = store.layout().ranges().len();
    if store.tree_created() {
        writeln!(
            out,
            "Created {} shard directories under {}",
            store.layout().leaf_count(),
            store.root().display()
        )?;
    } else {
        writeln!(
            out,
            "Shard tree already present under {}",
            store.root().display()
        )?;
    }
    log_cli_info!("Shard tree ready", levels = levels);
    Ok(())
}

fn cmd_get(config: &Config, key: &str, timeout: Duration, out: &mut dyn Write) -> Result<bool> {
    let store = open_store(config)?;
    match store
        .get(key, timeout)
        .with_context(|| format!("Failed to read {key}"))?
    {
        Some(mut reader) => {
            io::copy(&mut reader, out)?;
            out.flush()?;
            Ok(true)
        }
        None => {
            // A lookup from the CLI must not leave a claim behind for real fetchers to wait on.
            if store.holds_claim(key) {
                store.delete(key)?;
            }
            eprintln!("miss");
            Ok(false)
        }
    }
}

fn cmd_put(
    config: &Config,
    key: &str,
    file: Option<PathBuf>,
    header: &[u8],
    force: bool,
    out: &mut dyn Write,
) -> Result<()> {
    let store = open_store(config)?;

    if let Some(existing) = store.get(key, config.locking.timeout())? {
        if !force {
            writeln!(out, "Already cached: {}", store.path_for(key).display())?;
            return Ok(());
        }
        drop(existing);
    }

    let mut source: Box<dyn Read> = match &file {
        Some(path) => Box::new(
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        ),
        None => Box::new(io::stdin().lock()),
    };

    let reader = store
        .set(key, header, Content::stream(&mut *source))
        .with_context(|| format!("Failed to store {key}"))?;
    let size = reader.entry_len()?;
    log_cli_info!("Stored entry", key = key, bytes = size);
    writeln!(out, "{}", store.path_for(key).display())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(temp: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.root = temp.path().to_path_buf();
        config.storage.shards = vec![(0, 1)];
        config.locking.timeout_secs = 1;
        config.locking.initial_backoff_ms = 5;
        config.locking.max_backoff_ms = 20;
        config
    }

    #[test]
    fn test_parse_shards() {
        assert_eq!(parse_shards("0:2,2:4").unwrap().0, vec![(0, 2), (2, 4)]);
        assert_eq!(parse_shards(" 0:1 , 1:3 ").unwrap().0, vec![(0, 1), (1, 3)]);
        assert!(parse_shards("").unwrap().0.is_empty());
        assert!(parse_shards("0-2").is_err());
        assert!(parse_shards("a:2").is_err());
    }

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "dcache",
            "get",
            "http://example.com/a",
            "--timeout",
            "3",
            "--shards",
            "0:1",
            "--root",
            "/tmp/cache",
        ])
        .unwrap();
        assert_eq!(cli.shards, Some(Shards(vec![(0, 1)])));
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/cache")));
        match cli.command {
            Commands::Get { key, timeout } => {
                assert_eq!(key, "http://example.com/a");
                assert_eq!(timeout, Some(3));
            }
            _ => panic!("expected get"),
        }
    }

    #[test]
    fn test_put_then_get() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let body = temp.path().join("body.txt");
        std::fs::write(&body, "payload").unwrap();

        let mut out = Vec::new();
        cmd_put(&config, "k", Some(body.clone()), b"H:", false, &mut out).unwrap();

        let mut out = Vec::new();
        assert!(cmd_get(&config, "k", Duration::ZERO, &mut out).unwrap());
        assert_eq!(out, b"H:payload");

        // Without --force the committed entry is left alone.
        std::fs::write(&body, "other").unwrap();
        let mut out = Vec::new();
        cmd_put(&config, "k", Some(body.clone()), b"", false, &mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("Already cached"));

        let mut out = Vec::new();
        cmd_put(&config, "k", Some(body), b"", true, &mut out).unwrap();
        let mut out = Vec::new();
        cmd_get(&config, "k", Duration::ZERO, &mut out).unwrap();
        assert_eq!(out, b"other");
    }

    #[test]
    fn test_get_miss_leaves_no_placeholder() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);

        let mut out = Vec::new();
        assert!(!cmd_get(&config, "absent", Duration::ZERO, &mut out).unwrap());
        assert!(out.is_empty());

        let store = open_store(&config).unwrap();
        assert!(!store.path_for("absent").exists());
    }

    #[test]
    fn test_init_reports_creation_once() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);

        let mut out = Vec::new();
        cmd_init(&config, &mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("Created 16"));

        let mut out = Vec::new();
        cmd_init(&config, &mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("Shard tree already present"));
    }

    #[test]
    fn test_delete_command() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let store = open_store(&config).unwrap();
        store.set("k", b"", b"v").unwrap();

        let mut out = Vec::new();
        assert!(run(
            Commands::Delete {
                key: "k".to_string()
            },
            &config,
            &mut out
        )
        .unwrap());
        assert!(!store.path_for("k").exists());
    }
}
