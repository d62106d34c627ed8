//! `keyreg`: operator tooling for the data-key registry.
//!
//! Master keys come from a file of raw bytes (`--key-path`) or a hex string
//! (`--key-hex` / `KEYREG_KEY_HEX`). Supplying neither means the registry is
//! unencrypted. Key material is never printed.
//!
//! Registry log records are re-emitted as `tracing` events with target
//! `keyreg_core` and a `component` field, so `RUST_LOG=keyreg_core=debug`
//! selects them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use eyre::{bail, Result, WrapErr};
use keyreg_core::logger::{self, LogLevel, Logger};
use keyreg_core::{KeyRegistry, RegistryOptions};
use tracing::level_filters::LevelFilter;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "keyreg", version)]
#[command(about = "Inspect and maintain the data-key registry of an encrypted store")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging (overridden by `RUST_LOG`)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Open or create the registry and report its size
    Init {
        /// Storage directory holding `KEYREGISTRY`
        #[arg(long)]
        dir: PathBuf,

        #[command(flatten)]
        key: MasterKeyArgs,
    },

    /// List recorded data keys without modifying anything
    Info {
        /// Storage directory holding `KEYREGISTRY`
        #[arg(long)]
        dir: PathBuf,

        #[command(flatten)]
        key: MasterKeyArgs,
    },

    /// Print the current data key id, rotating first if the period has elapsed
    Latest {
        /// Storage directory holding `KEYREGISTRY`
        #[arg(long)]
        dir: PathBuf,

        /// Rotation period in days
        #[arg(long, default_value_t = 10)]
        rotation_days: u64,

        #[command(flatten)]
        key: MasterKeyArgs,
    },

    /// Re-wrap every data key under a new master key
    Rekey {
        /// Storage directory holding `KEYREGISTRY`
        #[arg(long)]
        dir: PathBuf,

        /// File with the current master key (omit for an unencrypted registry)
        #[arg(long)]
        old_key_path: Option<PathBuf>,

        /// File with the new master key (omit to store keys in clear)
        #[arg(long)]
        new_key_path: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct MasterKeyArgs {
    /// File containing the raw master key (16, 24 or 32 bytes)
    #[arg(long, conflicts_with = "key_hex")]
    key_path: Option<PathBuf>,

    /// Master key as a hex string
    #[arg(long, env = "KEYREG_KEY_HEX", hide_env_values = true)]
    key_hex: Option<String>,
}

impl MasterKeyArgs {
    fn load(&self) -> Result<Vec<u8>> {
        match (&self.key_path, &self.key_hex) {
            (Some(path), _) => read_key_file(path),
            (None, Some(hex_key)) => {
                hex::decode(hex_key.trim()).wrap_err("master key is not valid hex")
            }
            (None, None) => Ok(Vec::new()),
        }
    }
}

fn read_key_file(path: &Path) -> Result<Vec<u8>> {
    let key = std::fs::read(path)
        .wrap_err_with(|| format!("failed to read master key from {}", path.display()))?;
    if key.is_empty() {
        bail!("master key file {} is empty", path.display());
    }
    Ok(key)
}

/// Re-emits registry records as `tracing` events.
struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, component: &str, message: &str) {
        match level {
            LogLevel::Error => tracing::error!(target: "keyreg_core", component, "{message}"),
            LogLevel::Warn => tracing::warn!(target: "keyreg_core", component, "{message}"),
            LogLevel::Info => tracing::info!(target: "keyreg_core", component, "{message}"),
            LogLevel::Debug => tracing::debug!(target: "keyreg_core", component, "{message}"),
            LogLevel::Trace => tracing::trace!(target: "keyreg_core", component, "{message}"),
        }
    }
}

fn registry_level(level: Level) -> LogLevel {
    if level == Level::ERROR {
        LogLevel::Error
    } else if level == Level::WARN {
        LogLevel::Warn
    } else if level == Level::INFO {
        LogLevel::Info
    } else if level == Level::DEBUG {
        LogLevel::Debug
    } else {
        LogLevel::Trace
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;
    run(cli)
}

fn init_tracing(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .wrap_err("failed to install tracing subscriber")?;

    // The subscriber's most verbose level bounds what the registry formats.
    if let Some(level) = LevelFilter::current().into_level() {
        logger::set_logger(Arc::new(TracingLogger), registry_level(level))
            .wrap_err("failed to route registry logs")?;
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Init { dir, key } => {
            let options = RegistryOptions::new(&dir).with_encryption_key(key.load()?);
            let registry = open(&options)?;
            println!(
                "registry at {} holds {} data keys",
                dir.display(),
                registry.len()?
            );
            registry.close()?;
        }
        Command::Info { dir, key } => {
            let options = RegistryOptions::new(&dir)
                .with_encryption_key(key.load()?)
                .with_read_only(true);
            let registry = open(&options)?;
            println!("directory:   {}", dir.display());
            println!("encrypted:   {}", registry.is_encrypted()?);
            println!("next key id: {}", registry.next_key_id()?);
            for key_id in registry.key_ids()? {
                if let Some(key) = registry.data_key(key_id)? {
                    println!("key {key_id}: created_at={}", key.created_at());
                }
            }
            registry.close()?;
        }
        Command::Latest {
            dir,
            rotation_days,
            key,
        } => {
            let period = std::time::Duration::from_secs(rotation_days.saturating_mul(86_400));
            let options = RegistryOptions::new(&dir)
                .with_encryption_key(key.load()?)
                .with_rotation_period(period);
            let registry = open(&options)?;
            match registry.latest_data_key()? {
                Some(key) => println!("key {}: created_at={}", key.key_id(), key.created_at()),
                None => println!("encryption disabled; no data key"),
            }
            registry.close()?;
        }
        Command::Rekey {
            dir,
            old_key_path,
            new_key_path,
        } => {
            let old_key = old_key_path
                .as_deref()
                .map(read_key_file)
                .transpose()?
                .unwrap_or_default();
            let new_key = new_key_path
                .as_deref()
                .map(read_key_file)
                .transpose()?
                .unwrap_or_default();

            let registry = open(&RegistryOptions::new(&dir).with_encryption_key(old_key))?;
            registry
                .rekey(new_key)
                .wrap_err("failed to re-key registry")?;
            info!(dir = %dir.display(), keys = registry.len()?, "registry re-keyed");
            println!("re-keyed {} data keys", registry.len()?);
            registry.close()?;
        }
    }
    Ok(())
}

fn open(options: &RegistryOptions) -> Result<KeyRegistry> {
    KeyRegistry::open(options).wrap_err_with(|| {
        format!(
            "failed to open key registry in {}",
            options.dir().display()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("keyreg").chain(args.iter().copied()))
            .expect("parse")
    }

    fn write_key(dir: &Path, name: &str, byte: u8) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, vec![byte; 32]).expect("write key");
        path
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_key_sources_conflict() {
        let result = Cli::try_parse_from([
            "keyreg",
            "init",
            "--dir",
            "/tmp/x",
            "--key-path",
            "/tmp/key",
            "--key-hex",
            "00",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_hex_key_is_decoded() {
        let args = MasterKeyArgs {
            key_path: None,
            key_hex: Some(" 000102030405060708090a0b0c0d0e0f\n".to_string()),
        };
        assert_eq!(args.load().expect("load"), (0u8..16).collect::<Vec<_>>());

        let args = MasterKeyArgs {
            key_path: None,
            key_hex: Some("zz".to_string()),
        };
        assert!(args.load().is_err());
    }

    #[test]
    fn test_empty_key_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.key");
        std::fs::write(&path, b"").expect("write");
        assert!(read_key_file(&path).is_err());
    }

    #[derive(Clone, Default)]
    struct CapturedOutput(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedOutput {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_level_mapping() {
        assert_eq!(registry_level(Level::ERROR), LogLevel::Error);
        assert_eq!(registry_level(Level::INFO), LogLevel::Info);
        assert_eq!(registry_level(Level::TRACE), LogLevel::Trace);
    }

    #[test]
    fn test_registry_records_become_tracing_events() {
        let output = CapturedOutput::default();
        let writer = output.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("keyreg_core=info"))
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            TracingLogger.log(LogLevel::Warn, "registry", "duplicate record for data key 4");
            TracingLogger.log(LogLevel::Debug, "registry", "replayed 4 data keys");
        });

        let rendered = String::from_utf8(output.0.lock().expect("lock").clone()).expect("utf-8");
        assert!(rendered.contains("WARN"));
        assert!(rendered.contains("keyreg_core"));
        assert!(rendered.contains("registry"));
        assert!(rendered.contains("duplicate record for data key 4"));
        assert!(!rendered.contains("replayed 4 data keys"));
    }

    #[test]
    fn test_rotate_is_not_a_subcommand() {
        let result = Cli::try_parse_from(["keyreg", "rotate", "--dir", "/tmp/x"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_init_latest_rekey_flow() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = tempfile::tempdir().expect("tempdir");
        let old_key = write_key(keys.path(), "old.key", 0x01);
        let new_key = write_key(keys.path(), "new.key", 0x02);
        let store = dir.path().to_str().expect("utf-8 path");
        let old = old_key.to_str().expect("utf-8 path");
        let new = new_key.to_str().expect("utf-8 path");

        run(parse(&["init", "--dir", store, "--key-path", old])).expect("init");
        run(parse(&["latest", "--dir", store, "--key-path", old])).expect("latest");
        run(parse(&["info", "--dir", store, "--key-path", old])).expect("info");
        run(parse(&[
            "rekey",
            "--dir",
            store,
            "--old-key-path",
            old,
            "--new-key-path",
            new,
        ]))
        .expect("rekey");

        assert!(run(parse(&["info", "--dir", store, "--key-path", old])).is_err());
        let options = RegistryOptions::new(dir.path()).with_encryption_key(vec![0x02; 32]);
        let registry = KeyRegistry::open(&options).expect("open with new key");
        assert_eq!(registry.key_ids().expect("ids"), vec![1]);
    }
}
