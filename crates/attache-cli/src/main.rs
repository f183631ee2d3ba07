//! attache: encrypted chat-attachment storage CLI
//!
//! Commands:
//!   upload <file> <bucket/key>      - seal and upload, resuming an interrupted attempt
//!   download <descriptor> <file>    - fetch and decrypt a whole object
//!   cat <descriptor>                - decrypt a byte range to stdout
//!   stash list | stash clear        - inspect or drop interrupted uploads
//!   check                           - verify the storage backend is reachable
//!   config show                     - display current configuration

use anyhow::{Context, Result};
use attache_core::config::{expand_tilde, AttacheConfig};
use attache_core::Destination;
use attache_storage::{ObjectStore, OpendalStore};
use attache_upload::{
    open_stash, AttachmentStash, FileSource, ObjectDescriptor, PlaintextSource, ProgressFn,
    RandomAccessReader, StashKey, UploadError, UploadLimiter, UploadTask, Uploader, UploaderConfig,
};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "attache",
    version,
    about = "Encrypted, resumable attachment storage",
    long_about = "attache: seal chat attachments, upload them resumably and read them back by range"
)]
struct Cli {
    /// Path to attache.toml configuration file
    #[arg(long, short = 'c', env = "ATTACHE_CONFIG", default_value = "~/.config/attache/attache.toml")]
    config: PathBuf,

    /// Upload stash location (overrides config)
    #[arg(long, env = "ATTACHE_STASH_PATH")]
    stash: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to the config value
    #[arg(long, env = "ATTACHE_LOG")]
    log: Option<String>,

    /// Log format; defaults to the config value
    #[arg(long, env = "ATTACHE_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Seal a local file and upload it
    ///
    /// S3 credentials are read from AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY
    /// (or ATTACHE_ACCESS_KEY_ID / ATTACHE_SECRET_ACCESS_KEY).
    Upload {
        /// Local file
        local: PathBuf,
        /// Destination as bucket/key
        dest: String,
        /// Where to write the object descriptor (default: <file>.attache.json)
        #[arg(long, short = 'd')]
        descriptor: Option<PathBuf>,
    },

    /// Download and decrypt a whole object
    Download {
        /// Descriptor written by `upload`
        descriptor: PathBuf,
        /// Local output file
        output: PathBuf,
    },

    /// Decrypt a byte range of an object to stdout
    Cat {
        descriptor: PathBuf,
        /// First plaintext byte
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Number of bytes (default: to the end)
        #[arg(long)]
        len: Option<u64>,
    },

    /// Interrupted uploads recorded in the stash
    Stash {
        #[command(subcommand)]
        action: StashAction,
    },

    /// Verify the storage backend is reachable
    Check {
        /// Bucket to check (default: config storage.bucket)
        #[arg(long)]
        bucket: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum StashAction {
    /// List interrupted uploads
    List,
    /// Drop interrupted uploads and their staged parts
    Clear {
        /// Stash entry as printed by `stash list` (default: all entries)
        entry: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = AttacheConfig::load(&config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, format);

    let stash_path = expand_tilde(cli.stash.as_deref().unwrap_or(config.stash.path.as_path()));

    match cli.command {
        Commands::Upload { local, dest, descriptor } => {
            cmd_upload(&config, &stash_path, &local, &dest, descriptor.as_deref()).await
        }
        Commands::Download { descriptor, output } => {
            cmd_download(&config, &descriptor, &output).await
        }
        Commands::Cat { descriptor, offset, len } => cmd_cat(&config, &descriptor, offset, len).await,
        Commands::Stash { action: StashAction::List } => cmd_stash_list(&stash_path).await,
        Commands::Stash { action: StashAction::Clear { entry } } => {
            cmd_stash_clear(&config, &stash_path, entry.as_deref()).await
        }
        Commands::Check { bucket } => cmd_check(&config, bucket.as_deref()).await,
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &config_path),
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_writer(std::io::stderr)).init(),
        LogFormat::Text => registry.with(fmt::layer().with_writer(std::io::stderr)).init(),
    }
}

// ── Storage from config + environment credentials ────────────────────────────

/// S3 credentials from the environment, if both halves are set.
fn credentials_from_env() -> Option<(String, String)> {
    let access = std::env::var("AWS_ACCESS_KEY_ID")
        .or_else(|_| std::env::var("ATTACHE_ACCESS_KEY_ID"))
        .ok()?;
    let secret = std::env::var("AWS_SECRET_ACCESS_KEY")
        .or_else(|_| std::env::var("ATTACHE_SECRET_ACCESS_KEY"))
        .ok()?;
    Some((access, secret))
}

fn build_operator(config: &AttacheConfig, bucket: &str) -> Result<opendal::Operator> {
    let creds = credentials_from_env();
    attache_storage::build_from_core_config(
        &config.storage,
        bucket,
        creds.as_ref().map(|(a, s)| (a.as_str(), s.as_str())),
    )
    .with_context(|| format!("building storage operator for bucket {bucket}"))
}

fn open_store(config: &AttacheConfig, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
    let op = build_operator(config, bucket)?;
    Ok(Arc::new(OpendalStore::new(bucket, op)))
}

fn build_uploader(
    config: &AttacheConfig,
    stash: Arc<dyn AttachmentStash>,
    store: Arc<dyn ObjectStore>,
) -> Result<Uploader> {
    let upload_config = UploaderConfig::from_core(&config.upload).context("upload config")?;
    let limiter = Arc::new(UploadLimiter::new(config.upload.concurrency));
    Ok(Uploader::new(store, stash, limiter, upload_config))
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping (progress is kept in the stash)");
            child.cancel();
        }
    });
    token
}

// ── Descriptor files ─────────────────────────────────────────────────────────

async fn read_descriptor(path: &Path) -> Result<ObjectDescriptor> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading descriptor: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing descriptor: {}", path.display()))
}

async fn write_descriptor(path: &Path, descriptor: &ObjectDescriptor) -> Result<()> {
    let json = serde_json::to_vec_pretty(descriptor).context("serializing descriptor")?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &json)
        .await
        .with_context(|| format!("writing descriptor: {}", tmp.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // The descriptor carries the decryption keys.
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
    }
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming descriptor into place: {}", path.display()))
}

fn default_descriptor_path(local: &Path) -> PathBuf {
    let mut name = local.file_name().unwrap_or_default().to_os_string();
    name.push(".attache.json");
    local.with_file_name(name)
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}",
    )
    .map(|s| s.progress_chars("=>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn progress_sink(pb: &ProgressBar) -> ProgressFn {
    let pb = pb.clone();
    Arc::new(move |done, total| {
        pb.set_length(total);
        pb.set_position(done);
    })
}

// ── `attache upload` ─────────────────────────────────────────────────────────

async fn cmd_upload(
    config: &AttacheConfig,
    stash_path: &Path,
    local: &Path,
    dest: &str,
    descriptor_path: Option<&Path>,
) -> Result<()> {
    let dest = Destination::parse(dest)?;
    let store = open_store(config, &dest.bucket)?;
    let stash = open_stash(stash_path)
        .with_context(|| format!("opening stash: {}", stash_path.display()))?;
    let uploader = build_uploader(config, stash, store)?;

    let source = FileSource::open(local)
        .await
        .with_context(|| format!("opening {}", local.display()))?;
    let size = source.len();

    println!("Uploading {} → {} ({})", local.display(), dest, fmt_bytes(size));

    let pb = make_progress_bar(0, "upload");
    let mut task = UploadTask::new(source, size, dest.clone()).with_progress(progress_sink(&pb));
    let cancel = cancel_on_ctrl_c();

    let outcome = match uploader.upload_asset(&mut task, &cancel).await {
        Err(UploadError::AbortOnPartMismatch { part }) => {
            pb.set_message(format!("part {part} changed, restarting"));
            warn!(part, "file changed since the interrupted upload; restarting with fresh keys");
            task.source.reset().await?;
            uploader.upload_asset(&mut task, &cancel).await
        }
        other => other,
    };
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(UploadError::Cancelled) => {
            pb.abandon_with_message("cancelled");
            anyhow::bail!("upload cancelled; run the same command again to resume");
        }
        Err(e) => {
            pb.abandon_with_message("failed");
            return Err(e).with_context(|| format!("uploading {}", local.display()));
        }
    };
    pb.finish_with_message("done");

    let descriptor_path = descriptor_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_descriptor_path(local));
    write_descriptor(&descriptor_path, &outcome.descriptor).await?;

    let d = &outcome.descriptor;
    println!("  object:     {}", d.dest);
    println!("  sealed:     {}", fmt_bytes(d.sealed_size));
    println!("  hash:       {}", &d.content_hash[..16.min(d.content_hash.len())]);
    println!(
        "  parts:      {} uploaded, {} reused{}",
        outcome.parts_uploaded,
        outcome.parts_reused,
        if outcome.resumed { " (resumed)" } else { "" }
    );
    println!("  descriptor: {}", descriptor_path.display());
    Ok(())
}

// ── `attache download` / `attache cat` ───────────────────────────────────────

async fn open_reader(config: &AttacheConfig, descriptor: &Path) -> Result<RandomAccessReader> {
    let descriptor = read_descriptor(descriptor).await?;
    let store = open_store(config, &descriptor.dest.bucket)?;
    Ok(RandomAccessReader::from_descriptor(store, &descriptor))
}

async fn cmd_download(config: &AttacheConfig, descriptor: &Path, output: &Path) -> Result<()> {
    let mut reader = open_reader(config, descriptor).await?;
    let total = reader.len();
    println!("Downloading {} ({}) → {}", descriptor.display(), fmt_bytes(total), output.display());

    let pb = make_progress_bar(total, "download");
    let tmp = output.with_extension("part");
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("creating {}", tmp.display()))?;

    let cancel = cancel_on_ctrl_c();
    let mut buf = vec![0u8; attache_crypto::CHUNK_LEN];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => {
                pb.abandon_with_message("cancelled");
                anyhow::bail!("download cancelled");
            }
            n = reader.read(&mut buf) => n.context("reading object")?,
        };
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        pb.inc(n as u64);
    }
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, output)
        .await
        .with_context(|| format!("renaming into place: {}", output.display()))?;

    pb.finish_with_message("done");
    info!(bytes = total, output = %output.display(), "download complete");
    Ok(())
}

async fn cmd_cat(config: &AttacheConfig, descriptor: &Path, offset: u64, len: Option<u64>) -> Result<()> {
    let mut reader = open_reader(config, descriptor).await?;
    reader.seek(SeekFrom::Start(offset))?;
    let mut remaining = len.unwrap_or(u64::MAX);

    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want]).await.context("reading object")?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    stdout.flush().await?;
    Ok(())
}

// ── `attache stash` ──────────────────────────────────────────────────────────

/// Split a stash entry name (`{hash}:{bucket}/{key}`) back into a key.
fn parse_stash_entry(entry: &str) -> Result<StashKey> {
    let (hash, dest) = entry
        .split_once(':')
        .with_context(|| format!("malformed stash entry: {entry}"))?;
    Ok(StashKey::new(hash, Destination::parse(dest)?))
}

async fn cmd_stash_list(stash_path: &Path) -> Result<()> {
    let stash = open_stash(stash_path)
        .with_context(|| format!("opening stash: {}", stash_path.display()))?;
    let mut entries = stash.list().await?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    println!("Stash: {}", stash_path.display());
    if entries.is_empty() {
        println!("  no interrupted uploads");
        return Ok(());
    }
    for (name, info) in entries {
        println!("  {name}");
        println!("    parts recorded: {}", info.parts.len());
        println!("    started at:     {}", info.started_at);
    }
    Ok(())
}

async fn cmd_stash_clear(config: &AttacheConfig, stash_path: &Path, entry: Option<&str>) -> Result<()> {
    let stash = open_stash(stash_path)
        .with_context(|| format!("opening stash: {}", stash_path.display()))?;
    let keys = match entry {
        Some(entry) => vec![parse_stash_entry(entry)?],
        None => stash
            .list()
            .await?
            .iter()
            .map(|(name, _)| parse_stash_entry(name))
            .collect::<Result<Vec<_>>>()?,
    };

    for key in &keys {
        let store = open_store(config, &key.dest.bucket)?;
        let uploader = build_uploader(config, stash.clone(), store)?;
        uploader
            .abort(&key.dest, &key.content_hash)
            .await
            .with_context(|| format!("clearing {key}"))?;
        println!("cleared {key}");
    }
    Ok(())
}

// ── `attache check` / `attache config show` ──────────────────────────────────

async fn cmd_check(config: &AttacheConfig, bucket: Option<&str>) -> Result<()> {
    let bucket = bucket.unwrap_or(&config.storage.bucket);
    let op = build_operator(config, bucket)?;
    attache_storage::check_health(&op).await?;
    println!("storage ok: {:?} bucket {}", config.storage.backend, bucket);
    Ok(())
}

fn cmd_config_show(config: &AttacheConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attache_crypto::{EncryptionContext, SignaturePrefix};

    #[test]
    fn stash_entry_roundtrips_through_display() {
        let key = StashKey::new("ab".repeat(32), Destination::new("attachments", "conv/a b.png"));
        let parsed = parse_stash_entry(&key.to_string()).unwrap();
        assert_eq!(parsed, key);
        assert!(parse_stash_entry("no-separator").is_err());
        assert!(parse_stash_entry("hash:bucket-only").is_err());
    }

    #[test]
    fn descriptor_path_sits_next_to_file() {
        assert_eq!(
            default_descriptor_path(Path::new("/tmp/photo.jpg")),
            PathBuf::from("/tmp/photo.jpg.attache.json")
        );
    }

    #[tokio::test]
    async fn descriptor_file_roundtrip_is_private() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("d.json");
        let ctx = EncryptionContext::generate();
        let descriptor = ObjectDescriptor {
            dest: Destination::new("attachments", "k"),
            plaintext_size: 10,
            sealed_size: 90,
            content_hash: "00".repeat(32),
            keys: ctx.decryption_keys(),
            signature_prefix: SignaturePrefix::new("attache-test").unwrap(),
        };
        write_descriptor(&path, &descriptor).await.unwrap();
        let back = read_descriptor(&path).await.unwrap();
        assert_eq!(back.dest, descriptor.dest);
        assert_eq!(back.sealed_size, 90);
        assert_eq!(back.keys.nonce(), ctx.nonce());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn fmt_bytes_units() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(2048), "2.0 KB");
        assert_eq!(fmt_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
