//! snapdump — dump snapshot images and apply diff streams to local files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use snapdump_core::config::SnapdumpConfig;
use snapdump_core::FeatureSet;
use snapdump_engine::{
    apply_diff_to_path, clean_up, export_to_path, format_size, CleanupPolicy, ConsoleProgress,
    DumpOptions, FileImageSource, NoProgress, ProgressSink, Shutdown, ThrottleSettings,
    TransferError,
};

// ── Subcommand handlers ───────────────────────────────────────────────────────

async fn run_export<P: ProgressSink + 'static>(
    source: FileImageSource,
    dest: &Path,
    progress: P,
    options: DumpOptions,
    cleanup: CleanupPolicy,
    shutdown: Shutdown,
) -> Result<()> {
    let report = export_to_path(source, dest, progress, options, cleanup, shutdown)
        .await
        .with_context(|| format!("dump to {} failed", dest.display()))?;

    let secs = report.elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "Dumped {} in {} chunks, {:.1}s ({}/s)",
        format_size(report.bytes),
        report.chunks,
        secs,
        format_size((report.bytes as f64 / secs) as u64),
    );
    println!("blake3 {}", report.digest);
    Ok(())
}

async fn cmd_dump(
    config: &SnapdumpConfig,
    flags: &Flags,
    source: &str,
    dest: &str,
    shutdown: Shutdown,
) -> Result<()> {
    let mut options = DumpOptions::from_config(config);
    if let Some(size) = flags.chunk_size {
        options.chunk_size = Some(size);
    }
    if flags.sequential {
        options.pipelined = false;
    }
    match flags.limit {
        Some(0) => options.throttle = None,
        Some(rate) => {
            let backoff = options
                .throttle
                .map(|t| t.backoff)
                .unwrap_or(Duration::from_millis(config.throttle.backoff_ms));
            options.throttle = Some(ThrottleSettings {
                backoff,
                ..ThrottleSettings::new(rate as f64)
            });
        }
        None => {}
    }

    let cleanup = if flags.keep_partial {
        CleanupPolicy::Keep
    } else {
        CleanupPolicy::from_config(&config.output)
    };

    let image = FileImageSource::open(source).with_context(|| format!("cannot open {source}"))?;
    let dest = Path::new(dest);
    if config.output.progress {
        run_export(image, dest, ConsoleProgress::stdout(), options, cleanup, shutdown).await
    } else {
        run_export(image, dest, NoProgress, options, cleanup, shutdown).await
    }
}

/// How long an interrupted apply gets to stop on its own before the
/// process gives up on it. A read blocked on a pipe never polls the signal.
const APPLY_GRACE: Duration = Duration::from_secs(2);

async fn cmd_apply_diff(
    config: &SnapdumpConfig,
    flags: &Flags,
    diff: &str,
    dest: &str,
    mut shutdown: Shutdown,
) -> Result<()> {
    let cleanup = if flags.keep_partial {
        CleanupPolicy::Keep
    } else {
        CleanupPolicy::from_config(&config.output)
    };
    let (diff, dest) = (PathBuf::from(diff), PathBuf::from(dest));
    let created = !dest.exists();
    let mut apply_shutdown = shutdown.resubscribe();

    // The apply loop is plain blocking I/O.
    let mut apply = {
        let (diff, dest) = (diff.clone(), dest.clone());
        tokio::task::spawn_blocking(move || {
            apply_diff_to_path(&diff, &dest, cleanup, &mut apply_shutdown)
        })
    };

    let result = tokio::select! {
        joined = &mut apply => joined?,
        _ = shutdown.wait() => match tokio::time::timeout(APPLY_GRACE, &mut apply).await {
            Ok(joined) => joined?,
            Err(_) => {
                tracing::warn!("diff apply did not stop, abandoning it");
                if created {
                    clean_up(&dest, cleanup, &TransferError::Cancelled);
                }
                eprintln!("applying {} to {} interrupted", diff.display(), dest.display());
                std::process::exit(130);
            }
        },
    };
    let summary = result
        .with_context(|| format!("applying {} to {} failed", diff.display(), dest.display()))?;

    println!(
        "{} bytes written, {} total",
        summary.bytes_changed,
        summary.image_size.unwrap_or(0)
    );
    Ok(())
}

fn cmd_features(bits: &str) -> Result<()> {
    let bits = match bits.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => bits.parse(),
    }
    .context("feature mask must be a number")?;

    let features = FeatureSet::from_bits(bits);
    for (name, enabled) in features.to_map() {
        println!("  {:<16} {}", name, if enabled { "on" } else { "off" });
    }
    if features.unknown_bits() != 0 {
        println!("  unknown bits     {:#x}", features.unknown_bits());
    }
    Ok(())
}

fn print_usage() {
    println!("Usage: snapdump [options] <command>");
    println!();
    println!("Commands:");
    println!("  dump <image> <dest>         Copy a whole image to a local file");
    println!("  apply-diff <diff> <dest>    Apply an rbd diff v1 stream onto a local file");
    println!("  features <mask>             Show which image features a bitmask enables");
    println!();
    println!("Options:");
    println!("  --chunk-size <bytes>   Read size (default: object size x stripe count)");
    println!("  --limit <bytes/sec>    Throttle reads; 0 = unlimited");
    println!("  --sequential           Read and write on one thread");
    println!("  --keep-partial         Keep output of a failed transfer");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Flags {
    chunk_size: Option<u64>,
    limit: Option<u64>,
    sequential: bool,
    keep_partial: bool,
}

fn parse_number(args: &[String], i: usize, flag: &str) -> Result<u64> {
    args.get(i)
        .with_context(|| format!("{flag} requires a value"))?
        .parse()
        .with_context(|| format!("{flag} must be a number"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = SnapdumpConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = SnapdumpConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SnapdumpConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut flags = Flags::default();
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--chunk-size" => {
                i += 1;
                flags.chunk_size = Some(parse_number(&args, i, "--chunk-size")?);
            }
            "--limit" => {
                i += 1;
                flags.limit = Some(parse_number(&args, i, "--limit")?);
            }
            "--sequential" => flags.sequential = true,
            "--keep-partial" => flags.keep_partial = true,
            other => remaining.push(other),
        }
        i += 1;
    }

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("interrupt received, stopping transfer");
        let _ = shutdown_tx.send(());
    });
    let shutdown = Shutdown::new(shutdown_rx);

    match remaining.as_slice() {
        ["dump", source, dest] => cmd_dump(&config, &flags, source, dest, shutdown).await,
        ["apply-diff", diff, dest] => cmd_apply_diff(&config, &flags, diff, dest, shutdown).await,
        ["features", bits] => cmd_features(bits),
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
