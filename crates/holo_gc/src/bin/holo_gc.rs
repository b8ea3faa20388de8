//! Operator tool for running GC commands against a local range.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_gc::engine::Reader;
use holo_gc::{
    BatchHeader, FjallEngine, GcKey, GcRequest, RangeDescriptor, RangeId, Replica, Timestamp,
};

#[derive(Parser, Debug)]
#[command(name = "holo-gc")]
#[command(about = "Run MVCC garbage collection against a local HoloStore range", long_about = None)]
struct Args {
    /// Directory holding the range's fjall keyspace.
    #[arg(long, env = "HOLO_GC_DATA_DIR")]
    data_dir: PathBuf,
    #[arg(long, env = "HOLO_GC_RANGE_ID", default_value_t = 1)]
    range_id: u64,
    /// Inclusive start key of the range (UTF-8).
    #[arg(long, env = "HOLO_GC_START_KEY", default_value = "")]
    start_key: String,
    /// Exclusive end key of the range (UTF-8); empty means unbounded.
    #[arg(long, env = "HOLO_GC_END_KEY", default_value = "")]
    end_key: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a value at a timestamp (`wall` or `wall,logical`).
    Put {
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
        #[arg(long)]
        ts: Timestamp,
    },
    /// Write a deletion tombstone at a timestamp.
    Delete {
        #[arg(long)]
        key: String,
        #[arg(long)]
        ts: Timestamp,
    },
    /// Collect versions of keys, each given as `key@timestamp`.
    Gc {
        #[arg(long = "key", required = true)]
        keys: Vec<String>,
        #[arg(long)]
        batch_ts: Timestamp,
    },
    /// Advance the range's GC threshold.
    Threshold {
        #[arg(long)]
        ts: Timestamp,
        /// Batch timestamp of the request; defaults to the threshold itself.
        #[arg(long)]
        batch_ts: Option<Timestamp>,
    },
    /// Print the GC threshold and, optionally, the versions of one key.
    Show {
        #[arg(long)]
        key: Option<String>,
    },
}

fn parse_gc_key(raw: &str) -> anyhow::Result<GcKey> {
    let (key, ts) = raw
        .rsplit_once('@')
        .with_context(|| format!("gc key {raw:?} must look like key@timestamp"))?;
    Ok(GcKey::new(key, ts.parse::<Timestamp>()?))
}

fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("create data dir {}", args.data_dir.display()))?;
    let engine = Arc::new(FjallEngine::open(&args.data_dir)?);
    let desc = RangeDescriptor::new(
        RangeId(args.range_id),
        args.start_key.into_bytes(),
        args.end_key.into_bytes(),
    );
    let replica = Replica::load(desc, engine.clone())?;

    match args.command {
        Command::Put { key, value, ts } => {
            anyhow::ensure!(!value.is_empty(), "use `delete` to write a tombstone");
            replica.write(key.as_bytes(), ts, value.as_bytes())?;
            engine.persist()?;
        }
        Command::Delete { key, ts } => {
            replica.write(key.as_bytes(), ts, &[])?;
            engine.persist()?;
        }
        Command::Gc { keys, batch_ts } => {
            let keys = keys
                .iter()
                .map(|raw| parse_gc_key(raw))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let res = replica.execute_gc(BatchHeader::at(batch_ts), &GcRequest::collect_keys(keys))?;
            engine.persist()?;
            println!(
                "collected keys={} versions={} bytes={}",
                res.gc.keys, res.gc.versions, res.gc.bytes
            );
        }
        Command::Threshold { ts, batch_ts } => {
            let header = BatchHeader::at(batch_ts.unwrap_or(ts));
            let res = replica.execute_gc(header, &GcRequest::advance_threshold(ts))?;
            engine.persist()?;
            match res.new_gc_threshold() {
                Some(updated) => println!("gc threshold advanced to {updated}"),
                None => println!(
                    "gc threshold unchanged at {}",
                    replica.gc_threshold()?
                ),
            }
        }
        Command::Show { key } => {
            println!("range {} gc threshold {}", RangeId(args.range_id), replica.gc_threshold()?);
            if let Some(key) = key {
                for version in engine.mvcc_versions(key.as_bytes())? {
                    if version.is_tombstone() {
                        println!("{key}@{} <tombstone>", version.timestamp);
                    } else {
                        println!(
                            "{key}@{} {}",
                            version.timestamp,
                            String::from_utf8_lossy(&version.value)
                        );
                    }
                }
            }
        }
    }
    Ok(())
}
