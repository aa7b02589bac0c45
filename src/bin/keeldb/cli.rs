use clap::{Parser, Subcommand};
use std::path::PathBuf;

use KeelDB::cluster::RachisState;
use KeelDB::StorageType;

/// CLI для KeelDB: окружение хранилища, журнал, схема и топология кластера
#[derive(Parser, Debug)]
#[command(name = "keeldb", version, about = "KeelDB storage and cluster tooling")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Create a new storage environment
    Init {
        #[arg(long)]
        path: PathBuf,
        /// documents | index | configuration | server
        #[arg(long, default_value = "documents")]
        storage: StorageType,
        #[arg(long, default_value_t = 8192)]
        page_size: u32,
        /// Encrypt pages and journal (key from KEEL_MASTER_KEY_HEX / KEEL_MASTER_KEY_BASE64)
        #[arg(long, default_value_t = false)]
        encrypted: bool,
    },
    /// Meta, environment header, schema version and metrics
    Status {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Dry-run replay of the journal (nothing is applied or truncated)
    VerifyJournal {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Flush journaled pages into the data file and truncate the journal
    Checkpoint {
        #[arg(long)]
        path: PathBuf,
    },
    /// Run the schema upgrade chain up to the current version
    Upgrade {
        #[arg(long)]
        path: PathBuf,
    },
    /// Offline export of every verifiable page run (ignores schema version)
    Recover {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Which node owns a task according to a database record
    WhoseTask {
        /// Database record JSON
        #[arg(long)]
        record: PathBuf,
        #[arg(long)]
        key: String,
        #[arg(long)]
        mentor: Option<String>,
        /// passive | candidate | member | leader
        #[arg(long, default_value = "member")]
        state: RachisState,
        /// Resolve within this shard's topology (sharded records)
        #[arg(long)]
        shard: Option<u32>,
    },
    /// Replication destinations of a node
    Destinations {
        #[arg(long)]
        record: PathBuf,
        #[arg(long)]
        node: String,
        #[arg(long, default_value = "member")]
        state: RachisState,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Bucket of a document id (and its shard, with --record)
    Bucket {
        #[arg(long)]
        id: String,
        #[arg(long)]
        record: Option<PathBuf>,
    },
    /// Generate a random 256-bit master key
    Keygen {
        #[arg(long, default_value = "default")]
        kid: String,
    },
}
