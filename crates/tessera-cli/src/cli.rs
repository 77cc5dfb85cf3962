use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "tessera",
    about = "Tessera -- transactional object store with a coherent two-tier cache",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file
    #[arg(short, long, global = true, default_value = "tessera.toml")]
    pub config: PathBuf,

    /// Override `storage.dsn` from the configuration file
    #[arg(long, global = true)]
    pub dsn: Option<String>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Write a default configuration file and create the schema
    Init(InitArgs),
    /// Show object counts, the current TID and cache statistics
    Stats,
    /// Show one record
    Get(GetArgs),
    /// List the children of a container
    Ls(LsArgs),
    /// Create or update a child record
    Put(PutArgs),
    /// Move a record to the trash
    Rm(RmArgs),
    /// Physically remove every trashed record
    Vacuum,
    /// Read and write chunked binary objects
    Blob(BlobArgs),
    /// Print the effective configuration
    Config,
}

#[derive(Args)]
pub struct InitArgs {
    /// Overwrite an existing configuration file
    #[arg(long)]
    pub force: bool,

    /// Identifier of the database (prefixes cache keys)
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Args)]
pub struct GetArgs {
    pub oid: String,

    /// Print the opaque state as UTF-8 (lossy)
    #[arg(long)]
    pub state: bool,
}

#[derive(Args)]
pub struct LsArgs {
    pub parent: String,

    /// 1-based page of child names, ordered by OID
    #[arg(long)]
    pub page: Option<u32>,

    #[arg(long, default_value_t = 50)]
    pub page_size: u32,
}

#[derive(Args)]
pub struct PutArgs {
    /// Container OID; omit to write a root record
    #[arg(long)]
    pub parent: Option<String>,

    /// Name under the parent
    pub id: String,

    /// OID to write; a fresh one is generated for new records
    #[arg(long)]
    pub oid: Option<String>,

    #[arg(long = "type", default_value = "Item")]
    pub type_name: String,

    /// State given inline
    #[arg(long, conflicts_with = "file")]
    pub state: Option<String>,

    /// State read from a file
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// JSON projection stored next to the state
    #[arg(long)]
    pub json: Option<String>,
}

#[derive(Args)]
pub struct RmArgs {
    pub oids: Vec<String>,
}

#[derive(Args)]
pub struct BlobArgs {
    #[command(subcommand)]
    pub action: BlobAction,
}

#[derive(Subcommand)]
pub enum BlobAction {
    /// Store a file as a chunked blob owned by OID
    Put {
        blob_id: String,
        oid: String,
        file: PathBuf,
        #[arg(long, default_value_t = 1024 * 1024)]
        chunk_size: usize,
    },
    /// Reassemble a blob
    Get {
        blob_id: String,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Delete every chunk of a blob
    Rm { blob_id: String },
}
