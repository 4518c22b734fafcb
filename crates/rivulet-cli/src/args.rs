use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rivulet_core::{IdSpec, StreamId};

#[derive(Parser)]
#[command(
    name = "rivulet",
    about = "Inspect and script a Rivulet data directory",
    version
)]
pub struct Cli {
    /// Journal directory [default: ./rivulet-data]
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Broker configuration file (TOML); --data-dir takes precedence
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Append an entry and print its id
    Append {
        stream: String,
        /// Field pairs as name=value
        #[arg(required = true)]
        fields: Vec<String>,
        /// Entry id: `*`, `<ms>-*` or `<ms>-<seq>`
        #[arg(long, default_value = "*")]
        id: IdSpec,
    },

    /// Entries between two ids, oldest first
    Range {
        stream: String,
        /// Start bound: `-`, `<ms>`, `<ms>-<seq>`, or `(` for exclusive
        #[arg(default_value = "-", allow_hyphen_values = true)]
        start: String,
        /// End bound: `+`, `<ms>`, `<ms>-<seq>`, or `(` for exclusive
        #[arg(default_value = "+", allow_hyphen_values = true)]
        end: String,
        #[arg(long)]
        count: Option<usize>,
    },

    /// Entries between two ids, newest first
    RevRange {
        stream: String,
        #[arg(default_value = "+", allow_hyphen_values = true)]
        end: String,
        #[arg(default_value = "-", allow_hyphen_values = true)]
        start: String,
        #[arg(long)]
        count: Option<usize>,
    },

    /// Stream metadata with its groups
    Info { stream: String },

    /// Create a consumer group
    CreateGroup {
        stream: String,
        group: String,
        /// `$` for new entries only, `0` for everything, or an id
        #[arg(default_value = "$")]
        start: String,
        /// Create the stream if it does not exist
        #[arg(long)]
        mkstream: bool,
    },

    /// Read new entries for a consumer
    Read {
        stream: String,
        group: String,
        consumer: String,
        #[arg(long)]
        count: Option<usize>,
        /// Wait this long for entries when none are available
        #[arg(long)]
        block_ms: Option<u64>,
    },

    /// Pending summary, or the pending records with --detail
    Pending {
        stream: String,
        group: String,
        #[arg(long)]
        detail: bool,
        #[arg(long, default_value = "-", allow_hyphen_values = true)]
        start: String,
        #[arg(long, default_value = "+", allow_hyphen_values = true)]
        end: String,
        #[arg(long)]
        count: Option<usize>,
        #[arg(long)]
        consumer: Option<String>,
        #[arg(long)]
        min_idle_ms: Option<u64>,
    },

    /// Take over specific pending entries
    Claim {
        stream: String,
        group: String,
        consumer: String,
        min_idle_ms: u64,
        #[arg(required = true)]
        ids: Vec<StreamId>,
    },

    /// Take over idle pending entries from a cursor
    AutoClaim {
        stream: String,
        group: String,
        consumer: String,
        min_idle_ms: u64,
        #[arg(default_value = "0-0")]
        cursor: StreamId,
        #[arg(long, default_value_t = 100)]
        count: usize,
    },

    /// Acknowledge entries
    Ack {
        stream: String,
        group: String,
        #[arg(required = true)]
        ids: Vec<StreamId>,
    },

    /// Remove the oldest entries
    Trim {
        stream: String,
        /// Keep at most this many entries
        #[arg(long, conflicts_with = "minid", required_unless_present = "minid")]
        maxlen: Option<usize>,
        /// Remove entries below this id
        #[arg(long)]
        minid: Option<StreamId>,
    },

    /// Rewrite the journal to its shortest form
    Compact,
}
