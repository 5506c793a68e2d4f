use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use thread_cache::{Anchor, Direction};

#[derive(Parser, Debug)]
#[command(name = "thread-cache")]
#[command(about = "Inspect and drive the shared thread cache")]
pub struct Cli {
    /// Redis connection URL; the in-memory backend is used when unset
    #[arg(long, env = "REDIS_URL", global = true)]
    pub redis_url: Option<String>,

    /// Process id used for lock ownership and event sender tagging
    #[arg(long, env = "THREAD_CACHE_PROCESS_ID", global = true)]
    pub process_id: Option<String>,

    /// Tracing filter directive
    #[arg(
        long,
        env = "RUST_LOG",
        default_value = "info,thread_cache=debug",
        global = true
    )]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replace a thread's cached log with entries from a JSON file
    Seed {
        thread: String,

        /// JSON array of log entries
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Generate this many synthetic entries instead of reading a file
        #[arg(long, conflicts_with = "file")]
        synthetic: Option<usize>,

        /// Resync even if the store already holds entries
        #[arg(long)]
        force: bool,
    },

    /// Print the initial viewport of a thread
    Viewport {
        thread: String,

        #[arg(long, value_enum, default_value_t = AnchorArg::Bottom)]
        anchor: AnchorArg,
    },

    /// Fetch the batch adjacent to a cursor
    LoadMore {
        thread: String,

        #[arg(long, value_enum, default_value_t = DirectionArg::Up)]
        direction: DirectionArg,

        /// Entry id to page from
        #[arg(long)]
        cursor: String,
    },

    /// Expand a window from a timestamp with exact has-more flags
    Expand {
        thread: String,

        #[arg(long)]
        anchor_ts: i64,

        #[arg(long, value_enum, default_value_t = DirectionArg::Up)]
        direction: DirectionArg,
    },

    /// Try to take (or release) a named lock
    Lock {
        resource: String,

        #[arg(long)]
        ttl_ms: Option<u64>,

        #[arg(long)]
        release: bool,
    },

    /// Record a heartbeat and list active members
    Presence {
        thread: String,

        #[arg(long)]
        member: Option<String>,

        /// Remove the member instead of refreshing it
        #[arg(long, requires = "member")]
        leave: bool,
    },

    /// Print events published for a thread until interrupted
    Watch {
        thread: String,

        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Dump the process metrics in Prometheus text format
    Metrics,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum AnchorArg {
    Top,
    Bottom,
}

impl From<AnchorArg> for Anchor {
    fn from(value: AnchorArg) -> Self {
        match value {
            AnchorArg::Top => Anchor::Top,
            AnchorArg::Bottom => Anchor::Bottom,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum DirectionArg {
    Up,
    Down,
}

impl From<DirectionArg> for Direction {
    fn from(value: DirectionArg) -> Self {
        match value {
            DirectionArg::Up => Direction::Up,
            DirectionArg::Down => Direction::Down,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_load_more() {
        let cli = Cli::try_parse_from([
            "thread-cache",
            "load-more",
            "t1",
            "--direction",
            "down",
            "--cursor",
            "msg_10",
        ])
        .unwrap();
        match cli.command {
            Commands::LoadMore {
                thread,
                direction,
                cursor,
            } => {
                assert_eq!(thread, "t1");
                assert_eq!(direction, DirectionArg::Down);
                assert_eq!(cursor, "msg_10");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn leave_requires_member() {
        assert!(Cli::try_parse_from(["thread-cache", "presence", "t1", "--leave"]).is_err());
    }
}
