use burrow_core::UserId;
use clap::{Parser, Subcommand};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

pub const DATABASE_DSN_ENV: &str = "BURROW_DATABASE_DSN";
pub const LOG_FILE_ENV: &str = "BURROW_LOG_FILE";
pub const DELETE_LANES_ENV: &str = "BURROW_DELETE_LANES";

/// Which backend the configuration selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Postgres(String),
    Log(PathBuf),
    InMemory,
}

impl Display for Backend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Postgres(_) => write!(f, "postgres"),
            Backend::Log(path) => write!(f, "log ({})", path.display()),
            Backend::InMemory => write!(f, "in-memory"),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "burrow-admin", about = "Inspect and modify a Burrow link store")]
pub struct CLI {
    /// PostgreSQL connection string; takes precedence over --log-file.
    #[arg(long, env = DATABASE_DSN_ENV)]
    pub database_dsn: Option<String>,

    /// Append-only log file, used when no DSN is configured.
    #[arg(long, env = LOG_FILE_ENV)]
    pub log_file: Option<PathBuf>,

    /// Batch-delete worker lanes (defaults to the number of CPUs).
    #[arg(long, env = DELETE_LANES_ENV)]
    pub lanes: Option<usize>,

    /// Skip fsync after each log append.
    #[arg(long)]
    pub no_fsync: bool,

    /// Emit diagnostics as JSON.
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl CLI {
    /// DSN first, then log file, then in-memory.
    pub fn backend(&self) -> Backend {
        match (&self.database_dsn, &self.log_file) {
            (Some(dsn), _) => Backend::Postgres(dsn.clone()),
            (None, Some(path)) => Backend::Log(path.clone()),
            (None, None) => Backend::InMemory,
        }
    }

    pub fn lanes(&self) -> usize {
        self.lanes.unwrap_or_else(num_cpus::get).max(1)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a user; the ID is assigned when omitted.
    UserCreate {
        #[arg(long)]
        id: Option<UserId>,
    },
    /// Show a user.
    UserGet { id: UserId },
    /// Create a short URL.
    UrlCreate {
        id: String,
        original_url: String,
        user_id: UserId,
    },
    /// Show a short URL by its ID.
    UrlGet { id: String },
    /// Show the short URL pointing at an original URL.
    UrlFind { original_url: String },
    /// List a user's short URLs.
    UrlList { user_id: UserId },
    /// Soft-delete short URLs owned by a user.
    UrlDelete {
        owner_id: UserId,
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Print user and short URL counts.
    Stats,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CLI {
        CLI::try_parse_from(std::iter::once("burrow-admin").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn dsn_wins_over_log_file() {
        let cli = parse(&["--database-dsn", "postgres://db", "--log-file", "a.log", "stats"]);
        assert_eq!(cli.backend(), Backend::Postgres("postgres://db".to_string()));
    }

    #[test]
    fn log_file_without_dsn() {
        let cli = parse(&["--log-file", "a.log", "stats"]);
        assert_eq!(cli.backend(), Backend::Log(PathBuf::from("a.log")));
    }

    #[test]
    fn defaults_to_in_memory() {
        let cli = parse(&["stats"]);
        assert_eq!(cli.backend(), Backend::InMemory);
        assert!(cli.lanes() >= 1);
    }

    #[test]
    fn delete_requires_ids() {
        assert!(CLI::try_parse_from(["burrow-admin", "url-delete", "1"]).is_err());

        let cli = parse(&["--lanes", "0", "url-delete", "1", "a", "b"]);
        assert_eq!(cli.lanes(), 1);
        match cli.command {
            Command::UrlDelete { owner_id, ids } => {
                assert_eq!(owner_id, 1);
                assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
