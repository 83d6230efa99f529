//! netpool
//!
//! Command-line front end for the network resource pool allocator. Each run
//! locks the state snapshot, loads it, performs one operation and writes the
//! snapshot back when the operation can change anything, failed or not.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use netpool::{
    Error, LeaseRequest, NetpoolConfig, PoolKind, PoolScope, PoolService, ReleaseKey,
    ReleaseOutcome, Result, ScopeId, SnapshotFile,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// netpool - VLAN, VXLAN, IP and MAC pool allocator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML, or JSON by extension)
    #[arg(long, env = "NETPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// State snapshot file
    #[arg(long, env = "NETPOOL_STATE", default_value = "netpool-state.json")]
    state: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print Prometheus metrics after the command
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

/// Pool selector shared by most subcommands
#[derive(clap::Args, Debug, Clone, Copy)]
struct PoolArgs {
    /// Pool kind (vnet-segment, pod-vlan, private-ip, link-local-ip)
    #[arg(long, value_parser = parse_kind)]
    kind: PoolKind,

    /// Zone id for segment pools, pod id for the rest
    #[arg(long)]
    scope: u64,
}

impl PoolArgs {
    fn pool_scope(&self) -> PoolScope {
        PoolScope::new(self.kind, self.scope)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision a range of values into a pool
    AddRange {
        #[command(flatten)]
        pool: PoolArgs,
        /// First value (segment id or IPv4 address)
        #[arg(long)]
        start: String,
        /// Last value; exclusive for segment kinds, inclusive for IP kinds
        #[arg(long)]
        end: String,
    },

    /// Remove every entry of a pool
    DeleteRange {
        #[command(flatten)]
        pool: PoolArgs,
        /// Delete even while entries are leased
        #[arg(long)]
        force: bool,
    },

    /// Lease one free entry
    Take {
        #[command(flatten)]
        pool: PoolArgs,
        /// Account id (segments) or instance id (IPs)
        #[arg(long)]
        owner: u64,
        /// Idempotency token for retried leases
        #[arg(long)]
        reservation: Option<String>,
        /// Fail on the first contention instead of backing off
        #[arg(long)]
        no_retry: bool,
    },

    /// Return leased entries to the pool
    Release {
        #[command(flatten)]
        pool: PoolArgs,
        /// Value to release
        #[arg(long)]
        value: Option<String>,
        /// Owner to release (alone: everything the owner holds)
        #[arg(long)]
        owner: Option<u64>,
        /// Reservation to release
        #[arg(long)]
        reservation: Option<String>,
    },

    /// List entries of a pool
    List {
        #[command(flatten)]
        pool: PoolArgs,
        /// List free entries instead of leased ones
        #[arg(long)]
        free: bool,
    },

    /// Show pool occupancy, for every pool when no pool is given
    Usage {
        #[arg(long, value_parser = parse_kind, requires = "scope")]
        kind: Option<PoolKind>,
        #[arg(long, requires = "kind")]
        scope: Option<u64>,
    },

    /// Generate MAC address pairs
    MacPair {
        /// Zone id embedded in the address
        #[arg(long)]
        zone: u64,
        /// Bits OR-ed into every address (hex accepted with 0x)
        #[arg(long, value_parser = parse_mask, default_value = "0")]
        mask: u64,
        /// Number of pairs
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
}

impl Command {
    fn mutates(&self) -> bool {
        !matches!(self, Command::List { .. } | Command::Usage { .. })
    }
}

fn parse_kind(raw: &str) -> std::result::Result<PoolKind, String> {
    raw.parse::<PoolKind>().map_err(|e| e.to_string())
}

fn parse_mask(raw: &str) -> std::result::Result<u64, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|e| format!("invalid mask '{}': {}", raw, e))
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    debug!("netpool {}", netpool::VERSION);

    let config = match &args.config {
        Some(path) => NetpoolConfig::from_file(path)?,
        None => NetpoolConfig::default(),
    };

    let state = SnapshotFile::new(args.state.clone());
    let (service, ()) =
        PoolService::run_with_state(config, &state, args.command.mutates(), |service| {
            run(service, &args.command)
        })
        .await?;

    if args.print_metrics {
        print!("{}", service.metrics().encode_text()?);
    }

    Ok(())
}

fn run(service: &PoolService, command: &Command) -> Result<()> {
    match command {
        Command::AddRange { pool, start, end } => {
            let inserted = service.add_range(pool.kind, ScopeId(pool.scope), start, end)?;
            println!("added {} entries to {}", inserted, pool.pool_scope());
        }

        Command::DeleteRange { pool, force } => {
            let removed = if *force {
                service.force_delete_range(pool.kind, ScopeId(pool.scope))?
            } else {
                service.delete_range(pool.kind, ScopeId(pool.scope))?
            };
            println!("deleted {} entries from {}", removed, pool.pool_scope());
        }

        Command::Take {
            pool,
            owner,
            reservation,
            no_retry,
        } => {
            let mut request = LeaseRequest::new(*owner);
            if let Some(reservation) = reservation {
                request = request.with_reservation(reservation.clone());
            }
            let entry = if *no_retry {
                service.take(pool.pool_scope(), &request)?
            } else {
                service.take_with_backoff(pool.pool_scope(), &request)?
            };
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }

        Command::Release {
            pool,
            value,
            owner,
            reservation,
        } => {
            let key = release_key(value.clone(), *owner, reservation.clone())?;
            match service.release(pool.pool_scope(), &key)? {
                ReleaseOutcome::Released(entries) => {
                    for entry in entries {
                        println!("released {}", entry.value);
                    }
                }
                ReleaseOutcome::NotAllocated => println!("nothing allocated for {}", key),
            }
        }

        Command::List { pool, free } => {
            let entries = if *free {
                service.list_free(pool.pool_scope())
            } else {
                service.list_allocated(pool.pool_scope())
            };
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }

        Command::Usage { kind, scope } => {
            let scopes = match (kind, scope) {
                (Some(kind), Some(scope)) => vec![PoolScope::new(*kind, *scope)],
                _ => service.scopes(),
            };
            let usage: Vec<_> = scopes.into_iter().map(|s| service.usage(s)).collect();
            println!("{}", serde_json::to_string_pretty(&usage)?);
        }

        Command::MacPair { zone, mask, count } => {
            for _ in 0..*count {
                let pair = service.generate_mac_pair(ScopeId(*zone), *mask)?;
                println!("{}", pair);
            }
        }
    }
    Ok(())
}

fn release_key(
    value: Option<String>,
    owner_id: Option<u64>,
    reservation_id: Option<String>,
) -> Result<ReleaseKey> {
    match (value, owner_id, reservation_id) {
        (Some(value), owner_id, reservation_id) => Ok(ReleaseKey::Value {
            value,
            owner_id,
            reservation_id,
        }),
        (None, _, Some(reservation_id)) => Ok(ReleaseKey::Reservation { reservation_id }),
        (None, Some(owner_id), None) => Ok(ReleaseKey::Owner { owner_id }),
        (None, None, None) => Err(Error::Configuration(
            "release needs --value, --owner or --reservation".into(),
        )),
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    // Logs go to stderr so command output stays machine-readable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
