//! sogamo - command-line host for the sogamo tracker
//!
//! Each invocation restores the tracker for one project token from the
//! snapshot database, applies one command and saves the snapshot again.
//! Useful for scripting, for smoke-testing a collector endpoint and for
//! inspecting what a crashed host left behind.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Snapshots: $XDG_DATA_HOME/sogamo/sogamo.db (~/.local/share/sogamo/sogamo.db)
//! - Config: $XDG_CONFIG_HOME/sogamo/config.toml (~/.config/sogamo/config.toml)
//! - Logs: $XDG_STATE_HOME/sogamo/ (~/.local/state/sogamo/)

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use sogamo_core::{Config, Properties, QueueKind, SnapshotStore, Tracker};

#[derive(Parser)]
#[command(name = "sogamo")]
#[command(about = "Record and deliver analytics events from the command line")]
#[command(version)]
struct Args {
    /// Verbose output (writes a log file)
    #[arg(short, long)]
    verbose: bool,

    /// Project token
    #[arg(short, long, env = "SOGAMO_TOKEN", global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration and what is queued for the token
    Status,

    /// List tokens that have a saved snapshot
    Tokens,

    /// Queue an event
    Track {
        /// Event name
        event: String,

        /// Event property as key=value (value parsed as JSON when possible)
        #[arg(short, long = "prop", value_name = "KEY=VALUE")]
        props: Vec<String>,
    },

    /// Identify the user for events and profile ops
    Identify {
        distinct_id: String,
    },

    /// Link an alias to an existing distinct id
    Alias {
        alias: String,

        /// Distinct id to link to (default: the current one)
        #[arg(long)]
        distinct_id: Option<String>,
    },

    /// Queue a profile operation
    People {
        #[command(subcommand)]
        op: PeopleCommand,
    },

    /// Register super properties
    Register {
        /// Property as key=value
        #[arg(required = true, value_name = "KEY=VALUE")]
        props: Vec<String>,

        /// Keep existing values
        #[arg(long)]
        once: bool,

        /// With --once, values equal to this are still replaced
        #[arg(long, requires = "once")]
        default: Option<String>,
    },

    /// Remove a super property
    Unregister {
        key: String,
    },

    /// Deliver queued records now
    Flush {
        /// Give up after this many seconds, keeping the unsent batch
        #[arg(short, long)]
        budget: Option<u64>,
    },

    /// Forget the user and drop every undelivered record
    Reset,

    /// Delete the saved snapshot for the token
    Forget,
}

#[derive(Subcommand)]
enum PeopleCommand {
    /// Set profile properties
    Set {
        #[arg(required = true, value_name = "KEY=VALUE")]
        props: Vec<String>,
    },
    /// Set profile properties that have no value yet
    SetOnce {
        #[arg(required = true, value_name = "KEY=VALUE")]
        props: Vec<String>,
    },
    /// Add to numeric profile properties
    Increment {
        key: String,
        #[arg(default_value_t = 1.0)]
        by: f64,
    },
    /// Append a value to a list property
    Append {
        #[arg(required = true, value_name = "KEY=VALUE")]
        props: Vec<String>,
    },
    /// Merge values into a list property
    Union {
        key: String,
        #[arg(required = true)]
        values: Vec<String>,
    },
    /// Record a transaction
    Charge {
        amount: f64,
        #[arg(short, long = "prop", value_name = "KEY=VALUE")]
        props: Vec<String>,
    },
    /// Remove every recorded transaction
    ClearCharges,
    /// Delete the profile
    Delete,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Logging goes to a file; keep the guard alive until exit
    let _log_guard = if args.verbose {
        Some(sogamo_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    let db_path = Config::database_path();

    if let Command::Tokens = args.command {
        return cmd_tokens(&db_path);
    }

    let Some(token) = args.token else {
        bail!("no project token given (use --token or SOGAMO_TOKEN)");
    };

    if let Command::Forget = args.command {
        return cmd_forget(&db_path, &token);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    let store = SnapshotStore::open(&db_path).context("failed to open snapshot database")?;
    let tracker = Tracker::with_http(token, config.tracker.clone(), Some(store))
        .context("failed to create tracker")?;

    match args.command {
        Command::Status => {
            cmd_status(&config, &tracker);
            return Ok(());
        }
        Command::Tokens => return cmd_tokens(&db_path),
        Command::Forget => return cmd_forget(&db_path, tracker.token()),
        Command::Track { event, props } => {
            tracker.track_with_properties(&event, parse_props(&props)?);
            println!("Queued event '{}'", event);
        }
        Command::Identify { distinct_id } => {
            tracker.identify(&distinct_id);
            println!("Identified as {}", distinct_id);
        }
        Command::Alias { alias, distinct_id } => {
            let distinct_id = distinct_id.unwrap_or_else(|| tracker.distinct_id());
            tracker.create_alias(&alias, &distinct_id);
            println!("Queued alias {} -> {}", alias, distinct_id);
        }
        Command::People { op } => cmd_people(&tracker, op)?,
        Command::Register {
            props,
            once,
            default,
        } => {
            let props = parse_props(&props)?;
            let count = props.len();
            if once {
                tracker.register_super_properties_once(props, default.map(|d| parse_value(&d)));
            } else {
                tracker.register_super_properties(props);
            }
            println!("Registered {} super properties", count);
        }
        Command::Unregister { key } => {
            tracker.unregister_super_property(&key);
            println!("Unregistered {}", key);
        }
        Command::Flush { budget } => runtime.block_on(cmd_flush(&tracker, budget)),
        Command::Reset => {
            tracker.reset();
            println!("Tracker reset");
        }
    }

    tracker.archive().context("failed to save snapshot")?;
    Ok(())
}

fn cmd_tokens(db_path: &Path) -> Result<()> {
    if !db_path.exists() {
        println!("No snapshots saved yet");
        return Ok(());
    }
    let store = SnapshotStore::open(db_path).context("failed to open snapshot database")?;
    let tokens = store.tokens().context("failed to list tokens")?;
    if tokens.is_empty() {
        println!("No snapshots saved yet");
    }
    for token in tokens {
        println!("{}", token);
    }
    Ok(())
}

fn cmd_forget(db_path: &Path, token: &str) -> Result<()> {
    if !db_path.exists() {
        println!("No snapshot saved for {}", token);
        return Ok(());
    }
    let store = SnapshotStore::open(db_path).context("failed to open snapshot database")?;
    if store.delete(token).context("failed to delete snapshot")? {
        println!("Deleted snapshot for {}", token);
    } else {
        println!("No snapshot saved for {}", token);
    }
    Ok(())
}

fn cmd_status(config: &Config, tracker: &Tracker) {
    let settings = &config.tracker;

    println!("Sogamo Tracker Status");
    println!("=====================");
    println!();
    println!("Token:           {}", tracker.token());
    println!("Server URL:      {}", settings.base_url());
    println!("Flush Interval:  {}s", settings.flush_interval_secs);
    println!("Batch Size:      {}", settings.max_batch_size);
    println!("Queue Limit:     {}", settings.max_queue_length);
    println!("Snapshots:       {}", Config::database_path().display());
    println!(
        "Log File:        {}",
        sogamo_core::logging::log_file_path().display()
    );
    println!();
    println!("Distinct ID:     {}", tracker.distinct_id());
    println!(
        "People ID:       {}",
        tracker.people_distinct_id().as_deref().unwrap_or("<not set>")
    );

    let supers = tracker.current_super_properties();
    println!("Super Props:     {}", supers.len());
    for (key, value) in &supers {
        println!("  {} = {}", key, value);
    }

    println!();
    println!("Pending Events:  {}", tracker.pending_count(QueueKind::Events));
    println!("Pending Profile: {}", tracker.pending_count(QueueKind::People));
    println!("Withheld:        {}", tracker.withheld_count());
}

fn cmd_people(tracker: &Tracker, op: PeopleCommand) -> Result<()> {
    let people = tracker.people();
    let label = match op {
        PeopleCommand::Set { props } => {
            people.set(parse_props(&props)?);
            "set"
        }
        PeopleCommand::SetOnce { props } => {
            people.set_once(parse_props(&props)?);
            "set_once"
        }
        PeopleCommand::Increment { key, by } => {
            people.increment_by(&key, by);
            "increment"
        }
        PeopleCommand::Append { props } => {
            people.append(parse_props(&props)?);
            "append"
        }
        PeopleCommand::Union { key, values } => {
            let values: Vec<Value> = values.iter().map(String::as_str).map(parse_value).collect();
            let mut props = Properties::new();
            props.insert(key, Value::Array(values));
            people.union(props);
            "union"
        }
        PeopleCommand::Charge { amount, props } => {
            people.track_charge_with_properties(amount, parse_props(&props)?);
            "track_charge"
        }
        PeopleCommand::ClearCharges => {
            people.clear_charges();
            "clear_charges"
        }
        PeopleCommand::Delete => {
            people.delete_user();
            "delete_user"
        }
    };

    if tracker.people_distinct_id().is_none() {
        println!("Queued {} (withheld until identify)", label);
    } else {
        println!("Queued {}", label);
    }
    Ok(())
}

async fn cmd_flush(tracker: &Tracker, budget: Option<u64>) {
    let report = match budget {
        Some(secs) => match tracker.flush_with_budget(Duration::from_secs(secs)).await {
            Some(report) => report,
            None => {
                println!("Flush did not finish within {}s; unsent records kept", secs);
                return;
            }
        },
        None => tracker.flush().await,
    };

    if report.deferred {
        println!("Flush deferred");
        return;
    }

    println!("Flush complete:");
    println!("  Batches sent:     {}", report.batches_sent);
    println!("  Records sent:     {}", report.records_sent);
    println!("  Records dropped:  {}", report.records_dropped);
    println!("  Failed attempts:  {}", report.retryable_failures);
    println!(
        "  Still queued:     {}",
        tracker.pending_count(QueueKind::Events) + tracker.pending_count(QueueKind::People)
    );
}

/// Parse `key=value` pairs; values that are valid JSON keep their type
fn parse_props(pairs: &[String]) -> Result<Properties> {
    let mut props = Properties::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("expected KEY=VALUE, got '{}'", pair);
        };
        if key.is_empty() {
            bail!("empty property name in '{}'", pair);
        }
        props.insert(key.to_string(), parse_value(value));
    }
    Ok(props)
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
