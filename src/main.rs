use alveole::configuration::{BackendKind, StoreConfig};
use alveole::error_handling::SessionError;
use alveole::session_management::{FetchedItem, SessionStore, StoreData};
use alveole::storage::open_backend;
use clap::{Parser, Subcommand};
use log::{error, info};
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "alveole")]
#[command(version)]
#[command(about = "Session store with exclusive per-session locking")]
struct Args {
    /// TOML configuration file
    #[arg(long, short, env = "ALVEOLE_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `application_scope`
    #[arg(long, env = "ALVEOLE_SCOPE")]
    scope: Option<String>,

    /// Overrides `timeout_minutes`
    #[arg(long)]
    timeout_minutes: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an uninitialized session; a new id is generated when none is given
    Create { id: Option<String> },
    /// Read a session, taking its lock with --exclusive
    Get {
        id: String,
        #[arg(long)]
        exclusive: bool,
    },
    /// Save items (key=json pairs) and release the lock
    Set {
        id: String,
        #[arg(long)]
        lock_id: Option<i64>,
        /// First save of a session that does not exist yet
        #[arg(long)]
        new: bool,
        items: Vec<String>,
    },
    /// Release a lock without saving
    Release { id: String, lock_id: i64 },
    /// Delete a session, presenting its lock token
    Remove { id: String, lock_id: i64 },
    /// Push the expiry to now plus the configured timeout
    Touch { id: String },
    /// Delete every expired session in the backend
    Purge,
}

fn load_config(args: &Args) -> Result<StoreConfig, String> {
    let mut config = match &args.config {
        Some(path) => StoreConfig::from_file(path).map_err(|e| e.to_string())?,
        None => {
            let mut config = StoreConfig::new("/", 20);
            config.backend.kind = BackendKind::File;
            config
        }
    };
    if let Some(scope) = &args.scope {
        config.application_scope = scope.clone();
    }
    if let Some(timeout) = args.timeout_minutes {
        config.timeout_minutes = timeout;
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

/// `key=value`, where the value is JSON when it parses and a plain string otherwise.
fn parse_item(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("item '{}' is not of the form key=value", raw))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn fetched_to_json(id: &str, fetched: &FetchedItem) -> Value {
    json!({
        "id": id,
        "found": fetched.data.is_some() || fetched.lock.locked,
        "locked": fetched.lock.locked,
        "lock_id": fetched.lock.lock_id,
        "lock_age_ms": fetched.lock.lock_age.num_milliseconds(),
        "action_flags": fetched.lock.action_flags,
        "data": fetched.data,
    })
}

fn run(store: &SessionStore, command: Command) -> Result<Value, SessionError> {
    let timeout = store.config().timeout_minutes;
    match command {
        Command::Create { id } => {
            let id = id.unwrap_or_else(SessionStore::new_session_id);
            store.create_uninitialized_item(&id, timeout)?;
            Ok(json!({ "id": id, "created": true }))
        }
        Command::Get { id, exclusive } => {
            let fetched = if exclusive {
                store.get_item_exclusive(&id)?
            } else {
                store.get_item(&id)?
            };
            Ok(fetched_to_json(&id, &fetched))
        }
        Command::Set { id, lock_id, new, items } => {
            let mut data = StoreData::new(timeout);
            for raw in &items {
                let (key, value) = parse_item(raw).map_err(SessionError::Serialization)?;
                data.items.insert(key, value);
            }
            store.set_and_release_item_exclusive(&id, &data, lock_id, new)?;
            Ok(json!({ "id": id, "saved": data.items.len() }))
        }
        Command::Release { id, lock_id } => {
            store.release_item_exclusive(&id, lock_id)?;
            Ok(json!({ "id": id, "released": lock_id }))
        }
        Command::Remove { id, lock_id } => {
            store.remove_item(&id, lock_id)?;
            Ok(json!({ "id": id, "removed": true }))
        }
        Command::Touch { id } => {
            store.reset_item_timeout(&id)?;
            Ok(json!({ "id": id, "timeout_minutes": timeout }))
        }
        Command::Purge => Ok(json!({ "purged": store.purge_expired()? })),
    }
}

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    let args = Args::parse();

    let config = load_config(&args).unwrap_or_else(|e| {
        error!("Unable to load configuration: {}", e);
        std::process::exit(1);
    });
    info!(
        "Using {:?} backend for scope {}",
        config.backend.kind, config.application_scope
    );

    let backend = open_backend(&config.backend).unwrap_or_else(|e| {
        error!("Unable to open session backend: {}", e);
        std::process::exit(1);
    });
    let store = SessionStore::new(backend, config);

    match run(&store, args.command) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            error!("Command failed: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_item() {
        assert_eq!(parse_item("n=3").unwrap(), ("n".to_string(), json!(3)));
        assert_eq!(parse_item("name=ada").unwrap(), ("name".to_string(), json!("ada")));
        assert_eq!(parse_item("tags=[\"a\"]").unwrap(), ("tags".to_string(), json!(["a"])));
        assert!(parse_item("novalue").is_err());
    }

    #[test]
    fn test_args_override_config() {
        let args = Args::try_parse_from([
            "alveole",
            "--scope",
            "/blog",
            "--timeout-minutes",
            "45",
            "get",
            "S1",
            "--exclusive",
        ])
        .unwrap_or_else(|e| panic!("{}", e));
        let config = load_config(&args).unwrap();
        assert_eq!(config.application_scope, "/blog");
        assert_eq!(config.timeout_minutes, 45);
        assert_eq!(config.backend.kind, BackendKind::File);
        assert!(matches!(args.command, Command::Get { exclusive: true, .. }));
    }

    #[test]
    fn test_run_against_memory_backend() {
        let store = SessionStore::new(
            std::sync::Arc::new(alveole::storage::MemoryStorage::new()),
            StoreConfig::new("app1", 20),
        );
        let created = run(&store, Command::Create { id: Some("S1".into()) }).unwrap();
        assert_eq!(created["created"], json!(true));

        let locked = run(&store, Command::Get { id: "S1".into(), exclusive: true }).unwrap();
        assert_eq!(locked["lock_id"], json!(1));
        assert_eq!(locked["action_flags"], json!("InitializeItem"));

        let saved = run(
            &store,
            Command::Set { id: "S1".into(), lock_id: Some(1), new: false, items: vec!["n=2".into()] },
        )
        .unwrap();
        assert_eq!(saved["saved"], json!(1));

        let read = run(&store, Command::Get { id: "S1".into(), exclusive: false }).unwrap();
        assert_eq!(read["data"]["items"]["n"], json!(2));
        assert_eq!(read["locked"], json!(false));
    }
}
