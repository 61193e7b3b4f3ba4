use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use blobshift_core::config::settings_path;
use blobshift_core::{
    Connections, DestinationSettings, FsDestination, FsSource, MigrationEngine, MigrationOptions,
    Settings, SourceSettings, SqliteCollectionSource, UploadResult, load_settings,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Parser)]
#[command(name = "blobshift")]
#[command(about = "Migrate objects and collections into a content-addressed store", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    /// Print NDJSON progress events while migrating.
    #[arg(long)]
    events: bool,

    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Migrate a single object by key.
    File { key: String },
    /// Migrate every object under a prefix as one upload.
    Dir { prefix: String },
    /// Export and migrate one collection, or all of them.
    Collection { name: Option<String> },
    Space {
        #[command(subcommand)]
        cmd: SpaceCmd,
    },
    Uploads {
        #[command(subcommand)]
        cmd: UploadsCmd,
    },
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
}

#[derive(Subcommand)]
enum SpaceCmd {
    Create,
    Set { id: String },
    List,
}

#[derive(Subcommand)]
enum UploadsCmd {
    List {
        #[arg(long)]
        space: Option<String>,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }
}

#[tokio::main]
async fn main() {
    blobshift_core::logging::init_logging();
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_path = cli
        .config
        .or_else(|| std::env::var("BLOBSHIFT_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| settings_path(Path::new(".")));
    let settings = load_settings(&config_path).map_err(map_core_err)?;
    debug!(
        event = "cli.settings_loaded",
        path = %config_path.display(),
        "cli.settings_loaded"
    );

    if let Command::Settings { cmd: SettingsCmd::Get } = cli.cmd {
        return settings_get(&settings, cli.json);
    }

    let engine = build_engine(&settings)?;
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let outcome = run_with_engine(&engine, &settings, cli.cmd, cli.json, cli.events, &cancel).await;
    let closed = engine.close().await.map_err(map_core_err);
    outcome?;
    closed
}

fn build_engine(settings: &Settings) -> Result<MigrationEngine, CliError> {
    let DestinationSettings::Fs { root, .. } = &settings.destination;
    let destination = Arc::new(FsDestination::new(
        root,
        settings.migration.shard_size_bytes,
    ));
    let mut conns = Connections::new(destination);
    conns = match &settings.source {
        SourceSettings::Fs { root } => conns.with_source(Arc::new(FsSource::new(root))),
        SourceSettings::Sqlite { path } => {
            conns.with_collections(Arc::new(SqliteCollectionSource::new(path)))
        }
    };
    MigrationEngine::new(settings.migration.clone(), conns).map_err(map_core_err)
}

async fn run_with_engine(
    engine: &MigrationEngine,
    settings: &Settings,
    cmd: Command,
    json: bool,
    events: bool,
    cancel: &CancellationToken,
) -> Result<(), CliError> {
    let options = MigrationOptions {
        cancel: Some(cancel),
    };
    engine
        .initialize_with(options)
        .await
        .map_err(map_core_err)?;

    let DestinationSettings::Fs { space, .. } = &settings.destination;
    if let Some(space) = space {
        let selected = engine.set_space_with(space, options).await;
        if !selected.success {
            return Err(CliError::new(
                "space.unavailable",
                selected.error.unwrap_or_default(),
            ));
        }
    }

    match cmd {
        Command::File { key } => {
            let task_id = subscribe_events(engine, events);
            let res = engine.migrate_file_with(&key, options).await;
            print_result(&task_id, &res, json, events)
        }
        Command::Dir { prefix } => {
            let task_id = subscribe_events(engine, events);
            let res = engine.migrate_directory_with(&prefix, options).await;
            print_result(&task_id, &res, json, events)
        }
        Command::Collection { name } => {
            let task_id = subscribe_events(engine, events);
            let res = engine
                .migrate_collection_with(name.as_deref(), options)
                .await;
            print_result(&task_id, &res, json, events)
        }
        Command::Space { cmd } => {
            let res = match cmd {
                SpaceCmd::Create => engine.create_space_with(options).await,
                SpaceCmd::Set { id } => engine.set_space_with(&id, options).await,
                SpaceCmd::List => {
                    let spaces = engine
                        .list_spaces_with(options)
                        .await
                        .map_err(map_core_err)?;
                    if json {
                        print_json(&spaces)?;
                    } else {
                        for s in spaces {
                            println!("{}\t{}", s.id, s.name);
                        }
                    }
                    return Ok(());
                }
            };
            if !res.success {
                return Err(CliError::new(
                    "space.failed",
                    res.error.unwrap_or_default(),
                ));
            }
            if json {
                print_json(&res)?;
            } else {
                match res.name {
                    Some(name) => println!("spaceId={} name={name}", res.id),
                    None => println!("spaceId={}", res.id),
                }
            }
            Ok(())
        }
        Command::Uploads {
            cmd: UploadsCmd::List { space },
        } => {
            let uploads = engine
                .list_uploads_with(space.as_deref(), options)
                .await
                .map_err(map_core_err)?;
            if json {
                print_json(&uploads)?;
            } else {
                for u in uploads {
                    println!("{}\t{}", u.id, u.size);
                }
            }
            Ok(())
        }
        Command::Settings { .. } => Ok(()),
    }
}

/// Registers NDJSON printers for progress and per-unit errors. Returns the
/// task id stamped on every event.
fn subscribe_events(engine: &MigrationEngine, events: bool) -> String {
    let task_id = format!("mig_{}", uuid::Uuid::new_v4());
    if !events {
        return task_id;
    }

    let id = task_id.clone();
    engine.on_progress(move |p| {
        let mut line = serde_json::to_value(p).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(obj) = line.as_object_mut() {
            obj.insert("type".to_string(), "migration.progress".into());
            obj.insert("taskId".to_string(), id.clone().into());
        }
        println!("{line}");
    });

    let id = task_id.clone();
    engine.on_error(move |error, file| {
        let line = serde_json::json!({
            "type": "migration.error",
            "taskId": id,
            "file": file,
            "error": error,
        });
        println!("{line}");
    });
    task_id
}

fn print_result(
    task_id: &str,
    res: &UploadResult,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    if events {
        let mut line = serde_json::to_value(res)
            .map_err(|e| CliError::new("output.encode_failed", e.to_string()))?;
        if let Some(obj) = line.as_object_mut() {
            obj.insert("type".to_string(), "migration.result".into());
            obj.insert("taskId".to_string(), task_id.into());
        }
        println!("{line}");
    } else if json {
        print_json(res)?;
    } else if res.success {
        println!(
            "cid={} url={} size={}",
            res.cid.as_deref().unwrap_or_default(),
            res.url.as_deref().unwrap_or_default(),
            res.size.unwrap_or_default()
        );
    }

    if res.success {
        Ok(())
    } else {
        Err(CliError::new(
            "migration.failed",
            res.error.clone().unwrap_or_default(),
        ))
    }
}

fn settings_get(settings: &Settings, json: bool) -> Result<(), CliError> {
    if json {
        return print_json(settings);
    }
    let text = toml::to_string_pretty(settings)
        .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    print!("{text}");
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    let text = serde_json::to_string(value)
        .map_err(|e| CliError::new("output.encode_failed", e.to_string()))?;
    println!("{text}");
    Ok(())
}

fn map_core_err(e: blobshift_core::Error) -> CliError {
    use blobshift_core::Error;

    let text = e.to_string();
    match e {
        Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        Error::Connection { message } => CliError::retryable("connection.unavailable", message),
        Error::NotFound { message } => CliError::new("not_found", message),
        Error::Transfer { message } => CliError::retryable("transfer.failed", message),
        Error::RetriesExhausted {
            context, attempts, ..
        } => {
            let mut err = CliError::retryable("retries.exhausted", text);
            err.details = serde_json::json!({ "context": context, "attempts": attempts });
            err
        }
        Error::Cancelled => CliError::new("task.cancelled", "cancelled"),
        _ => CliError::new("unknown", text),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| {
        r#"{"code":"unknown","message":"json encode failed","details":{},"retryable":false}"#
            .to_string()
    });
    let _ = writeln!(std::io::stderr(), "{json}");
}
