pub mod bridge;
pub mod config;
pub mod db {
    pub mod models;
}
pub mod dosing;
pub mod schema;
pub mod validation;
pub mod services {
    pub mod demo;
    pub mod executor;
    pub mod usage;
}

use crate::bridge::{HttpValveBridge, LogOnlyActuator, ValveActuator};
use crate::config::Config;
use crate::services::executor::{self, ExecutorSettings};
use chrono::Utc;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{error, info, warn};
use std::path::PathBuf;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    env_file: Option<PathBuf>,
    /// Run a single executor tick and exit.
    once: bool,
    seed_demo: bool,
}

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => {
            if applied.is_empty() {
                info!("Database schema is up to date; no migrations were applied");
            } else {
                let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                info!("Applied {} database migration(s): {}", applied.len(), names);
            }
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

fn build_actuator(cfg: &Config) -> Box<dyn ValveActuator> {
    match cfg.bridge_url.as_deref() {
        Some(url) => {
            info!(
                "Valve bridge: {} (timeout={}s, max_request_retries={})",
                url,
                cfg.bridge_timeout.as_secs(),
                cfg.max_request_retries
            );
            Box::new(HttpValveBridge::new(
                url,
                cfg.bridge_token.clone(),
                cfg.bridge_timeout,
                cfg.max_request_retries,
            ))
        }
        None => {
            warn!("BRIDGE_URL not set; valves will not be actuated (dry run)");
            Box::new(LogOnlyActuator)
        }
    }
}

fn run(args: &CliArgs) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (poll_interval={}s, batch_size={}, utc_offset={}, executor_enabled={}, bridge={})",
        cfg.poll_interval.as_secs(),
        cfg.batch_size,
        cfg.utc_offset,
        cfg.executor_enabled,
        cfg.bridge_url.as_deref().unwrap_or("-")
    );

    // 2) Connect DB
    let mut conn = PgConnection::establish(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");

    // 3) Apply pending database migrations
    apply_database_migrations(&mut conn)?;

    // 4) Optional demo data
    if args.seed_demo {
        services::demo::run(&mut conn, Utc::now(), cfg.utc_offset)?;
    }

    // 5) Executor
    if !cfg.executor_enabled {
        info!("Executor disabled via EXECUTOR_ENABLED={}", cfg.executor_enabled);
        return Ok(());
    }

    let actuator = build_actuator(&cfg);
    let settings = ExecutorSettings {
        poll_interval: cfg.poll_interval,
        batch_size: cfg.batch_size,
        utc_offset: cfg.utc_offset,
    };

    if args.once {
        let summary = executor::run_tick(&mut conn, actuator.as_ref(), &settings, Utc::now())?;
        info!("Single tick complete: {:?}", summary);
        return Ok(());
    }

    info!(
        "Starting executor loop: interval={}s, actuator={}",
        settings.poll_interval.as_secs(),
        actuator.name()
    );
    executor::run_loop(&mut conn, actuator.as_ref(), &settings)
}

fn parse_cli<I: IntoIterator<Item = std::ffi::OsString>>(args: I) -> Result<CliArgs, String> {
    let mut parsed = CliArgs::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let arg = arg
            .into_string()
            .map_err(|_| "argument contains invalid UTF-8".to_string())?;
        let env_path = match arg.as_str() {
            "--once" => {
                parsed.once = true;
                continue;
            }
            "--seed-demo" => {
                parsed.seed_demo = true;
                continue;
            }
            "--env-file" => args
                .next()
                .map(PathBuf::from)
                .ok_or_else(|| "`--env-file` requires a path argument".to_string())?,
            s if s.starts_with("--env-file=") => {
                let path = &s["--env-file=".len()..];
                if path.is_empty() {
                    return Err("`--env-file` requires a path argument".to_string());
                }
                PathBuf::from(path)
            }
            "--" => break,
            other => return Err(format!("unrecognised argument: {}", other)),
        };
        if parsed.env_file.replace(env_path).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }

    Ok(parsed)
}

/// Load the explicit env file, or `./.env` when present.
fn load_env(args: &CliArgs) -> Result<Option<(PathBuf, bool)>, String> {
    if let Some(path) = &args.env_file {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        config::load_env_file(path)?;
        return Ok(Some((path.clone(), true)));
    }

    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let default_path = cwd.join(".env");
    if default_path.is_file() {
        config::load_env_file(&default_path)?;
        Ok(Some((default_path, false)))
    } else {
        Ok(None)
    }
}

fn main() {
    let (args, loaded_env) = match parse_cli(std::env::args_os().skip(1)).and_then(|a| load_env(&a).map(|l| (a, l))) {
        Ok(v) => v,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some((path, explicit)) = loaded_env.as_ref() {
        let origin = if *explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, path.display());
    }

    info!(
        "irrigation-dosing {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(&args) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
