//! CLI entry point for rffmpeg
//!
//! Installed under its own name this is the administrative control CLI.
//! Installed (or symlinked) as `ffmpeg` or `ffprobe` it acts as that tool and
//! dispatches the invocation to a worker host.

mod control;

use chrono::Local;
use rffmpeg::{Config, Dispatcher, Invocation, Store, Tool};
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let argv: Vec<OsString> = std::env::args_os().collect();
    let program = argv
        .first()
        .and_then(|arg0| Path::new(arg0).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    match Tool::from_program_name(&program) {
        Some(tool) => {
            let args = argv
                .iter()
                .skip(1)
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect();
            run_tool(tool, args).await
        }
        None => control::run(argv),
    }
}

/// Log level: `RUST_LOG` when set, otherwise from `program.debug`
pub(crate) fn env_filter(config: &Config) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if config.program.debug { "debug" } else { "info" })
    })
}

/// Send logs to today's file under `program.log`.
///
/// The child owns stdout and stderr, so when the file cannot be opened
/// logging stays off.
fn init_file_logging(config: &Config) {
    let path = config.program.log.join(format!(
        "log_rffmpeg_{}.log",
        Local::now().format("%Y%m%d")
    ));
    let Ok(file) = OpenOptions::new().create(true).append(true).open(&path) else {
        return;
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
}

async fn run_tool(tool: Tool, args: Vec<String>) -> ExitCode {
    let config_path = Config::default_path();
    let config = match Config::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("rffmpeg: {}: {}", config_path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    init_file_logging(&config);
    info!(
        pid = std::process::id(),
        tool = tool.as_str(),
        args = %args.join(" "),
        "starting invocation"
    );

    let db_path = config.database.file_path();
    let store = match Store::open(&db_path) {
        Ok(store) => store,
        Err(e) => {
            // no shared state: an empty in-memory store makes this run local
            error!(path = %db_path.display(), error = %e, "failed to open store");
            match Store::open_in_memory() {
                Ok(store) => store,
                Err(e) => {
                    error!(error = %e, "failed to open in-memory store");
                    return ExitCode::FAILURE;
                }
            }
        }
    };

    let invocation = Invocation::new(tool, args);
    match Dispatcher::new(&store, &config).dispatch(&invocation).await {
        Ok(code) => {
            info!(code, "finished invocation");
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
        Err(e) => {
            error!(error = %e, "invocation failed");
            ExitCode::FAILURE
        }
    }
}
