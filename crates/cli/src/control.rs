//! Administrative control commands

use crate::env_filter;
use chrono::Utc;
use clap::{Parser, Subcommand};
use rffmpeg::{
    status_report, Config, HostRegistry, HostStatus, SelectionPolicy, Store, Tracker,
};
use std::error::Error;
use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

type ControlResult = Result<(), Box<dyn Error + Send + Sync>>;

/// rffmpeg - remote ffmpeg dispatcher control
#[derive(Parser, Debug)]
#[command(name = "rffmpeg")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a worker host
    Add {
        /// Hostname or IP the remote shell connects to
        host: String,

        /// Unique servername, defaults to the host
        #[arg(short, long)]
        name: Option<String>,

        /// Relative capacity of the host
        #[arg(short, long)]
        weight: Option<u32>,
    },

    /// Remove a worker host
    Remove {
        /// Servername of the host
        name: String,
    },

    /// Show hosts, their state and running processes
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Clear process and state rows
    Clear {
        /// Only clear rows of this servername
        #[arg(short, long)]
        name: Option<String>,
    },
}

pub fn run(argv: Vec<OsString>) -> ExitCode {
    let cli = Cli::parse_from(argv);

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = match Config::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", config_path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(&config))
        .with_writer(std::io::stderr)
        .init();

    match execute(&config, cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

fn execute(config: &Config, command: Command) -> ControlResult {
    let store = Store::open(config.database.file_path())?;
    let registry = HostRegistry::new(&store);

    match command {
        Command::Add { host, name, weight } => {
            let name = name.unwrap_or_else(|| host.clone());
            registry.add_host(&name, &host, weight)?;
        }
        Command::Remove { name } => {
            registry.remove_host(&name)?;
        }
        Command::Status { json } => {
            let policy = SelectionPolicy::from_config(&config.selector);
            let report = status_report(&store, &policy, Utc::now())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", render_table(&report, std::io::stdout().is_terminal()));
            }
        }
        Command::Clear { name } => {
            let tracker = Tracker::new(&store);
            let summary = match name {
                Some(name) => tracker.clear_by_host(registry.find_by_servername(&name)?.id)?,
                None => tracker.clear_all()?,
            };
            info!(
                processes = summary.processes,
                states = summary.states,
                "cleared rows"
            );
        }
    }
    Ok(())
}

const HEADERS: [&str; 6] = [
    "Servername",
    "Hostname",
    "ID",
    "Weight",
    "State",
    "Active Processes",
];

/// Aligned status table, one line per process after the first
fn render_table(report: &[HostStatus], bold_header: bool) -> String {
    let rows: Vec<[String; 5]> = report
        .iter()
        .map(|s| {
            [
                s.servername.clone(),
                s.hostname.clone(),
                s.id.to_string(),
                s.weight.to_string(),
                s.state.to_string(),
            ]
        })
        .collect();

    let mut widths = [0usize; 5];
    for (i, width) in widths.iter_mut().enumerate() {
        *width = rows
            .iter()
            .map(|row| row[i].len())
            .chain(std::iter::once(HEADERS[i].len()))
            .max()
            .unwrap_or(0);
    }

    let line = |cells: [&str; 5], last: &str| {
        let mut out = String::new();
        for (cell, width) in cells.iter().zip(widths) {
            out.push_str(&format!("{:<width$} ", cell, width = width));
        }
        out.push_str(last);
        out.trim_end().to_string() + "\n"
    };

    let header = line(
        [HEADERS[0], HEADERS[1], HEADERS[2], HEADERS[3], HEADERS[4]],
        HEADERS[5],
    );
    let mut out = if bold_header {
        format!("\x1b[1m{}\x1b[0m\n", header.trim_end())
    } else {
        header
    };

    for (status, row) in report.iter().zip(&rows) {
        let mut commands = status
            .processes
            .iter()
            .map(|p| format!("PID {}: {}", p.process_id, p.cmd));
        let first = commands.next().unwrap_or_else(|| "N/A".to_string());
        let cells = [
            row[0].as_str(),
            row[1].as_str(),
            row[2].as_str(),
            row[3].as_str(),
            row[4].as_str(),
        ];
        out.push_str(&line(cells, &first));
        for command in commands {
            out.push_str(&line(["", "", "", "", ""], &command));
        }
    }
    out
}
