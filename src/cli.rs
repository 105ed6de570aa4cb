use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::commands::{self, CommandReport};
use crate::logging::{LogFormat, init_logging};

#[derive(Debug, Parser)]
#[command(
    name = "tcsync",
    version,
    about = "Keeps the toolchain warehouse reconciled with the toolchain API"
)]
pub struct Cli {
    /// Print the command report as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Startup reconciliation, then incremental ticks until stopped.
    Run {
        /// Stop after startup and a single tick.
        #[arg(long)]
        once: bool,
    },
    /// Fill warehouse gaps from the full id populations.
    Startup,
    /// One incremental tick over the event log.
    Tick,
    /// Re-check every retained toolchain against the API.
    Refresh,
    /// Repair legacy placeholder tombstones until none are left.
    Migrate,
    /// Paths, configuration, persisted state and active overrides.
    Status,
    /// Write the source-control service instance report.
    Export {
        /// CSV with every matching service instance.
        #[arg(long, value_name = "PATH")]
        csv: Option<PathBuf>,
        /// JSON list of instances without a webhook.
        #[arg(long = "json-out", value_name = "PATH")]
        json_out: Option<PathBuf>,
    },
}

fn render(report: &CommandReport, json: bool) -> Result<String> {
    if json {
        return Ok(serde_json::to_string_pretty(report)?);
    }
    let mut out = format!(
        "{}: {}\n",
        report.command,
        if report.ok { "ok" } else { "issues" }
    );
    for detail in &report.details {
        out.push_str(&format!("  {detail}\n"));
    }
    for issue in &report.issues {
        out.push_str(&format!("  issue: {issue}\n"));
    }
    Ok(out.trim_end().to_string())
}

pub fn dispatch(command: &Command) -> Result<CommandReport> {
    match command {
        Command::Run { once } => {
            commands::sync_run::run(&commands::sync_run::RunOptions { once: *once })
        }
        Command::Startup => commands::sync_startup::run(),
        Command::Tick => commands::sync_tick::run(),
        Command::Refresh => commands::sync_refresh::run(),
        Command::Migrate => commands::sync_migrate::run(),
        Command::Status => commands::sync_status::run(),
        Command::Export { csv, json_out } => {
            commands::sync_export::run(&commands::sync_export::ExportOptions {
                csv: csv.clone(),
                json: json_out.clone(),
            })
        }
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogFormat::from_env());

    let report = dispatch(&cli.command)?;
    println!("{}", render(&report, cli.json)?);
    if !report.ok {
        bail!(
            "{} finished with {} issue(s)",
            report.command,
            report.issues.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn export_paths_and_global_json_parse() {
        let cli = Cli::try_parse_from([
            "tcsync", "export", "--csv", "all.csv", "--json-out", "fix.json", "--json",
        ])
        .expect("parse");
        assert!(cli.json);
        match cli.command {
            Command::Export { csv, json_out } => {
                assert_eq!(csv, Some(PathBuf::from("all.csv")));
                assert_eq!(json_out, Some(PathBuf::from("fix.json")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn text_report_lists_details_then_issues() {
        let mut report = CommandReport::new("tick");
        report.detail("tick.events=3");
        report.issue("toolchain tc-1 failed");
        let text = render(&report, false).expect("render");
        assert_eq!(
            text,
            "tick: issues\n  tick.events=3\n  issue: toolchain tc-1 failed"
        );
        let json = render(&report, true).expect("render");
        assert!(json.contains("\"ok\": false"));
    }
}
