mod logging;
mod output;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::providers::Serialized;
use tenant_guard::{
    GuardConfig, GuardDb, InstallReport, Installer, ProtocolHarness, Remediation, Verifier,
    redact_credentials_in_dsn,
};

use crate::output::{OutputFormat, RunReport};

/// Exit code for an operational error (bad config, unreachable database).
const EXIT_ERROR: u8 = 2;

/// Tenant-isolation enforcement for the shop database
#[derive(Parser)]
#[command(name = "shopguard")]
#[command(about = "Apply, verify and exercise the shop_id tenant-isolation controls")]
#[command(version)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database DSN (overrides config and environment)
    #[arg(long, global = true)]
    dsn: Option<String>,

    /// Report format written to stdout
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Install every control, then verify; fails unless fully enforced
    Apply,
    /// Verify and run the protocol harness against disposable rows
    Check,
    /// Verify from catalog metadata only (no writes)
    Verify,
    /// Drop every trigger, constraint and function shopguard installs
    Remove,
}

impl Commands {
    fn name(self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Check => "check",
            Self::Verify => "verify",
            Self::Remove => "remove",
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let outcome = run(&cli).await;
    if let Err(e) = &outcome {
        let message = render_error(e);
        tracing::error!(error = %message, "shopguard failed");
        eprintln!("error: {message}");
    }
    ExitCode::from(exit_status(&outcome))
}

/// 0 when the command succeeded, 1 when enforcement is incomplete or a step
/// failed, [`EXIT_ERROR`] on an operational error.
fn exit_status(outcome: &Result<bool>) -> u8 {
    match outcome {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(_) => EXIT_ERROR,
    }
}

/// Error chain joined with `: `, skipping causes whose text an outer error
/// already includes. Driver errors tend to repeat their source in `Display`.
fn render_error(e: &anyhow::Error) -> String {
    let mut out = e.to_string();
    for cause in e.chain().skip(1) {
        let text = cause.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
    }
    out
}

/// Layered config: defaults -> YAML -> env (`SHOPGUARD__*`) -> CLI.
fn load_config(cli: &Cli) -> Result<GuardConfig> {
    let mut figment = GuardConfig::figment(cli.config.as_deref())?;
    if let Some(dsn) = &cli.dsn {
        figment = figment.merge(Serialized::default("database.dsn", dsn));
    }
    Ok(GuardConfig::from_figment(&figment)?)
}

/// Returns whether the command succeeded. Errors are operational failures.
async fn run(cli: &Cli) -> Result<bool> {
    let config = load_config(cli)?;

    if cli.print_config {
        let mut shown = config.clone();
        shown.database.dsn = shown.database.dsn.as_deref().map(redact_credentials_in_dsn);
        println!("{}", serde_yaml::to_string(&shown)?);
        return Ok(true);
    }

    let Some(command) = cli.command else {
        anyhow::bail!("no command given; see `shopguard --help`");
    };

    let db = GuardDb::connect(&config.database)
        .await
        .context("failed to connect to database")?;
    let catalog = db.catalog();
    let mut report = RunReport::new(command.name());

    match command {
        Commands::Apply => {
            let install = match Installer::new(&catalog, &config).install_all().await {
                Ok(install) => install,
                Err(e) => InstallReport::from_abort(e, &config.schema.schema)?,
            };
            let verification = Verifier::new(&catalog, &config).verify().await;
            report.remediation = Remediation::plan(&verification, Some(&install), &config);
            report.install = Some(install);
            report.verification = Some(verification);
        }
        Commands::Check => {
            let verification = Verifier::new(&catalog, &config).verify().await;
            let harness = ProtocolHarness::new(db.conn(), &config).run().await;
            report.remediation = Remediation::plan(&verification, None, &config);
            report.verification = Some(verification);
            report.harness = Some(harness);
        }
        Commands::Verify => {
            let verification = Verifier::new(&catalog, &config).verify().await;
            report.remediation = Remediation::plan(&verification, None, &config);
            report.verification = Some(verification);
        }
        Commands::Remove => {
            report.removal = Some(Installer::new(&catalog, &config).remove_all().await);
        }
    }
    db.close().await;
    report.evaluate();

    let mut stdout = std::io::stdout().lock();
    report.write(cli.format, &mut stdout)?;
    stdout.flush()?;
    Ok(report.success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenant_guard::{CatalogError, GuardError};

    #[test]
    fn exit_status_mapping() {
        assert_eq!(exit_status(&Ok(true)), 0);
        assert_eq!(exit_status(&Ok(false)), 1);
        assert_eq!(exit_status(&Err(anyhow::anyhow!("no database"))), EXIT_ERROR);
    }

    #[test]
    fn repeated_causes_are_printed_once() {
        let err = anyhow::Error::new(GuardError::SharedFunction {
            function: "prevent_shop_id_change",
            source: CatalogError::Unavailable("permission denied for schema public".to_owned()),
        })
        .context("permission denied for schema public");
        let text = render_error(&err);
        assert_eq!(text.matches("permission denied for schema public").count(), 1);
        assert!(text.contains("failed to create shared function 'prevent_shop_id_change'"));
    }

    #[test]
    fn distinct_causes_are_all_kept() {
        let err = anyhow::anyhow!("connection refused").context("failed to connect to database");
        assert_eq!(
            render_error(&err),
            "failed to connect to database: connection refused"
        );
    }
}
