use std::io::Write;

use clap::ValueEnum;
use serde::Serialize;
use tenant_guard::{HarnessSummary, InstallReport, Remediation, StepOutcome, VerificationReport};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Everything one CLI invocation produced.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub command: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install: Option<InstallReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removal: Option<InstallReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub harness: Option<HarnessSummary>,
    #[serde(skip_serializing_if = "Remediation::is_empty")]
    pub remediation: Remediation,
    pub success: bool,
}

impl RunReport {
    #[must_use]
    pub fn new(command: &'static str) -> Self {
        Self {
            command,
            install: None,
            removal: None,
            verification: None,
            harness: None,
            remediation: Remediation::default(),
            success: false,
        }
    }

    /// Set `success` from the collected reports. `apply` needs enforcement and
    /// no failed install step, `check` needs enforcement and a passing
    /// harness, `verify` needs enforcement alone and `remove` needs no failed
    /// step. A missing report never counts as success.
    pub fn evaluate(&mut self) {
        let enforced = self
            .verification
            .as_ref()
            .is_some_and(VerificationReport::is_enforced);
        let steps_ok = |r: Option<&InstallReport>| r.is_some_and(|r| r.failed().next().is_none());
        self.success = match self.command {
            "apply" => enforced && steps_ok(self.install.as_ref()),
            "check" => enforced && self.harness.as_ref().is_some_and(HarnessSummary::all_passed),
            "verify" => enforced,
            "remove" => steps_ok(self.removal.as_ref()),
            _ => false,
        };
    }

    /// # Errors
    /// Returns an error if writing or JSON serialization fails.
    pub fn write(&self, format: OutputFormat, w: &mut impl Write) -> anyhow::Result<()> {
        match format {
            OutputFormat::Json => {
                serde_json::to_writer_pretty(&mut *w, self)?;
                writeln!(w)?;
            }
            OutputFormat::Text => self.write_text(w)?,
        }
        Ok(())
    }

    fn write_text(&self, w: &mut impl Write) -> std::io::Result<()> {
        if let Some(install) = &self.install {
            write_steps(w, "install", install)?;
        }
        if let Some(removal) = &self.removal {
            write_steps(w, "remove", removal)?;
        }
        if let Some(report) = &self.verification {
            write_verification(w, report)?;
        }
        if let Some(harness) = &self.harness {
            writeln!(
                w,
                "harness: {} passed, {} failed",
                harness.passed(),
                harness.failed()
            )?;
            for r in &harness.results {
                let mark = if r.passed { "PASS" } else { "FAIL" };
                writeln!(w, "  {mark}  {:<26} {}", r.scenario, r.detail)?;
            }
        }
        if !self.remediation.is_empty() {
            writeln!(w, "remediation:")?;
            for action in &self.remediation.actions {
                writeln!(w, "  - {action}")?;
            }
            for query in &self.remediation.queries {
                writeln!(w, "    {query}")?;
            }
        }
        writeln!(w, "result: {}", self.verdict())
    }

    fn verdict(&self) -> &'static str {
        match (self.command, self.success) {
            ("remove", true) => "REMOVED",
            ("remove", false) => "REMOVAL INCOMPLETE",
            (_, true) => "ENFORCED",
            (_, false) => "NOT ENFORCED",
        }
    }
}

fn write_steps(w: &mut impl Write, title: &str, report: &InstallReport) -> std::io::Result<()> {
    writeln!(w, "{title}:")?;
    for step in &report.steps {
        let (status, note) = match &step.outcome {
            StepOutcome::Applied => ("applied", String::new()),
            StepOutcome::AlreadyPresent => ("present", String::new()),
            StepOutcome::Skipped(reason) => ("SKIPPED", format!(": {reason}")),
            StepOutcome::Failed { error } => ("FAILED", format!(": {error}")),
        };
        writeln!(
            w,
            "  {status:<8} {:<13} {}{note}",
            step.category, step.target
        )?;
    }
    Ok(())
}

fn write_verification(w: &mut impl Write, report: &VerificationReport) -> std::io::Result<()> {
    let flag = |active: bool| if active { "ACTIVE" } else { "INACTIVE" };
    let coverage = &report.constraint_coverage;
    let constraints = if coverage.is_partial() {
        "INCOMPLETE"
    } else {
        flag(report.constraints_active)
    };
    writeln!(w, "verification:")?;
    writeln!(w, "  triggers      {}", flag(report.triggers_active))?;
    writeln!(
        w,
        "  constraints   {constraints} ({} of {})",
        coverage.present, coverage.expected
    )?;
    writeln!(w, "  auditing      {}", flag(report.auditing_active))?;
    for detail in &report.details {
        writeln!(w, "  . {detail}")?;
    }
    Ok(())
}
