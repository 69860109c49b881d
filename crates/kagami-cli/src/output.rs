use std::io::{self, Write};

use serde::Serialize;
use serde_json::json;

use crate::auth::AuthSummary;
use crate::cli::OutputMode;
use crate::doctor::{CheckStatus, DoctorOutcome};
use crate::errors::{AppError, AppResult};
use crate::guards::{GuardReport, StageReport};
use crate::identities::IdentitiesReport;

fn write_json<T: Serialize + ?Sized>(payload: &T) -> AppResult<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let payload = serde_json::to_string(payload)?;
    handle.write_all(payload.as_bytes())?;
    handle.write_all(b"\n")?;
    Ok(())
}

pub fn render_auth(summary: &AuthSummary, mode: OutputMode, verbose: bool) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            if verbose {
                for line in &summary.audit {
                    println!("{line}");
                }
            }
            match summary.method {
                Some(method) => println!(
                    "Authenticated {} by {} in {} ms",
                    summary.user, method, summary.elapsed_ms
                ),
                None => println!(
                    "Authentication {} for {}: {} ({} ms)",
                    summary.outcome, summary.user, summary.reason, summary.elapsed_ms
                ),
            }
        }
        OutputMode::Json => write_json(summary)?,
    }
    Ok(())
}

pub fn render_guards(report: &GuardReport, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            println!("{}", stage_line(&report.unlocked));
            match &report.locked {
                Some(locked) => println!("{}", stage_line(locked)),
                None => println!("locked stage: not evaluated"),
            }
            let facts = &report.facts;
            println!(
                "remote={} camera_accessible={} lid_closed={} lock_screen_active={}",
                facts.remote, facts.camera_accessible, facts.lid_closed, facts.lock_screen_active
            );
            for connector in &facts.connectors {
                println!(
                    "  {} internal={} connected={} lit={}",
                    connector.name, connector.internal, connector.connected, connector.lit
                );
            }
        }
        OutputMode::Json => write_json(report)?,
    }
    Ok(())
}

fn stage_line(stage: &StageReport) -> String {
    let verdict = if stage.proceed { "proceed" } else { "skip" };
    format!("{} stage: {verdict} ({})", stage.stage, stage.reason)
}

pub fn render_identities(report: &IdentitiesReport, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            if report.identities.is_empty() {
                println!("No enrolled identities in {}", report.store_dir.display());
            }
            for identity in &report.identities {
                println!(
                    "{}: {} template(s) in {} file(s)",
                    identity.user, identity.templates, identity.files
                );
            }
            for broken in &report.unreadable {
                println!("{}: unreadable ({})", broken.user, broken.error);
            }
        }
        OutputMode::Json => write_json(report)?,
    }
    Ok(())
}

pub fn render_doctor(outcome: &DoctorOutcome, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            for check in &outcome.checks {
                let status = match check.status {
                    CheckStatus::Pass => "PASS",
                    CheckStatus::Warn => "WARN",
                    CheckStatus::Fail => "FAIL",
                };
                println!("[{status}] {}: {}", check.name, check.message);
            }
            println!(
                "Doctor {}",
                if outcome.ok {
                    "completed without failures"
                } else {
                    "found failures"
                }
            );
        }
        OutputMode::Json => write_json(outcome)?,
    }
    Ok(())
}

pub fn render_error(err: &AppError, mode: OutputMode) {
    match mode {
        OutputMode::Human => {
            eprintln!("error: {}", err.human_message());
        }
        OutputMode::Json => {
            let payload = json!({ "status": "error", "message": err.human_message() });
            if let Ok(text) = serde_json::to_string(&payload) {
                println!("{text}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_line_names_verdict_and_reason() {
        let line = stage_line(&StageReport {
            stage: "unlocked",
            proceed: false,
            reason: "remote_session",
        });
        assert_eq!(line, "unlocked stage: skip (remote_session)");
    }
}
