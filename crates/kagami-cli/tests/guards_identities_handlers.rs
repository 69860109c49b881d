use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use kagami_cli::cli::{GuardsArgs, IdentitiesArgs, OutputMode};
use kagami_cli::commands::{CommandHandler, GuardsHandler, IdentitiesHandler};
use kagami_cli::guards::{GuardReport, ProbeFacts, StageReport};
use kagami_cli::identities::list_identities;
use tempfile::tempdir;

fn report(unlocked: bool, locked: Option<bool>) -> GuardReport {
    GuardReport {
        unlocked: StageReport {
            stage: "unlocked",
            proceed: unlocked,
            reason: if unlocked { "ok" } else { "remote_session" },
        },
        locked: locked.map(|proceed| StageReport {
            stage: "locked",
            proceed,
            reason: if proceed { "ok" } else { "display_off" },
        }),
        facts: ProbeFacts {
            remote: !unlocked,
            camera_accessible: true,
            lid_closed: false,
            lock_screen_active: false,
            connectors: Vec::new(),
        },
    }
}

fn guards_exit(report_value: GuardReport) -> ExitCode {
    let handler = GuardsHandler::with_dependencies(
        GuardsArgs {
            lock_timeout_secs: 0,
        },
        move |_args| Ok(report_value.clone()),
        |_report, _mode| Ok(()),
    );
    handler.execute(OutputMode::Json, false).unwrap()
}

#[test]
fn guards_handler_succeeds_only_when_both_stages_proceed() {
    assert_eq!(guards_exit(report(true, Some(true))), ExitCode::SUCCESS);
    assert_eq!(guards_exit(report(true, Some(false))), ExitCode::from(1));
    assert_eq!(guards_exit(report(false, None)), ExitCode::from(1));
}

#[test]
fn identities_handler_renders_store_listing() {
    let tmp = tempdir().unwrap();
    fs::write(
        tmp.path().join("alice.json"),
        r#"{"embeddings":[{"id":"a1","embedding":[0.3,0.4]}]}"#,
    )
    .unwrap();
    let store = tmp.path().to_path_buf();

    let handler = IdentitiesHandler::with_dependencies(
        IdentitiesArgs {
            store_dir: Some(store.clone()),
        },
        |args| list_identities(args.store_dir.as_deref().unwrap()),
        move |report, _mode| {
            assert_eq!(report.store_dir, store);
            assert_eq!(report.identities.len(), 1);
            assert_eq!(report.identities[0].user, "alice");
            Ok(())
        },
    );
    assert_eq!(
        handler.execute(OutputMode::Human, false).unwrap(),
        ExitCode::SUCCESS
    );
}

#[test]
fn identities_handler_ignores_non_template_files() {
    let tmp = tempdir().unwrap();
    fs::write(tmp.path().join("README.txt"), "not a template").unwrap();
    let report = list_identities(&PathBuf::from(tmp.path())).unwrap();
    assert!(report.identities.is_empty());
}
