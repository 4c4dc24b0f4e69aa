use std::process::Command;

use tempfile::TempDir;

fn run(actions: &str) -> (String, String, bool) {
    let state = TempDir::new().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_requisition-router"))
        .arg("tests/fixtures/directory.csv")
        .arg(format!("tests/fixtures/{actions}"))
        .env("RUST_LOG", "warn")
        .env("REQROUTE_STATUS_PATH", state.path().join("status"))
        .output()
        .expect("failed to run binary");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn routes_line_items_through_review() {
    let (stdout, stderr, success) = run("actions.csv");

    assert!(success, "{stderr}");

    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        lines,
        [
            "request_id,line_item_id,action,actor_id,status,claimed_by",
            "REQ-1,LI-1,approve,fran,PENDING_APPROVAL,first_line",
            "REQ-1,LI-1,approve,dana,PENDING_APPROVAL,unhandled",
            "REQ-1,LI-1,approve,cleo,APPROVED,final",
            "REQ-1,LI-2,approve,sam,PENDING_APPROVAL,second_line",
            "REQ-1,LI-2,approve,dana,APPROVED,final",
            "REQ-2,LI-1,deny,fran,DENIED,first_line",
            "REQ-2,LI-2,cancel,rita,CANCELLED,disposition",
        ]
    );
    // the delegate over the limit is not an error, but it is reported
    assert!(stderr.contains("routing unhandled"));
}

#[test]
fn errors_warn_but_do_not_block() {
    let (stdout, stderr, success) = run("with_errors.csv");

    assert!(success);
    assert!(stderr.contains("unrecognized action 'escalate'"));
    assert!(stderr.contains("invalid total price 'ten'"));
    assert!(stderr.contains("routing rejected"));

    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines[0], "request_id,line_item_id,action,actor_id,status,claimed_by");
    assert_eq!(lines[1], "REQ-1,LI-3,approve,fran,NEW_REQUEST,rejected");
    assert_eq!(lines[2], "REQ-1,LI-4,approve,fran,PENDING_APPROVAL,first_line");
    assert_eq!(lines.len(), 3);
}

#[test]
fn missing_arguments_fail() {
    let output = Command::new(env!("CARGO_BIN_EXE_requisition-router"))
        .arg("tests/fixtures/directory.csv")
        .output()
        .expect("failed to run binary");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("usage: requisition-router"));
}
