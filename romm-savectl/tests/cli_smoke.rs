use std::process::Command;

fn run_ctl(args: &[&str]) -> std::process::Output {
    let exe = env!("CARGO_BIN_EXE_romm-savectl");
    Command::new(exe)
        .args(args)
        .output()
        .expect("romm-savectl should execute")
}

#[test]
fn help_lists_primary_commands() {
    let output = run_ctl(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in [
        "--sync",
        "--conflicts",
        "--resolve",
        "--queue",
        "--retry",
        "--set",
        "--playtime",
    ] {
        assert!(stdout.contains(command), "help should mention {command}");
    }
}

#[test]
fn unknown_argument_fails() {
    let output = run_ctl(&["--frobnicate"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown argument"));
}

#[test]
fn invalid_setting_is_rejected_before_contacting_daemon() {
    let output = run_ctl(&["--set", "conflict_mode=bogus"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("conflict_mode"));
}
