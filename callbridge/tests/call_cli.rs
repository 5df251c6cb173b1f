//! Runs `callbridge-call` end to end against the fixture worker.
//!
//! The fixture binary belongs to the sibling workspace member and is found
//! next to this package's binary in the target directory.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};

fn fixture_worker() -> PathBuf {
    let path = PathBuf::from(env!("CARGO_BIN_EXE_callbridge-call")).with_file_name(format!(
        "callbridge-fixture{}",
        std::env::consts::EXE_SUFFIX
    ));
    assert!(
        path.exists(),
        "{} not built; run the workspace tests (`cargo test --workspace`)",
        path.display()
    );
    path
}

fn call(workers: &str, input: &str) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_callbridge-call"))
        .args(["--workers", workers, "--"])
        .arg(fixture_worker())
        .env("CALLBRIDGE_LOG", "warn")
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let mut stdin = child.stdin.take().unwrap();
    stdin.write_all(input.as_bytes()).unwrap();
    drop(stdin);

    child.wait_with_output().unwrap()
}

fn stdout_lines(output: &Output) -> Vec<String> {
    String::from_utf8(output.stdout.clone())
        .unwrap()
        .lines()
        .map(String::from)
        .collect()
}

#[test]
fn answers_every_line_in_input_order() {
    let input = [
        r#"{"function": "add", "argument": {"a": 5, "b": 6}}"#,
        "this is not json",
        r#"{"function": "no_such_function", "argument": null}"#,
        "",
        r#"{"function": "add_scalar_output", "argument": {"a": 1.5, "b": 2}}"#,
        r#"{"function": "identity", "argument": {"zeta": 1, "alpha": {"$array": {"dtype": "int32", "shape": [2], "data": [1, 2]}}}}"#,
        r#"{"function": "verify_1d_int32_array", "argument": {"a": {"$array": {"dtype": "int32", "shape": [1], "data": [11]}}}}"#,
        r#"{"function": "add_numpy_arrays", "argument": {"a": {"$array": {"dtype": "float64", "shape": [2], "data": [5.5, 3.5]}}, "b": {"$array": {"dtype": "float64", "shape": [2], "data": [1.0, 2.1]}}}}"#,
    ]
    .join("\n");

    let output = call("3", &input);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let lines = stdout_lines(&output);
    assert_eq!(lines.len(), 7, "{lines:#?}");
    assert_eq!(lines[0], r#"{"ok":{"result":11}}"#);
    assert!(
        lines[1].starts_with(r#"{"error":"invalid request line: "#),
        "{}",
        lines[1]
    );
    assert_eq!(lines[2], r#"{"error":"unknown function 'no_such_function'"}"#);
    assert_eq!(lines[3], r#"{"ok":3.5}"#);
    insta::assert_snapshot!(
        lines[4],
        @r#"{"ok":{"zeta":1,"alpha":{"$array":{"dtype":"int32","shape":[2],"data":[1,2]}}}}"#
    );
    insta::assert_snapshot!(lines[5], @r#"{"error":"expected arr [10] but was [11]"}"#);
    assert_eq!(
        lines[6],
        r#"{"ok":{"$array":{"dtype":"float64","shape":[2],"data":[6.5,5.6]}}}"#
    );
}

#[test]
fn empty_input_exits_cleanly() {
    let output = call("1", "");
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn usage_errors_exit_with_two() {
    let output = Command::new(env!("CARGO_BIN_EXE_callbridge-call"))
        .args(["--workers", "0", "--", "worker"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("--workers must be positive"));
}
