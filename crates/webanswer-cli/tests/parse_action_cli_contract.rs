use assert_cmd::Command;
use predicates::prelude::*;

fn webanswer() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("webanswer"));
    cmd.env_remove("WEBANSWER_ENV_FILE");
    cmd
}

#[test]
fn parse_action_accepts_single_quoted_call() {
    let out = webanswer()
        .args([
            "parse-action",
            "--text",
            "Thought: search it.\n{'name': 'web_search', 'arguments': {'query': 'foo'}}",
        ])
        .output()
        .expect("run webanswer parse-action");
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("parse json");
    assert_eq!(v["ok"].as_bool(), Some(true));
    assert_eq!(v["name"].as_str(), Some("web_search"));
    assert_eq!(v["arguments"]["query"].as_str(), Some("foo"));
    assert_eq!(v["preamble"].as_str(), Some("Thought: search it.\n"));
}

#[test]
fn parse_action_reads_stdin_and_unwraps_function_envelope() {
    webanswer()
        .arg("parse-action")
        .write_stdin(r#"{"type":"function","function":{"name":"final_answer","arguments":"{\"answer\":\"42\"}"}}"#)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""name":"final_answer""#))
        .stdout(predicate::str::contains(r#""answer":"42""#));
}

#[test]
fn parse_action_rejects_multiple_calls_with_exit_2() {
    let text = "{\"name\": \"a\", \"arguments\": {}},\n{\"name\": \"b\", \"arguments\": {}}";
    let out = webanswer()
        .arg("parse-action")
        .write_stdin(text)
        .output()
        .expect("run webanswer parse-action");
    assert_eq!(out.status.code(), Some(2));
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("parse json");
    assert_eq!(v["ok"].as_bool(), Some(false));
    assert_eq!(v["error"]["kind"].as_str(), Some("multiple_tool_calls"));
    assert!(v["error"]["snippet"].as_str().unwrap_or("").contains("},"));
}

#[test]
fn parse_action_without_braces_is_malformed() {
    webanswer()
        .args(["parse-action", "--text", "I will just answer directly."])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("malformed_json"))
        .stdout(predicate::str::contains(r#""position":0"#));
}
