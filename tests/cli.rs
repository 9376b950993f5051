use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

fn chainsaw() -> Command {
    Command::cargo_bin("chainsaw").expect("could not find binary")
}

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("could not write file");
    path
}

const SIGMA_RULE: &str = r#"
title: Network Logon
description: Detects successful network logons
status: stable
level: high
detection:
    selection:
        EventID: 4624
        LogonType: 3
    condition: selection
"#;

const JSON_MAPPING: &str = r#"
name: plain json
kind: json
rules: sigma
groups:
  - name: Logons
    timestamp: timestamp
    filter:
      EventID: "*"
    fields:
      - name: Event ID
        from: EventID
        to: EventID
      - name: Logon Type
        from: LogonType
        to: LogonType
"#;

const CHAINSAW_RULE: &str = r#"
title: Encoded PowerShell
group: Execution
description: Detects encoded and unprofiled powershell
authors:
  - tester
kind: json
level: high
status: stable
timestamp: timestamp

fields:
  - name: Command Line
    from: CommandLine
    to: CommandLine

filter:
  condition: encoded
  encoded:
    CommandLine|contains|all:
      - ' -enc '
      - ' -nop '
"#;

#[test]
fn search_literal_emits_single_jsonl_hit() {
    let dir = tempfile::tempdir().unwrap();
    let sample = write(
        dir.path(),
        "sample.json",
        r#"[{"line": "x mimikatz y"}, {"line": "calc"}, {"line": "notepad"}]"#,
    );

    chainsaw()
        .arg("search")
        .arg(&sample)
        .args(["-e", "mimikatz", "-q", "--jsonl"])
        .assert()
        .success()
        .stdout(predicate::str::diff("{\"line\":\"x mimikatz y\"}\n"))
        .stderr(predicate::str::contains("[+] 1 hits in 1 files"));
}

#[test]
fn search_with_no_criteria_dumps_everything() {
    let dir = tempfile::tempdir().unwrap();
    let sample = write(dir.path(), "sample.json", r#"[{"a": 1}, {"a": 2}]"#);

    chainsaw()
        .arg("search")
        .arg(&sample)
        .args(["-q", "--jsonl"])
        .assert()
        .success()
        .stdout(predicate::str::diff("{\"a\":1}\n{\"a\":2}\n"))
        .stderr(predicate::str::contains("[+] 2 hits in 1 files"));
}

#[test]
fn hunt_translates_sigma_rules() {
    let dir = tempfile::tempdir().unwrap();
    let rule = write(dir.path(), "rule.yml", SIGMA_RULE);
    let mapping = write(dir.path(), "mapping.yml", JSON_MAPPING);
    let sample = write(
        dir.path(),
        "sample.json",
        r#"[
            {"EventID": 4624, "LogonType": 3, "timestamp": "2024-01-01T10:00:00Z"},
            {"EventID": 4624, "LogonType": 2, "timestamp": "2024-01-01T11:00:00Z"}
        ]"#,
    );

    chainsaw()
        .arg("hunt")
        .arg(&sample)
        .args(["-s"])
        .arg(&rule)
        .args(["-m"])
        .arg(&mapping)
        .args(["-q", "--jsonl"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Network Logon"))
        .stdout(predicate::function(|out: &str| out.lines().count() == 1))
        .stderr(predicate::str::contains("[+] 1 detections in 1 files"));
}

#[test]
fn hunt_chainsaw_rule_contains_all_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let rule = write(dir.path(), "rule.yml", CHAINSAW_RULE);
    let sample = write(
        dir.path(),
        "sample.json",
        r#"[
            {"CommandLine": "powershell -enc aGk= -nop x", "timestamp": "2024-01-01T10:00:00Z"},
            {"CommandLine": "powershell -enc aGk=", "timestamp": "2024-01-01T11:00:00Z"}
        ]"#,
    );

    chainsaw()
        .arg("hunt")
        .arg(&sample)
        .args(["-r"])
        .arg(&rule)
        .args(["-q", "--jsonl"])
        .assert()
        .success()
        .stdout(predicate::function(|out: &str| out.lines().count() == 1))
        .stderr(predicate::str::contains("[+] 1 detections in 1 files"));
}

#[test]
fn hunt_time_window_excludes_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let rule = write(dir.path(), "rule.yml", SIGMA_RULE);
    let mapping = write(dir.path(), "mapping.yml", JSON_MAPPING);
    let sample = write(
        dir.path(),
        "sample.json",
        r#"[
            {"EventID": 4624, "LogonType": 3, "timestamp": "2024-01-01T00:00:00Z"},
            {"EventID": 4624, "LogonType": 3, "timestamp": "2024-01-02T00:00:00Z"}
        ]"#,
    );

    chainsaw()
        .arg("hunt")
        .arg(&sample)
        .args(["-s"])
        .arg(&rule)
        .args(["-m"])
        .arg(&mapping)
        .args([
            "-q",
            "--jsonl",
            "--from",
            "2024-01-01T00:00:00Z",
            "--to",
            "2024-01-02T00:00:00Z",
        ])
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("[+] 0 detections in 1 files"));
}

#[test]
fn lint_counts_failures_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "chainsaw.yml", CHAINSAW_RULE);
    write(dir.path(), "sigma.yml", SIGMA_RULE);

    chainsaw()
        .arg("lint")
        .arg(dir.path())
        .args(["--kind", "chainsaw"])
        .assert()
        .success()
        .stderr(predicate::str::contains(
            "Validated 1 detection rules out of 2",
        ));
}

#[test]
fn lint_requires_a_kind() {
    let dir = tempfile::tempdir().unwrap();
    chainsaw()
        .arg("lint")
        .arg(dir.path())
        .assert()
        .failure()
        .code(2);
}

#[test]
fn dump_with_no_compatible_files_fails() {
    let dir = tempfile::tempdir().unwrap();
    chainsaw()
        .arg("dump")
        .arg(dir.path())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains(
            "No compatible files were found in the provided paths",
        ));
}

#[test]
fn dump_renders_documents_with_separators() {
    let dir = tempfile::tempdir().unwrap();
    let sample = write(dir.path(), "sample.json", r#"[{"a": 1}]"#);

    chainsaw()
        .arg("dump")
        .arg(&sample)
        .arg("-q")
        .assert()
        .success()
        .stdout(predicate::str::contains("---"))
        .stdout(predicate::str::contains("\"a\": 1"));
}
