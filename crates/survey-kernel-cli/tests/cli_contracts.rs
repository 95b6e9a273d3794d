#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::{json, Value};
use survey_kernel_store_sqlite::color_script;
use ulid::Ulid;

fn sk_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_sk") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/sk");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "survey-kernel-cli", "--bin", "sk"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build sk binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn sk_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(sk_binary_path());
    command.arg("--db").arg(db_path).arg("--log-level").arg("warn");
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run sk command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn sk_json(db_path: &Path, args: &[&str]) -> Value {
    let output = sk_output(db_path, args);
    assert!(
        output.status.success(),
        "sk {:?} failed\nstderr={}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    stdout_json(&output)
}

fn id_of(value: &Value) -> String {
    match value["id"].as_i64() {
        Some(id) => id.to_string(),
        None => panic!("missing id in {value}"),
    }
}

struct Fixture {
    db_path: PathBuf,
    contact_id: String,
    root: String,
    red: String,
}

impl Fixture {
    fn new(label: &str) -> Self {
        let db_path =
            std::env::temp_dir().join(format!("survey-cli-{label}-{}.sqlite3", Ulid::new()));
        let migrated = sk_json(&db_path, &["migrate"]);
        assert_eq!(migrated["migrated"], json!(true));

        let campaign = sk_json(
            &db_path,
            &["campaign", "create", "--organization-id", "1", "--title", "Colors"],
        );
        let campaign_id = id_of(&campaign);

        let script_path = db_path.with_extension("script.json");
        let script = match serde_json::to_string_pretty(&color_script()) {
            Ok(value) => value,
            Err(err) => panic!("failed to encode script: {err}"),
        };
        if let Err(err) = std::fs::write(&script_path, script) {
            panic!("failed to write script fixture: {err}");
        }
        let steps = sk_json(
            &db_path,
            &[
                "script",
                "load",
                "--campaign-id",
                &campaign_id,
                "--file",
                &script_path.display().to_string(),
            ],
        );
        let _ = std::fs::remove_file(&script_path);

        sk_json(
            &db_path,
            &["role", "set", "--user-id", "7", "--organization-id", "1", "--role", "texter"],
        );
        let assignment = sk_json(
            &db_path,
            &["assignment", "create", "--campaign-id", &campaign_id, "--user-id", "7"],
        );
        let contact = sk_json(
            &db_path,
            &[
                "contact",
                "add",
                "--campaign-id",
                &campaign_id,
                "--cell",
                "+15555550100",
                "--assignment-id",
                &id_of(&assignment),
                "--first-name",
                "Ada",
                "--status",
                "messaged",
            ],
        );

        Self {
            db_path,
            contact_id: id_of(&contact),
            root: id_of(&steps[0]),
            red: id_of(&steps[1]),
        }
    }

    fn update(&self, user_id: &str, answers: &[(&str, &str)]) -> Output {
        let inputs: Vec<Value> = answers
            .iter()
            .map(|(step, value)| {
                json!({
                    "campaignContactId": self.contact_id,
                    "interactionStepId": step,
                    "value": value,
                })
            })
            .collect();
        sk_output(
            &self.db_path,
            &[
                "responses",
                "update",
                "--contact-id",
                &self.contact_id,
                "--user-id",
                user_id,
                "--json",
                &Value::Array(inputs).to_string(),
            ],
        )
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.db_path);
    }
}

fn step_value(step: &str, value: &str) -> Value {
    let id = match step.parse::<i64>() {
        Ok(value) => value,
        Err(err) => panic!("step id {step:?} is not numeric: {err}"),
    };
    json!({"interactionStepId": id, "value": value})
}

#[test]
fn help_lists_the_command_surface() {
    let output = match Command::new(sk_binary_path()).arg("--help").output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run sk --help: {err}"),
    };
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    for command in ["migrate", "campaign", "script", "contact", "responses", "actions"] {
        assert!(help.contains(command), "help missing {command}: {help}");
    }
}

#[test]
fn branch_change_scenario_through_the_binary() {
    let fixture = Fixture::new("scenario");

    let output = fixture.update(
        "7",
        &[(fixture.root.as_str(), "Red"), (fixture.red.as_str(), "Crimson")],
    );
    assert!(output.status.success());
    let record = stdout_json(&output);
    assert_eq!(record["messageStatus"], json!("messaged"));
    assert_eq!(
        record["questionResponseValues"],
        json!([
            step_value(fixture.root.as_str(), "Red"),
            step_value(fixture.red.as_str(), "Crimson")
        ])
    );

    let record = stdout_json(&fixture.update("7", &[(fixture.root.as_str(), "Purple")]));
    assert_eq!(
        record["questionResponseValues"],
        json!([step_value(fixture.root.as_str(), "Purple")])
    );

    let shown = sk_json(
        &fixture.db_path,
        &["contact", "show", "--contact-id", &fixture.contact_id],
    );
    assert_eq!(shown["questionResponseValues"], record["questionResponseValues"]);
}

#[test]
fn denied_update_exits_non_zero_and_writes_nothing() {
    let fixture = Fixture::new("denied");
    let output = fixture.update("8", &[(fixture.root.as_str(), "Red")]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("permission denied"));

    let responses = sk_json(
        &fixture.db_path,
        &["responses", "show", "--contact-id", &fixture.contact_id],
    );
    assert_eq!(responses, json!([]));
}

#[test]
fn invalid_config_file_is_rejected() {
    let fixture = Fixture::new("config");
    let config_path = fixture.db_path.with_extension("config.json");
    if let Err(err) = std::fs::write(&config_path, r#"{"cache_capacity": 0}"#) {
        panic!("failed to write config fixture: {err}");
    }

    let output = sk_output(
        &fixture.db_path,
        &["--config", &config_path.display().to_string(), "migrate"],
    );
    let _ = std::fs::remove_file(&config_path);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("configuration error"));
}

#[test]
fn next_script_renders_the_current_step() {
    let fixture = Fixture::new("next");
    let _ = stdout_json(&fixture.update("7", &[(fixture.root.as_str(), "Red")]));

    let next = sk_json(
        &fixture.db_path,
        &[
            "script",
            "next",
            "--contact-id",
            &fixture.contact_id,
            "--texter-first-name",
            "Grace",
        ],
    );
    assert_eq!(next["script"], json!("Red is an awesome color, Ada!"));
    assert_eq!(next["answerOptions"], json!(["Crimson", "Firebrick"]));
}
