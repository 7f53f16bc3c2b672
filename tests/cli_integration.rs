use serde_json::Value;
use std::path::PathBuf;
use std::process::{Command, Output};

fn scratch_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("roomchat-cli-{name}-{}", std::process::id()))
}

fn roomchat(args: &[&str], envs: &[(&str, &str)]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_roomchat"));
    command
        .args(args)
        .env_remove("ROOMCHAT_USER_ID")
        .env_remove("ROOMCHAT_EMAIL")
        .env_remove("ROOMCHAT_TOKEN")
        .env_remove("ROOMCHAT_PLATFORM")
        .env_remove("ROOMCHAT_STORAGE_BUCKET");
    for (key, value) in envs {
        command.env(key, value);
    }
    command.output().expect("failed to execute roomchat binary")
}

fn run_json(args: &[&str], envs: &[(&str, &str)]) -> Value {
    let output = roomchat(args, envs);
    assert!(
        output.status.success(),
        "roomchat failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout should be valid json")
}

#[test]
fn config_reports_resolved_settings_without_secrets() {
    let dir = scratch_dir("config");
    let data_dir = dir.to_string_lossy().into_owned();
    let value = run_json(
        &["config", "--json"],
        &[
            ("ROOMCHAT_PROJECT_ID", "demo-project"),
            ("ROOMCHAT_API_KEY", "secret-key"),
            ("ROOMCHAT_PLATFORM", "ios"),
            ("ROOMCHAT_DATA_DIR", &data_dir),
            ("ROOMCHAT_POLL_INTERVAL_MS", "5"),
        ],
    );
    assert_eq!(value["projectId"], "demo-project");
    assert_eq!(value["storageBucket"], "demo-project.appspot.com");
    assert_eq!(value["platform"], "ios");
    assert_eq!(value["pollInterval"], 200);
    assert!(value.get("apiKey").is_none());
    let secrets = value["secretsPath"].as_str().expect("secrets path");
    assert!(secrets.ends_with("session.json"), "{secrets}");
}

#[test]
fn unknown_platform_is_rejected() {
    let output = roomchat(&["config"], &[("ROOMCHAT_PLATFORM", "windows")]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown platform"), "{stderr}");
}

#[test]
fn send_requires_exactly_one_content_kind() {
    let output = roomchat(
        &["messages", "send", "--thread", "t1", "--text", "hi", "--location", "1,2"],
        &[],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cannot be used with"), "{stderr}");

    let output = roomchat(&["messages", "send", "--thread", "t1"], &[]);
    assert!(!output.status.success());
}

#[test]
fn commands_need_a_session() {
    let dir = scratch_dir("session");
    let secrets = dir.join("missing.json");
    let secrets = secrets.to_string_lossy().into_owned();
    let output = roomchat(
        &["threads", "list"],
        &[("ROOMCHAT_SECRETS_PATH", &secrets)],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("roomchat auth login"), "{stderr}");
}
