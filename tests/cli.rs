//! Drives the `docchat` binary. None of these tests reach a real service:
//! the credential is refused before any call, or the configured endpoint
//! is a closed local port.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

fn docchat_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("docchat");
    path
}

fn setup_test_env(extra_config: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::create_dir_all(root.join("config")).unwrap();
    fs::write(
        root.join("moon.md"),
        "# Moon\n\nThe moon is about 384,400 km from Earth.\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[cache]
backend = "fs"
path = "{}/cache"

[embedding]
base_url = "http://127.0.0.1:1/v1"
max_retries = 0
timeout_secs = 5

[llm]
base_url = "http://127.0.0.1:1/v1"
max_retries = 0
timeout_secs = 5
{}
"#,
        root.display(),
        extra_config
    );
    let config_path = root.join("config").join("docchat.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docchat(config_path: &Path, args: &[&str], stdin: &str) -> (String, String, bool) {
    let binary = docchat_binary();
    let mut child = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("OPENAI_API_KEY")
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap_or_else(|e| panic!("Failed to run docchat binary at {:?}: {}", binary, e));

    child
        .stdin
        .take()
        .unwrap()
        .write_all(stdin.as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn moon_file(config_path: &Path) -> String {
    config_path
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("moon.md")
        .display()
        .to_string()
}

#[test]
fn test_help_lists_commands() {
    let (_tmp, config_path) = setup_test_env("");
    let (stdout, _, success) = run_docchat(&config_path, &["--help"], "");
    assert!(success);
    assert!(stdout.contains("doc"));
    assert!(stdout.contains("site"));
}

#[test]
fn test_malformed_api_key_is_rejected() {
    let (_tmp, config_path) = setup_test_env("");
    let file = moon_file(&config_path);
    let (stdout, stderr, success) = run_docchat(
        &config_path,
        &["doc", &file, "--api-key", "not-a-key"],
        "",
    );
    assert!(!success, "stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Please check your API key."), "stdout={}", stdout);
    assert!(stderr.contains("no usable API key"), "stderr={}", stderr);
}

#[test]
fn test_missing_api_key_prompts() {
    let (_tmp, config_path) = setup_test_env("");
    let file = moon_file(&config_path);
    let (stdout, _, success) = run_docchat(&config_path, &["doc", &file], "");
    assert!(!success);
    assert!(stdout.contains("Enter your OpenAI API key:"));
}

#[test]
fn test_quit_at_key_prompt() {
    let (_tmp, config_path) = setup_test_env("");
    let file = moon_file(&config_path);
    let (stdout, stderr, success) = run_docchat(&config_path, &["doc", &file], "/quit\n");
    assert!(success, "stdout={}, stderr={}", stdout, stderr);
}

#[test]
fn test_credential_from_environment() {
    let (_tmp, config_path) = setup_test_env("");
    let file = moon_file(&config_path);
    let output = Command::new(docchat_binary())
        .arg("--config")
        .arg(&config_path)
        .args(["doc", &file])
        .env("OPENAI_API_KEY", "bogus")
        .stdin(Stdio::null())
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!output.status.success());
    assert!(stdout.contains("Please check your API key."), "stdout={}", stdout);
}

#[test]
fn test_unreachable_service_is_reported() {
    let (_tmp, config_path) = setup_test_env("");
    let file = moon_file(&config_path);
    let (stdout, stderr, success) = run_docchat(
        &config_path,
        &["doc", &file, "--api-key", "sk-well-formed"],
        "",
    );
    assert!(!success, "stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Ask again to retry loading"), "stdout={}", stdout);
    assert!(stderr.contains("embedding failed"), "stderr={}", stderr);
}

#[test]
fn test_missing_file_is_reported() {
    let (_tmp, config_path) = setup_test_env("");
    let (_, stderr, success) = run_docchat(
        &config_path,
        &["doc", "/definitely/not/here.md", "--api-key", "sk-well-formed"],
        "",
    );
    assert!(!success);
    assert!(stderr.contains("failed to read"), "stderr={}", stderr);
}

#[test]
fn test_site_requires_xml_url() {
    let (_tmp, config_path) = setup_test_env("");
    let (_, stderr, success) = run_docchat(&config_path, &["site", "https://example.com/"], "");
    assert!(!success);
    assert!(stderr.contains("Sitemap URL"), "stderr={}", stderr);
}

#[test]
fn test_invalid_config_is_rejected() {
    let (_tmp, config_path) = setup_test_env("[chunking]\nchunk_size = 100\nchunk_overlap = 100\n");
    let file = moon_file(&config_path);
    let (_, stderr, success) = run_docchat(&config_path, &["doc", &file], "");
    assert!(!success);
    assert!(stderr.contains("chunking.chunk_overlap"), "stderr={}", stderr);
}

#[test]
fn test_custom_credential_pattern() {
    let (_tmp, config_path) = setup_test_env("[credential]\npattern = \"^key-[0-9]+$\"\n");
    let file = moon_file(&config_path);
    let (stdout, _, success) = run_docchat(
        &config_path,
        &["doc", &file, "--api-key", "sk-looks-like-openai"],
        "",
    );
    assert!(!success);
    assert!(stdout.contains("Please check your API key."), "stdout={}", stdout);
}
