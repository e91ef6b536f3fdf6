use std::path::PathBuf;
use std::time::Duration;

use arkgen::error::Error;
use arkgen::process::{ProcessConfig, spawn_and_capture};

fn make_config(command: &str, args: &[&str]) -> ProcessConfig {
    ProcessConfig {
        command: command.to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
        working_dir: PathBuf::from("."),
        timeout: None,
        log_prefix: "test".to_string(),
        env: vec![],
        stdin_data: None,
    }
}

#[tokio::test]
async fn test_stdout_capture() {
    let config = make_config("sh", &["-c", "echo line1; echo line2; echo line3"]);
    let output = spawn_and_capture(config).await.unwrap();
    assert!(output.success());
    assert_eq!(output.exit_code, 0);
    assert_eq!(output.signal, None);
    assert_eq!(output.stdout_lines, vec!["line1", "line2", "line3"]);
}

#[tokio::test]
async fn test_stderr_capture() {
    let config = make_config("sh", &["-c", "echo err1 >&2; echo err2 >&2"]);
    let output = spawn_and_capture(config).await.unwrap();
    assert!(output.success());
    assert_eq!(output.stderr_lines, vec!["err1", "err2"]);
}

#[tokio::test]
async fn test_combined_transcript_order() {
    let config = make_config("sh", &["-c", "echo out; echo err >&2"]);
    let output = spawn_and_capture(config).await.unwrap();
    assert_eq!(output.combined(), "out\nerr");
}

#[tokio::test]
async fn test_nonzero_exit_code() {
    let config = make_config("sh", &["-c", "exit 3"]);
    let output = spawn_and_capture(config).await.unwrap();
    assert!(!output.success());
    assert_eq!(output.exit_code, 3);
}

#[tokio::test]
async fn test_missing_binary_is_process_error() {
    let config = make_config("definitely-not-a-real-binary-xyz", &[]);
    let err = spawn_and_capture(config).await.unwrap_err();
    assert!(matches!(err, Error::Process(_)));
    assert!(err.to_string().contains("failed to spawn"));
}

#[tokio::test]
async fn test_timeout_kills_process() {
    let mut config = make_config("sh", &["-c", "sleep 30"]);
    config.timeout = Some(Duration::from_millis(200));
    let started = std::time::Instant::now();
    let err = spawn_and_capture(config).await.unwrap_err();
    assert!(matches!(err, Error::ProcessTimeout(_)));
    // SIGTERM then SIGKILL, well before the sleep would finish.
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_stdin_piped_to_child() {
    let mut config = make_config("sh", &["-c", "cat"]);
    config.stdin_data = Some("fed via stdin".to_string());
    let output = spawn_and_capture(config).await.unwrap();
    assert_eq!(output.stdout_lines, vec!["fed via stdin"]);
}

#[tokio::test]
async fn test_env_passed_to_child() {
    let mut config = make_config("sh", &["-c", "echo $ARKGEN_TEST_VALUE"]);
    config.env = vec![("ARKGEN_TEST_VALUE".to_string(), "present".to_string())];
    let output = spawn_and_capture(config).await.unwrap();
    assert_eq!(output.stdout_lines, vec!["present"]);
}

#[tokio::test]
async fn test_working_dir_respected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
    let mut config = make_config("sh", &["-c", "ls"]);
    config.working_dir = dir.path().to_path_buf();
    let output = spawn_and_capture(config).await.unwrap();
    assert!(output.stdout_lines.contains(&"marker.txt".to_string()));
}
