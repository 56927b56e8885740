use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use bulkgen_core::logging::{install_crash_hook, CrashHook, CRASH_DIR_NAME, LOG_DIR_NAME, REDACTED};
use tempfile::tempdir;

const CHILD_MODE_ENV: &str = "BULKGEN_CRASH_CHILD_MODE";
const CHILD_DATA_DIR_ENV: &str = "BULKGEN_CRASH_CHILD_DATA_DIR";
const LEAKED_SESSION: &str = "sess-4f2a9c";

fn crash_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME)
}

/// Re-run this test binary, filtered down to the child entrypoint.
fn spawn_crashing_child(mode: &str, data_dir: &Path) -> Output {
    Command::new(std::env::current_exe().unwrap())
        .args(["crash_child_entrypoint", "--exact", "--nocapture"])
        .env(CHILD_MODE_ENV, mode)
        .env(CHILD_DATA_DIR_ENV, data_dir)
        .output()
        .unwrap()
}

fn newest_artifact(dir: &Path) -> Option<String> {
    let mut logs: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
        .collect();
    logs.sort();
    logs.last().map(|path| fs::read_to_string(path).unwrap())
}

#[test]
fn crash_child_entrypoint() {
    let Ok(mode) = std::env::var(CHILD_MODE_ENV) else {
        return;
    };
    let data_dir = PathBuf::from(std::env::var(CHILD_DATA_DIR_ENV).unwrap());

    let first = install_crash_hook(Some(&data_dir)).unwrap();
    assert_eq!(first.dir(), crash_dir(&data_dir).as_path());
    assert!(matches!(
        install_crash_hook(Some(&data_dir)),
        Ok(CrashHook::AlreadyInstalled(_))
    ));

    match mode.as_str() {
        "leaky_panic" => panic!("upstream rejected request cookie: {LEAKED_SESSION}"),
        "blocked_crash_dir" => {
            let dir = crash_dir(&data_dir);
            let _ = fs::remove_dir_all(&dir);
            fs::write(&dir, b"in the way").unwrap();
            panic!("crash while crash dir is blocked");
        }
        other => panic!("unknown child mode {other}"),
    }
}

#[test]
fn panic_artifact_is_written_with_secrets_masked() {
    let data_dir = tempdir().unwrap();
    let output = spawn_crashing_child("leaky_panic", data_dir.path());
    assert!(!output.status.success());

    let artifact = newest_artifact(&crash_dir(data_dir.path())).expect("crash artifact");
    assert!(artifact.contains("timestamp_utc="));
    assert!(artifact.contains("location="));
    assert!(artifact.contains("backtrace:"));
    assert!(artifact.contains(&format!(
        "payload=upstream rejected request cookie: {REDACTED}"
    )));
    assert!(!artifact.contains(LEAKED_SESSION));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("thread panicked while panicking"));
}

#[test]
fn blocked_crash_dir_warns_without_double_panic() {
    let data_dir = tempdir().unwrap();
    let output = spawn_crashing_child("blocked_crash_dir", data_dir.path());
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("crash while crash dir is blocked"));
    assert!(stderr.contains("Warning: failed to write panic crash artifact under"));
    assert!(!stderr.contains("thread panicked while panicking"));
}
