use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fs;
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Utc};

use super::{redact_secrets, SinkUnavailable, CRASH_DIR_NAME, LOG_DIR_NAME};

static HOOK_DIR: OnceLock<PathBuf> = OnceLock::new();
static INSTALL_LOCK: Mutex<()> = Mutex::new(());
static WRITING: AtomicBool = AtomicBool::new(false);
static REPORT_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashHook {
    Installed(PathBuf),
    AlreadyInstalled(PathBuf),
}

impl CrashHook {
    pub fn dir(&self) -> &Path {
        match self {
            Self::Installed(dir) | Self::AlreadyInstalled(dir) => dir,
        }
    }
}

/// Chain a panic hook that drops a report into `<data_dir>/logs/crash`
/// before the previous hook runs. Only the first call installs anything.
pub fn install_crash_hook(data_dir: Option<&Path>) -> Result<CrashHook, SinkUnavailable> {
    if let Some(dir) = HOOK_DIR.get() {
        return Ok(CrashHook::AlreadyInstalled(dir.clone()));
    }
    let data_dir = data_dir.ok_or_else(|| SinkUnavailable {
        attempted: None,
        reason: "no data directory configured".to_string(),
    })?;
    let dir = data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME);
    fs::create_dir_all(&dir).map_err(|err| SinkUnavailable {
        attempted: Some(dir.clone()),
        reason: format!("failed to create crash directory: {err}"),
    })?;

    let _guard = INSTALL_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = HOOK_DIR.get() {
        return Ok(CrashHook::AlreadyInstalled(existing.clone()));
    }

    let previous = panic::take_hook();
    let hook_dir = dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_panic(&hook_dir, info);
        previous(info);
    }));
    let _ = HOOK_DIR.set(dir.clone());
    Ok(CrashHook::Installed(dir))
}

fn record_panic(dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic while writing the report must not recurse into us.
    if WRITING.swap(true, Ordering::AcqRel) {
        return;
    }

    let written = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        CrashReport::capture(info).write_into(dir)
    }));
    match written {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => eprintln!(
            "Warning: failed to write panic crash artifact under '{}': {err}",
            dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: crash reporter panicked while writing under '{}'",
            dir.display()
        ),
    }

    WRITING.store(false, Ordering::Release);
}

#[derive(Debug)]
struct CrashReport {
    at: DateTime<Utc>,
    thread: String,
    location: String,
    message: String,
    backtrace: Option<String>,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let trace = Backtrace::capture();
        let backtrace = (trace.status() == BacktraceStatus::Captured).then(|| trace.to_string());

        Self {
            at: Utc::now(),
            thread: std::thread::current()
                .name()
                .unwrap_or("<unnamed>")
                .to_string(),
            location: info
                .location()
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            message: redact_secrets(&payload_text(info.payload())),
            backtrace,
        }
    }

    fn render(&self) -> String {
        let backtrace = self
            .backtrace
            .as_deref()
            .unwrap_or("<not captured; set RUST_BACKTRACE=1 to enable>");
        format!(
            "timestamp_utc={}\nthread={}\nlocation={}\npayload={}\nbacktrace:\n{backtrace}\n",
            self.at.to_rfc3339(),
            self.thread,
            self.location,
            self.message,
        )
    }

    fn write_into(&self, dir: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let seq = REPORT_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!(
            "panic-{}-{seq:04}.log",
            self.at.format("%Y%m%dT%H%M%S%.3f")
        ));
        fs::write(&path, self.render())?;
        Ok(path)
    }
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|text| text.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}
