//! Process supervision, grounded in
//! `original_source/ljrServer/daemon.{h,cpp}`'s `ProcessInfo`/
//! `real_start`/`real_daemon`/`start_daemon`.
//!
//! `start_daemon` either runs `main_cb` directly in the foreground, or
//! detaches via `daemon(3)` and loops fork/waitpid, restarting the
//! worker after an abnormal exit and stopping once a child exits
//! cleanly (status `0`).

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Mirrors the original's `ProcessInfo`: who started the worker, when,
/// and how many times the supervisor has had to restart it.
#[derive(Debug, Clone, Default)]
pub struct ProcessInfo {
    pub parent_id: i32,
    pub main_id: i32,
    pub parent_start_time: u64,
    pub main_start_time: u64,
    pub restart_count: u32,
}

static PROCESS_INFO: OnceLock<parking_lot::RwLock<ProcessInfo>> = OnceLock::new();

/// Process-wide supervisor bookkeeping, analogous to the original's
/// `Singleton<ProcessInfoMgr>`.
pub fn process_info() -> &'static parking_lot::RwLock<ProcessInfo> {
    PROCESS_INFO.get_or_init(|| parking_lot::RwLock::new(ProcessInfo::default()))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn real_start(main_cb: &impl Fn() -> i32) -> i32 {
    {
        let mut info = process_info().write();
        info.main_id = std::process::id() as i32;
        info.main_start_time = now_secs();
    }
    main_cb()
}

/// Detaches from the controlling terminal, then loops fork/waitpid:
/// each child runs `main_cb` and exits with its return code; the parent
/// waits, restarting after `daemon.restart_interval` seconds if the
/// child died abnormally, or returning once it exits with status `0`.
fn real_daemon(main_cb: impl Fn() -> i32) -> i32 {
    let restart_interval = weft_config::Config::lookup(
        "daemon.restart_interval",
        5u64,
        "seconds to wait before restarting a crashed worker",
    );

    {
        let mut info = process_info().write();
        info.parent_id = std::process::id() as i32;
        info.parent_start_time = now_secs();
    }

    // Safety: `daemon(3)` takes no pointers; `1, 0` keeps the working
    // directory and leaves stdio attached to `/dev/null`, matching the
    // original's `daemon(1, 0)` call.
    let rc = unsafe { libc::daemon(1, 0) };
    if rc != 0 {
        log::error!("daemon() failed: {}", std::io::Error::last_os_error());
        return -1;
    }

    loop {
        // Safety: `fork()` takes no arguments; both branches below only
        // touch state already valid in the calling process.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => {
                log::error!("fork() failed: {}", std::io::Error::last_os_error());
                return -1;
            }
            0 => {
                let code = real_start(&main_cb);
                std::process::exit(code);
            }
            child => {
                let mut status: i32 = 0;
                // Safety: `status` is a valid `i32` out-parameter;
                // `child` was just returned by the `fork()` above.
                unsafe { libc::waitpid(child, &mut status, 0) };
                if status == 0 {
                    log::info!("worker {child} exited cleanly, supervisor stopping");
                    return 0;
                }
                let restart_count = {
                    let mut info = process_info().write();
                    info.restart_count += 1;
                    info.restart_count
                };
                let wait_secs = restart_interval.get();
                log::error!(
                    "worker {child} died (status={status}), restart #{restart_count} in {wait_secs}s"
                );
                std::thread::sleep(std::time::Duration::from_secs(wait_secs));
            }
        }
    }
}

/// Runs `main_cb` directly when `is_daemon` is `false`; otherwise hands
/// it to the restart supervisor above. Mirrors `start_daemon` from the
/// original.
pub fn start_daemon(is_daemon: bool, main_cb: impl Fn() -> i32) -> i32 {
    if !is_daemon {
        return real_start(&main_cb);
    }
    real_daemon(main_cb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn foreground_mode_runs_the_callback_once_directly() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let code = start_daemon(false, move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            0
        });
        assert_eq!(code, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn foreground_mode_records_main_start_in_process_info() {
        let before = process_info().read().main_start_time;
        start_daemon(false, || 0);
        let after = process_info().read().main_start_time;
        assert!(after >= before);
    }
}
