//! Shared helpers for tests: stub worker endpoints and process checks.

use std::net::TcpListener as StdTcpListener;
use std::process::Stdio;
use std::time::Duration;

use axum::Router;
use boostrun_core::Timing;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// HTTP server standing in for a worker endpoint.
pub struct Stub {
    port: u16,
    handle: JoinHandle<()>,
}

impl Stub {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop serving and wait until the listener is closed.
    pub async fn shutdown(mut self) {
        self.handle.abort();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for Stub {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Serve `router` on an ephemeral loopback port.
pub async fn serve_stub(router: Router) -> Stub {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Stub { port, handle }
}

/// A loopback port nothing listens on.
pub fn unused_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Timing tight enough for tests.
pub fn fast_timing() -> Timing {
    Timing {
        probe_interval: Duration::from_millis(20),
        readiness_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(2),
        reap_interval: Duration::from_millis(20),
        reap_timeout: Duration::from_secs(5),
        kill_grace: Duration::from_secs(5),
        run_timeout: None,
    }
}

/// Returns true if a `python3` interpreter is on the PATH.
pub fn python3_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Returns true if `pid` names a live, non-zombie process.
pub fn is_running(pid: u32) -> bool {
    if kill(Pid::from_raw(pid as i32), None) == Err(Errno::ESRCH) {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rfind(')')
            .and_then(|i| stat[i + 1..].split_whitespace().next())
            .map(|state| state != "Z")
            .unwrap_or(true),
        Err(_) => false,
    }
}
