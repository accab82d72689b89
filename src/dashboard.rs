use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};

use crate::err::Error;

pub const DASHBOARD_SCRIPT: &str = "app.R";
pub const STARTUP_POLL: Duration = Duration::from_millis(200);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// A statistics dashboard (an R Shiny app) serving on a loopback port.
///
/// The process leads its own process group so that stopping it also stops
/// whatever R spawned underneath.
pub struct Dashboard {
    child: Child,
    port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardStatus {
    pub url: String,
    pub reachable: bool,
    pub message: String,
}

impl Dashboard {
    /// Spawns `<rscript> app.R` inside `dir` with `SHINY_PORT` set. Does not
    /// wait for the port; see [`wait_for_port`].
    pub fn spawn(rscript: &str, dir: &Path, port: u16) -> Result<Self, Error> {
        if rscript.trim().is_empty() {
            return Err(Error::DashboardError {
                message: "Please specify your Rscript path and save it first".to_string(),
            });
        }
        let script: PathBuf = dir.join(DASHBOARD_SCRIPT);
        if !script.exists() {
            return Err(Error::DashboardError {
                message: format!("Shiny app not found at: {}", script.display()),
            });
        }

        let mut command = Command::new(rscript.trim());
        command
            .arg(DASHBOARD_SCRIPT)
            .current_dir(dir)
            .env("SHINY_PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|err| Error::DashboardError {
            message: format!("Error starting Shiny: {}", err),
        })?;
        log::info!("Dashboard process {:?} started on port {}", child.id(), port);
        Ok(Dashboard { child, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        dashboard_url(self.port)
    }

    /// True once the process has terminated, whatever the reason.
    pub fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => false,
            Ok(Some(status)) => {
                log::info!("Dashboard on port {} exited with {}", self.port, status);
                true
            }
            Err(err) => {
                log::warn!("Could not poll dashboard on port {}: {}", self.port, err);
                true
            }
        }
    }

    /// SIGTERM to the process group, then SIGKILL if it is still around
    /// after [`SHUTDOWN_GRACE`]. A process that already exited is fine.
    pub async fn stop(mut self) {
        if self.has_exited() {
            return;
        }
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                // The child was spawned with process_group(0), so its pid is the group id.
                unsafe {
                    libc::killpg(pid as libc::pid_t, libc::SIGTERM);
                }
                match timeout(SHUTDOWN_GRACE, self.child.wait()).await {
                    Ok(Ok(status)) => {
                        log::info!("Dashboard on port {} stopped ({})", self.port, status);
                        return;
                    }
                    Ok(Err(err)) => log::warn!("Waiting for dashboard on port {} failed: {}", self.port, err),
                    Err(_) => log::warn!(
                        "Dashboard on port {} ignored SIGTERM for {:?}, killing it",
                        self.port,
                        SHUTDOWN_GRACE
                    ),
                }
                unsafe {
                    libc::killpg(pid as libc::pid_t, libc::SIGKILL);
                }
            }
        }
        match self.child.kill().await {
            Ok(()) => log::info!("Dashboard on port {} killed", self.port),
            Err(err) => log::debug!("Dashboard on port {} was already gone: {}", self.port, err),
        }
    }
}

pub fn dashboard_url(port: u16) -> String {
    format!("http://127.0.0.1:{}", port)
}

/// Status after a fresh start: waits up to `startup` for the port.
pub async fn startup_status(port: u16, startup: Duration) -> DashboardStatus {
    let reachable = wait_for_port(port, startup, STARTUP_POLL).await;
    let message = if reachable {
        "Shiny Dashboard started successfully!".to_string()
    } else {
        log::warn!("Dashboard did not open port {} within {:?}", port, startup);
        format!(
            "Shiny Dashboard did not respond within {} seconds",
            startup.as_secs_f32()
        )
    };
    DashboardStatus {
        url: dashboard_url(port),
        reachable,
        message,
    }
}

/// Status of a dashboard that was already running: one connection attempt.
pub async fn running_status(port: u16) -> DashboardStatus {
    let reachable = wait_for_port(port, Duration::ZERO, STARTUP_POLL).await;
    DashboardStatus {
        url: dashboard_url(port),
        reachable,
        message: if reachable {
            "Shiny Dashboard is already running".to_string()
        } else {
            "Shiny Dashboard is running but not responding yet".to_string()
        },
    }
}

/// Polls `127.0.0.1:port` until a connection succeeds or `timeout` runs out.
/// A zero timeout makes exactly one attempt.
pub async fn wait_for_port(port: u16, timeout: Duration, interval: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn missing_app_script_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = Dashboard::spawn("Rscript", dir.path(), 8050).err().unwrap();
        assert!(matches!(err, Error::DashboardError { ref message } if message.contains("app.R")));
    }

    #[test]
    fn empty_rscript_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Dashboard::spawn("  ", dir.path(), 8050).is_err());
    }

    #[tokio::test]
    async fn open_port_is_found_immediately() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(wait_for_port(port, Duration::from_secs(1), Duration::from_millis(20)).await);
        assert!(running_status(port).await.reachable);
    }

    #[tokio::test]
    async fn closed_port_times_out() {
        let port = closed_port();
        let started = Instant::now();
        assert!(!wait_for_port(port, Duration::from_millis(300), Duration::from_millis(50)).await);
        assert!(started.elapsed() >= Duration::from_millis(300));

        let status = startup_status(port, Duration::from_millis(100)).await;
        assert!(!status.reachable);
        assert!(!running_status(port).await.reachable);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_process_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DASHBOARD_SCRIPT), "").unwrap();
        let mut dashboard = Dashboard::spawn("/bin/true", dir.path(), closed_port()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !dashboard.has_exited() {
            assert!(Instant::now() < deadline, "/bin/true did not exit");
            sleep(Duration::from_millis(20)).await;
        }
        dashboard.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_terminates_a_running_process() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DASHBOARD_SCRIPT), "sleep 30\n").unwrap();
        let mut dashboard = Dashboard::spawn("/bin/sh", dir.path(), closed_port()).unwrap();
        assert!(!dashboard.has_exited());

        let started = Instant::now();
        dashboard.stop().await;
        assert!(started.elapsed() < SHUTDOWN_GRACE);
    }
}
