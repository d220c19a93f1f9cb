use super::client::FastCgiTarget;
use crate::cgi::{effective_environment, HostPlatform};
use crate::error::GatewayError;
use anyhow::{anyhow, Result};
use prism_core::config::ApplicationConfig;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, error, info, warn, Instrument};

/// How long a launched backend gets to start accepting connections.
pub const STARTUP_WINDOW: Duration = Duration::from_secs(10);
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Time between the terminate request and a forced kill.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(1500);

/// A FastCGI backend process started and owned by the gateway.
#[derive(Debug)]
pub struct Supervisor {
    name: String,
    child: Mutex<Option<Child>>,
}

impl Supervisor {
    /// Spawn the backend described by `application`. Its standard error is
    /// logged line by line at error level for as long as it runs.
    pub fn launch(application: &ApplicationConfig, name: &str) -> Result<Self> {
        let env = effective_environment(
            std::env::vars_os(),
            application
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
            HostPlatform::current(),
        );
        let mut child = Command::new(&application.path)
            .args(&application.arguments)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GatewayError::Setup(format!(
                    "cannot launch FastCGI application {name} ({}): {e}",
                    application.path.display()
                ))
            })?;
        info!(
            application = name,
            pid = child.id(),
            program = %application.path.display(),
            "launched FastCGI backend"
        );

        if let Some(stderr) = child.stderr.take() {
            let span = tracing::info_span!("fastcgi_backend", application = %name);
            tokio::spawn(
                async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        error!(line = %line, "FastCGI backend error output");
                    }
                }
                .instrument(span),
            );
        }

        Ok(Self {
            name: name.to_string(),
            child: Mutex::new(Some(child)),
        })
    }

    /// Poll until `target` accepts a connection. Fails when the process exits
    /// first or the window elapses.
    pub async fn wait_until_responsive(
        &self,
        target: &FastCgiTarget,
        window: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + window;
        loop {
            {
                let mut guard = self.child.lock().await;
                let child = guard
                    .as_mut()
                    .ok_or_else(|| anyhow!("FastCGI backend {} was already stopped", self.name))?;
                if let Some(status) = child.try_wait()? {
                    return Err(GatewayError::Setup(format!(
                        "FastCGI backend {} exited during startup ({status})",
                        self.name
                    ))
                    .into());
                }
            }
            match target.connect().await {
                Ok(_) => {
                    debug!(
                        application = %self.name,
                        backend = %target.address(),
                        "FastCGI backend is accepting connections"
                    );
                    return Ok(());
                }
                Err(e) if Instant::now() >= deadline => {
                    return Err(GatewayError::Setup(format!(
                        "FastCGI backend {} did not accept connections within {:?}: {e}",
                        self.name, window
                    ))
                    .into());
                }
                Err(_) => sleep(STARTUP_POLL_INTERVAL).await,
            }
        }
    }

    /// Ask the backend to exit, then kill it if it is still running after
    /// [`SHUTDOWN_GRACE`].
    pub async fn shutdown(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        request_termination(&child);
        match timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => info!(application = %self.name, %status, "FastCGI backend stopped"),
            Ok(Err(e)) => {
                warn!(application = %self.name, error = %e, "waiting for FastCGI backend failed")
            }
            Err(_) => {
                warn!(application = %self.name, "FastCGI backend did not stop in time, killing it");
                if let Err(e) = child.kill().await {
                    warn!(application = %self.name, error = %e, "failed to kill FastCGI backend");
                }
            }
        }
    }
}

#[cfg(unix)]
fn request_termination(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we own and have not reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM failed");
        }
    }
}

#[cfg(not(unix))]
fn request_termination(_child: &Child) {}
