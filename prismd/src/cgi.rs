use crate::cgi_response::{parse_cgi_output, CgiResponse};
use anyhow::{anyhow, Result};
use hyper::body::HttpBody as _;
use hyper::Body;
use prism_core::config::ApplicationConfig;
use std::collections::HashMap;
use std::ffi::OsString;
use std::io::Cursor;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tracing::{debug, error, warn, Instrument};

/// Variables kept from the inherited environment on Windows hosts.
const WINDOWS_KEPT_VARIABLES: &[&str] = &["PATH", "TMP", "TEMP"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPlatform {
    Windows,
    Unix,
}

impl HostPlatform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Unix
        }
    }
}

/// Environment a CGI process starts with.
///
/// Windows hosts only pass PATH, TMP and TEMP from `base`; other hosts pass
/// all of it, including entries that are not valid UTF-8. `overrides` are
/// applied afterwards in order, later values replacing earlier ones.
pub fn effective_environment<B, O, K, V>(
    base: B,
    overrides: O,
    platform: HostPlatform,
) -> HashMap<OsString, OsString>
where
    B: IntoIterator<Item = (OsString, OsString)>,
    O: IntoIterator<Item = (K, V)>,
    K: Into<OsString>,
    V: Into<OsString>,
{
    let mut env: HashMap<OsString, OsString> = base
        .into_iter()
        .filter(|(key, _)| match platform {
            HostPlatform::Windows => WINDOWS_KEPT_VARIABLES
                .iter()
                .any(|kept| key.eq_ignore_ascii_case(kept)),
            HostPlatform::Unix => true,
        })
        .collect();
    for (key, value) in overrides {
        env.insert(key.into(), value.into());
    }
    env
}

/// Runs one process per request following the CGI convention.
#[derive(Debug, Clone)]
pub struct CgiExecutor {
    application: ApplicationConfig,
    platform: HostPlatform,
}

impl CgiExecutor {
    pub fn new(application: ApplicationConfig) -> Self {
        Self {
            application,
            platform: HostPlatform::current(),
        }
    }

    /// Run the application with `variables` in its environment and `body` on
    /// its standard input, and parse what it writes to standard output.
    ///
    /// Each line on standard error is logged at error level in `span`. The
    /// call returns once the process has exited.
    pub async fn execute(
        &self,
        variables: &HashMap<String, String>,
        body: Option<Body>,
        span: &tracing::Span,
    ) -> Result<CgiResponse> {
        let env = effective_environment(
            std::env::vars_os(),
            self.application
                .environment
                .iter()
                .chain(variables.iter())
                .map(|(k, v)| (k.clone(), v.clone())),
            self.platform,
        );

        let mut child = Command::new(&self.application.path)
            .args(&self.application.arguments)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                anyhow!(
                    "failed to start CGI application {}: {}",
                    self.application.path.display(),
                    e
                )
            })?;
        debug!(
            parent: span,
            program = %self.application.path.display(),
            pid = child.id(),
            "started CGI process"
        );

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("CGI child stdin unavailable"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("CGI child stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("CGI child stderr unavailable"))?;

        let stdin_task = tokio::spawn(
            async move {
                if let Err(e) = pump_stdin(stdin, body).await {
                    debug!(error = %e, "CGI process did not take the whole request body");
                }
            }
            .instrument(span.clone()),
        );
        let stderr_task = tokio::spawn(
            async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => error!(line = %line, "CGI error output"),
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "failed to read CGI error output");
                            break;
                        }
                    }
                }
            }
            .instrument(span.clone()),
        );

        let mut output = Vec::new();
        let read = stdout.read_to_end(&mut output).await;
        let _ = stdin_task.await;
        let _ = stderr_task.await;
        let status = child.wait().await?;
        read.map_err(|e| anyhow!("failed to read CGI output: {}", e))?;

        if !status.success() {
            warn!(
                parent: span,
                program = %self.application.path.display(),
                exit_code = status.code(),
                "CGI process exited with error"
            );
        }

        parse_cgi_output(&mut Cursor::new(output))
    }
}

async fn pump_stdin(mut stdin: ChildStdin, body: Option<Body>) -> Result<()> {
    if let Some(mut body) = body {
        while let Some(chunk) = body.data().await {
            stdin.write_all(&chunk?).await?;
        }
    }
    stdin.shutdown().await?;
    Ok(())
}
