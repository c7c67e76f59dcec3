//! Tunnel process supervision
//!
//! The tunnel itself is an external black-box binary (OpenVPN in the
//! reference deployment) launched under an elevation prefix. The
//! supervisor writes the endpoint config and credentials to scratch
//! files, spawns the process with stdout piped, and scans its output
//! for a readiness marker before declaring the tunnel up. A monitor
//! task keeps logging output and publishes the exit code through a
//! watch channel, which doubles as the asynchronous crash notification.
//!
//! Because the process runs elevated, signals are delivered through the
//! same elevation prefix (`sudo -n kill ...`) rather than directly.

use std::process::Stdio;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout};
use tokio::sync::watch;
use tokio::time::timeout;

use tw_core::config::TunnelConfig;
use tw_core::error::SupervisorError;
use tw_core::types::{Credentials, Host};

/// Handle to a running tunnel process
#[derive(Debug)]
pub struct TunnelHandle {
    pid: u32,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl TunnelHandle {
    /// Build a handle from a pid and an exit watch. The sender side
    /// belongs to whatever is monitoring the process; it publishes the
    /// exit code exactly once.
    pub fn new(pid: u32, exit_rx: watch::Receiver<Option<i32>>) -> Self {
        Self { pid, exit_rx }
    }

    /// Process ID of the tunnel process
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// A fresh watch on the process exit, for concurrent waiters
    pub fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
        self.exit_rx.clone()
    }

    /// Wait until the process has exited. Returns the exit code when
    /// known, `None` if the monitor went away without reporting one.
    pub async fn exited(&mut self) -> Option<i32> {
        match self.exit_rx.wait_for(|code| code.is_some()).await {
            Ok(code) => *code,
            Err(_) => None,
        }
    }
}

/// Starts and stops tunnel processes
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Launch the tunnel against the host and wait for readiness.
    /// On failure no process is left behind.
    async fn start(
        &self,
        host: &Host,
        credentials: &Credentials,
    ) -> Result<TunnelHandle, SupervisorError>;

    /// Terminate the process: graceful first, forced after the grace
    /// period. Returns `Ok` only once the process is confirmed gone.
    async fn stop(&self, handle: TunnelHandle) -> Result<(), SupervisorError>;
}

/// Supervisor for the external tunnel binary
pub struct TunnelSupervisor {
    config: TunnelConfig,
}

impl TunnelSupervisor {
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    fn spawn_process(
        &self,
        config_path: &std::path::Path,
        auth_path: &std::path::Path,
    ) -> Result<Child, SupervisorError> {
        let mut argv: Vec<String> = self.config.elevation_command.clone();
        argv.push(self.config.binary.display().to_string());
        argv.extend([
            "--suppress-timestamps".to_string(),
            "--config".to_string(),
            config_path.display().to_string(),
            "--auth-user-pass".to_string(),
            auth_path.display().to_string(),
        ]);

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SupervisorError::Spawn("empty tunnel command".to_string()))?;

        tracing::debug!(command = %program, "spawning tunnel process");
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SupervisorError::Spawn(e.to_string()))?;
        Ok(child)
    }

    /// Scan stdout until the readiness marker appears. An EOF before
    /// the marker means the process died (or closed stdout, which we
    /// cannot tell apart from death and treat the same way).
    async fn await_ready(
        &self,
        lines: &mut Lines<BufReader<ChildStdout>>,
        pid: u32,
    ) -> Result<(), SupervisorError> {
        let marker = self.config.ready_marker.as_str();
        let scan = async {
            loop {
                match lines.next_line().await? {
                    Some(line) => {
                        tracing::info!(pid, stream = "stdout", "{}", line.trim_end());
                        if line.contains(marker) {
                            return Ok(());
                        }
                    }
                    None => return Err(SupervisorError::EarlyExit(None)),
                }
            }
        };

        match timeout(self.config.ready_timeout, scan).await {
            Ok(result) => result,
            Err(_) => Err(SupervisorError::ReadinessTimeout(self.config.ready_timeout)),
        }
    }

    /// Deliver a signal through the elevation prefix
    async fn signal(&self, pid: u32, sig: &str) {
        let mut argv: Vec<String> = self.config.elevation_command.clone();
        argv.extend(["kill".to_string(), sig.to_string(), pid.to_string()]);
        let (program, args) = match argv.split_first() {
            Some(split) => split,
            None => return,
        };
        match tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) if !status.success() => {
                // usually means the process is already gone
                tracing::debug!(pid, sig, "kill returned non-zero");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(pid, sig, error = %e, "failed to signal tunnel process"),
        }
    }

    /// Kill and reap a process that failed during startup
    async fn cleanup_failed_start(&self, mut child: Child, pid: u32) {
        self.signal(pid, "-TERM").await;
        if timeout(self.config.stop_grace, child.wait()).await.is_err() {
            self.signal(pid, "-KILL").await;
            let _ = child.wait().await;
        }
    }
}

#[async_trait]
impl Supervisor for TunnelSupervisor {
    async fn start(
        &self,
        host: &Host,
        credentials: &Credentials,
    ) -> Result<TunnelHandle, SupervisorError> {
        // scratch files live until readiness is decided; the tunnel
        // binary reads them at startup
        let config_file = write_scratch(&tunnel_config_contents(host))?;
        let auth_file = write_scratch(&format!(
            "{}\n{}\n",
            credentials.username, credentials.password
        ))?;

        let mut child = self.spawn_process(config_file.path(), auth_file.path())?;
        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::Spawn("tunnel process has no pid".to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::Spawn("tunnel stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        if let Err(err) = self.await_ready(&mut lines, pid).await {
            tracing::error!(pid, error = %err, "tunnel failed to come up");
            self.cleanup_failed_start(child, pid).await;
            return Err(err);
        }

        tracing::info!(pid, host = %host.id, "tunnel up");

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(monitor(child, lines, pid, exit_tx));

        Ok(TunnelHandle::new(pid, exit_rx))
    }

    async fn stop(&self, mut handle: TunnelHandle) -> Result<(), SupervisorError> {
        let pid = handle.pid();
        tracing::debug!(pid, "stopping tunnel process");

        self.signal(pid, "-TERM").await;
        if timeout(self.config.stop_grace, handle.exited()).await.is_err() {
            tracing::warn!(pid, "tunnel ignored SIGTERM, killing");
            self.signal(pid, "-KILL").await;
            if timeout(self.config.stop_grace, handle.exited()).await.is_err() {
                // signals go through the elevation prefix, so a dead
                // grant can leave the process untouched
                tracing::error!(pid, "tunnel process survived SIGKILL");
                return Err(SupervisorError::StopFailed(pid));
            }
        }

        tracing::info!(pid, "tunnel down");
        Ok(())
    }
}

/// Follow the process after readiness: log its output, reap it, and
/// publish the exit code.
async fn monitor(
    mut child: Child,
    mut lines: Lines<BufReader<ChildStdout>>,
    pid: u32,
    exit_tx: watch::Sender<Option<i32>>,
) {
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::info!(pid, stream = "stdout", "{}", line.trim_end());
    }
    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(pid, error = %e, "failed to reap tunnel process");
            None
        }
    };
    tracing::debug!(pid, ?code, "tunnel process exited");
    let _ = exit_tx.send(Some(code.unwrap_or(-1)));
}

fn tunnel_config_contents(host: &Host) -> String {
    format!("client\nremote {}\nnobind\n", host.address)
}

fn write_scratch(contents: &str) -> Result<NamedTempFile, SupervisorError> {
    use std::io::Write;
    let mut file = NamedTempFile::new()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    use tw_core::types::{CountryCode, HostId};

    fn test_host() -> Host {
        Host {
            id: HostId::new("us1"),
            country: CountryCode::parse("US").unwrap(),
            country_name: "United States".to_string(),
            address: "us1.example.net".to_string(),
            load: 10,
            refreshed_at: SystemTime::now(),
        }
    }

    fn test_creds() -> Credentials {
        Credentials::new("user", "pass")
    }

    /// A fake tunnel: a shell script that ignores its arguments
    fn fake_tunnel(script_body: &str) -> tempfile::TempPath {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "#!/bin/sh\n{script_body}").unwrap();
        file.flush().unwrap();
        let mut perms = file.as_file().metadata().unwrap().permissions();
        perms.set_mode(0o755);
        file.as_file().set_permissions(perms).unwrap();
        // close the write handle so exec doesn't hit ETXTBSY
        file.into_temp_path()
    }

    fn supervisor_for(script: &std::path::Path, ready_timeout: Duration) -> TunnelSupervisor {
        TunnelSupervisor::new(TunnelConfig {
            binary: script.to_path_buf(),
            elevation_command: vec![],
            ready_marker: "TUNNEL READY".to_string(),
            ready_timeout,
            stop_grace: Duration::from_secs(2),
            ..Default::default()
        })
    }

    fn process_alive(pid: u32) -> bool {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn start_waits_for_readiness_and_stop_terminates() {
        let script = fake_tunnel("echo TUNNEL READY\nsleep 60");
        let supervisor = supervisor_for(&script, Duration::from_secs(5));

        let handle = supervisor.start(&test_host(), &test_creds()).await.unwrap();
        let pid = handle.pid();
        assert!(process_alive(pid));

        supervisor.stop(handle).await.unwrap();
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn readiness_timeout_kills_the_process() {
        let script = fake_tunnel("sleep 60");
        let supervisor = supervisor_for(&script, Duration::from_millis(300));

        let err = supervisor
            .start(&test_host(), &test_creds())
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ReadinessTimeout(_)));
    }

    #[tokio::test]
    async fn early_exit_is_a_spawn_failure() {
        let script = fake_tunnel("echo nope\nexit 3");
        let supervisor = supervisor_for(&script, Duration::from_secs(5));

        let err = supervisor
            .start(&test_host(), &test_creds())
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::EarlyExit(_)));
    }

    #[tokio::test]
    async fn stop_errors_when_the_process_survives_escalation() {
        let script = fake_tunnel("sleep 60");
        // an elevation prefix of `true` swallows both signals, as a
        // dead sudo grant would
        let supervisor = TunnelSupervisor::new(TunnelConfig {
            binary: script.to_path_buf(),
            elevation_command: vec!["true".to_string()],
            stop_grace: Duration::from_millis(100),
            ..Default::default()
        });

        // the sender stays alive and never reports an exit
        let (_exit_tx, exit_rx) = watch::channel(None);
        let handle = TunnelHandle::new(12345, exit_rx);

        let err = supervisor.stop(handle).await.unwrap_err();
        assert!(matches!(err, SupervisorError::StopFailed(12345)));
    }

    #[tokio::test]
    async fn crash_is_reported_through_the_handle() {
        let script = fake_tunnel("echo TUNNEL READY\nsleep 0.2\nexit 7");
        let supervisor = supervisor_for(&script, Duration::from_secs(5));

        let mut handle = supervisor.start(&test_host(), &test_creds()).await.unwrap();
        let code = timeout(Duration::from_secs(5), handle.exited())
            .await
            .expect("crash never reported");
        assert_eq!(code, Some(7));
    }
}
