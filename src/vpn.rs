use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
    sync::OnceLock,
    time::Duration,
};

use async_trait::async_trait;
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use rand::seq::SliceRandom;
use regex::Regex;
use tempfile::NamedTempFile;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStdout, Command},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};

use crate::{config::Credentials, Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);
const READY_MARKER: &str = "Initialization Sequence Completed";
const FAILURE_MARKERS: [&str; 4] = ["ERROR", "FAILED", "AUTH_FAILED", "Exiting due to fatal error"];

/// Outbound tunnel the collector routes its requests through.
#[async_trait]
pub trait Tunnel: Send {
    /// Brings up the tunnel on the next server in rotation.
    async fn connect_next(&mut self) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;
    fn is_connected(&mut self) -> bool;
}

/// One `remote host port` entry and the `.ovpn` file it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Remote {
    pub config: PathBuf,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn remote_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*remote\s+(\S+)\s+(\d+)").expect("valid remote regex"))
}

/// Extracts every `remote <host> <port>` line of an `.ovpn` file.
pub fn parse_remotes(config: &Path, text: &str) -> Vec<Remote> {
    text.lines()
        .filter_map(|line| {
            let caps = remote_regex().captures(line)?;
            let port = caps[2].parse().ok()?;
            Some(Remote {
                config: config.to_path_buf(),
                host: caps[1].to_string(),
                port,
            })
        })
        .collect()
}

/// Rewrites an `.ovpn` template so that it targets `remote` only and reads the login
/// from `credentials`.
pub fn render_config(template: &str, credentials: &Path, remote: &Remote) -> String {
    let mut out = String::with_capacity(template.len() + 64);
    for line in template.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("remote ") {
            continue;
        }
        if trimmed.starts_with("auth-user-pass") {
            out.push_str(&format!("auth-user-pass \"{}\"\n", credentials.display()));
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    out.push_str(&format!("remote {} {}\n", remote.host, remote.port));
    out
}

#[derive(Debug, PartialEq, Eq)]
pub enum LineStatus {
    Ready,
    Failed,
    Pending,
}

/// Reads one line of OpenVPN output.
pub fn classify_line(line: &str) -> LineStatus {
    if line.contains(READY_MARKER) {
        LineStatus::Ready
    } else if FAILURE_MARKERS.iter().any(|m| line.contains(m)) {
        LineStatus::Failed
    } else {
        LineStatus::Pending
    }
}

/// Every remote of every `.ovpn` file in a directory, shuffled once and then cycled.
#[derive(Debug)]
pub struct ServerPool {
    remotes: Vec<Remote>,
    cursor: usize,
}

impl ServerPool {
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut ovpn_files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "ovpn") {
                ovpn_files.push(path);
            }
        }
        if ovpn_files.is_empty() {
            return Err(Error::NoServerConfigs(dir.to_path_buf()));
        }

        let mut remotes = Vec::new();
        for path in &ovpn_files {
            let text = std::fs::read_to_string(path)?;
            remotes.extend(parse_remotes(path, &text));
        }
        if remotes.is_empty() {
            return Err(Error::NoRemotes(dir.to_path_buf()));
        }

        info!(
            "{} VPN servers loaded from {} configuration files.",
            remotes.len(),
            ovpn_files.len()
        );
        Ok(Self::from_remotes(remotes))
    }

    pub fn from_remotes(mut remotes: Vec<Remote>) -> Self {
        remotes.shuffle(&mut rand::rng());
        ServerPool { remotes, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.remotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }

    /// Never runs out: wraps back to the first remote after the last.
    pub fn next_remote(&mut self) -> Option<&Remote> {
        if self.remotes.is_empty() {
            return None;
        }
        let remote = &self.remotes[self.cursor % self.remotes.len()];
        self.cursor = (self.cursor + 1) % self.remotes.len();
        Some(remote)
    }
}

struct Connection {
    child: Child,
    remote: Remote,
    // Deleted on drop.
    _config: NamedTempFile,
    log_drain: JoinHandle<()>,
}

/// Drives the system `openvpn` binary, one server at a time.
pub struct VpnHandler {
    pool: ServerPool,
    credentials: Credentials,
    active: Option<Connection>,
}

impl VpnHandler {
    pub fn new(pool: ServerPool, credentials: Credentials) -> Self {
        VpnHandler {
            pool,
            credentials,
            active: None,
        }
    }

    pub fn connected_server(&self) -> Option<&Remote> {
        self.active.as_ref().map(|c| &c.remote)
    }

    async fn connect_to(&self, remote: Remote) -> Result<Connection> {
        let template = tokio::fs::read_to_string(&remote.config).await?;
        let rendered = render_config(&template, &self.credentials.path, &remote);

        let config = tempfile::Builder::new().suffix(".ovpn").tempfile()?;
        tokio::fs::write(config.path(), rendered).await?;

        info!("Connecting to VPN server: {remote}");
        let mut child = Command::new("sudo")
            .arg("openvpn")
            .arg("--config")
            .arg(config.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| Error::VpnConnect {
            server: remote.to_string(),
            reason: "openvpn stdout unavailable".into(),
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let outcome = timeout(CONNECT_TIMEOUT, wait_until_ready(&mut lines)).await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(reason),
            Err(_) => Some(format!("no confirmation after {}s", CONNECT_TIMEOUT.as_secs())),
        };
        if let Some(reason) = failure {
            // sudo can't relay SIGKILL, take down the whole group.
            if let Some(pid) = child.id() {
                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
            if let Err(e) = child.kill().await {
                warn!("Couldn't kill openvpn for {remote}: {e}");
            }
            return Err(Error::VpnConnect {
                server: remote.to_string(),
                reason,
            });
        }

        info!("VPN connection established: {remote}");
        // OpenVPN blocks once its stdout pipe fills up, keep reading it.
        let log_drain = tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "openvpn", "{line}");
            }
        });

        Ok(Connection {
            child,
            remote,
            _config: config,
            log_drain,
        })
    }
}

async fn wait_until_ready(
    lines: &mut tokio::io::Lines<BufReader<ChildStdout>>,
) -> core::result::Result<(), String> {
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return Err("openvpn exited before the tunnel was up".into()),
            Err(e) => return Err(e.to_string()),
        };
        debug!(target: "openvpn", "{}", line.trim());
        match classify_line(&line) {
            LineStatus::Ready => return Ok(()),
            LineStatus::Failed => return Err(line.trim().to_string()),
            LineStatus::Pending => {}
        }
    }
}

#[async_trait]
impl Tunnel for VpnHandler {
    /// Tries each server of the pool at most once.
    async fn connect_next(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Err(Error::VpnAlreadyConnected);
        }
        for _ in 0..self.pool.len() {
            let Some(remote) = self.pool.next_remote().cloned() else {
                break;
            };
            match self.connect_to(remote).await {
                Ok(conn) => {
                    self.active = Some(conn);
                    return Ok(());
                }
                Err(e) => error!("{e}"),
            }
        }
        Err(Error::VpnExhausted(self.pool.len()))
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(mut conn) = self.active.take() else {
            warn!("No active VPN connection to disconnect.");
            return Ok(());
        };
        info!("Disconnecting from VPN server: {}", conn.remote);
        conn.log_drain.abort();

        let Some(pid) = conn.child.id() else {
            // Already reaped.
            return Ok(());
        };
        let group = Pid::from_raw(pid as i32);
        match killpg(group, Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => return Err(e.into()),
        }

        match timeout(TERMINATE_TIMEOUT, conn.child.wait()).await {
            Ok(status) => {
                status?;
                info!("VPN terminated.");
            }
            Err(_) => {
                warn!("VPN didn't terminate gracefully, forcing shutdown...");
                match killpg(group, Signal::SIGKILL) {
                    Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                    Err(e) => return Err(e.into()),
                }
                conn.child.wait().await?;
            }
        }
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        let Some(conn) = self.active.as_mut() else {
            return false;
        };
        match conn.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!("VPN process exited unexpectedly: {status}");
                if let Some(conn) = self.active.take() {
                    conn.log_drain.abort();
                }
                false
            }
            Err(e) => {
                warn!("Couldn't poll the VPN process: {e}");
                false
            }
        }
    }
}
