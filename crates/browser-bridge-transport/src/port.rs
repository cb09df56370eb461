//! Freeing a listening port held by another process.

use std::{
    io,
    net::SocketAddr,
    path::PathBuf,
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio::process::Command;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Port eviction error.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("Executable not found: {0}")]
    ToolMissing(&'static str),
    #[error("Failed to run {tool}: {source}")]
    Command {
        tool: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Failed to kill process {pid}")]
    KillFailed { pid: u32 },
    #[error("Port {0} is still in use")]
    StillBusy(u16),
}

/// Whether something already listens on `addr`.
#[must_use]
pub fn is_port_in_use(addr: SocketAddr) -> bool {
    std::net::TcpListener::bind(addr).is_err_and(|e| e.kind() == io::ErrorKind::AddrInUse)
}

/// Make sure `addr` is free, killing its current owner if needed.
///
/// # Errors
/// Returns error if the owner cannot be found or killed, or the port is
/// still taken after `wait`.
pub async fn free_port(addr: SocketAddr, wait: Duration) -> Result<(), PortError> {
    if !is_port_in_use(addr) {
        return Ok(());
    }
    let killed = evict(addr.port()).await?;
    tracing::info!(port = addr.port(), killed, "Evicted previous listener");

    let deadline = Instant::now() + wait;
    while is_port_in_use(addr) {
        if Instant::now() >= deadline {
            return Err(PortError::StillBusy(addr.port()));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Ok(())
}

/// Kill every other process listening on `port`. Returns how many.
///
/// # Errors
/// Returns error if the platform tools are missing or a kill fails.
pub async fn evict(port: u16) -> Result<usize, PortError> {
    let own = std::process::id();
    let pids: Vec<u32> = listening_pids(port)
        .await?
        .into_iter()
        .filter(|&pid| pid != own)
        .collect();
    for &pid in &pids {
        kill(pid).await?;
    }
    Ok(pids.len())
}

async fn listening_pids(port: u16) -> Result<Vec<u32>, PortError> {
    if cfg!(windows) {
        let output = run("netstat", &["-ano", "-p", "tcp"]).await?;
        Ok(parse_netstat(&output, port))
    } else {
        let target = format!("tcp:{port}");
        let output = run("lsof", &["-t", "-i", &target, "-sTCP:LISTEN"]).await?;
        Ok(parse_lsof(&output))
    }
}

async fn kill(pid: u32) -> Result<(), PortError> {
    let pid_arg = pid.to_string();
    let (tool, args): (&'static str, Vec<&str>) = if cfg!(windows) {
        ("taskkill", vec!["/F", "/PID", &pid_arg])
    } else {
        ("kill", vec!["-9", &pid_arg])
    };
    let program = resolve(tool).await?;
    let status = Command::new(program)
        .args(&args)
        .status()
        .await
        .map_err(|source| PortError::Command { tool, source })?;
    if status.success() {
        tracing::debug!(pid, "Killed process");
        Ok(())
    } else {
        Err(PortError::KillFailed { pid })
    }
}

async fn run(tool: &'static str, args: &[&str]) -> Result<String, PortError> {
    let program = resolve(tool).await?;
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| PortError::Command { tool, source })?;
    // lsof exits non-zero when nothing matches; the output is still meaningful.
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn resolve(tool: &'static str) -> Result<PathBuf, PortError> {
    tokio::task::spawn_blocking(move || which::which(tool))
        .await
        .ok()
        .and_then(Result::ok)
        .ok_or(PortError::ToolMissing(tool))
}

fn parse_lsof(output: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

fn parse_netstat(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            match cols.as_slice() {
                [proto, local, _remote, state, pid]
                    if proto.eq_ignore_ascii_case("tcp")
                        && local.ends_with(&suffix)
                        && state.eq_ignore_ascii_case("listening") =>
                {
                    pid.parse().ok()
                }
                _ => None,
            }
        })
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}
