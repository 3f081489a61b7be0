use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};

const DAEMON_BIN: &str = "syncerd";

/// Pids of running `syncerd` processes, found through `/proc/<pid>/exe`.
pub fn daemon_pids() -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut pids: Vec<u32> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let pid = entry.file_name().to_str()?.parse::<u32>().ok()?;
            let exe = std::fs::read_link(entry.path().join("exe")).ok()?;
            is_daemon_exe(&exe).then_some(pid)
        })
        .collect();
    pids.sort_unstable();
    pids
}

fn is_daemon_exe(exe: &Path) -> bool {
    exe.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.trim_end_matches(" (deleted)") == DAEMON_BIN)
        .unwrap_or(false)
}

/// `syncerd` next to the running executable, otherwise whatever `PATH` resolves.
fn daemon_program() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DAEMON_BIN)))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(DAEMON_BIN))
}

pub fn start_daemon() -> Result<()> {
    let running = daemon_pids();
    if let Some(pid) = running.first() {
        bail!("daemon is already running (pid {pid})");
    }
    let program = daemon_program();
    let mut command = Command::new(&program);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let child = command
        .spawn()
        .with_context(|| format!("failed to start {}", program.display()))?;
    println!("daemon started (pid {})", child.id());
    Ok(())
}

pub fn stop_daemon() -> Result<()> {
    let pids = daemon_pids();
    if pids.is_empty() {
        println!("daemon is not running");
        return Ok(());
    }
    for pid in pids {
        let status = Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status()
            .context("failed to run kill")?;
        if !status.success() {
            bail!("failed to stop daemon (pid {pid})");
        }
        println!("daemon stopped (pid {pid})");
    }
    Ok(())
}
