use std::{
    path::Path,
    process::{ExitStatus, Stdio},
};

use anyhow::Context;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
};
use tracing::debug;

/// Identity injected into every spawned child.
pub struct SpawnEnv<'a> {
    pub instance_id: &'a str,
    pub node_id: &'a str,
    pub controller_grpc_addr: &'a str,
    pub app_name: Option<&'a str>,
    pub app_version: Option<&'a str>,
}

/// A live child process, tracked by the reconciler. The child runs in its
/// own session, so its pid doubles as the process-group id and signals to
/// `-pgid` reach the entire subtree.
pub struct ChildHandle {
    child: Child,
    pid: u32,
    pgid: i32,
    exit: Option<ExitStatus>,
}

impl ChildHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking reap. The first observed exit status is cached so later
    /// calls keep answering consistently.
    pub fn try_reap(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none()
            && let Ok(Some(status)) = self.child.try_wait()
        {
            self.exit = Some(status);
        }
        self.exit
    }

    pub fn is_alive(&mut self) -> bool {
        self.try_reap().is_none()
    }

    pub fn send_term(&self) {
        signal_group(self.pgid, libc::SIGTERM);
    }

    pub fn send_kill(&self) {
        signal_group(self.pgid, libc::SIGKILL);
    }

    /// Hand the child to a background task so a SIGKILLed process that has
    /// not exited yet is still reaped and never left as a zombie.
    pub fn reap_in_background(mut self) {
        if self.try_reap().is_some() {
            return;
        }
        tokio::spawn(async move {
            let _ = self.child.wait().await;
        });
    }
}

#[cfg(unix)]
fn signal_group(pgid: i32, signal: i32) {
    unsafe {
        libc::kill(-pgid, signal);
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: i32, _signal: i32) {}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the agent process dies (crash/kill), ensure the child is terminated.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// Normalise a controller-supplied command line: strip leading whitespace
/// and commas (tolerating controller formatting slop), default to
/// `./start.sh` when nothing is left.
pub fn normalize_cmdline(raw: &str) -> String {
    let trimmed = raw.trim_start_matches([' ', '\t', '\r', '\n', ',']);
    let trimmed = trimmed.trim_end();
    if trimmed.is_empty() {
        "./start.sh".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Spawn the instance's command under a shell wrapper, in a new session.
/// The effective command is `cd <app_dir> && <cmdline>`; a failed exec
/// inside the shell surfaces as exit code 127 and is reported like any
/// other child failure.
pub fn spawn(app_dir: &Path, start_cmd: &str, env: &SpawnEnv<'_>) -> anyhow::Result<ChildHandle> {
    let cmdline = normalize_cmdline(start_cmd);
    let full_cmd = format!("cd '{}' && {}", app_dir.display(), cmdline);
    debug!(instance_id = env.instance_id, %full_cmd, "spawning child");

    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(&full_cmd)
        .env("PLUM_INSTANCE_ID", env.instance_id)
        .env("WORKER_NODE_ID", env.node_id)
        .env("CONTROLLER_GRPC_ADDR", env.controller_grpc_addr)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(name) = env.app_name.filter(|v| !v.is_empty()) {
        cmd.env("PLUM_APP_NAME", name);
    }
    if let Some(version) = env.app_version.filter(|v| !v.is_empty()) {
        cmd.env("PLUM_APP_VERSION", version);
    }

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn instance command (cwd {})", app_dir.display()))?;
    let pid = child
        .id()
        .ok_or_else(|| anyhow::anyhow!("child exited before a pid could be read"))?;

    drain_output(env.instance_id, &mut child);

    Ok(ChildHandle {
        child,
        pid,
        pgid: pid as i32,
        exit: None,
    })
}

/// Forward child stdout/stderr line-by-line into the agent log, tagged with
/// the owning instance.
fn drain_output(instance_id: &str, child: &mut Child) {
    if let Some(out) = child.stdout.take() {
        let instance_id = instance_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(instance_id = %instance_id, "[stdout] {line}");
            }
        });
    }
    if let Some(err) = child.stderr.take() {
        let instance_id = instance_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(instance_id = %instance_id, "[stderr] {line}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_cmdline;

    #[test]
    fn empty_command_defaults_to_start_script() {
        assert_eq!(normalize_cmdline(""), "./start.sh");
        assert_eq!(normalize_cmdline("   "), "./start.sh");
        assert_eq!(normalize_cmdline(",,"), "./start.sh");
    }

    #[test]
    fn leading_commas_and_whitespace_are_stripped() {
        assert_eq!(normalize_cmdline(", ./run --fast"), "./run --fast");
        assert_eq!(normalize_cmdline("\t\n,./start.sh -v"), "./start.sh -v");
    }

    #[test]
    fn plain_commands_pass_through() {
        assert_eq!(normalize_cmdline("./start.sh"), "./start.sh");
        assert_eq!(
            normalize_cmdline("python3 server.py --port 8000"),
            "python3 server.py --port 8000"
        );
    }
}
