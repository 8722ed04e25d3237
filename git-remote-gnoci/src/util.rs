//! Small helpers shared by the local git operations in [`crate::git_repo`]
//! and [`crate::cmd_fetch`].

use std::ffi::OsString;

use once_cell::sync::OnceCell;

/// SSH/askpass environment variables a spawned `git` subprocess needs to
/// reuse the invoking user's agent and credential prompts. Captured once at
/// startup since `std::env::var_os` is not safe to call from multiple
/// threads concurrently with mutation.
struct Environment {
    ssh_agent_pid: Option<OsString>,
    ssh_auth_sock: Option<OsString>,
    git_ssh_command: Option<OsString>,
    git_ssh: Option<OsString>,
    git_askpass: Option<OsString>,
}

impl Environment {
    fn new() -> Environment {
        Environment {
            ssh_agent_pid: std::env::var_os("SSH_AGENT_PID"),
            ssh_auth_sock: std::env::var_os("SSH_AUTH_SOCK"),
            git_ssh_command: std::env::var_os("GIT_SSH_COMMAND"),
            git_ssh: std::env::var_os("GIT_SSH"),
            git_askpass: std::env::var_os("GIT_ASKPASS"),
        }
    }

    fn apply(&self, cmd: &mut std::process::Command) {
        Self::maybe_set(cmd, "SSH_AGENT_PID", self.ssh_agent_pid.as_ref());
        Self::maybe_set(cmd, "SSH_AUTH_SOCK", self.ssh_auth_sock.as_ref());
        Self::maybe_set(cmd, "GIT_SSH_COMMAND", self.git_ssh_command.as_ref());
        Self::maybe_set(cmd, "GIT_SSH", self.git_ssh.as_ref());
        Self::maybe_set(cmd, "GIT_ASKPASS", self.git_askpass.as_ref());
    }

    fn maybe_set(cmd: &mut std::process::Command, key: &str, value: Option<&OsString>) {
        if let Some(value) = value {
            cmd.env(key, value);
        }
    }
}

static CELL: OnceCell<Environment> = OnceCell::new();

/// A `git` subprocess invocation with a clean environment plus the handful
/// of SSH/askpass variables a push or fetch might need. Only `index-pack`
/// and `pack-objects` are ever spawned through this, neither of which
/// requires a committer identity.
pub fn git_command() -> std::process::Command {
    let environment = CELL.get_or_init(Environment::new);
    let mut cmd = std::process::Command::new("git");
    cmd.env_clear().env("GIT_CONFIG_NOSYSTEM", "");
    environment.apply(&mut cmd);
    cmd
}
