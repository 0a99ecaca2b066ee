// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::command::{CommandOutput, CommandRunner, Invocation};
use crate::config::Config;
use crate::{Error, Result};

use log::{debug, info};

use std::path::{Path, PathBuf};

pub const CHANNEL: &str = "blocking-channel";
const CONTEXT_FIELDS: &[&str] = &["vpid", "vtid"];
const PID_FILE: &str = ".lttng/lttng-sessiond.pid";

/// Controls one LTTng session daemon.
///
/// Every command runs with `LTTNG_HOME` pointed at a per-session directory
/// so concurrent sessions sharing a home filesystem do not fight over the
/// same daemon lock.
pub struct DaemonControl<'a> {
    config: &'a Config,
    runner: &'a dyn CommandRunner,
    home: PathBuf,
}

impl<'a> DaemonControl<'a> {
    pub fn new(config: &'a Config, runner: &'a dyn CommandRunner, home: &Path) -> Self {
        Self {
            config,
            runner,
            home: home.to_path_buf(),
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn pid_file(&self) -> PathBuf {
        self.home.join(PID_FILE)
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let invocation = Invocation::new(program)
            .args(args)
            .env("LTTNG_HOME", &self.home.to_string_lossy());
        debug!("LTTNG_HOME={:?} {}", self.home, invocation.command_line());
        self.runner.run(&invocation)
    }

    fn lttng(&self, args: &[&str]) -> Result<CommandOutput> {
        self.run(&self.config.lttng, args)
    }

    pub fn start_daemon(&self) -> Result<()> {
        std::fs::create_dir_all(&self.home)?;
        info!("starting session daemon in {:?}", self.home);
        self.run(&self.config.lttng_sessiond, &["--daemonize"])?;
        Ok(())
    }

    pub fn create_session(&self, session: &str, output: &Path) -> Result<()> {
        let output = format!("--output={}", output.to_string_lossy());
        self.lttng(&["create", session, output.as_str()])?;
        Ok(())
    }

    /// Creates the blocking userspace channel and attaches the context
    /// fields every event carries.
    pub fn enable_channel(&self, session: &str) -> Result<()> {
        let session_arg = format!("--session={}", session);
        let channel_arg = format!("--channel={}", CHANNEL);
        self.lttng(&[
            "enable-channel",
            "--userspace",
            session_arg.as_str(),
            "--blocking-timeout=inf",
            CHANNEL,
        ])?;
        let mut args = vec![
            "add-context",
            "--userspace",
            session_arg.as_str(),
            channel_arg.as_str(),
        ];
        for field in CONTEXT_FIELDS {
            args.extend(["-t", *field]);
        }
        self.lttng(&args)?;
        Ok(())
    }

    pub fn enable_events(&self, session: &str, globs: &[&str]) -> Result<()> {
        if globs.is_empty() {
            return Ok(());
        }
        let session_arg = format!("--session={}", session);
        let channel_arg = format!("--channel={}", CHANNEL);
        let events = globs.join(",");
        self.lttng(&[
            "enable-event",
            "--userspace",
            session_arg.as_str(),
            channel_arg.as_str(),
            events.as_str(),
        ])?;
        Ok(())
    }

    pub fn start_session(&self, session: &str) -> Result<()> {
        self.lttng(&["start", session])?;
        Ok(())
    }

    pub fn stop_session(&self, session: &str) -> Result<()> {
        self.lttng(&["stop", session])?;
        Ok(())
    }

    pub fn destroy_session(&self, session: &str) -> Result<()> {
        self.lttng(&["destroy", session])?;
        Ok(())
    }

    pub fn daemon_pid(&self) -> Result<libc::pid_t> {
        let path = self.pid_file();
        let content = std::fs::read_to_string(&path).map_err(|e| Error::DaemonPid {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let pid: libc::pid_t = content.trim().parse().map_err(|e| Error::DaemonPid {
            path: path.clone(),
            message: format!("{:?}: {}", content.trim(), e),
        })?;
        // kill(2) treats 0 and negative pids as process groups
        if pid <= 0 {
            return Err(Error::DaemonPid {
                path,
                message: format!("{} is not a process id", pid),
            });
        }
        Ok(pid)
    }

    pub fn kill_daemon(&self) -> Result<()> {
        let pid = self.daemon_pid()?;
        info!("stopping session daemon {}", pid);
        self.runner.terminate(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::ScriptedRunner;
    use crate::env_probe::MapEnv;

    #[test]
    fn commands_use_session_home() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_env(&MapEnv::new());
        let runner = ScriptedRunner::succeed();
        let home = dir.path().join("lttng-home");
        let daemon = DaemonControl::new(&config, &runner, &home);

        daemon.start_daemon().unwrap();
        daemon.create_session("s1", Path::new("/traces/node0")).unwrap();
        daemon.enable_channel("s1").unwrap();
        daemon
            .enable_events("s1", &["lttng_ust_opencl:*", "lttng_ust_thapi:*"])
            .unwrap();
        daemon.enable_events("s1", &[]).unwrap();
        daemon.start_session("s1").unwrap();

        assert!(home.is_dir());
        let calls = runner.calls();
        let lines: Vec<String> = calls.iter().map(Invocation::command_line).collect();
        assert_eq!(
            lines,
            vec![
                "lttng-sessiond --daemonize",
                "lttng create s1 --output=/traces/node0",
                "lttng enable-channel --userspace --session=s1 --blocking-timeout=inf blocking-channel",
                "lttng add-context --userspace --session=s1 --channel=blocking-channel -t vpid -t vtid",
                "lttng enable-event --userspace --session=s1 --channel=blocking-channel lttng_ust_opencl:*,lttng_ust_thapi:*",
                "lttng start s1",
            ]
        );
        for call in calls {
            assert_eq!(
                call.env,
                vec![("LTTNG_HOME".to_string(), home.to_string_lossy().into_owned())]
            );
        }
    }

    #[test]
    fn kill_reads_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_env(&MapEnv::new());
        let runner = ScriptedRunner::succeed();
        let daemon = DaemonControl::new(&config, &runner, dir.path());

        assert!(matches!(daemon.kill_daemon(), Err(Error::DaemonPid { .. })));

        std::fs::create_dir_all(dir.path().join(".lttng")).unwrap();
        std::fs::write(daemon.pid_file(), "4242\n").unwrap();
        daemon.kill_daemon().unwrap();
        assert_eq!(runner.terminated(), vec![4242]);
    }

    #[test]
    fn garbage_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_env(&MapEnv::new());
        let runner = ScriptedRunner::succeed();
        let daemon = DaemonControl::new(&config, &runner, dir.path());
        std::fs::create_dir_all(dir.path().join(".lttng")).unwrap();
        std::fs::write(daemon.pid_file(), "not a pid").unwrap();
        assert!(matches!(daemon.daemon_pid(), Err(Error::DaemonPid { .. })));
        assert!(runner.terminated().is_empty());
    }

    #[test]
    fn process_group_pids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_env(&MapEnv::new());
        let runner = ScriptedRunner::succeed();
        let daemon = DaemonControl::new(&config, &runner, dir.path());
        std::fs::create_dir_all(dir.path().join(".lttng")).unwrap();
        for pid in ["0", "-1\n", "-4242"] {
            std::fs::write(daemon.pid_file(), pid).unwrap();
            assert!(matches!(daemon.kill_daemon(), Err(Error::DaemonPid { .. })));
        }
        assert!(runner.terminated().is_empty());
    }
}
