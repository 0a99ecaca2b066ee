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

use crate::{Error, Result};

use log::debug;

use std::process::{Command, Stdio};

/// A fully described external tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg<S: AsRef<str>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    pub fn env(mut self, name: &str, value: &str) -> Self {
        self.env.push((name.to_string(), value.to_string()));
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs external tools and delivers signals to external processes.
pub trait CommandRunner: Send + Sync {
    /// Runs to completion. A non-zero exit is an [`Error::CommandFailed`].
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;

    /// Asks process `pid` to terminate.
    fn terminate(&self, pid: libc::pid_t) -> Result<()> {
        // SAFETY: kill(2) has no memory safety requirements
        let r = unsafe { libc::kill(pid, libc::SIGTERM) };
        if r != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

/// Runs tools as child processes of the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let command_line = invocation.command_line();
        debug!("running {}", command_line);
        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .output()
            .map_err(|source| Error::Spawn {
                command: command_line.clone(),
                source,
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: command_line,
                status: output.status.to_string(),
                stderr: stderr.trim_end().to_string(),
            });
        }
        Ok(CommandOutput { stdout, stderr })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout() {
        let out = SystemRunner
            .run(&Invocation::new("sh").args(["-c", "echo hello"]))
            .unwrap();
        assert_eq!(out.stdout, "hello\n");
    }

    #[test]
    fn passes_environment() {
        let out = SystemRunner
            .run(
                &Invocation::new("sh")
                    .args(["-c", "echo $IPROF_TEST_VALUE"])
                    .env("IPROF_TEST_VALUE", "42"),
            )
            .unwrap();
        assert_eq!(out.stdout.trim(), "42");
    }

    #[test]
    fn failure_carries_stderr() {
        let err = SystemRunner
            .run(&Invocation::new("sh").args(["-c", "echo broken >&2; exit 3"]))
            .unwrap_err();
        match err {
            Error::CommandFailed {
                command, stderr, ..
            } => {
                assert!(command.starts_with("sh -c"));
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let err = SystemRunner
            .run(&Invocation::new("/nonexistent/iprof-tool"))
            .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }
}
