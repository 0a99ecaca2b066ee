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
use tokio::io::AsyncRead;
use tokio::process::Command;

use std::os::unix::process::ExitStatusExt as _;
use std::process::{ExitStatus, Stdio};

/// Runs the user's command to completion.
pub trait Launcher {
    /// Returns the child's exit code, 128+signal when it was killed.
    fn launch(&self, command: &[String], env: &[(String, String)]) -> Result<i32>;
}

/// Spawns the workload as a child process and forwards its output to ours.
#[derive(Debug, Default)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&self, command: &[String], env: &[(String, String)]) -> Result<i32> {
        let Some((program, args)) = command.split_first() else {
            return Err(Error::Config {
                name: "command".to_string(),
                message: "no command to run".to_string(),
            });
        };
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let status = rt.block_on(run_child(program, args, env))?;
        debug!("{} exited with {}", program, status);
        Ok(exit_code(status))
    }
}

async fn run_child(program: &str, args: &[String], env: &[(String, String)]) -> Result<ExitStatus> {
    let mut child = Command::new(program)
        .args(args)
        .envs(env.iter().map(|(k, v)| (k, v)))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| Error::Spawn {
            command: program.to_string(),
            source,
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (out, err) = tokio::join!(
        forward(stdout, tokio::io::stdout()),
        forward(stderr, tokio::io::stderr()),
    );
    // a closed parent stream must not stop us from reaping the child
    if let Err(e) = out.and(err) {
        debug!("output forwarding stopped: {}", e);
    }
    Ok(child.wait().await?)
}

async fn forward<R, W>(reader: Option<R>, mut writer: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    match reader {
        Some(mut reader) => tokio::io::copy(&mut reader, &mut writer).await,
        None => Ok(0),
    }
}

pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn propagates_exit_code() {
        assert_eq!(ProcessLauncher.launch(&sh("exit 3"), &[]).unwrap(), 3);
        assert_eq!(ProcessLauncher.launch(&sh("true"), &[]).unwrap(), 0);
    }

    #[test]
    fn signal_death() {
        assert_eq!(ProcessLauncher.launch(&sh("kill -TERM $$"), &[]).unwrap(), 128 + libc::SIGTERM);
    }

    #[test]
    fn environment_reaches_child() {
        let env = vec![("IPROF_TEST_MARKER".to_string(), "42".to_string())];
        let code = ProcessLauncher
            .launch(&sh("test \"$IPROF_TEST_MARKER\" = 42"), &env)
            .unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn missing_program() {
        let err = ProcessLauncher
            .launch(&["/nonexistent/iprof-workload".to_string()], &[])
            .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
        assert!(matches!(
            ProcessLauncher.launch(&[], &[]).unwrap_err(),
            Error::Config { .. }
        ));
    }
}
