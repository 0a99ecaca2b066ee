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

//! Drives one rank through a tracing session.
//!
//! ```text
//! Idle -> GlobalInit -> EnvPrepared -> LocalSessionUp -> AwaitingSetupBarrier
//!      -> WorkloadRunning -> AwaitingStopBarrier -> LocalSessionDown
//!      -> AwaitingGlobalBarrier -> Finalized
//! ```
//!
//! `LocalSessionUp` and `LocalSessionDown` are only visited by local
//! masters; every other rank goes straight past them.

use crate::backend::{BackendDescriptor, BackendDetector, Registry, METADATA_EVENTS};
use crate::backoff::PollSettings;
use crate::barrier::{BarrierToken, GlobalBarrier, GlobalHandle, LocalBarrier};
use crate::command::CommandRunner;
use crate::config::Config;
use crate::daemon::DaemonControl;
use crate::env_probe::Environment;
use crate::overlay::EnvOverlay;
use crate::rank::RankContext;
use crate::session::{self, SessionDescriptor};
use crate::workload::Launcher;
use crate::{Error, Result};

use log::{debug, info};

use std::path::{Path, PathBuf};

pub const SETUP_BARRIER: &str = "setup-complete";
pub const WORKLOAD_BARRIER: &str = "workload-complete";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    GlobalInit,
    EnvPrepared,
    LocalSessionUp,
    AwaitingSetupBarrier,
    WorkloadRunning,
    AwaitingStopBarrier,
    LocalSessionDown,
    AwaitingGlobalBarrier,
    Finalized,
}

/// Result of a complete session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub exit_code: i32,
    /// Final trace directory, only known to the global master.
    pub trace_dir: Option<PathBuf>,
}

pub struct SessionOrchestrator<'a> {
    config: &'a Config,
    ctx: &'a RankContext,
    env: &'a dyn Environment,
    runner: &'a dyn CommandRunner,
    launcher: &'a dyn Launcher,
    registry: &'a Registry,
    hostname: String,
    poll: PollSettings,

    phase: Phase,
    global: Option<GlobalHandle>,
    backends: Vec<BackendDescriptor>,
    overlay: EnvOverlay,
    session: Option<SessionDescriptor>,
}

impl<'a> SessionOrchestrator<'a> {
    pub fn new(
        config: &'a Config,
        ctx: &'a RankContext,
        env: &'a dyn Environment,
        runner: &'a dyn CommandRunner,
        launcher: &'a dyn Launcher,
        registry: &'a Registry,
        hostname: &str,
    ) -> Self {
        Self {
            config,
            ctx,
            env,
            runner,
            launcher,
            registry,
            hostname: hostname.to_string(),
            poll: PollSettings::from_config(config),
            phase: Phase::Idle,
            global: None,
            backends: Vec::new(),
            overlay: EnvOverlay::new(),
            session: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn backends(&self) -> &[BackendDescriptor] {
        &self.backends
    }

    pub fn overlay(&self) -> &EnvOverlay {
        &self.overlay
    }

    pub fn session(&self) -> Option<&SessionDescriptor> {
        self.session.as_ref()
    }

    fn require_phase(&self, expected: &[Phase]) -> Result<()> {
        if expected.contains(&self.phase) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                expected: expected.to_vec(),
                found: self.phase,
            })
        }
    }

    fn transition(&mut self, to: Phase) {
        if self.ctx.is_local_master() {
            info!("{:?} -> {:?}", self.phase, to);
        } else {
            debug!("{:?} -> {:?}", self.phase, to);
        }
        self.phase = to;
    }

    fn daemon(&self, session: &SessionDescriptor) -> DaemonControl<'a> {
        DaemonControl::new(self.config, self.runner, session.daemon_home())
    }

    /// Local masters register their global-barrier sentinel.
    pub fn global_init(&mut self) -> Result<()> {
        self.require_phase(&[Phase::Idle])?;
        if self.ctx.is_local_master() {
            let token = BarrierToken::global(self.config, self.ctx);
            self.global = Some(GlobalBarrier::new(self.ctx, self.poll).init(&token)?);
        }
        self.transition(Phase::GlobalInit);
        Ok(())
    }

    /// Detects backends and computes this rank's environment overlay.
    pub fn prepare_environment(&mut self) -> Result<()> {
        self.require_phase(&[Phase::GlobalInit])?;
        let traced = self.config.traced_ranks.contains(self.ctx.global_rank());
        if self.ctx.is_local_master() || traced {
            let detector = BackendDetector::new(self.config, self.env, self.runner);
            self.backends = detector.detect(self.registry, &self.config.backends);
        }
        self.overlay = EnvOverlay::for_rank(self.ctx, self.config, self.registry, &self.backends);
        if !traced {
            info!("rank {} is not traced", self.ctx.global_rank());
        }
        if self.ctx.is_local_master() {
            self.session = Some(SessionDescriptor::new(
                self.config,
                self.ctx,
                &self.hostname,
                &self.backends,
            ));
        }
        self.transition(Phase::EnvPrepared);
        Ok(())
    }

    /// Brings up the node's daemon and arms the session. No-op on
    /// non-masters.
    pub fn start_local_session(&mut self) -> Result<()> {
        self.require_phase(&[Phase::EnvPrepared])?;
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        let daemon = self.daemon(session);
        let id = session.session_id();
        daemon.start_daemon()?;
        daemon.create_session(id, session.output_path())?;
        daemon.enable_channel(id)?;
        for descr in self.backends.iter().filter(|d| d.enabled) {
            if let Some(handler) = self.registry.get(&descr.name) {
                handler.enable_events(&daemon, id, self.config.trace_mode, self.config.profile)?;
            }
        }
        daemon.enable_events(id, METADATA_EVENTS)?;
        daemon.start_session(id)?;
        session.write_manifest(self.ctx, &self.hostname, self.config.trace_mode, &self.backends)?;
        self.transition(Phase::LocalSessionUp);
        Ok(())
    }

    /// Waits until every rank of the node, and so the session, is ready.
    pub fn await_setup(&mut self) -> Result<()> {
        self.require_phase(&[Phase::EnvPrepared, Phase::LocalSessionUp])?;
        if self.session.is_some() && self.phase == Phase::EnvPrepared {
            return Err(Error::InvalidState {
                expected: vec![Phase::LocalSessionUp],
                found: self.phase,
            });
        }
        self.transition(Phase::AwaitingSetupBarrier);
        let token = BarrierToken::local(self.config, self.ctx, SETUP_BARRIER);
        LocalBarrier::new(self.ctx, self.poll).enter(&token)
    }

    /// Runs the workload with this rank's overlay applied.
    ///
    /// The phase moves on even if the child cannot be started, so the
    /// rank can still take part in the remaining barriers.
    pub fn run_workload(&mut self, command: &[String]) -> Result<i32> {
        self.require_phase(&[Phase::AwaitingSetupBarrier])?;
        self.transition(Phase::WorkloadRunning);
        let env = self.overlay.resolve(self.env);
        self.launcher.launch(command, &env)
    }

    /// Waits until every traced process of the node has exited.
    pub fn await_workload(&mut self) -> Result<()> {
        self.require_phase(&[Phase::WorkloadRunning])?;
        self.transition(Phase::AwaitingStopBarrier);
        let token = BarrierToken::local(self.config, self.ctx, WORKLOAD_BARRIER);
        LocalBarrier::new(self.ctx, self.poll).enter(&token)
    }

    /// Stops and destroys the session, then terminates the daemon.
    /// No-op on non-masters.
    pub fn stop_local_session(&mut self) -> Result<()> {
        self.require_phase(&[Phase::AwaitingStopBarrier])?;
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        let daemon = self.daemon(session);
        daemon.stop_session(session.session_id())?;
        daemon.destroy_session(session.session_id())?;
        daemon.kill_daemon()?;
        self.transition(Phase::LocalSessionDown);
        Ok(())
    }

    /// Local masters release their sentinel and wait for the others.
    pub fn await_global(&mut self) -> Result<()> {
        self.require_phase(&[Phase::AwaitingStopBarrier, Phase::LocalSessionDown])?;
        if self.session.is_some() && self.phase == Phase::AwaitingStopBarrier {
            return Err(Error::InvalidState {
                expected: vec![Phase::LocalSessionDown],
                found: self.phase,
            });
        }
        self.transition(Phase::AwaitingGlobalBarrier);
        if let Some(handle) = self.global.take() {
            GlobalBarrier::new(self.ctx, self.poll).wait(handle)?;
        }
        Ok(())
    }

    /// The global master moves the job's raw output to its final name.
    ///
    /// Output written to an explicit directory is left where it is.
    pub fn finalize(&mut self) -> Result<Option<PathBuf>> {
        self.require_phase(&[Phase::AwaitingGlobalBarrier])?;
        let trace_dir = if !self.ctx.is_global_master() {
            None
        } else if self.config.trace_output.is_some() {
            Some(session::job_output_dir(self.config, self.ctx))
        } else {
            let raw = session::job_output_dir(self.config, self.ctx);
            let root = Path::new(&self.config.home_dir).join(&self.config.trace_root);
            Some(session::finalize_output(&raw, &root, &session::timestamp())?)
        };
        self.transition(Phase::Finalized);
        Ok(trace_dir)
    }

    /// Runs every phase in order.
    ///
    /// A workload that fails to start is reported only after this rank has
    /// passed the remaining barriers and torn its session down, so the
    /// other ranks of the job are not left waiting.
    pub fn run(&mut self, command: &[String]) -> Result<Outcome> {
        self.global_init()?;
        self.prepare_environment()?;
        self.start_local_session()?;
        self.await_setup()?;
        let launched = self.run_workload(command);
        self.await_workload()?;
        self.stop_local_session()?;
        self.await_global()?;
        let trace_dir = self.finalize()?;
        Ok(Outcome {
            exit_code: launched?,
            trace_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::{stdout, ScriptedRunner};
    use crate::command::{CommandOutput, Invocation};
    use crate::config::RankSelection;
    use crate::env_probe::MapEnv;
    use crate::session::MANIFEST_FILE;

    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use std::time::Duration;

    const OPENCL_ONLY: &str = "\
1 libs found in cache `/etc/ld.so.cache'
\tlibOpenCL.so.1 (libc6,x86-64) => /usr/lib/x86_64-linux-gnu/libOpenCL.so.1
";

    /// Records the environment each launch receives.
    #[derive(Default)]
    struct RecordingLauncher {
        launches: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl RecordingLauncher {
        fn launches(&self) -> Vec<Vec<(String, String)>> {
            self.launches.lock().unwrap().clone()
        }
    }

    impl Launcher for RecordingLauncher {
        fn launch(&self, _command: &[String], env: &[(String, String)]) -> Result<i32> {
            self.launches.lock().unwrap().push(env.to_vec());
            Ok(7)
        }
    }

    fn pid_file_writer(inv: &Invocation) -> Result<CommandOutput> {
        let (_, home) = inv
            .env
            .iter()
            .find(|(k, _)| k == "LTTNG_HOME")
            .unwrap();
        let dir = Path::new(home).join(".lttng");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("lttng-sessiond.pid"), "1234\n")?;
        Ok(CommandOutput::default())
    }

    /// A node with a fake linker cache and a fake LTTng.
    fn node(listing: &'static str) -> ScriptedRunner {
        ScriptedRunner::new(move |inv| match inv.program.as_str() {
            "ldconfig" => stdout(listing),
            "objdump" => stdout("file format elf64-x86-64\n"),
            "lttng-sessiond" => pid_file_writer(inv),
            "lttng" => Ok(CommandOutput::default()),
            other => panic!("unexpected tool {}", other),
        })
    }

    fn test_config(dir: &Path, backends: &[&str]) -> Config {
        let mut config = Config::from_env(&MapEnv::new());
        config.home_dir = dir.join("home").to_string_lossy().into_owned();
        config.local_shared_dir = dir.join("shm").to_string_lossy().into_owned();
        config.backends = backends.iter().map(|b| b.to_string()).collect();
        config.backoff_cap = Some(Duration::from_millis(2));
        config.barrier_timeout = Some(Duration::from_secs(30));
        config
    }

    fn cmd() -> Vec<String> {
        vec!["./app".to_string()]
    }

    #[test]
    fn standalone_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), &[]);
        let ctx = RankContext::standalone();
        let env = MapEnv::new();
        let runner = node(OPENCL_ONLY);
        let launcher = RecordingLauncher::default();
        let registry = Registry::builtin();
        let mut orch =
            SessionOrchestrator::new(&config, &ctx, &env, &runner, &launcher, &registry, "node0");

        let outcome = orch.run(&cmd()).unwrap();

        assert!(!ctx.in_managed_environment());
        assert_eq!(orch.phase(), Phase::Finalized);
        assert!(orch.overlay().is_empty());
        assert_eq!(launcher.launches(), vec![Vec::new()]);
        assert_eq!(outcome.exit_code, 7);
        let trace_dir = outcome.trace_dir.unwrap();
        assert!(trace_dir.starts_with(dir.path().join("home/thapi-traces")));
        assert!(trace_dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("thapi--"));
        assert!(trace_dir.join("node0").join(MANIFEST_FILE).is_file());
        assert_eq!(runner.calls_to("lttng-sessiond").len(), 1);
        assert_eq!(runner.terminated(), vec![1234]);
        // no barrier directories outside a managed job
        assert!(!dir.path().join("shm").exists());
    }

    #[test]
    fn only_detected_backends_are_traced() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), &["cl", "ze"]);
        let ctx = RankContext::standalone();
        let env = MapEnv::new();
        let runner = node(OPENCL_ONLY);
        let launcher = RecordingLauncher::default();
        let registry = Registry::builtin();
        let mut orch =
            SessionOrchestrator::new(&config, &ctx, &env, &runner, &launcher, &registry, "node0");

        orch.run(&cmd()).unwrap();

        let status: Vec<(&str, bool)> = orch
            .backends()
            .iter()
            .map(|b| (b.name.as_str(), b.enabled))
            .collect();
        assert_eq!(status, vec![("cl", true), ("ze", false)]);
        assert!(orch.overlay().names().any(|n| n == "LTTNG_UST_OPENCL_LIBOPENCL"));
        assert!(orch.overlay().names().all(|n| !n.contains("ZE")));
        let env = &launcher.launches()[0];
        assert!(env
            .iter()
            .any(|(k, v)| k == "LD_LIBRARY_PATH" && v.contains("opencl")));

        let events: Vec<String> = runner
            .calls_to("lttng")
            .iter()
            .filter(|c| c.args[0] == "enable-event")
            .map(|c| c.args.last().unwrap().clone())
            .collect();
        assert_eq!(events.len(), 2);
        assert!(events[0].contains("lttng_ust_opencl:*"));
        assert!(!events[0].contains("lttng_ust_ze"));
        assert_eq!(events[1], METADATA_EVENTS.join(","));
        assert_eq!(
            orch.session().unwrap().enabled_backends(),
            &BTreeSet::from(["cl".to_string()])
        );
    }

    #[test]
    fn ranks_share_one_node_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), &["cl"]);
        config.traced_ranks = RankSelection::Ranks(BTreeSet::from([0]));
        let env = MapEnv::new();
        let runner = node(OPENCL_ONLY);
        let registry = Registry::builtin();
        let ranks = [
            RankContext::managed("job42", 0, 0, 2),
            RankContext::managed("job42", 1, 1, 2),
        ];
        let launchers = [RecordingLauncher::default(), RecordingLauncher::default()];

        let outcomes: Vec<Outcome> = std::thread::scope(|s| {
            let handles: Vec<_> = ranks
                .iter()
                .zip(launchers.iter())
                .map(|(ctx, launcher)| {
                    let (config, env, runner, registry) = (&config, &env, &runner, &registry);
                    s.spawn(move || {
                        SessionOrchestrator::new(config, ctx, env, runner, launcher, registry, "node0")
                            .run(&cmd())
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(outcomes[0].trace_dir.is_some());
        assert!(outcomes[1].trace_dir.is_none());
        assert!(!launchers[0].launches()[0].is_empty());
        assert!(launchers[1].launches()[0].is_empty());
        assert_eq!(runner.calls_to("lttng-sessiond").len(), 1);
        assert_eq!(runner.terminated(), vec![1234]);
        // global scratch is gone, local markers stay
        assert!(!dir.path().join("home/.thapi_lock/job42").exists());
        assert!(dir
            .path()
            .join("shm/.thapi_lock/job42")
            .join(WORKLOAD_BARRIER)
            .join("1")
            .is_dir());
    }

    #[test]
    fn phases_must_run_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), &[]);
        let ctx = RankContext::standalone();
        let env = MapEnv::new();
        let runner = ScriptedRunner::succeed();
        let launcher = RecordingLauncher::default();
        let registry = Registry::builtin();
        let mut orch =
            SessionOrchestrator::new(&config, &ctx, &env, &runner, &launcher, &registry, "node0");

        match orch.start_local_session().unwrap_err() {
            Error::InvalidState { expected, found } => {
                assert_eq!(expected, vec![Phase::EnvPrepared]);
                assert_eq!(found, Phase::Idle);
            }
            other => panic!("unexpected error {:?}", other),
        }
        orch.global_init().unwrap();
        orch.prepare_environment().unwrap();
        // the master must arm the session before the setup barrier
        assert!(matches!(orch.await_setup(), Err(Error::InvalidState { .. })));
        assert!(matches!(orch.global_init(), Err(Error::InvalidState { .. })));
        assert_eq!(orch.phase(), Phase::EnvPrepared);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn command_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), &[]);
        let ctx = RankContext::standalone();
        let env = MapEnv::new();
        let runner = ScriptedRunner::new(|inv| match (inv.program.as_str(), inv.args.first()) {
            ("lttng-sessiond", _) => pid_file_writer(inv),
            ("lttng", Some(sub)) if sub == "create" => Err(Error::CommandFailed {
                command: inv.command_line(),
                status: "exit status: 1".to_string(),
                stderr: "Error: Session name already exists".to_string(),
            }),
            _ => Ok(CommandOutput::default()),
        });
        let launcher = RecordingLauncher::default();
        let registry = Registry::builtin();
        let mut orch =
            SessionOrchestrator::new(&config, &ctx, &env, &runner, &launcher, &registry, "node0");

        match orch.run(&cmd()).unwrap_err() {
            Error::CommandFailed { stderr, .. } => assert!(stderr.contains("already exists")),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(orch.phase(), Phase::EnvPrepared);
        assert!(launcher.launches().is_empty());
    }

    #[test]
    fn explicit_output_is_not_renamed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), &[]);
        let out = dir.path().join("out");
        config.trace_output = Some(out.to_string_lossy().into_owned());
        let ctx = RankContext::standalone();
        let env = MapEnv::new();
        let runner = node(OPENCL_ONLY);
        let launcher = RecordingLauncher::default();
        let registry = Registry::builtin();
        let mut orch =
            SessionOrchestrator::new(&config, &ctx, &env, &runner, &launcher, &registry, "node3");

        let outcome = orch.run(&cmd()).unwrap();
        assert_eq!(outcome.trace_dir, Some(out.clone()));
        assert!(out.join("node3").join(MANIFEST_FILE).is_file());
    }
}
