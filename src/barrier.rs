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

//! Rendezvous between processes that share nothing but a directory tree.
//!
//! Participants announce themselves by creating a directory entry and then
//! poll the number of entries. `mkdir` is atomic on every filesystem we
//! care about, and creating an entry that already exists is treated as
//! success, so registration is idempotent.

use crate::backoff::PollSettings;
use crate::config::Config;
use crate::rank::RankContext;
use crate::Result;

use log::debug;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Identifies one synchronization checkpoint.
///
/// Two different checkpoints of the same job must never share a base path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierToken {
    name: String,
    base_path: PathBuf,
}

impl BarrierToken {
    pub fn new<P: Into<PathBuf>>(name: &str, base_path: P) -> Self {
        Self {
            name: name.to_string(),
            base_path: base_path.into(),
        }
    }

    /// `<local_shared_dir>/<lock_namespace>/<job_id>/<name>`
    pub fn local(config: &Config, ctx: &RankContext, name: &str) -> Self {
        let base = Path::new(&config.local_shared_dir)
            .join(&config.lock_namespace)
            .join(ctx.job_id())
            .join(name);
        Self::new(name, base)
    }

    /// `<home_dir>/<lock_namespace>/<job_id>`
    pub fn global(config: &Config, ctx: &RankContext) -> Self {
        let base = Path::new(&config.home_dir)
            .join(&config.lock_namespace)
            .join(ctx.job_id());
        Self::new("global", base)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

fn count_entries(dir: &Path) -> std::io::Result<usize> {
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            let mut n = 0;
            for entry in entries {
                entry?;
                n += 1;
            }
            Ok(n)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// Barrier between all ranks of one node.
///
/// Markers are never removed: a slow participant may still be between two
/// polls, and seeing the count drop would leave it waiting forever. Each
/// checkpoint therefore needs its own token.
#[derive(Debug)]
pub struct LocalBarrier<'a> {
    ctx: &'a RankContext,
    poll: PollSettings,
}

impl<'a> LocalBarrier<'a> {
    pub fn new(ctx: &'a RankContext, poll: PollSettings) -> Self {
        Self { ctx, poll }
    }

    /// Blocks until all `local_size` ranks of this node have entered `token`.
    ///
    /// Returns immediately outside a managed environment. Without a timeout
    /// a rank that never arrives blocks the others forever.
    pub fn enter(&self, token: &BarrierToken) -> Result<()> {
        if !self.ctx.in_managed_environment() {
            return Ok(());
        }
        self.register(token)?;
        let expected = self.ctx.local_size() as usize;
        debug!(
            "local rank {} waiting on {} for {} ranks",
            self.ctx.local_rank(),
            token.name(),
            expected
        );
        self.poll.poll_until(token.name(), expected, || {
            let n = count_entries(token.base_path())?;
            Ok((n, n >= expected))
        })?;
        debug!("local rank {} passed {}", self.ctx.local_rank(), token.name());
        Ok(())
    }

    pub(crate) fn register(&self, token: &BarrierToken) -> Result<()> {
        let marker = token.base_path().join(self.ctx.local_rank().to_string());
        std::fs::create_dir_all(marker)?;
        Ok(())
    }

    pub(crate) fn arrived(&self, token: &BarrierToken) -> Result<usize> {
        Ok(count_entries(token.base_path())?)
    }
}

/// Sentinel a node master holds between [`GlobalBarrier::init`] and
/// [`GlobalBarrier::wait`].
#[derive(Debug)]
#[must_use = "a registered sentinel must be released with GlobalBarrier::wait"]
pub struct GlobalHandle {
    token: BarrierToken,
    sentinel: Option<PathBuf>,
}

impl GlobalHandle {
    pub fn sentinel(&self) -> Option<&Path> {
        self.sentinel.as_deref()
    }
}

/// Barrier between the node masters of a job.
///
/// Masters register a sentinel early and remove it when they are done; the
/// barrier is passed once no sentinel is left. A master that reaches
/// [`wait`](Self::wait) before another master ran [`init`](Self::init) can
/// pass early, so callers must already be ordered by a job-wide collective
/// (for instance the workload's own `MPI_Init`) between the two calls.
#[derive(Debug)]
pub struct GlobalBarrier<'a> {
    ctx: &'a RankContext,
    poll: PollSettings,
}

impl<'a> GlobalBarrier<'a> {
    pub fn new(ctx: &'a RankContext, poll: PollSettings) -> Self {
        Self { ctx, poll }
    }

    /// Registers this node master. Only local masters may call this.
    pub fn init(&self, token: &BarrierToken) -> Result<GlobalHandle> {
        if !self.ctx.in_managed_environment() {
            return Ok(GlobalHandle {
                token: token.clone(),
                sentinel: None,
            });
        }
        let sentinel = token.base_path().join(self.ctx.global_rank().to_string());
        std::fs::create_dir_all(&sentinel)?;
        debug!("rank {} registered {:?}", self.ctx.global_rank(), sentinel);
        Ok(GlobalHandle {
            token: token.clone(),
            sentinel: Some(sentinel),
        })
    }

    /// Releases the sentinel and waits for every other master to do the
    /// same. The global master then removes the whole base directory.
    pub fn wait(&self, handle: GlobalHandle) -> Result<()> {
        let Some(sentinel) = handle.sentinel else {
            return Ok(());
        };
        let token = handle.token;
        match std::fs::remove_dir(&sentinel) {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        self.poll.poll_until(token.name(), 0, || {
            let n = count_entries(token.base_path())?;
            Ok((n, n == 0))
        })?;
        if self.ctx.is_global_master() {
            match std::fs::remove_dir_all(token.base_path()) {
                Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        debug!("rank {} passed {}", self.ctx.global_rank(), token.name());
        Ok(())
    }
}
