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


use crate::env_probe::Environment;

use log::warn;
use rand::Rng as _;

use std::str::FromStr;

/// Where one launcher family publishes the identity of a rank.
///
/// All fields of a [`RankContext`] come from the same family.
struct LauncherFamily {
    name: &'static str,
    /// Joined with `.`; the first one is required. Later parts narrow an
    /// allocation-wide id down to one launch.
    job_id: &'static [&'static str],
    global_rank: &'static str,
    local_rank: &'static str,
    local_size: fn(&dyn Environment) -> Option<u32>,
}

// Probed in this order.
const FAMILIES: &[LauncherFamily] = &[
    LauncherFamily {
        name: "PALS",
        job_id: &["PALS_APID"],
        global_rank: "PALS_RANKID",
        local_rank: "PALS_LOCAL_RANKID",
        local_size: pals_local_size,
    },
    LauncherFamily {
        name: "MPICH",
        job_id: &["PMI_JOBID"],
        global_rank: "PMI_RANK",
        local_rank: "MPI_LOCALRANKID",
        local_size: mpich_local_size,
    },
    LauncherFamily {
        name: "Open MPI",
        job_id: &["OMPI_MCA_ess_base_jobid"],
        global_rank: "OMPI_COMM_WORLD_RANK",
        local_rank: "OMPI_COMM_WORLD_LOCAL_RANK",
        local_size: ompi_local_size,
    },
    LauncherFamily {
        name: "Slurm",
        job_id: &["SLURM_JOB_ID", "SLURM_STEP_ID"],
        global_rank: "SLURM_PROCID",
        local_rank: "SLURM_LOCALID",
        local_size: slurm_local_size,
    },
];

fn positive(n: &u32) -> bool {
    *n > 0
}

fn pals_local_size(env: &dyn Environment) -> Option<u32> {
    probe(env, &["PALS_LOCAL_SIZE"], positive)
}

fn mpich_local_size(env: &dyn Environment) -> Option<u32> {
    probe(env, &["MPI_LOCALNRANKS"], positive)
}

fn ompi_local_size(env: &dyn Environment) -> Option<u32> {
    probe(env, &["OMPI_COMM_WORLD_LOCAL_SIZE"], positive)
}

/// `SLURM_STEP_TASKS_PER_NODE` indexed by `SLURM_NODEID`, else the
/// user-requested `SLURM_NTASKS_PER_NODE`.
fn slurm_local_size(env: &dyn Environment) -> Option<u32> {
    let from_step = env.var("SLURM_STEP_TASKS_PER_NODE").and_then(|layout| {
        let node = probe::<usize>(env, &["SLURM_NODEID"], |_| true)?;
        let n = tasks_on_node(&layout, node).filter(positive);
        if n.is_none() {
            warn!(
                "ignoring SLURM_STEP_TASKS_PER_NODE={:?} for node {}",
                layout, node
            );
        }
        n
    });
    from_step.or_else(|| probe(env, &["SLURM_NTASKS_PER_NODE"], positive))
}

/// Expands Slurm's compressed per-node task list, e.g. `2(x3),1`.
fn tasks_on_node(layout: &str, node: usize) -> Option<u32> {
    let mut first = 0usize;
    for item in layout.split(',') {
        let item = item.trim();
        let (tasks, repeat) = match item.split_once("(x") {
            Some((tasks, rest)) => (tasks, rest.strip_suffix(')')?.parse::<usize>().ok()?),
            None => (item, 1),
        };
        let tasks = tasks.parse::<u32>().ok()?;
        if node < first + repeat {
            return Some(tasks);
        }
        first += repeat;
    }
    None
}

/// Identity of this process within the parallel job.
///
/// Built once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RankContext {
    job_id: String,
    global_rank: u32,
    local_rank: u32,
    local_size: u32,
    in_managed_environment: bool,
}

impl RankContext {
    /// Resolves every field from the first launcher family whose rank
    /// variable is set and parses. Without one, or when the family's
    /// values contradict each other, the process runs standalone.
    pub fn from_env(env: &dyn Environment) -> Self {
        let found = FAMILIES.iter().find_map(|family| {
            probe::<u32>(env, &[family.global_rank], |_| true).map(|rank| (family, rank))
        });
        let Some((family, global_rank)) = found else {
            return Self::standalone();
        };

        let local_rank = probe(env, &[family.local_rank], |_| true).unwrap_or(0);
        let local_size = (family.local_size)(env).unwrap_or(1);
        if local_rank >= local_size {
            warn!(
                "{}: local rank {} does not fit a node of {} ranks, running standalone",
                family.name, local_rank, local_size
            );
            return Self::standalone();
        }

        Self {
            job_id: launch_id(env, family),
            global_rank,
            local_rank,
            local_size,
            in_managed_environment: true,
        }
    }

    /// Context of a rank launched by a job runtime.
    pub fn managed(job_id: &str, global_rank: u32, local_rank: u32, local_size: u32) -> Self {
        Self {
            job_id: job_id.to_string(),
            global_rank,
            local_rank,
            local_size: local_size.max(1),
            in_managed_environment: true,
        }
    }

    /// Context of a process that is not part of a parallel job.
    pub fn standalone() -> Self {
        Self {
            job_id: random_job_id(),
            global_rank: 0,
            local_rank: 0,
            local_size: 1,
            in_managed_environment: false,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn global_rank(&self) -> u32 {
        self.global_rank
    }

    pub fn local_rank(&self) -> u32 {
        self.local_rank
    }

    pub fn local_size(&self) -> u32 {
        self.local_size
    }

    pub fn is_local_master(&self) -> bool {
        self.local_rank == 0
    }

    pub fn is_global_master(&self) -> bool {
        self.global_rank == 0
    }

    pub fn in_managed_environment(&self) -> bool {
        self.in_managed_environment
    }
}

/// Identifier shared by every rank of one launch, and only of that launch.
///
/// Without the launcher's own id the parent process stands in: all ranks
/// of a node are children of the same launcher process.
fn launch_id(env: &dyn Environment, family: &LauncherFamily) -> String {
    let parts: Vec<String> = family
        .job_id
        .iter()
        .map_while(|name| env.var(name).filter(|v| !v.trim().is_empty()))
        .map(|v| v.trim().to_string())
        .collect();
    if !parts.is_empty() {
        return parts.join(".");
    }
    // SAFETY: getppid(2) cannot fail
    let ppid = unsafe { libc::getppid() };
    warn!(
        "{}: {} is not set, identifying the job by parent process {}",
        family.name, family.job_id[0], ppid
    );
    format!("ppid-{}", ppid)
}

/// First variable in `names` that is set, parses and passes `valid` wins.
fn probe<T>(env: &dyn Environment, names: &[&str], valid: fn(&T) -> bool) -> Option<T>
where
    T: FromStr,
{
    names.iter().find_map(|name| {
        let raw = env.var(name)?;
        match raw.trim().parse::<T>() {
            Ok(v) if valid(&v) => Some(v),
            _ => {
                warn!("ignoring unusable {}={:?}", name, raw);
                None
            }
        }
    })
}

fn random_job_id() -> String {
    format!("{:016x}", rand::rng().random::<u64>())
}
