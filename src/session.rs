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

use crate::backend::BackendDescriptor;
use crate::config::{Config, TraceMode};
use crate::rank::RankContext;
use crate::Result;

use log::{info, warn};
use sha2::{Digest as _, Sha256};

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "iprof-session.json";
const FINAL_PREFIX: &str = "thapi--";
const DAEMON_HOMES: &str = ".lttng_home";

/// Contents of [`MANIFEST_FILE`].
#[derive(Debug, serde::Serialize)]
struct Manifest<'a> {
    hostname: &'a str,
    session_id: &'a str,
    rank: &'a RankContext,
    trace_mode: TraceMode,
    backends: &'a [BackendDescriptor],
    started: String,
}

/// Fixed description of one node's tracing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    output_path: PathBuf,
    session_id: String,
    daemon_home: PathBuf,
    enabled_backends: BTreeSet<String>,
}

impl SessionDescriptor {
    pub fn new(
        config: &Config,
        ctx: &RankContext,
        hostname: &str,
        backends: &[BackendDescriptor],
    ) -> Self {
        let output_path = job_output_dir(config, ctx).join(hostname);
        let session_id = session_id_for(&output_path);
        let daemon_home = Path::new(&config.home_dir)
            .join(DAEMON_HOMES)
            .join(&session_id);
        Self {
            output_path,
            session_id,
            daemon_home,
            enabled_backends: backends
                .iter()
                .filter(|b| b.enabled)
                .map(|b| b.name.clone())
                .collect(),
        }
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn daemon_home(&self) -> &Path {
        &self.daemon_home
    }

    pub fn enabled_backends(&self) -> &BTreeSet<String> {
        &self.enabled_backends
    }

    /// Describes the session for the trace-processing pipeline.
    pub fn write_manifest(
        &self,
        ctx: &RankContext,
        hostname: &str,
        mode: TraceMode,
        backends: &[BackendDescriptor],
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.output_path)?;
        let manifest = Manifest {
            hostname,
            session_id: &self.session_id,
            rank: ctx,
            trace_mode: mode,
            backends,
            started: chrono::Local::now().to_rfc3339(),
        };
        let path = self.output_path.join(MANIFEST_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(&manifest)?)?;
        Ok(path)
    }
}

/// Directory holding every node's raw output for this job.
///
/// `<trace_output>` when set explicitly, else
/// `<home_dir>/<trace_root>/<job_id>`.
pub fn job_output_dir(config: &Config, ctx: &RankContext) -> PathBuf {
    match &config.trace_output {
        Some(dir) => PathBuf::from(dir),
        None => Path::new(&config.home_dir)
            .join(&config.trace_root)
            .join(ctx.job_id()),
    }
}

/// Same output path, same id.
pub fn session_id_for(output_path: &Path) -> String {
    let digest = Sha256::digest(output_path.as_os_str().as_encoded_bytes());
    let hex: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
    format!("iprof-{}", hex)
}

pub fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%z").to_string()
}

/// Moves `raw` to `<root>/thapi--<timestamp>[_<n>]`.
///
/// The final name is reserved with `mkdir`, which fails for everyone but
/// one contender, so concurrent finalizations always get distinct names.
pub fn finalize_output(raw: &Path, root: &Path, timestamp: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(root)?;
    let base = format!("{}{}", FINAL_PREFIX, timestamp);
    let mut n = 0u32;
    let target = loop {
        let name = if n == 0 {
            base.clone()
        } else {
            format!("{}_{}", base, n)
        };
        let candidate = root.join(name);
        match std::fs::create_dir(&candidate) {
            Ok(()) => break candidate,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e.into()),
        }
    };
    // renaming onto the empty reserved directory replaces it
    match std::fs::rename(raw, &target) {
        Ok(()) => info!("trace available in {:?}", target),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!("no raw trace in {:?}, {:?} is empty", raw, target)
        }
        Err(e) => return Err(e.into()),
    }
    Ok(target)
}
