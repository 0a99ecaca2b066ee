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

use crate::orchestrator::Phase;

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An external tool ran and exited unsuccessfully.
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// An external tool could not be started at all.
    #[error("could not spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {name}: {message}")]
    Config { name: String, message: String },

    /// Only produced when a barrier timeout is configured.
    #[error("barrier `{name}` timed out after observing {observed} of {expected}")]
    BarrierTimeout {
        name: String,
        observed: usize,
        expected: usize,
    },

    #[error("orchestrator is in phase {found:?}, expected one of {expected:?}")]
    InvalidState {
        expected: Vec<Phase>,
        found: Phase,
    },

    #[error("could not read daemon pid from {path:?}: {message}")]
    DaemonPid { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
