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

//! Launches a command under a node-local LTTng tracing session, keeping
//! every rank of a parallel job in step through barriers on a shared
//! filesystem.

pub mod backend;
pub mod backoff;
pub mod barrier;
pub mod command;
pub mod config;
pub mod daemon;
pub mod env_probe;
mod error;
pub mod logger;
pub mod orchestrator;
pub mod overlay;
pub mod rank;
pub mod session;
pub mod workload;

pub use backend::{BackendDescriptor, BackendDetector, Registry, TracingBackend};
pub use barrier::{BarrierToken, GlobalBarrier, LocalBarrier};
pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::{Outcome, Phase, SessionOrchestrator};
pub use rank::RankContext;
