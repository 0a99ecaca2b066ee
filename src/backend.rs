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

use crate::command::{CommandRunner, Invocation};
use crate::config::{Config, TraceMode};
use crate::daemon::DaemonControl;
use crate::env_probe::Environment;
use crate::overlay::EnvOverlay;
use crate::Result;

use log::{debug, info, warn};

use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Outcome of detection for one requested backend.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BackendDescriptor {
    pub name: String,
    pub library_pattern: String,
    pub env_vars: Vec<String>,
    pub enabled: bool,
    pub library: Option<PathBuf>,
}

/// A traceable runtime.
///
/// Knows how to find its library, how to route the workload through the
/// tracing wrapper, and which events to enable in a daemon session.
pub trait TracingBackend: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// File-name prefix of the runtime library, e.g. `libOpenCL.so`.
    fn library_pattern(&self) -> &'static str;

    /// Variable a user sets to force a specific library.
    fn location_var(&self) -> &'static str;

    /// Every variable this backend reads or injects.
    fn env_vars(&self) -> Vec<&'static str>;

    fn inject_environment(&self, library: &Path, config: &Config, overlay: &mut EnvOverlay);

    fn event_globs(&self, mode: TraceMode, profile: bool) -> Vec<&'static str>;

    fn enable_events(
        &self,
        daemon: &DaemonControl,
        session: &str,
        mode: TraceMode,
        profile: bool,
    ) -> Result<()> {
        daemon.enable_events(session, &self.event_globs(mode, profile))
    }
}

/// Event globs, each level a superset of the previous one.
#[derive(Debug)]
struct EventTable {
    minimal: &'static [&'static str],
    default: &'static [&'static str],
    full: &'static [&'static str],
    profiling: &'static [&'static str],
}

impl EventTable {
    fn globs(&self, mode: TraceMode, profile: bool) -> Vec<&'static str> {
        let mut globs = self.minimal.to_vec();
        if mode != TraceMode::Minimal {
            globs.extend_from_slice(self.default);
        }
        if mode == TraceMode::Full {
            globs.extend_from_slice(self.full);
        }
        if profile {
            globs.extend_from_slice(self.profiling);
        }
        globs
    }
}

/// Backend traced by interposing a wrapper library found through
/// `LD_LIBRARY_PATH`; the wrapper loads the real library from `library_var`.
#[derive(Debug)]
struct LoaderBackend {
    name: &'static str,
    pattern: &'static str,
    location_var: &'static str,
    library_var: &'static str,
    wrapper_dir: &'static str,
    profile_var: Option<&'static str>,
    extra_vars: &'static [(&'static str, &'static str)],
    events: EventTable,
}

impl TracingBackend for LoaderBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn library_pattern(&self) -> &'static str {
        self.pattern
    }

    fn location_var(&self) -> &'static str {
        self.location_var
    }

    fn env_vars(&self) -> Vec<&'static str> {
        let mut vars = vec![self.location_var, "LD_LIBRARY_PATH", self.library_var];
        vars.extend(self.profile_var);
        vars.extend(self.extra_vars.iter().map(|(k, _)| *k));
        vars
    }

    fn inject_environment(&self, library: &Path, config: &Config, overlay: &mut EnvOverlay) {
        let wrapper = Path::new(&config.lib_dir).join(self.wrapper_dir);
        overlay.prepend("LD_LIBRARY_PATH", &wrapper.to_string_lossy());
        overlay.set(self.library_var, &library.to_string_lossy());
        if let Some(var) = self.profile_var.filter(|_| config.profile) {
            overlay.set(var, "1");
        }
        for (k, v) in self.extra_vars {
            overlay.set(k, v);
        }
    }

    fn event_globs(&self, mode: TraceMode, profile: bool) -> Vec<&'static str> {
        self.events.globs(mode, profile)
    }
}

/// OpenMP offload, traced through an OMPT tool library.
#[derive(Debug)]
struct OmptBackend {
    events: EventTable,
}

const OMPT_TOOL: &str = "libTracerOMPT.so";

impl TracingBackend for OmptBackend {
    fn name(&self) -> &'static str {
        "omp"
    }

    fn library_pattern(&self) -> &'static str {
        "libomptarget.so"
    }

    fn location_var(&self) -> &'static str {
        "LIBOMPTARGET_LOCATION"
    }

    fn env_vars(&self) -> Vec<&'static str> {
        vec![self.location_var(), "OMP_TOOL_LIBRARIES", "OMP_TOOL"]
    }

    fn inject_environment(&self, _library: &Path, config: &Config, overlay: &mut EnvOverlay) {
        let tool = Path::new(&config.lib_dir).join("ompt").join(OMPT_TOOL);
        overlay.prepend("OMP_TOOL_LIBRARIES", &tool.to_string_lossy());
        overlay.set("OMP_TOOL", "enabled");
    }

    fn event_globs(&self, mode: TraceMode, profile: bool) -> Vec<&'static str> {
        self.events.globs(mode, profile)
    }
}

/// Events every session records regardless of backends.
pub const METADATA_EVENTS: &[&str] = &["lttng_ust_thapi:*"];

/// Name → handler map. New backends are added with [`Registry::register`].
#[derive(Debug, Default)]
pub struct Registry {
    handlers: BTreeMap<&'static str, Box<dyn TracingBackend>>,
}

impl Registry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut r = Self::empty();
        r.register(Box::new(LoaderBackend {
            name: "cl",
            pattern: "libOpenCL.so",
            location_var: "LIBOPENCL_LOCATION",
            library_var: "LTTNG_UST_OPENCL_LIBOPENCL",
            wrapper_dir: "opencl",
            profile_var: Some("LTTNG_UST_OPENCL_PROFILE"),
            extra_vars: &[("LTTNG_UST_ALLOW_BLOCKING", "1")],
            events: EventTable {
                minimal: &["lttng_ust_opencl:*"],
                default: &["lttng_ust_opencl_devices:*", "lttng_ust_opencl_arguments:*"],
                full: &["lttng_ust_opencl_build:*", "lttng_ust_opencl_dump:*"],
                profiling: &["lttng_ust_opencl_profiling:*"],
            },
        }));
        r.register(Box::new(LoaderBackend {
            name: "ze",
            pattern: "libze_loader.so",
            location_var: "LIBZE_LOADER_LOCATION",
            library_var: "LTTNG_UST_ZE_LIBZE_LOADER",
            wrapper_dir: "ze",
            profile_var: Some("LTTNG_UST_ZE_PROFILE"),
            extra_vars: &[
                ("LTTNG_UST_ALLOW_BLOCKING", "1"),
                ("ZE_ENABLE_TRACING_LAYER", "1"),
            ],
            events: EventTable {
                minimal: &["lttng_ust_ze:*"],
                default: &["lttng_ust_ze_properties:*", "lttng_ust_ze_build:*"],
                full: &["lttng_ust_zet:*", "lttng_ust_zes:*", "lttng_ust_zel:*"],
                profiling: &["lttng_ust_ze_profiling:*"],
            },
        }));
        r.register(Box::new(LoaderBackend {
            name: "cuda",
            pattern: "libcuda.so",
            location_var: "LIBCUDA_LOCATION",
            library_var: "LTTNG_UST_CUDA_LIBCUDA",
            wrapper_dir: "cuda",
            profile_var: Some("LTTNG_UST_CUDA_PROFILE"),
            extra_vars: &[("LTTNG_UST_ALLOW_BLOCKING", "1")],
            events: EventTable {
                minimal: &["lttng_ust_cuda:*"],
                default: &["lttng_ust_cuda_properties:*"],
                full: &["lttng_ust_cuda_args:*"],
                profiling: &["lttng_ust_cuda_profiling:*"],
            },
        }));
        r.register(Box::new(LoaderBackend {
            name: "hip",
            pattern: "libamdhip64.so",
            location_var: "LIBAMDHIP64_LOCATION",
            library_var: "LTTNG_UST_HIP_LIBAMDHIP64",
            wrapper_dir: "hip",
            profile_var: Some("LTTNG_UST_HIP_PROFILE"),
            extra_vars: &[("LTTNG_UST_ALLOW_BLOCKING", "1")],
            events: EventTable {
                minimal: &["lttng_ust_hip:*"],
                default: &["lttng_ust_hip_properties:*"],
                full: &["lttng_ust_hip_args:*"],
                profiling: &["lttng_ust_hip_profiling:*"],
            },
        }));
        r.register(Box::new(LoaderBackend {
            name: "mpi",
            pattern: "libmpi.so",
            location_var: "LIBMPI_LOCATION",
            library_var: "LTTNG_UST_MPI_LIBMPI",
            wrapper_dir: "mpi",
            profile_var: None,
            extra_vars: &[("LTTNG_UST_ALLOW_BLOCKING", "1")],
            events: EventTable {
                minimal: &["lttng_ust_mpi:*"],
                default: &["lttng_ust_mpi_type:*"],
                full: &[],
                profiling: &[],
            },
        }));
        r.register(Box::new(OmptBackend {
            events: EventTable {
                minimal: &["lttng_ust_ompt:*target*"],
                default: &["lttng_ust_ompt:*"],
                full: &[],
                profiling: &[],
            },
        }));
        r
    }

    pub fn register(&mut self, handler: Box<dyn TracingBackend>) {
        self.handlers.insert(handler.name(), handler);
    }

    pub fn get(&self, name: &str) -> Option<&dyn TracingBackend> {
        self.handlers.get(name).map(|h| h.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().map(|k| k.to_string()).collect()
    }
}

pub fn default_backend_names() -> Vec<String> {
    Registry::builtin().names()
}

/// Libraries known to the dynamic linker, grouped by directory in the
/// order the linker cache lists them.
#[derive(Debug, Default)]
struct LibraryDir {
    dir: PathBuf,
    files: Vec<String>,
}

fn parse_linker_cache(listing: &str) -> Vec<LibraryDir> {
    let mut dirs: Vec<LibraryDir> = Vec::new();
    for line in listing.lines() {
        let Some((_, path)) = line.split_once("=>") else {
            continue;
        };
        let path = Path::new(path.trim());
        let (Some(dir), Some(file)) = (path.parent(), path.file_name()) else {
            continue;
        };
        let file = file.to_string_lossy().into_owned();
        match dirs.iter_mut().find(|d| d.dir == dir) {
            Some(d) => d.files.push(file),
            None => dirs.push(LibraryDir {
                dir: dir.to_path_buf(),
                files: vec![file],
            }),
        }
    }
    dirs
}

/// Finds usable 64-bit runtime libraries on this node.
///
/// The linker cache is listed once per detector; binaries are inspected
/// lazily and only until the first 64-bit match for a pattern.
pub struct BackendDetector<'a> {
    config: &'a Config,
    env: &'a dyn Environment,
    runner: &'a dyn CommandRunner,
    linker_cache: OnceCell<Vec<LibraryDir>>,
}

impl<'a> BackendDetector<'a> {
    pub fn new(config: &'a Config, env: &'a dyn Environment, runner: &'a dyn CommandRunner) -> Self {
        Self {
            config,
            env,
            runner,
            linker_cache: OnceCell::new(),
        }
    }

    fn linker_cache(&self) -> &[LibraryDir] {
        self.linker_cache.get_or_init(|| {
            let invocation = Invocation::new(&self.config.ldconfig).arg("-p");
            match self.runner.run(&invocation) {
                Ok(out) => parse_linker_cache(&out.stdout),
                Err(e) => {
                    warn!("could not list the linker cache: {}", e);
                    Vec::new()
                }
            }
        })
    }

    fn candidates<'s>(&'s self, pattern: &'s str) -> impl Iterator<Item = PathBuf> + 's {
        self.linker_cache().iter().flat_map(move |d| {
            d.files
                .iter()
                .filter(move |f| f.starts_with(pattern))
                .map(move |f| d.dir.join(f))
        })
    }

    fn is_64bit(&self, library: &Path) -> bool {
        let invocation = Invocation::new(&self.config.objdump)
            .arg("-f")
            .arg(library.to_string_lossy());
        match self.runner.run(&invocation) {
            Ok(out) => out.stdout.contains("elf64"),
            Err(e) => {
                debug!("cannot inspect {:?}: {}", library, e);
                false
            }
        }
    }

    /// Resolved absolute path of the library for `backend`, if usable.
    pub fn locate(&self, backend: &dyn TracingBackend) -> Option<PathBuf> {
        let forced = self.env.var(backend.location_var()).map(PathBuf::from);
        // the linker cache is only listed once the override is ruled out
        let listed = std::iter::once(()).flat_map(|()| self.candidates(backend.library_pattern()));
        forced
            .into_iter()
            .chain(listed)
            .find(|candidate| self.is_64bit(candidate))
    }

    pub fn detect(&self, registry: &Registry, requested: &[String]) -> Vec<BackendDescriptor> {
        let mut seen = Vec::new();
        let mut descriptors = Vec::new();
        for name in requested {
            if seen.contains(name) {
                continue;
            }
            seen.push(name.clone());
            let Some(backend) = registry.get(name) else {
                warn!("unknown backend {}, ignoring it", name);
                continue;
            };
            let library = self.locate(backend);
            match &library {
                Some(path) => info!("backend {} uses {:?}", name, path),
                None => warn!(
                    "backend {}: no 64-bit {} found, it will not be traced",
                    name,
                    backend.library_pattern()
                ),
            }
            descriptors.push(BackendDescriptor {
                name: name.clone(),
                library_pattern: backend.library_pattern().to_string(),
                env_vars: backend.env_vars().iter().map(|v| v.to_string()).collect(),
                enabled: library.is_some(),
                library,
            });
        }
        descriptors
    }
}
