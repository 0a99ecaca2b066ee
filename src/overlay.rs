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

use crate::backend::{BackendDescriptor, Registry};
use crate::config::Config;
use crate::env_probe::Environment;
use crate::rank::RankContext;

use std::collections::BTreeMap;

const LIST_SEPARATOR: &str = ":";

/// Variables to inject into the traced workload.
///
/// List-valued variables (search paths, preload lists) are prepended to
/// whatever the parent already has; scalar variables replace it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnvOverlay {
    lists: BTreeMap<String, Vec<String>>,
    scalars: BTreeMap<String, String>,
}

impl EnvOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the overlay for this rank.
    ///
    /// Ranks outside the traced selection get an empty overlay and run the
    /// workload untouched.
    pub fn for_rank(
        ctx: &RankContext,
        config: &Config,
        registry: &Registry,
        backends: &[BackendDescriptor],
    ) -> Self {
        let mut overlay = Self::new();
        if !config.traced_ranks.contains(ctx.global_rank()) {
            return overlay;
        }
        for descr in backends.iter().filter(|d| d.enabled) {
            if let (Some(handler), Some(library)) = (registry.get(&descr.name), &descr.library) {
                handler.inject_environment(library, config, &mut overlay);
            }
        }
        overlay
    }

    pub fn prepend(&mut self, name: &str, value: &str) {
        let entries = self.lists.entry(name.to_string()).or_default();
        if !entries.iter().any(|e| e == value) {
            entries.push(value.to_string());
        }
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.scalars.insert(name.to_string(), value.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty() && self.scalars.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.lists.keys().chain(self.scalars.keys()).map(String::as_str)
    }

    /// Final `(name, value)` pairs, merged with the current values in `env`.
    pub fn resolve(&self, env: &dyn Environment) -> Vec<(String, String)> {
        let mut vars = Vec::with_capacity(self.lists.len() + self.scalars.len());
        for (name, entries) in self.lists.iter() {
            let mut value = entries.join(LIST_SEPARATOR);
            if let Some(existing) = env.var(name).filter(|v| !v.is_empty()) {
                value.push_str(LIST_SEPARATOR);
                value.push_str(&existing);
            }
            vars.push((name.clone(), value));
        }
        for (name, value) in self.scalars.iter() {
            vars.push((name.clone(), value.clone()));
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env_probe::MapEnv;

    #[test]
    fn lists_are_prepended() {
        let mut overlay = EnvOverlay::new();
        overlay.prepend("LD_LIBRARY_PATH", "/opt/thapi/lib/opencl");
        overlay.prepend("LD_LIBRARY_PATH", "/opt/thapi/lib/ze");
        overlay.prepend("LD_LIBRARY_PATH", "/opt/thapi/lib/opencl");
        overlay.set("LTTNG_UST_ALLOW_BLOCKING", "1");

        let env = MapEnv::from([
            ("LD_LIBRARY_PATH", "/usr/local/lib"),
            ("LTTNG_UST_ALLOW_BLOCKING", "0"),
        ]);
        let vars: BTreeMap<_, _> = overlay.resolve(&env).into_iter().collect();
        assert_eq!(
            vars["LD_LIBRARY_PATH"],
            "/opt/thapi/lib/opencl:/opt/thapi/lib/ze:/usr/local/lib"
        );
        assert_eq!(vars["LTTNG_UST_ALLOW_BLOCKING"], "1");
    }

    #[test]
    fn unset_list_has_no_trailing_separator() {
        let mut overlay = EnvOverlay::new();
        overlay.prepend("LD_PRELOAD", "libfoo.so");
        let vars = overlay.resolve(&MapEnv::from([("LD_PRELOAD", "")]));
        assert_eq!(vars, vec![("LD_PRELOAD".to_string(), "libfoo.so".to_string())]);
    }

    #[test]
    fn empty_overlay() {
        let overlay = EnvOverlay::new();
        assert!(overlay.is_empty());
        assert!(overlay.resolve(&MapEnv::new()).is_empty());
    }
}
