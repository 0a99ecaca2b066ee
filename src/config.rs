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

use crate::backend;
use crate::env_probe::Environment;

use log::error;

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

macro_rules! field_from_env {
    ($env: expr, $s: expr, $field: ident) => {
        let env_name = iprof_config!(stringify!($field).to_uppercase());
        $s.$field = parse_env($env, &env_name);
    };
    ($env: expr, $s: expr, $field: ident, $d: expr) => {
        let env_name = iprof_config!(stringify!($field).to_uppercase());
        $s.$field = parse_env($env, &env_name).unwrap_or($d);
    };
    ($env: expr, $s: expr, $env_name: literal, $field: ident, $d: expr) => {
        $s.$field = parse_env($env, $env_name).unwrap_or($d);
    };
}

macro_rules! iprof_config {
    ($s: expr) => {
        format!("IPROF_{}", $s)
    };
}

/// How much of each backend's API surface gets traced.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceMode {
    Minimal,
    #[default]
    Default,
    Full,
}

impl FromStr for TraceMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "minimal" => Ok(TraceMode::Minimal),
            "default" => Ok(TraceMode::Default),
            "full" => Ok(TraceMode::Full),
            other => Err(format!("unknown trace mode {}", other)),
        }
    }
}

/// Global ranks whose workload gets the tracing environment.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum RankSelection {
    #[default]
    All,
    Ranks(BTreeSet<u32>),
}

impl RankSelection {
    pub const WILDCARD: i64 = -1;

    pub fn from_values<I: IntoIterator<Item = i64>>(values: I) -> Result<Self, String> {
        let mut ranks = BTreeSet::new();
        for v in values {
            if v == Self::WILDCARD {
                return Ok(RankSelection::All);
            }
            let rank = u32::try_from(v).map_err(|_| format!("invalid rank {}", v))?;
            ranks.insert(rank);
        }
        Ok(RankSelection::Ranks(ranks))
    }

    pub fn contains(&self, global_rank: u32) -> bool {
        match self {
            RankSelection::All => true,
            RankSelection::Ranks(ranks) => ranks.contains(&global_rank),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Config {
    // What to trace
    pub backends: Vec<String>,
    pub trace_mode: TraceMode,
    pub profile: bool,
    pub traced_ranks: RankSelection,

    // Where things live
    pub trace_output: Option<String>,
    pub home_dir: String,
    pub local_shared_dir: String,
    pub lock_namespace: String,
    pub trace_root: String,
    pub lib_dir: String,

    // External tools
    pub lttng: String,
    pub lttng_sessiond: String,
    pub ldconfig: String,
    pub objdump: String,

    // Barrier polling
    pub barrier_timeout: Option<Duration>,
    pub backoff_cap: Option<Duration>,

    pub log: String,
}

impl Config {
    pub fn from_env(env: &dyn Environment) -> Self {
        let mut s = Config::default();
        field_from_env!(env, s, backends, backend::default_backend_names());
        field_from_env!(env, s, trace_mode, TraceMode::Default);
        field_from_env!(env, s, profile, true);
        field_from_env!(env, s, traced_ranks, RankSelection::All);

        field_from_env!(env, s, trace_output);
        field_from_env!(env, s, "HOME", home_dir, String::from("/tmp"));
        field_from_env!(env, s, local_shared_dir, String::from("/dev/shm"));
        field_from_env!(env, s, lock_namespace, String::from(".thapi_lock"));
        field_from_env!(env, s, trace_root, String::from("thapi-traces"));
        field_from_env!(env, s, lib_dir, String::from("/usr/lib/thapi"));

        field_from_env!(env, s, lttng, String::from("lttng"));
        field_from_env!(env, s, lttng_sessiond, String::from("lttng-sessiond"));
        field_from_env!(env, s, ldconfig, String::from("ldconfig"));
        field_from_env!(env, s, objdump, String::from("objdump"));

        field_from_env!(env, s, barrier_timeout);
        field_from_env!(env, s, backoff_cap);

        field_from_env!(env, s, log, String::from("warn"));

        s
    }
}

trait FromConfigStr: Sized {
    type Err;
    fn parse(s: &str) -> Result<Self, Self::Err>;
}

// macro that implements FromConfigStr trait with FromStr
macro_rules! default_config_parser {
    ($t: tt) => {
        impl FromConfigStr for $t {
            type Err = <$t as FromStr>::Err;
            fn parse(s: &str) -> Result<Self, Self::Err> {
                <$t as FromStr>::from_str(s)
            }
        }
    };
}

default_config_parser!(String);
default_config_parser!(TraceMode);

impl FromConfigStr for bool {
    type Err = String;
    fn parse(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_lowercase();
        const TRUE: &[&str] = &["true", "y", "yes", "1"];
        const FALSE: &[&str] = &["false", "n", "no", "0"];
        if TRUE.iter().any(|i| *i == s) {
            return Ok(true);
        }
        if FALSE.iter().any(|i| *i == s) {
            return Ok(false);
        }
        Err(format!("Could not parse {} to bool", s))
    }
}

impl FromConfigStr for Vec<String> {
    type Err = String;
    fn parse(s: &str) -> Result<Self, Self::Err> {
        let items: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|i| !i.is_empty())
            .map(String::from)
            .collect();
        if items.is_empty() {
            return Err(format!("Could not parse {:?} to a list", s));
        }
        Ok(items)
    }
}

impl FromConfigStr for RankSelection {
    type Err = String;
    fn parse(s: &str) -> Result<Self, Self::Err> {
        let values = Vec::<String>::parse(s)?
            .iter()
            .map(|v| {
                v.parse::<i64>()
                    .map_err(|e| format!("Could not parse {} to rank: {}", v, e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        RankSelection::from_values(values)
    }
}

mod duration_parser {
    use nom::{
        character::complete::{alpha1, digit1},
        combinator::map_res,
        multi::fold_many1,
        sequence::pair,
        IResult, Parser as _,
    };

    use std::time::Duration;

    fn parse_u64(input: &str) -> IResult<&str, u64> {
        map_res(digit1, |s: &str| s.parse::<u64>()).parse(input)
    }

    fn parse_duration_component(input: &str) -> IResult<&str, Duration> {
        let (input, (value, unit)) = pair(parse_u64, alpha1).parse(input)?;

        let too_large = || {
            nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::TooLarge,
            ))
        };
        let secs = |scale: u64| {
            value
                .checked_mul(scale)
                .map(Duration::from_secs)
                .ok_or_else(too_large)
        };
        let dur = match unit {
            "d" => secs(24 * 60 * 60)?,
            "h" => secs(60 * 60)?,
            "m" => secs(60)?,
            "s" => Duration::from_secs(value),
            "ms" => Duration::from_millis(value),
            "us" => Duration::from_micros(value),
            _ => {
                return Err(nom::Err::Failure(nom::error::Error::new(
                    unit,
                    nom::error::ErrorKind::Tag,
                )))
            }
        };
        Ok((input, dur))
    }

    pub fn parse(input: &str) -> IResult<&str, Duration> {
        let (remaining, maybe_dur) = fold_many1(
            parse_duration_component,
            || Ok(Duration::default()),
            |acc: Result<_, nom::Err<_>>, item| {
                acc?.checked_add(item).ok_or_else(|| {
                    nom::Err::Failure(nom::error::Error::new(
                        input,
                        nom::error::ErrorKind::TooLarge,
                    ))
                })
            },
        )
        .parse(input)?;
        Ok((remaining, maybe_dur?))
    }
}

impl FromConfigStr for Duration {
    type Err = String;
    fn parse(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_lowercase();
        if let Ok((remaining, dur)) = duration_parser::parse(&s) {
            if remaining.is_empty() {
                return Ok(dur);
            }
        }
        Err(format!("Could not parse {} to duration", s))
    }
}

fn parse_env<T>(env: &dyn Environment, name: &str) -> Option<T>
where
    T: FromConfigStr,
    <T as FromConfigStr>::Err: std::fmt::Debug,
{
    env.var(name).and_then(|s| {
        T::parse(&s)
            .map_err(|e| {
                error!("Error parsing config {}, got error {:?}", name, e);
                e
            })
            .ok()
    })
}
