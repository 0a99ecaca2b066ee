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

use crate::rank::RankContext;

use std::io::Write as _;

/// `host:global:local`, prepended to every record.
pub fn record_prefix(hostname: &str, ctx: &RankContext) -> String {
    format!("{}:{}:{}", hostname, ctx.global_rank(), ctx.local_rank())
}

/// Logger writing to stderr with the rank prefix. `filter` uses the
/// `RUST_LOG` syntax.
pub fn build(filter: &str, hostname: &str, ctx: &RankContext) -> env_logger::Logger {
    let prefix = record_prefix(hostname, ctx);
    env_logger::Builder::new()
        .parse_filters(filter)
        .format(move |buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                prefix,
                record.level(),
                record.target(),
                record.args()
            )
        })
        .build()
}

/// Installs the process logger. Only the first call has an effect.
pub fn init(filter: &str, hostname: &str, ctx: &RankContext) {
    let logger = build(filter, hostname, ctx);
    let level = logger.filter();
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_names_host_and_ranks() {
        let ctx = RankContext::managed("job", 12, 3, 4);
        assert_eq!(record_prefix("x1000c0s0b0n0", &ctx), "x1000c0s0b0n0:12:3");
    }

    #[test]
    fn filter_is_parsed() {
        let ctx = RankContext::standalone();
        let logger = build("iprof=debug", "node", &ctx);
        assert_eq!(logger.filter(), log::LevelFilter::Debug);
        let logger = build("", "node", &ctx);
        assert_eq!(logger.filter(), log::LevelFilter::Error);
    }
}
