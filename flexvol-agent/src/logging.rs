// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::config::LogConfig;
use anyhow::Context;
use slog::{Drain, Logger};

type BoxedDrain = Box<dyn Drain<Ok = (), Err = slog::Never> + Send>;

/// Builds the driver's logger.
///
/// Stdout carries the reply to the kubelet, so nothing is ever logged there.
pub fn setup_log(config: &LogConfig) -> anyhow::Result<Logger> {
    let level: slog::Level = config.level.into();
    let mut drains: Vec<BoxedDrain> = Vec::new();

    if let Some(path) = &config.path {
        if let Some(parent) = path.parent() {
            if !parent.as_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("creating log directory {parent}")
                })?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {path}"))?;
        let file_decorator = slog_term::PlainDecorator::new(file);
        let file_drain =
            slog_term::FullFormat::new(file_decorator).build().fuse();
        drains.push(Box::new(file_drain.filter_level(level).fuse()));
    }
    if config.stderr {
        drains.push(Box::new(stderr_env_drain("RUST_LOG")));
    }

    let drain = drains
        .into_iter()
        .reduce(|a, b| -> BoxedDrain {
            Box::new(slog::Duplicate::new(a, b).fuse())
        })
        .unwrap_or_else(|| -> BoxedDrain { Box::new(slog::Discard) });
    let drain = slog_async::Async::new(drain).build().fuse();
    Ok(Logger::root(drain, slog::o!("pid" => std::process::id())))
}

pub(crate) fn stderr_env_drain(
    env_var: &str,
) -> impl Drain<Ok = (), Err = slog::Never> {
    let stderr_decorator = slog_term::TermDecorator::new().stderr().build();
    let stderr_drain =
        slog_term::FullFormat::new(stderr_decorator).build().fuse();
    let mut builder = slog_envlogger::LogBuilder::new(stderr_drain);
    if let Ok(s) = std::env::var(env_var) {
        builder = builder.parse(&s);
    } else {
        // Log at the info level by default.
        builder = builder.filter(None, slog::FilterLevel::Info);
    }
    builder.build()
}
