// Copyright 2021 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A pluggable sink behind the `log` facade, the same split the donor
//! workspace uses between `log`'s macros and a concrete backend (there,
//! `syslog`; here, whatever the platform wires up to the debug UART or an
//! in-memory ring buffer — both out of scope for this crate, which only
//! needs the seam).

use log::Level;
use log::LevelFilter;
use log::Metadata;
use log::Record;
use once_cell::sync::OnceCell;

static LOGGER: OnceCell<GlobalLogger> = OnceCell::new();

/// A destination for formatted log lines. Implementations are expected to
/// be cheap and non-blocking; the run-loop calls through this on the same
/// pCPU that produced the event.
pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, line: &str);
}

/// A `LogSink` that discards everything. The only sink this crate ships;
/// anything that writes somewhere real (debug sbuf, a host console channel)
/// is a platform integration, not part of this crate.
pub struct NullSink;

impl LogSink for NullSink {
    fn log(&self, _level: Level, _line: &str) {}
}

struct GlobalLogger {
    sink: Box<dyn LogSink>,
    max_level: LevelFilter,
}

impl log::Log for GlobalLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "[{:<5} {}:{}] {}",
            record.level(),
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
            record.args()
        );
        self.sink.log(record.level(), &line);
    }

    fn flush(&self) {}
}

/// Installs `sink` as the process-wide `log` backend at `max_level`.
/// Idempotent: the first call wins, later calls are no-ops, matching the
/// donor's "install once, read from everywhere" logger lifecycle.
pub fn init_logging(sink: Box<dyn LogSink>, max_level: LevelFilter) {
    let _ = LOGGER.get_or_init(|| GlobalLogger { sink, max_level });
    if let Some(logger) = LOGGER.get() {
        let _ = log::set_logger(logger);
        log::set_max_level(logger.max_level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sink_accepts_every_level() {
        let sink = NullSink;
        sink.log(Level::Error, "boom");
        sink.log(Level::Trace, "quiet");
    }
}
