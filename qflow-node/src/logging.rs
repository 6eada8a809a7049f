//! Structured logging setup. Colored console output plus an optional
//! date-based rotating file sink, built on `fern` with its `colored` and
//! `date-based` features.

use fern::colors::{Color, ColoredLevelConfig};

/// `trace` carries per-step host-call detail; `debug` lease/lifecycle
/// transitions; `info` flow-level milestones (admitted, completed, failed);
/// `warn` retried errors; `error` fatal ones. Call sites across the other
/// `qflow-*` crates already log at these levels; this only wires the sink.
pub fn init(level: &str, log_file: Option<&str>) {
    let colors = ColoredLevelConfig::new()
        .trace(Color::BrightBlack)
        .debug(Color::Blue)
        .info(Color::Green)
        .warn(Color::Yellow)
        .error(Color::Red);

    let level = level.parse::<log::LevelFilter>().unwrap_or(log::LevelFilter::Info);

    let mut dispatch = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout());

    if let Some(path) = log_file {
        dispatch = dispatch.chain(fern::DateBased::new(path, "%Y-%m-%d.log"));
    }

    // `apply()` only errs if a global logger is already set, which happens
    // harmlessly across multiple integration test binaries in one process.
    let _ = dispatch.apply();
}
