use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::SubscriberBuilder;

/// Host `verbose` parameter to a tracing level.
pub fn level_for(verbosity: u32) -> tracing::Level {
    match verbosity {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

/*
    @@@
    @logs_tracing();
    . Creates a daily-rotating log file (<dir>/<file>) and wraps it in a non-blocking writer.
    . Configures a tracing subscriber at the level picked by `verbosity` (with targets, no ANSI) on that writer.
    . Keeps the appender alive by returning the guard.
*/
pub fn logs_tracing(dir: &str, file: &str, verbosity: u32) -> anyhow::Result<WorkerGuard> {
    let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, file);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let subscriber = SubscriberBuilder::default()
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_writer(non_blocking)
        .with_max_level(level_for(verbosity))
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(guard)
}

/// Stderr subscriber for the command-line launchers.
pub fn console_tracing(verbosity: u32) -> anyhow::Result<()> {
    let subscriber = SubscriberBuilder::default()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_max_level(level_for(verbosity))
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
