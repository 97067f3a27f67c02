use std::path::Path;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub fn init_logger(level: &str, log_path: &Path, file_log: bool) -> Option<impl Drop> {
    let filter_layer = EnvFilter::new(level);

    let (file_layer, guard) = if file_log {
        let dir = log_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = log_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "drivespan.log".into());
        let file_appender = tracing_appender::rolling::never(dir, name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        (
            Some(fmt::layer().with_writer(non_blocking).with_ansi(false)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .pretty()
                .with_file(false)
                .without_time()
                .with_ansi(true),
        )
        .with(file_layer)
        .with(filter_layer)
        .init();

    info!("logging configured");

    guard
}
