//! File logging
//!
//! Stdout carries the protocol response and stderr is often discarded by
//! the runtime, so the plugin logs to a file. A log file that cannot be
//! opened disables logging instead of failing the request.

use std::env;
use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILE: &str = "/var/log/vxnet-cni.log";

pub fn init() {
    let path = env::var("VXNET_CNI_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILE.to_string());
    let path = Path::new(&path);
    let (Some(dir), Some(file)) = (path.parent(), path.file_name()) else {
        return;
    };

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file.to_string_lossy())
        .build(dir);
    let Ok(appender) = appender else {
        return;
    };

    // Writes are synchronous: the process is short-lived and may exit
    // before a background writer flushes.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_writer(appender)
        .with_ansi(false)
        .try_init();
}
