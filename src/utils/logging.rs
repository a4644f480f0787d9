use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or invalid
pub const DEFAULT_LOG_FILTER: &str = "video_archiver=info";

/// Install a fmt subscriber filtered by `RUST_LOG`. Repeated calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Like [`init_tracing`] but with an explicit level for this crate, as read
/// from `LoggingConfig::level`. `RUST_LOG` still wins when set.
pub fn init_tracing_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("video_archiver={}", level)));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
