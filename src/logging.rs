use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber filtered by `rust_log`
/// (an `EnvFilter` directive such as `info` or `rabbitmq_adapter=debug`).
///
/// Invalid directives fall back to `info`. Safe to call more than once.
pub fn init(rust_log: &str) {
    let filter = EnvFilter::try_new(rust_log).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .try_init();
}
