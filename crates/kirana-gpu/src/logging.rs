//! Logging initialization.

/// Initialize the logging system.
///
/// Uses env_logger with a default filter level of `info`; override with the
/// `RUST_LOG` environment variable. Calling it more than once is harmless.
///
/// # Example
/// ```
/// kirana_gpu::logging::init();
/// log::info!("Viewport started");
/// ```
pub fn init() {
    init_with_default("info");
}

/// Same as [`init`] with a different default filter, e.g. `"kirana_gpu=debug"`.
pub fn init_with_default(filter: &str) {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(filter)
    ).try_init();
}
