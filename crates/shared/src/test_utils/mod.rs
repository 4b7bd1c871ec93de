pub mod repository;

/// One-time test process setup: logging to stdout at whatever RUST_LOG says.
#[macro_export]
macro_rules! setup_test {
    () => {{
        static INIT: std::sync::Once = std::sync::Once::new();
        INIT.call_once(|| {
            let _ = $crate::logging::configure_stdout_logging();
        });
    }};
}
