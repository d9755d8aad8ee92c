use tracing::Level;

/// Installs a fmt subscriber that writes through the libtest capture.
/// Calling it more than once is harmless.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}
