pub mod builders;
pub mod fixtures;
pub mod server;
pub mod shared;

pub use builders::*;
pub use fixtures::{RecordingEvents, ScriptedAccess};
pub use server::TestServer;
pub use shared::SharedDatabase;

use tracing_subscriber::EnvFilter;

/// Installs a test-writer subscriber honouring `RUST_LOG`. Safe to call
/// from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}
