//! CLI support shared by both binaries

mod logging;
mod version;

pub use logging::{init_logging, init_probe_logging};
pub use version::display_version;
