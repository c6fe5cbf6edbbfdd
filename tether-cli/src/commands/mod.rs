//! CLI command implementations

pub mod sessions;
pub mod sync;

pub use sessions::SessionsArgs;
pub use sync::SyncArgs;
