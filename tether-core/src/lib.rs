//! Tether Core - Bidirectional working-tree sync with a remote container
//!
//! Keeps a local git working tree and its copy inside a container in step:
//! file edits flow both ways as they happen, and host commits, checkouts and
//! resets are replayed on the remote repository with identical hashes.

pub mod bridge;
pub mod config;
pub mod error;
pub mod git;
pub mod registry;
pub mod session;
pub mod sync;

pub use bridge::{CommandBridge, DockerBridge, ExecRequest, LocalBridge, RemoteProcess};
pub use config::{BridgeKind, Config, RemoteConfig, SyncConfig};
pub use error::{Error, Result};
pub use git::{HeadState, HostTree, RemoteTree, WorkTree};
pub use registry::{RegisteredSession, SessionGuard, SessionRecord, SessionRegistry};
pub use session::SyncSession;
pub use sync::SyncEngine;
