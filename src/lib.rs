//! Runtime supervision for out-of-process language-analysis servers.
//!
//! One [`ServerManager`] owns every running server, keyed by project root:
//! sessions are routed to the instance owning their root, servers start on
//! demand and are reclaimed when their last session goes away, crash-loop
//! restarts are budgeted per project, and shutdown is graceful with an
//! unconditional kill behind it. Each instance talks JSON-RPC through a
//! [`Connection`], which correlates requests with responses, carries
//! cooperative cancellation, and dispatches server-initiated traffic to
//! registered handlers.

pub mod codec;
pub mod types;

pub(crate) mod protocol;
pub(crate) mod router;

mod connection;
mod manager;
mod server;

pub use connection::{Connection, RequestError};
pub use manager::{
    ListenError, PathFilter, ServerManager, SessionFilter, SilentReporter, StartError,
    WorkReporter,
};
pub use protocol::ResponseError;
pub use server::{NativeProcess, NativeSpawner, ServerInstance, ServerProcess, ServerSpawner};
pub use tokio_util::sync::CancellationToken;
pub use types::{
    ChangeEvent, FileAction, LaunchConfig, SessionId, SessionMeta, WatchFilter, WatchedChange,
    WatchedChangeKind,
};
