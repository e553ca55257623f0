//! Task dispatch: typed operations executed on the node that owns their
//! target, with a shared request channel and per-call reply channels.

pub mod dispatcher;
pub mod handlers;
pub mod operation;
pub mod registry;
mod routing;

pub use dispatcher::{spawn_request_listener, TIMEOUT_INFO};
pub use handlers::{ban_screen, register_builtin};
pub use operation::{Task, TaskKind, TaskRequest};
pub use registry::{TaskHandler, TaskRegistry};
