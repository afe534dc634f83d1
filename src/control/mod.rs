//! Pipeline control: the state machine, command delivery, and the external
//! signals that feed it (permission, output route changes, notification).

pub mod command;
mod controller;
pub mod notify;
mod permission;
pub mod route;

pub use command::{CommandQueue, CommandSender, ConsoleInput, save_preference};
pub use controller::{Command, PipelineController, PipelineState, StateObserver, StateSnapshot};
pub use notify::ConsoleNotifier;
pub use permission::{InputPermission, PermissionGate};
pub use route::RouteWatcher;
