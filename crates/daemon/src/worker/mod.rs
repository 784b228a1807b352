//! External downloader process handling for the Fetch Relay Daemon

pub mod args;
pub mod passthrough;
pub mod supervisor;

pub use args::{build_worker_command, ArgTemplate, WorkerInvocation};
pub use passthrough::PassthroughStream;
pub use supervisor::{ProcessSupervisor, SupervisorError, WorkerExit};
