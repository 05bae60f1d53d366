pub mod command_parser;
pub mod completion;
pub mod host;
pub mod output;
pub mod pool;
pub mod process;
pub mod runner;
pub mod session;
pub mod spawner;

pub use pool::SessionPool;
pub use process::{ExitCodeDetails, ProcessHandle, TerminalProcess};
pub use session::{RunCallbacks, Session, SessionInfo, SessionLease, TerminalProvider};
