pub mod exec;
pub mod exit;
pub mod fork;
pub mod read;
pub mod sh;

pub use exec::{ExecTool, Reincarnator};
pub use exit::{ExitDecision, ExitSignal, ExitStatus, ExitTool};
pub use fork::{ForkContext, ForkTool};
pub use read::{ReadTool, StdinShim};
pub use sh::ShTool;
