pub mod activity;
pub mod appeal;
pub mod check;
pub mod config;
pub mod detached;
pub mod error;
pub mod event;
pub mod event_log;
pub mod reviewer;
pub mod scheduler;
pub mod session;

mod gate;

/// Set on every child the gate spawns. A gate that sees it does nothing.
pub const ACTIVE_ENV: &str = "TOLLGATE_ACTIVE";

pub use check::CheckOutcome;
pub use config::{load_config, GateConfig};
pub use error::GateError;
pub use event::{EventClass, HookEvent};
pub use gate::{recursion_guarded, Gate, GateReport, TaskReport};
pub use reviewer::{ClaudeReviewer, MockReviewer, Reviewer};
