pub mod parser;
pub mod schema;

pub use parser::{find_config, load_config, parse_config};
pub use schema::{AppealConfig, GateConfig, HookEntry, ReviewerConfig, Task, TaskKind, When};
