mod exec_event;
mod tool_run;

pub use exec_event::*;
pub use tool_run::*;
