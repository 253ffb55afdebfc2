mod check;
mod read;
mod run;
mod state;

pub use check::cmd_check;
pub use read::cmd_read;
pub use run::cmd_run;
pub use state::{cmd_state_clear, cmd_state_show};
