mod cron;
mod verify;

pub use cron::cmd_cron;
pub use verify::cmd_verify;
