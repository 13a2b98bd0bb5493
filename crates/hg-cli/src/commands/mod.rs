//! CLI command implementations

mod apply;
mod backups;
mod config;
mod plan;

pub use apply::apply_command;
pub use backups::{backups_command, restore_command};
pub use config::{config_get, config_init, config_path, config_set, config_show};
pub use plan::{plan_command, status_command};
