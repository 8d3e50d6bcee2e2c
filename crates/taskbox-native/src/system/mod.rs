//! Thin wrappers over the OS: user accounts and process trees.

pub mod process;
pub mod user;

pub use process::{Process, ProcessOptions, kill_group};
pub use user::{User, change_owner, change_owner_recursive, kill_by_owner};
