//! Agent Foreman — queue-driven orchestration of agent CLIs.

pub mod chats;
pub mod cli;
pub mod config;
pub mod error;
pub mod jobs;
pub mod store;
pub mod tasks;
pub mod workspaces;

#[cfg(test)]
pub(crate) mod testing;
