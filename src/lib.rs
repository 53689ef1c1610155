//! aoe-sync library - keeps a local git checkout in sync with an agent's sandbox

pub mod cli;
pub mod config;
pub mod environment;
pub mod git;
pub mod process;
pub mod sync;
pub mod task;
