//! Hoist CLI - pull registry images into docker-loadable archives.

pub mod commands;
pub mod output;
