//! A3S Image CLI - build and inspect single-file container images.

pub mod commands;
pub mod output;
