//! # confstore
//!
//! Library half of the `confstore` binary: command definitions, the
//! configuration file, and the restriction expression syntax.

pub mod cli;
pub mod config;
pub mod expr;
