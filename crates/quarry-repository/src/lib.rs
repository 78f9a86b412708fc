//! Package discovery and the local dependency graph for a multi-package
//! repository.

#![deny(clippy::all)]

pub mod discovery;
pub mod manifest;
pub mod package_graph;
