//! Cross-module tests for stagehand
//!
//! Plugin repositories are built in temporary directories; scheduling tests
//! talk to a service on a loopback port.

mod test_config;
mod test_graph;
mod test_protocol;
mod test_resolver;
