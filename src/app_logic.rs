/*
 * This module provides the application logic layer between the command line
 * and the engine in `core`: `AdminLogic` loads the configuration, resolves the
 * target operation and runs the requested command on it.
 * Unit tests for `AdminLogic` are in `handler_tests.rs`.
 */
pub mod handler;


pub use handler::{AdminCommand, AdminError, AdminLogic, AdminSettings};
