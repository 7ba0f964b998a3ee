//! Test modules for the shared crate

mod config_tests;
