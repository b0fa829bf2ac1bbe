//! Integration tests for the volcap capture engine

mod capture_failures;
mod capture_scenarios;
mod host_volume;
pub mod test_utils;
