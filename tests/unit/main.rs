//! Unit tests for pure engine logic (no database required)

mod backoff_test;
mod config_test;
mod severity_test;
