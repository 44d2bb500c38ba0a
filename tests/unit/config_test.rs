//! Unit tests for engine configuration defaults

use std::time::Duration;

use escalade::config::EngineConfig;
use pretty_assertions::assert_eq;

#[test]
fn test_engine_defaults() {
    let config = EngineConfig::default();

    assert!(!config.pause_on_acknowledge);
    assert_eq!(config.bundle_window, Duration::from_secs(120));
    assert_eq!(config.max_task_attempts, 5);
    assert_eq!(config.retry_base, Duration::from_secs(60));
    assert_eq!(config.retry_max, Duration::from_secs(3600));
    assert_eq!(config.max_grouping_retries, 10);
}
