//! Configuration loading tests.

use argus::config::Config;

#[test]
fn loads_from_env_with_defaults_and_overrides() {
    std::env::set_var("DATABASE_URL", "postgres://localhost:5432/argus_test");
    std::env::set_var("EVENTS_QUEUE", "events_cfg_test");
    std::env::set_var("SUMMARY_BUCKET_SECONDS", "120");
    std::env::remove_var("GEMINI_API_KEY");

    let config = Config::from_env().unwrap();

    assert_eq!(config.events_queue, "events_cfg_test");
    assert_eq!(config.bucket_width(), chrono::Duration::seconds(120));
    assert!(config.gemini_api_key.is_none());
    assert_eq!(config.dlq_queue, "events_dlq");
    assert_eq!(config.batch_size, 100);
    assert_eq!(config.flush_interval.as_millis(), 500);
}
