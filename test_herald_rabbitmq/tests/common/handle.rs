use herald_core::BackoffConfig;
use herald_rabbitmq::Handle;
use std::time::Duration;

pub fn rabbitmq_port() -> u16 {
    std::env::var("RABBITMQ_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(5672)
}

pub fn make_rabbitmq_handle() -> Handle {
    Handle::new("test_rabbitmq")
        .with_host("localhost")
        .with_port(rabbitmq_port())
        .with_credentials("admin", "admin")
        .with_vhost("/")
        .with_dial_timeout(Duration::from_secs(2))
        .with_backoff(fast_backoff())
}

/// Reaches the broker through the given local port instead.
pub fn make_proxied_handle(port: u16) -> Handle {
    make_rabbitmq_handle().with_host("127.0.0.1").with_port(port)
}

pub fn fast_backoff() -> BackoffConfig {
    BackoffConfig::default()
        .with_initial_interval(Duration::from_millis(50))
        .with_max_interval(Duration::from_millis(200))
}
