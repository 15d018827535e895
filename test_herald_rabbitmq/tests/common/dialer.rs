use async_trait::async_trait;
use herald_rabbitmq::{AmqpDialer, DialError, Dialer, Handle};
use lapin::Connection;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Dials like [`AmqpDialer`], counting the attempts.
#[derive(Default)]
pub struct CountingDialer {
    attempts: AtomicUsize,
}

impl CountingDialer {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for CountingDialer {
    async fn dial(&self, handle: &Handle) -> Result<Connection, DialError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        AmqpDialer.dial(handle).await
    }
}
