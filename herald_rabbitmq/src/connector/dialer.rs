use crate::{DialError, Handle};
use async_trait::async_trait;
use lapin::{Connection, ConnectionProperties};

/// Opens AMQP connections for a [`Connector`](crate::Connector).
///
/// The default [`AmqpDialer`] connects straight to the broker described by
/// the [`Handle`]. A custom dialer can wrap it to add behavior around the
/// handshake (custom TLS roots, routing through a proxy, counting attempts).
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Opens a new connection to the broker behind the given handle,
    /// honouring its dial timeout.
    async fn dial(&self, handle: &Handle) -> Result<Connection, DialError>;
}

/// Dials with [`lapin::Connection::connect`] on the current Tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpDialer;

#[async_trait]
impl Dialer for AmqpDialer {
    async fn dial(&self, handle: &Handle) -> Result<Connection, DialError> {
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        let dsn = handle.dsn();
        let timeout = handle.dial_timeout();

        match tokio::time::timeout(timeout, Connection::connect(dsn.unsecure(), properties)).await
        {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(source)) => Err(DialError::Failed {
                identifier: handle.identifier(),
                source,
            }),
            Err(_) => Err(DialError::Timeout {
                identifier: handle.identifier(),
                timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn silent_broker_times_out() {
        // Given
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = Handle::new("silent")
            .with_host("127.0.0.1")
            .with_port(port)
            .with_dial_timeout(Duration::from_millis(200));

        // When
        let result = AmqpDialer.dial(&handle).await;

        // Then
        match result {
            Err(DialError::Timeout { identifier, .. }) => {
                assert_eq!(identifier, format!("guest@127.0.0.1:{}/%2F", port));
            }
            Err(DialError::Failed { .. }) => {}
            Ok(_) => panic!("dialed a listener that never speaks AMQP"),
        }

        drop(listener);
    }
}
