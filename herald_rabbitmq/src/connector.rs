use crate::{DialError, GatewayError, Handle};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use herald_core::{Backoff, BackoffExhausted, Conduit, Retriever, Scope, Spindown, SpindownToken};
use lapin::{Channel, Connection, Error as LapinError};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub mod dialer;
pub mod state;

use self::dialer::Dialer;
use self::state::ConnectionState;

/// Every this many discarded connections, the connector waits for the
/// background closing of the previous ones to finish.
const DISCARDED_BETWEEN_CLEANUPS: usize = 10;

/// Runs in the background and maintains no more than one open connection to
/// the broker identified by a [`Handle`]. Hands out fresh channels on that
/// connection through a cheaply cloneable [`Gateway`].
///
/// The connector reconnects when the broker reports the connection as broken,
/// or when a channel cannot be created on it. Every reconnection is paced by
/// the handle's backoff; once the backoff gives up, the connector moves to
/// [`ConnectionState::Exhausted`] and stops, and every pending or future
/// channel request fails with [`GatewayError::ReconnectExhausted`].
///
/// Each successful dial bumps the connection **generation**. Channels carry the
/// generation they were created in, so that per-connection memos (like the set
/// of already declared exchanges) can tell when they went stale.
///
/// Discarded connections are closed in the background; the connector waits
/// for those to finish before it completes.
pub struct Connector {
    name: Arc<str>,
    identifier: Arc<str>,
    handle: Handle,
    dialer: Arc<dyn Dialer>,
    connection: Option<Connection>,
    generation: u64,
    discarded_connections: FuturesUnordered<JoinHandle<()>>,
    discarded_count: usize,
    backoff: Backoff,
    conduit: Conduit<Result<LinkedChannel, GatewayError>>,
    broken_sender: mpsc::UnboundedSender<u64>,
    broken_receiver: mpsc::UnboundedReceiver<u64>,
    state: watch::Sender<ConnectionState>,
    scope: Scope,
    _spindown_token: SpindownToken,
}

/// Requests channels from a running [`Connector`].
#[derive(Clone)]
pub struct Gateway {
    retriever: Retriever<Result<LinkedChannel, GatewayError>>,
    state: watch::Receiver<ConnectionState>,
    scope: Scope,
}

/// A channel together with the generation of the connection it lives on.
#[derive(Clone)]
pub struct LinkedChannel {
    channel: Channel,
    generation: u64,
}

impl LinkedChannel {
    /// Exposes the channel.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Reports the generation of the connection behind the channel.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

enum Event {
    Shutdown,
    Broken(u64),
    Request(Option<oneshot::Sender<Result<LinkedChannel, GatewayError>>>),
}

enum Flow {
    Continue,
    Stop,
}

impl Connector {
    /// Dials the broker behind the given handle and, on success, sends a new
    /// connector into the background to serve channels until the given scope
    /// is cancelled.
    ///
    /// The initial dial is made exactly once: its failure is returned to the
    /// caller rather than retried.
    pub async fn start(
        handle: Handle,
        dialer: Arc<dyn Dialer>,
        scope: Scope,
        spindown: &Spindown,
    ) -> Result<Gateway, DialError> {
        let name = Self::compose_name(&handle);
        let identifier: Arc<str> = Arc::from(handle.identifier());
        let (state, state_receiver) = watch::channel(ConnectionState::Init);

        state.send_replace(ConnectionState::Dialing);
        info!(
            name = name.as_ref(),
            identifier = identifier.as_ref(),
            "Connecting to RabbitMQ",
        );

        let connection = match dialer.dial(&handle).await {
            Ok(connection) => connection,
            Err(error) => {
                state.send_replace(ConnectionState::Failed);
                error!(
                    alert = true,
                    name = name.as_ref(),
                    identifier = identifier.as_ref(),
                    ?error,
                    error_message = %error,
                    "Failed to establish the initial RabbitMQ connection",
                );
                return Err(error);
            }
        };

        let backoff = Backoff::new(handle.backoff());
        let conduit = Conduit::new();
        let retriever = conduit.retriever();
        let (broken_sender, broken_receiver) = mpsc::unbounded_channel();
        let _spindown_token = spindown.register(&name);

        let mut connector = Self {
            name,
            identifier,
            handle,
            dialer,
            connection: None,
            generation: 0,
            discarded_connections: FuturesUnordered::new(),
            discarded_count: 0,
            backoff,
            conduit,
            broken_sender,
            broken_receiver,
            state,
            scope: scope.clone(),
            _spindown_token,
        };
        connector.install(connection);

        info!(
            name = connector.name.as_ref(),
            identifier = connector.identifier.as_ref(),
            "Connected to RabbitMQ",
        );

        tokio::spawn(connector.serve());

        Ok(Gateway {
            retriever,
            state: state_receiver,
            scope,
        })
    }

    fn compose_name(handle: &Handle) -> Arc<str> {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        Arc::from(format!(
            "rabbitmq:connector:{}:{}",
            handle.name(),
            COUNTER.fetch_add(1, Ordering::Relaxed),
        ))
    }
}

impl Connector {
    async fn serve(mut self) {
        loop {
            let event = select! {
                biased;
                _ = self.scope.cancelled() => Event::Shutdown,
                Some(generation) = self.broken_receiver.recv() => Event::Broken(generation),
                request = self.conduit.requested() => Event::Request(request),
            };

            let scope = self.scope.clone();
            let flow = match event {
                Event::Shutdown => Flow::Stop,
                Event::Broken(generation) => select! {
                    biased;
                    _ = scope.cancelled() => Flow::Stop,
                    flow = self.receive_broken(generation) => flow,
                },
                Event::Request(Some(request)) => select! {
                    biased;
                    _ = scope.cancelled() => Flow::Stop,
                    flow = self.receive_request(request) => flow,
                },
                Event::Request(None) => Flow::Stop,
            };

            if let Flow::Stop = flow {
                break;
            }
        }

        if !self.state.borrow().is_terminal() {
            self.state.send_replace(ConnectionState::Closed);
        }

        info!(
            name = self.name.as_ref(),
            identifier = self.identifier.as_ref(),
            "Closing the RabbitMQ connection",
        );

        self.disconnect();
        self.drain_discarded_connections().await;
    }

    /// Reacts to the broker reporting a connection as broken. Reports about
    /// previous generations are stale and ignored.
    async fn receive_broken(&mut self, generation: u64) -> Flow {
        if generation != self.generation || self.connection.is_none() {
            return Flow::Continue;
        }

        warn!(
            name = self.name.as_ref(),
            identifier = self.identifier.as_ref(),
            generation,
            "Lost the RabbitMQ connection",
        );

        match self.reconnect().await {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Stop,
        }
    }

    async fn receive_request(
        &mut self,
        request: oneshot::Sender<Result<LinkedChannel, GatewayError>>,
    ) -> Flow {
        let (response, flow) = match self.create_channel().await {
            Ok(channel) => (Ok(channel), Flow::Continue),
            Err(exhausted) => (
                Err(GatewayError::ReconnectExhausted(exhausted.attempts)),
                Flow::Stop,
            ),
        };

        if request.send(response).is_err() {
            warn!(
                name = self.name.as_ref(),
                identifier = self.identifier.as_ref(),
                "Too late to send the requested RabbitMQ channel",
            );
        }

        flow
    }

    /// Creates a channel on the current connection, reconnecting as many times
    /// as the backoff allows.
    async fn create_channel(&mut self) -> Result<LinkedChannel, BackoffExhausted> {
        loop {
            if let Some(connection) = &self.connection {
                match connection.create_channel().await {
                    Ok(channel) => {
                        return Ok(LinkedChannel {
                            channel,
                            generation: self.generation,
                        });
                    }
                    Err(error) => warn!(
                        name = self.name.as_ref(),
                        identifier = self.identifier.as_ref(),
                        ?error,
                        error_message = %error,
                        "Failed to create a RabbitMQ channel",
                    ),
                }
            }

            self.reconnect().await?;
        }
    }

    async fn reconnect(&mut self) -> Result<(), BackoffExhausted> {
        self.state.send_replace(ConnectionState::Reconnecting);
        self.disconnect();
        self.drain_periodically().await;

        loop {
            let attempt = match self.backoff.sleep_next().await {
                Ok(attempt) => attempt,
                Err(exhausted) => {
                    self.state
                        .send_replace(ConnectionState::Exhausted(exhausted.attempts));
                    error!(
                        alert = true,
                        name = self.name.as_ref(),
                        identifier = self.identifier.as_ref(),
                        attempts = exhausted.attempts,
                        "Tried to reconnect to RabbitMQ {} times. Giving up",
                        exhausted.attempts,
                    );
                    return Err(exhausted);
                }
            };

            match self.dialer.dial(&self.handle).await {
                Ok(connection) => {
                    self.install(connection);
                    self.backoff.reset();
                    info!(
                        name = self.name.as_ref(),
                        identifier = self.identifier.as_ref(),
                        attempt,
                        generation = self.generation,
                        "Reconnected to RabbitMQ",
                    );
                    return Ok(());
                }
                Err(error) => warn!(
                    name = self.name.as_ref(),
                    identifier = self.identifier.as_ref(),
                    attempt,
                    ?error,
                    error_message = %error,
                    "Failed to reconnect to RabbitMQ",
                ),
            }
        }
    }

    /// Makes the given connection current under a new generation and wires
    /// its error callback back into the serve loop.
    fn install(&mut self, connection: Connection) {
        self.generation += 1;

        let generation = self.generation;
        let broken_sender = self.broken_sender.clone();
        connection.on_error(move |_| {
            let _ = broken_sender.send(generation);
        });

        self.connection = Some(connection);
        self.state.send_replace(ConnectionState::Ready);
    }

    fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.discard_connection(connection);
        }
    }

    fn discard_connection(&mut self, connection: Connection) {
        let future = close_connection(self.name.clone(), self.identifier.clone(), connection);
        self.discarded_connections.push(tokio::spawn(future));
        self.discarded_count += 1;
    }

    async fn drain_discarded_connections(&mut self) {
        while self.discarded_connections.next().await.is_some() {}
    }
}

impl Connector {
    /// Keeps the backlog of connections being closed in the background from
    /// growing while the broker flaps.
    async fn drain_periodically(&mut self) {
        if self.discarded_count % DISCARDED_BETWEEN_CLEANUPS == 0 {
            self.drain_discarded_connections().await;
        }
    }
}

async fn close_connection(name: Arc<str>, identifier: Arc<str>, connection: Connection) {
    match connection.close(0, "Discarded connection").await {
        Ok(_) => info!(
            name = name.as_ref(),
            identifier = identifier.as_ref(),
            "Closed a discarded RabbitMQ connection",
        ),
        Err(LapinError::InvalidConnectionState(_)) => info!(
            name = name.as_ref(),
            identifier = identifier.as_ref(),
            "Discarded a previously lost RabbitMQ connection",
        ),
        Err(error) => warn!(
            name = name.as_ref(),
            identifier = identifier.as_ref(),
            ?error,
            error_message = %error,
            "Failed to close a discarded RabbitMQ connection",
        ),
    }
}

impl Gateway {
    /// Requests a fresh channel on the current connection.
    ///
    /// Waits for as long as reconnection takes. Fails with
    /// [`GatewayError::Closed`] once the owning scope is cancelled, and with
    /// [`GatewayError::ReconnectExhausted`] once the connector gave up.
    pub async fn channel(&self) -> Result<LinkedChannel, GatewayError> {
        if self.scope.is_cancelled() {
            return Err(GatewayError::Closed);
        }

        match self.retriever.request_until(self.scope.token()).await {
            Some(response) => response,
            None => Err(self.terminal_error()),
        }
    }

    /// Reports the current state of the connector.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Waits until the connector stops for good and reports why.
    pub async fn terminated(&self) -> GatewayError {
        let mut state = self.state.clone();
        let _ = state.wait_for(ConnectionState::is_terminal).await;

        self.terminal_error()
    }

    fn terminal_error(&self) -> GatewayError {
        match *self.state.borrow() {
            ConnectionState::Exhausted(attempts) => GatewayError::ReconnectExhausted(attempts),
            _ => GatewayError::Closed,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// The serving side of a [`Gateway`] that no connector stands behind.
    pub(crate) struct StubConnector {
        pub(crate) conduit: Conduit<Result<LinkedChannel, GatewayError>>,
        pub(crate) state: watch::Sender<ConnectionState>,
    }

    /// Creates a gateway whose channel requests are only answered if the
    /// test answers them through the returned [`StubConnector`].
    pub(crate) fn stub_gateway(scope: &Scope) -> (Gateway, StubConnector) {
        let conduit = Conduit::new();
        let (state, state_receiver) = watch::channel(ConnectionState::Ready);
        let gateway = Gateway {
            retriever: conduit.retriever(),
            state: state_receiver,
            scope: scope.clone(),
        };

        (gateway, StubConnector { conduit, state })
    }

    #[derive(Default)]
    struct RefusingDialer {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(&self, handle: &Handle) -> Result<Connection, DialError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(DialError::Timeout {
                identifier: handle.identifier(),
                timeout: handle.dial_timeout(),
            })
        }
    }

    #[tokio::test]
    async fn initial_dial_failure_is_returned_once() {
        // Given
        let dialer = Arc::new(RefusingDialer::default());
        let spindown = Spindown::new(Duration::from_secs(1));

        // When
        let result = Connector::start(
            Handle::new("refused"),
            dialer.clone(),
            Scope::new("test"),
            &spindown,
        )
        .await;

        // Then
        assert!(matches!(result, Err(DialError::Timeout { .. })));
        assert_eq!(dialer.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(spindown.completed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn gateway_reports_exhaustion() {
        // Given
        let (gateway, stub) = stub_gateway(&Scope::new("test"));

        // When
        stub.state.send_replace(ConnectionState::Exhausted(4));
        drop(stub);

        // Then
        assert_eq!(gateway.state(), ConnectionState::Exhausted(4));
        assert!(matches!(
            gateway.channel().await,
            Err(GatewayError::ReconnectExhausted(4)),
        ));
        assert_eq!(
            gateway.terminated().await,
            GatewayError::ReconnectExhausted(4),
        );
    }

    #[tokio::test]
    async fn gateway_reports_closed_scope() {
        // Given
        let scope = Scope::new("test");
        let (gateway, _stub) = stub_gateway(&scope);

        // When
        scope.cancel();

        // Then
        assert!(matches!(gateway.channel().await, Err(GatewayError::Closed)));
    }
}
