use crate::{
    DeclarationError, Declarator, ExchangeKind, Gateway, GatewayError, LinkedChannel, PublishError,
    Publishable,
};
use herald_core::Scope;
use herald_telemetry::ReleaseMetrics;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::publisher_confirm::Confirmation;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::select;
use tokio::sync::{Mutex as AsyncMutex, Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod envelope;

use self::envelope::Envelope;

/// Called every time the [`Publisher`] sends a message again, with the reason.
pub type RepublishHook = Arc<dyn Fn(RepublishReason) + Send + Sync>;

/// How the [`Publisher`] learns that the broker took responsibility for a
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// Every publish is committed in its own transaction, one at a time.
    Transactional,
    /// Publishes are confirmed by the broker; up to `window` confirmations
    /// may be outstanding.
    Confirm {
        /// The maximum number of unconfirmed publishes in flight.
        window: usize,
    },
}

impl PublishMode {
    /// Zero selects [transactions](PublishMode::Transactional); anything else
    /// selects [confirms](PublishMode::Confirm) with that window.
    pub fn from_max_unconfirmed(max_unconfirmed_in_flight: usize) -> Self {
        match max_unconfirmed_in_flight {
            0 => Self::Transactional,
            window => Self::Confirm { window },
        }
    }

    /// The number of publishes allowed in flight at once.
    pub fn window(&self) -> usize {
        match self {
            Self::Transactional => 1,
            Self::Confirm { window } => *window,
        }
    }
}

impl Default for PublishMode {
    fn default() -> Self {
        Self::Confirm { window: 1 }
    }
}

/// Why a message was sent again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepublishReason {
    /// No confirmation arrived within the republish timeout.
    Timeout,
    /// The broker negatively acknowledged the message.
    Nacked,
    /// The channel closed before the confirmation arrived.
    ConfirmationLost,
    /// The message could not be handed to the channel.
    ChannelLost,
}

impl RepublishReason {
    /// The short name of this reason, as used in metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Nacked => "nacked",
            Self::ConfirmationLost => "confirmation_lost",
            Self::ChannelLost => "channel_lost",
        }
    }

    /// Reports whether the next attempt waits out the rest of the republish
    /// timeout. Only a timeout has already used it up.
    fn paces_retry(&self) -> bool {
        !matches!(self, Self::Timeout)
    }
}

impl Display for RepublishReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Timeout => "timeout",
            Self::Nacked => "nacked",
            Self::ConfirmationLost => "confirmation lost",
            Self::ChannelLost => "channel lost",
        })
    }
}

/// Why a single attempt did not succeed.
enum AttemptError {
    Gateway(GatewayError),
    Republish(RepublishReason),
}

/// Publishes [`Publishable`] messages and does not report success until the
/// broker confirmed them (or, in transactional mode, until the transaction
/// committed).
///
/// A message that is not confirmed within the republish timeout, that the
/// broker rejects, or that is lost together with its channel is sent again,
/// with the same message ID, on a fresh channel if needed. Publishing stops
/// only on success, on the caller's cancellation, on [close](Publisher::close)
/// and when the connector gives up reconnecting.
///
/// Transmission is serialised on the publisher's single channel.
pub struct Publisher {
    name: Arc<str>,
    gateway: Gateway,
    declarator: Arc<Declarator>,
    exchange: String,
    exchange_kind: ExchangeKind,
    mode: PublishMode,
    window: Semaphore,
    republish_timeout: Duration,
    channel: AsyncMutex<Option<LinkedChannel>>,
    on_republish: Option<RepublishHook>,
    metrics: Option<ReleaseMetrics>,
    scope: Scope,
}

impl Publisher {
    /// Creates a publisher that obtains channels from the given gateway and
    /// follows the given scope. By default it publishes to the AMQP default
    /// exchange in confirm mode, one message at a time, republishing after
    /// five seconds.
    pub fn new(gateway: Gateway, declarator: Arc<Declarator>, scope: &Scope) -> Self {
        let name = Self::compose_name(declarator.prefix());
        let scope = scope.child(name.as_ref());
        let mode = PublishMode::default();

        Self {
            name,
            gateway,
            declarator,
            exchange: String::new(),
            exchange_kind: ExchangeKind::default(),
            mode,
            window: Semaphore::new(mode.window()),
            republish_timeout: Duration::from_secs(5),
            channel: AsyncMutex::new(None),
            on_republish: None,
            metrics: None,
            scope,
        }
    }

    /// Recreates this publisher with the given default exchange, used for
    /// messages that name no exchange of their own.
    pub fn with_exchange(self, exchange: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            exchange: exchange.into(),
            exchange_kind: kind,
            ..self
        }
    }

    /// Recreates this publisher with the given [`PublishMode`].
    pub fn with_mode(self, mode: PublishMode) -> Self {
        Self {
            mode,
            window: Semaphore::new(mode.window()),
            ..self
        }
    }

    /// Recreates this publisher with the given republish timeout.
    pub fn with_republish_timeout(self, republish_timeout: Duration) -> Self {
        Self {
            republish_timeout,
            ..self
        }
    }

    /// Recreates this publisher with the given republish hook.
    pub fn with_on_republish(self, on_republish: RepublishHook) -> Self {
        Self {
            on_republish: Some(on_republish),
            ..self
        }
    }

    /// Recreates this publisher with the given metrics, counting confirmed
    /// and republished messages.
    pub fn with_metrics(self, metrics: ReleaseMetrics) -> Self {
        Self {
            metrics: Some(metrics),
            ..self
        }
    }

    fn compose_name(prefix: &str) -> Arc<str> {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        Arc::from(format!(
            "rabbitmq:pub:{}:{}",
            prefix.trim_end_matches(['.', ':', '-', '_']),
            COUNTER.fetch_add(1, Ordering::Relaxed),
        ))
    }
}

impl Publisher {
    /// Reports the name of this publisher.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reports the [`PublishMode`] of this publisher.
    pub fn mode(&self) -> PublishMode {
        self.mode
    }

    /// Reports whether this publisher was closed.
    pub fn is_closed(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Opens the publishing channel and declares the default exchange.
    pub async fn ready(&self) -> Result<(), DeclarationError> {
        let mut guard = self.channel.lock().await;
        let linked = self.open_channel().await?;

        self.declarator
            .declare_exchange(
                linked.channel(),
                linked.generation(),
                &self.exchange,
                self.exchange_kind,
            )
            .await?;

        *guard = Some(linked);

        info!(
            name = self.name.as_ref(),
            exchange = self.exchange.as_str(),
            mode = ?self.mode,
            "Publisher is ready",
        );

        Ok(())
    }

    /// Publishes the given message and waits for the broker to take
    /// responsibility for it.
    pub async fn publish<P>(&self, message: &P) -> Result<(), PublishError>
    where
        P: Publishable,
    {
        self.publish_until(message, &CancellationToken::new()).await
    }

    /// Same as [`publish`](Publisher::publish), but gives up with
    /// [`PublishError::Cancelled`] as soon as the given token is cancelled.
    pub async fn publish_until<P>(
        &self,
        message: &P,
        cancellation: &CancellationToken,
    ) -> Result<(), PublishError>
    where
        P: Publishable,
    {
        let envelope = Envelope::seal(message)?;
        let _permit = self.acquire_permit(cancellation).await?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let deadline = Instant::now() + self.republish_timeout;

            let outcome = select! {
                biased;
                _ = self.scope.cancelled() => return Err(PublishError::Closed),
                _ = cancellation.cancelled() => return Err(PublishError::Cancelled),
                outcome = tokio::time::timeout_at(deadline, self.transmit(&envelope)) => outcome,
            };

            let reason = match outcome {
                Ok(Ok(())) => {
                    debug!(
                        name = self.name.as_ref(),
                        kind = envelope.kind(),
                        message_id = envelope.message_id(),
                        attempt,
                        "Published a message to RabbitMQ",
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_published(envelope.kind());
                    }
                    return Ok(());
                }
                Ok(Err(AttemptError::Gateway(error))) => return Err(error.into()),
                Ok(Err(AttemptError::Republish(reason))) if reason.paces_retry() => {
                    select! {
                        biased;
                        _ = self.scope.cancelled() => return Err(PublishError::Closed),
                        _ = cancellation.cancelled() => return Err(PublishError::Cancelled),
                        _ = tokio::time::sleep_until(deadline) => {},
                    }
                    reason
                }
                Ok(Err(AttemptError::Republish(reason))) => reason,
                Err(_) => {
                    self.discard_disconnected_channel().await;
                    RepublishReason::Timeout
                }
            };

            warn!(
                name = self.name.as_ref(),
                kind = envelope.kind(),
                message_id = envelope.message_id(),
                attempt,
                %reason,
                "Republishing a message to RabbitMQ",
            );

            if let Some(metrics) = &self.metrics {
                metrics.record_republish(reason.as_str());
            }

            if let Some(on_republish) = &self.on_republish {
                on_republish(reason);
            }
        }
    }

    /// Closes this publisher. In-flight and later publishes fail with
    /// [`PublishError::Closed`]. Repeated calls have no effect.
    pub fn close(&self) {
        self.scope.cancel();
    }
}

impl Publisher {
    async fn acquire_permit(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<SemaphorePermit<'_>, PublishError> {
        select! {
            biased;
            _ = self.scope.cancelled() => Err(PublishError::Closed),
            _ = cancellation.cancelled() => Err(PublishError::Cancelled),
            permit = self.window.acquire() => permit.map_err(|_| PublishError::Closed),
        }
    }

    /// Makes a single attempt at publishing the given envelope.
    async fn transmit(&self, envelope: &Envelope) -> Result<(), AttemptError> {
        let mut guard = self.channel.lock().await;

        let linked = match guard.as_ref() {
            Some(linked) if linked.channel().status().connected() => linked.clone(),
            _ => {
                *guard = None;
                let linked = self.open_channel().await.map_err(|error| match error {
                    DeclarationError::Gateway(error) => AttemptError::Gateway(error),
                    _ => AttemptError::Republish(RepublishReason::ChannelLost),
                })?;
                *guard = Some(linked.clone());
                linked
            }
        };

        let (exchange, kind) = match envelope.exchange() {
            "" => (self.exchange.as_str(), self.exchange_kind),
            exchange => (exchange, envelope.exchange_kind()),
        };

        let exchange = match self
            .declarator
            .declare_exchange(linked.channel(), linked.generation(), exchange, kind)
            .await
        {
            Ok(exchange) => exchange,
            Err(error) => {
                error!(
                    alert = true,
                    name = self.name.as_ref(),
                    ?error,
                    error_message = %error,
                    "Failed to declare an exchange for publishing",
                );
                *guard = None;
                return Err(AttemptError::Republish(RepublishReason::ChannelLost));
            }
        };

        let published = linked
            .channel()
            .basic_publish(
                &exchange,
                envelope.routing_key(),
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                envelope.body(),
                envelope.properties(),
            )
            .await;

        let confirm = match published {
            Ok(confirm) => confirm,
            Err(error) => {
                warn!(
                    name = self.name.as_ref(),
                    message_id = envelope.message_id(),
                    ?error,
                    error_message = %error,
                    "Failed to transmit a message to RabbitMQ",
                );
                *guard = None;
                return Err(AttemptError::Republish(RepublishReason::ChannelLost));
            }
        };

        if let PublishMode::Transactional = self.mode {
            return match linked.channel().tx_commit().await {
                Ok(()) => Ok(()),
                Err(error) => {
                    warn!(
                        name = self.name.as_ref(),
                        message_id = envelope.message_id(),
                        ?error,
                        error_message = %error,
                        "Failed to commit a RabbitMQ transaction",
                    );
                    *guard = None;
                    Err(AttemptError::Republish(RepublishReason::ConfirmationLost))
                }
            };
        }

        // Confirmations are awaited off the lock so the window can fill up
        drop(guard);

        match confirm.await {
            Ok(Confirmation::Ack(_)) | Ok(Confirmation::NotRequested) => Ok(()),
            Ok(Confirmation::Nack(_)) => {
                warn!(
                    alert = true,
                    name = self.name.as_ref(),
                    message_id = envelope.message_id(),
                    "RabbitMQ negatively acknowledged a message",
                );
                Err(AttemptError::Republish(RepublishReason::Nacked))
            }
            Err(error) => {
                warn!(
                    name = self.name.as_ref(),
                    message_id = envelope.message_id(),
                    ?error,
                    error_message = %error,
                    "Failed to receive a publisher confirm from RabbitMQ",
                );
                self.discard_channel(&linked).await;
                Err(AttemptError::Republish(RepublishReason::ConfirmationLost))
            }
        }
    }

    /// Requests a fresh channel and puts it into the publishing mode.
    async fn open_channel(&self) -> Result<LinkedChannel, DeclarationError> {
        let linked = self.gateway.channel().await?;

        let result = match self.mode {
            PublishMode::Transactional => linked.channel().tx_select().await,
            PublishMode::Confirm { .. } => {
                linked
                    .channel()
                    .confirm_select(ConfirmSelectOptions { nowait: false })
                    .await
            }
        };

        result.map_err(|source| DeclarationError::PublishMode { source })?;

        Ok(linked)
    }

    /// Forgets the given channel, unless it was already replaced.
    async fn discard_channel(&self, linked: &LinkedChannel) {
        let mut guard = self.channel.lock().await;

        if let Some(current) = guard.as_ref() {
            if current.generation() == linked.generation()
                && current.channel().id() == linked.channel().id()
            {
                *guard = None;
            }
        }
    }

    async fn discard_disconnected_channel(&self) {
        let mut guard = self.channel.lock().await;

        if let Some(current) = guard.as_ref() {
            if !current.channel().status().connected() {
                *guard = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::tests::stub_gateway;
    use crate::{DecodeError, EncodeError};
    use parking_lot::Mutex as SyncMutex;
    use pretty_assertions::assert_eq;
    use tokio::time::sleep;

    struct RolledBack;

    impl Publishable for RolledBack {
        fn kind(&self) -> &str {
            "release.rolled_back"
        }

        fn marshal(&self) -> Result<Vec<u8>, EncodeError> {
            Ok(b"{}".to_vec())
        }

        fn unmarshal(_bytes: &[u8]) -> Result<Self, DecodeError> {
            Ok(Self)
        }
    }

    fn publisher(gateway: Gateway, scope: &Scope) -> Publisher {
        Publisher::new(gateway, Arc::new(Declarator::new("test.")), scope)
            .with_republish_timeout(Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn close_fails_publish_in_flight() {
        // Given
        let scope = Scope::new("test");
        let (gateway, _stub) = stub_gateway(&scope);
        let publisher = publisher(gateway, &scope);

        // When
        let (result, ()) = tokio::join!(publisher.publish(&RolledBack), async {
            sleep(Duration::from_millis(50)).await;
            publisher.close();
        });

        // Then
        assert!(matches!(result, Err(PublishError::Closed)));
        assert!(publisher.is_closed());
    }

    #[tokio::test]
    async fn publish_after_close_fails() {
        // Given
        let scope = Scope::new("test");
        let (gateway, _stub) = stub_gateway(&scope);
        let publisher = publisher(gateway, &scope);

        // When
        publisher.close();
        publisher.close();
        let result = publisher.publish(&RolledBack).await;

        // Then
        assert!(matches!(result, Err(PublishError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_fails_publish_in_flight() {
        // Given
        let scope = Scope::new("test");
        let (gateway, _stub) = stub_gateway(&scope);
        let publisher = publisher(gateway, &scope);
        let cancellation = CancellationToken::new();

        // When
        let (result, ()) = tokio::join!(
            publisher.publish_until(&RolledBack, &cancellation),
            async {
                sleep(Duration::from_millis(50)).await;
                cancellation.cancel();
            },
        );

        // Then
        assert!(matches!(result, Err(PublishError::Cancelled)));
        assert!(!publisher.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_publish_is_republished() {
        // Given
        let scope = Scope::new("test");
        let (gateway, _stub) = stub_gateway(&scope);
        let reasons = Arc::new(SyncMutex::new(Vec::new()));
        let sink = reasons.clone();
        let metrics = ReleaseMetrics::new("test").unwrap();
        let publisher = publisher(gateway, &scope)
            .with_on_republish(Arc::new(move |reason: RepublishReason| sink.lock().push(reason)))
            .with_metrics(metrics.clone());
        let cancellation = CancellationToken::new();

        // When
        let (result, ()) = tokio::join!(
            publisher.publish_until(&RolledBack, &cancellation),
            async {
                sleep(Duration::from_millis(350)).await;
                cancellation.cancel();
            },
        );

        // Then
        assert!(matches!(result, Err(PublishError::Cancelled)));
        assert_eq!(*reasons.lock(), vec![RepublishReason::Timeout; 3]);
        assert_eq!(metrics.republished("timeout"), 3);
        assert_eq!(metrics.published("release.rolled_back"), 0);
    }

    #[tokio::test]
    async fn exhausted_gateway_fails_publish() {
        // Given
        let scope = Scope::new("test");
        let (gateway, stub) = stub_gateway(&scope);
        let publisher = publisher(gateway, &scope);
        let owner = tokio::spawn(async move {
            if let Some(request) = stub.conduit.requested().await {
                let _ = request.send(Err(GatewayError::ReconnectExhausted(3)));
            }
        });

        // When
        let result = publisher.publish(&RolledBack).await;

        // Then
        assert!(matches!(result, Err(PublishError::ReconnectExhausted(3))));
        owner.await.unwrap();
    }

    #[test]
    fn immediate_failures_pace_retries() {
        assert!(RepublishReason::Nacked.paces_retry());
        assert!(RepublishReason::ChannelLost.paces_retry());
        assert!(RepublishReason::ConfirmationLost.paces_retry());
        assert!(!RepublishReason::Timeout.paces_retry());
    }

    #[test]
    fn mode_from_max_unconfirmed() {
        assert_eq!(PublishMode::from_max_unconfirmed(0), PublishMode::Transactional);
        assert_eq!(
            PublishMode::from_max_unconfirmed(8),
            PublishMode::Confirm { window: 8 },
        );
        assert_eq!(PublishMode::Transactional.window(), 1);
        assert_eq!(PublishMode::default().window(), 1);
    }

    #[test]
    fn names_are_unique() {
        // When
        let first = Publisher::compose_name("herald.");
        let second = Publisher::compose_name("herald.");

        // Then
        assert!(first.starts_with("rabbitmq:pub:herald:"));
        assert_ne!(first, second);
    }

    #[test]
    fn republish_reasons_display() {
        assert_eq!(RepublishReason::Timeout.to_string(), "timeout");
        assert_eq!(RepublishReason::ChannelLost.to_string(), "channel lost");
        assert_eq!(RepublishReason::ChannelLost.as_str(), "channel_lost");
    }
}
