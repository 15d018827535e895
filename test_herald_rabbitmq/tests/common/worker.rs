use crate::common::dropbox::Dropbox;
use crate::common::message::TEST_EVENT;
use herald_core::Latch;
use herald_rabbitmq::{
    BrokerConfig, ExchangeKind, Handle, HandlerError, Handlers, Topology, Worker, WorkerError,
    handler_fn,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A worker config publishing to exchange `name` by default, with one
/// consumer of queue `name` bound to everything on it.
pub fn make_config(handle: Handle, name: &str, durable: bool) -> (BrokerConfig, Topology) {
    let topology = Topology::builder()
        .with_exchange(name)
        .with_queue(name)
        .with_durable(durable)
        .with_routing_pattern("#")
        .with_prefetch(10)
        .build()
        .unwrap();

    let config = BrokerConfig::new(handle)
        .with_exchange(name, ExchangeKind::Topic)
        .with_republish_timeout(Duration::from_millis(500))
        .with_init_timeout(Duration::from_secs(5))
        .with_close_timeout(Duration::from_secs(5))
        .with_consumer(topology.clone());

    (config, topology)
}

/// Handlers that drop the body of every [`TEST_EVENT`] into the dropbox.
pub fn counting_handlers(dropbox: &Dropbox) -> Handlers {
    let dropbox = dropbox.clone();

    Handlers::new().with(
        TEST_EVENT,
        handler_fn(move |body: Vec<u8>| {
            let dropbox = dropbox.clone();

            async move {
                dropbox.put(body);
                Ok::<(), HandlerError>(())
            }
        }),
    )
}

/// Starts consuming in the background and waits until every queue is being
/// consumed.
pub async fn spawn_consumer(
    worker: Arc<Worker>,
    topologies: Vec<Topology>,
    handlers: Handlers,
) -> JoinHandle<Result<Infallible, WorkerError>> {
    let started = Latch::new();
    let gate = started.gate();

    let consuming =
        tokio::spawn(async move { worker.start_consumer(&topologies, handlers, &started).await });

    assert!(gate.opened_within(Duration::from_secs(10)).await);

    consuming
}
