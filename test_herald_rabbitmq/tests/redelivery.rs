mod common;

#[cfg(test)]
mod tests {
    use crate::common::dropbox::Dropbox;
    use crate::common::handle::make_rabbitmq_handle;
    use crate::common::message::{FAILING_EVENT, FailingEvent, TEST_EVENT, TestEvent};
    use crate::common::names::mangle;
    use crate::common::worker::{make_config, spawn_consumer};
    use herald_rabbitmq::{HandlerError, Handlers, Hooks, Worker, WorkerError, handler_fn};
    use pretty_assertions::assert_eq;
    use std::any::type_name_of_val;
    use std::sync::Arc;
    use std::time::Duration;

    /// Reports every drop into the dropbox as `kind|body|reason`.
    fn dropping_hooks(dropped: &Dropbox) -> Hooks {
        let dropped = dropped.clone();

        Hooks::default().with_on_drop(Arc::new(move |kind: &str, body: &[u8], reason: &str| {
            dropped.put(format!(
                "{}|{}|{}",
                kind,
                String::from_utf8_lossy(body),
                reason,
            ));
        }))
    }

    fn drops(dropped: &Dropbox) -> Vec<String> {
        dropped
            .items()
            .into_iter()
            .map(|item| String::from_utf8(item).unwrap())
            .collect()
    }

    #[tokio::test]
    #[ignore]
    async fn failed_message_is_requeued_once_then_dropped() {
        // Given
        let name = mangle(type_name_of_val(&failed_message_is_requeued_once_then_dropped));
        let (config, topology) = make_config(make_rabbitmq_handle(), &name, false);
        let dropped = Dropbox::new();
        let worker = Arc::new(
            Worker::with_hooks(config, dropping_hooks(&dropped))
                .await
                .unwrap(),
        );

        let attempts = Dropbox::new();
        let handler_attempts = attempts.clone();
        let handlers = Handlers::new().with(
            FAILING_EVENT,
            handler_fn(move |body: Vec<u8>| {
                handler_attempts.put(body);

                async { Err::<(), HandlerError>(HandlerError::from("always fails")) }
            }),
        );
        let consuming = spawn_consumer(worker.clone(), vec![topology], handlers).await;

        // When
        worker
            .publish(&FailingEvent {
                message: "doomed".to_string(),
            })
            .await
            .unwrap();

        // Then
        assert!(dropped.wait_for(1, Duration::from_secs(10)).await);
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(attempts.count(), 2);
        let drops = drops(&dropped);
        assert_eq!(drops.len(), 1);
        assert!(drops[0].starts_with(r#"failing-event|{"message":"doomed"}|"#));
        assert!(drops[0].ends_with("always fails"));

        // Finally
        worker.close().await.unwrap();
        assert!(matches!(consuming.await.unwrap(), Err(WorkerError::Closed)));
    }

    #[tokio::test]
    #[ignore]
    async fn message_without_handler_is_dropped_once() {
        // Given
        let name = mangle(type_name_of_val(&message_without_handler_is_dropped_once));
        let (config, topology) = make_config(make_rabbitmq_handle(), &name, false);
        let dropped = Dropbox::new();
        let worker = Arc::new(
            Worker::with_hooks(config, dropping_hooks(&dropped))
                .await
                .unwrap(),
        );
        let consuming = spawn_consumer(worker.clone(), vec![topology], Handlers::new()).await;

        // When
        worker.publish(&TestEvent::new("unclaimed")).await.unwrap();

        // Then
        assert!(dropped.wait_for(1, Duration::from_secs(10)).await);
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(
            drops(&dropped),
            vec![format!(
                r#"{}|{{"message":"unclaimed"}}|no handler"#,
                TEST_EVENT,
            )],
        );

        // Finally
        worker.close().await.unwrap();
        assert!(matches!(consuming.await.unwrap(), Err(WorkerError::Closed)));
    }
}
