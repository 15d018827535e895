//! System tests for `herald-rabbitmq`; see the `tests` directory.
