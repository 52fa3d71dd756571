//! Failure-path coverage: per-record drops keep the stream alive, fatal
//! sink errors stop it, and panicking processors are recovered.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use common::*;
use pg_fanout::kafka::batch_writer::{BatchWriter, WriterConfig};
use pg_fanout::listener::Listener;
use pg_fanout::processor::Processor;
use pg_fanout::wal::{self, Lsn};
use pg_fanout::{Error, Result};

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_record_does_not_halt_the_stream() {
    // a schema-log row with a missing schema_name column fails translation
    // of that single event; the next record still flows
    let handler = ScriptedHandler::new(Box::new(|call| match call {
        1 => {
            let mut data = wal_data("pgfanout", "schema_log", 1, 0x10);
            data.columns.clear();
            Ok(data_message(&data, 0x10))
        }
        2 => Ok(data_message(&wal_data("public", "users", 2, 0x20), 0x20)),
        3 => Ok(keep_alive_message(0x30)),
        _ => Err(Error::ConnTimeout),
    }));

    let cancel = CancellationToken::new();
    let bus = CapturingBusWriter::new();
    let writer = Arc::new(
        BatchWriter::new(
            WriterConfig {
                batch_timeout: Duration::from_millis(50),
                ..WriterConfig::default()
            },
            bus.clone(),
            None,
            cancel.clone(),
        )
        .unwrap(),
    );
    let writer_task = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.run().await })
    };

    let listener = Listener::new(handler, writer.clone(), cancel.clone());
    let listener_task = tokio::spawn(async move { listener.listen().await });

    wait_until(|| !bus.messages().is_empty()).await;

    // the malformed schema-log record was dropped at the batch writer's
    // routing-key extraction; only the good record made it out
    let messages = bus.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].key, b"public".to_vec());

    cancel.cancel();
    let _ = listener_task.await.unwrap();
    let _ = writer_task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bus_failure_is_fatal_for_the_writer() {
    let cancel = CancellationToken::new();
    let bus = CapturingBusWriter::new();
    bus.fail.store(true, Ordering::SeqCst);

    let writer = Arc::new(
        BatchWriter::new(
            WriterConfig::default(),
            bus.clone(),
            None,
            cancel.clone(),
        )
        .unwrap(),
    );
    let writer_task = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.run().await })
    };

    writer
        .process_event(wal::Event {
            data: Some(wal_data("public", "users", 1, 0x10)),
            commit_position: wal::CommitPosition::wal(Lsn(0x10)),
        })
        .await
        .unwrap();
    writer
        .process_event(wal::Event {
            data: None,
            commit_position: wal::CommitPosition::wal(Lsn(0x20)),
        })
        .await
        .unwrap();

    let result = writer_task.await.unwrap();
    assert!(matches!(result, Err(Error::Connection(_))));
}

struct PanickingSink;

#[async_trait]
impl Processor for PanickingSink {
    fn name(&self) -> &'static str {
        "panicking"
    }

    async fn process_event(&self, event: wal::Event) -> Result<()> {
        if event.data.is_some() {
            panic!("sink exploded");
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_processor_panic_recovered_and_stream_continues() {
    let handler = ScriptedHandler::new(Box::new(|call| match call {
        1 => Ok(data_message(&wal_data("public", "users", 1, 0x10), 0x10)),
        // the keep-alive only arrives if the panic above was absorbed
        2 => Ok(keep_alive_message(0x20)),
        _ => Err(Error::ConnTimeout),
    }));

    let cancel = CancellationToken::new();
    let listener = Listener::new(handler.clone(), Arc::new(PanickingSink), cancel.clone());
    let listener_task = tokio::spawn(async move { listener.listen().await });

    // messages received after the panic prove the listener survived
    wait_until(|| handler.receive_calls() >= 3).await;
    assert!(listener_alive(&listener_task));

    cancel.cancel();
    let result = listener_task.await.unwrap();
    assert!(matches!(result, Err(Error::Shutdown)));
}

fn listener_alive(task: &tokio::task::JoinHandle<Result<()>>) -> bool {
    !task.is_finished()
}
