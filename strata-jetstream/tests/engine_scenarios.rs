//! Engine-level scenarios spanning streams, consumers and buckets.

use proptest::prelude::*;
use std::{sync::Arc, time::Duration};
use strata_core::{config::JetStreamConfig, Message};
use strata_jetstream::{ConsumerConfig, JetStreamEngine, StreamConfig};
use strata_storage::MemoryBackend;

fn engine() -> Arc<JetStreamEngine> {
    Arc::new(JetStreamEngine::new(JetStreamConfig::default(), Arc::new(MemoryBackend::new())))
}

#[tokio::test]
async fn test_orders_end_to_end() -> anyhow::Result<()> {
    let engine = engine();
    engine.create_stream(StreamConfig::new("ORDERS", ["orders.*"]))?;

    let acks: Vec<u64> = ["orders.new", "orders.cancel"]
        .into_iter()
        .flat_map(|subject| engine.ingest(&Message::new(subject, "{}").unwrap()))
        .map(|ack| ack.map(|a| a.seq))
        .collect::<Result<_, _>>()?;
    assert_eq!(acks, vec![1, 2]);

    let consumer = engine.create_consumer("ORDERS", ConsumerConfig::durable("all"), None)?;
    let batch = consumer.next_batch(10, Duration::from_millis(50), false).await?;
    let subjects: Vec<&str> = batch.iter().map(|d| d.message.subject.as_str()).collect();
    assert_eq!(subjects, vec!["orders.new", "orders.cancel"]);

    for delivery in &batch {
        engine.ack(&engine.ack_reply(delivery), b"")?;
    }
    let state = consumer.state();
    assert_eq!(state.ack_floor.stream_seq, 2);
    assert_eq!(state.num_pending, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ingest_is_dense() -> anyhow::Result<()> {
    let engine = engine();
    engine.create_stream(StreamConfig::new("S", ["s.>"]))?;

    let tasks: Vec<_> = (0..8)
        .map(|worker| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let subject = format!("s.{worker}");
                let mut seqs = Vec::new();
                for _ in 0..125 {
                    let acks = engine.ingest(&Message::new(subject.clone(), "x").unwrap());
                    seqs.push(acks[0].as_ref().unwrap().seq);
                }
                seqs
            })
        })
        .collect();

    let mut seqs = Vec::new();
    for task in tasks {
        seqs.extend(task.await?);
    }
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=1000).collect::<Vec<u64>>());
    let state = engine.stream("S")?.state();
    assert_eq!(state.messages, 1000);
    assert_eq!(state.last_seq, 1000);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_pull_parks_until_publish() -> anyhow::Result<()> {
    let engine = engine();
    engine.create_stream(StreamConfig::new("S", ["s"]))?;
    let consumer = engine.create_consumer("S", ConsumerConfig::durable("c"), None)?;

    let puller = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.next_batch(1, Duration::from_secs(60), false).await })
    };
    tokio::time::sleep(Duration::from_secs(5)).await;
    engine.ingest(&Message::new("s", "late")?);

    let batch = puller.await??;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].message.payload, "late");
    Ok(())
}

#[test]
fn test_kv_scenario() -> anyhow::Result<()> {
    let engine = engine();
    let bucket = engine.bucket_or_create("config")?;
    assert_eq!(bucket.put("k", "v1")?, 1);
    assert_eq!(bucket.put("k", "v2")?, 2);
    assert_eq!(bucket.get("k")?, "v2");
    bucket.delete("k")?;
    assert!(bucket.get("k").is_err());
    Ok(())
}

proptest! {
    #[test]
    fn prop_retention_bounds(
        max_msgs in 1i64..20,
        max_bytes in 1i64..200,
        sizes in prop::collection::vec(0usize..64, 1..60),
    ) {
        let engine = engine();
        let config = StreamConfig { max_msgs, max_bytes, ..StreamConfig::new("S", ["s"]) };
        let stream = engine.create_stream(config).unwrap();

        for (i, size) in sizes.iter().enumerate() {
            engine.ingest(&Message::new("s", vec![b'x'; *size]).unwrap());
            let state = stream.state();
            prop_assert_eq!(state.last_seq, i as u64 + 1);
            prop_assert!(state.messages >= 1);
            prop_assert!(state.messages <= max_msgs as u64);
            prop_assert!(state.bytes <= max_bytes as u64 || state.messages == 1);
            prop_assert_eq!(state.first_seq + state.messages, state.last_seq + 1);
        }
    }
}
