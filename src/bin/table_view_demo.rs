//! Table view demo over the in-memory broker
//!
//! Usage: table-view-demo [config.toml]
//!
//! Publishes a few account balances across two partitions, subscribes to
//! changes, deletes one key and grows the topic by a partition.

use compacted_view::{
    InMemoryTopicClient, JsonDecoder, SchemaType, TableView, TableViewConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => TableViewConfig::from_toml_str(&std::fs::read_to_string(path)?)?,
        None => TableViewConfig {
            schema: Some(SchemaType::Json),
            refresh_interval: Duration::from_millis(200),
            ..TableViewConfig::new("balances")
        },
    };

    let client = InMemoryTopicClient::new();
    let partitions = client.create_topic(&config.topic, 2);
    client.publish(&partitions[0], "alice", "120");
    client.publish(&partitions[1], "bob", "75");
    client.publish(&partitions[0], "alice", "100");

    let view = TableView::<i64>::builder(Arc::new(client.clone()))
        .config(config)
        .decoder(JsonDecoder::<i64>::new())
        .build()
        .await?;

    println!("initial: {} keys, alice = {:?}", view.size(), view.get("alice"));

    view.for_each_and_listen(|key, value| {
        match value {
            Some(v) => println!("  {} -> {}", key, v),
            None => println!("  {} deleted", key),
        }
        Ok(())
    })?;

    client.tombstone(&partitions[0], "alice");
    let added = client.add_partitions(view.topic(), 1);
    client.publish(&added[0], "carol", "30");

    let report = view.refresh().await?;
    println!("refresh added {} partition(s)", report.added.len());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut keys = view.keys();
    keys.sort();
    println!("final keys: {:?}", keys);

    view.close().await;
    Ok(())
}
