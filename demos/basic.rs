//! Basic Concord Example
//!
//! Two replicas on an in-process network: one writes while the other is
//! cut off, then a single sync cycle brings them back in line.
//!
//! Run with: cargo run --example basic

use std::sync::Arc;
use std::time::Duration;

use concord_core::{LocalIdentity, Replica};
use concord_storage::MemoryStorage;
use concord_transport::{MemoryNetwork, Node, NodeConfig, PeerId};

async fn open_node(network: &MemoryNetwork, name: &str) -> Result<Node, Box<dyn std::error::Error>> {
    let replica = Replica::open(
        Arc::new(MemoryStorage::new()),
        Arc::new(LocalIdentity::new(format!("{}-key", name))),
    )
    .await?;
    let mut config = NodeConfig::default();
    config.sync.interval_secs = 0;
    Ok(Node::new(Arc::new(replica), network.join(name), config))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("Concord Basic Example\n");

    let network = MemoryNetwork::new();
    let alice = open_node(&network, "alice").await?;
    let bob = open_node(&network, "bob").await?;
    let alice_handle = alice.start().await?;
    let bob_handle = bob.start().await?;

    // Live broadcast
    let post = alice
        .replica()
        .create_post("Hello", "First post on the new forum")
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("Bob sees: {:?}", bob.replica().read(&post.entity_id).await?);

    // Writes made during a partition are reconciled later
    let (a, b) = (PeerId::from("alice"), PeerId::from("bob"));
    network.partition(&a, &b);
    let reply = bob
        .replica()
        .comment(&post.entity_id, "Welcome!")
        .await?;
    bob.replica().favorite(&post.entity_id).await?;
    alice.replica().delete(&post.entity_id).await?;

    network.heal(&a, &b);
    let pulled = alice.sync_now().await;
    let pushed = bob.sync_now().await;
    println!("Alice pulled: {:?}", pulled);
    println!("Bob pulled: {:?}", pushed);

    let snapshot = bob.replica().log().snapshot(&post.entity_id);
    println!("Post deleted on Bob: {:?}", snapshot.map(|s| s.deleted));
    println!(
        "Reply on Alice: {:?}",
        alice.replica().read(&reply.entity_id).await?
    );
    println!(
        "Favorites of the post: {}",
        alice.replica().log().favorite_count(&post.entity_id)
    );
    println!("Alice notifications: {:?}", alice.replica().notifications().list());

    alice_handle.shutdown().await;
    bob_handle.shutdown().await;
    Ok(())
}
