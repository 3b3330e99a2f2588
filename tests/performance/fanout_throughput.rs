/// Fan-out throughput of the in-process broker
///
/// Publishes a burst of events into a room with many connections and
/// reports frames delivered per second.
///
/// Run this test with:
/// ```
/// cargo test --release -p relay-tests -- --ignored --nocapture performance::fanout_throughput
/// ```
use std::sync::Arc;
use std::time::Instant;

use backend_lib::broker::{Broker, BrokerOptions};
use backend_lib::registry::RoomRegistry;
use relay_common::{Role, User};
use serde_json::json;

#[tokio::test]
#[ignore] // long-running
async fn test_fanout_throughput() {
    let connections = 200;
    let events = 500;
    let broker = Arc::new(Broker::new(
        Arc::new(RoomRegistry::new()),
        BrokerOptions {
            echo_to_sender: false,
            buffer: events + 8,
        },
    ));

    let mut subscriptions = Vec::with_capacity(connections);
    for i in 0..connections {
        let user = User::new(format!("u{i}"), format!("User {i}"), Role::Member);
        subscriptions.push(broker.connect("bench", user).unwrap());
    }
    // discard greetings and joins
    for sub in &mut subscriptions {
        while sub.try_recv().is_some() {}
    }

    let publisher = User::new("publisher", "Publisher", Role::Member);
    let start = Instant::now();
    let mut delivered = 0;
    for seq in 0..events {
        let report = broker
            .publish("bench", "cursor", json!({"x": seq, "y": 0}), publisher.clone())
            .unwrap();
        assert_eq!(report.dropped, 0);
        delivered += report.delivered;
    }
    let elapsed = start.elapsed();

    assert_eq!(delivered, connections * events);
    for sub in &mut subscriptions {
        let mut received = 0;
        while sub.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, events);
    }

    println!("Fan-out Throughput");
    println!("  Connections: {connections}");
    println!("  Events: {events}");
    println!("  Total time: {elapsed:?}");
    println!(
        "  Frames per second: {:.0}",
        delivered as f64 / elapsed.as_secs_f64()
    );
}
