//! End-to-end dashboard flow over the channel transport.

use std::time::Duration;

use query_cache::dashboard::{
    dashboard_registry, QueryFailure, TotalTrips, TripCountsByDayHour, TripCountsByUserType,
};
use query_cache::{
    ChannelTransport, ClientConfig, ClientMessage, QueryClient, QuerySlot, ServerMessage,
};
use serde_json::json;
use tokio::sync::mpsc;

/// Answers every execute message from a canned table; cancel hints are
/// ignored the way the database service ignores them.
fn fake_backend(
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    inbound: mpsc::UnboundedSender<ServerMessage>,
) -> tokio::task::JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let mut executed = Vec::new();
        while let Some(message) = outbound.recv().await {
            let ClientMessage::Execute { query_string } = message else {
                continue;
            };
            executed.push(query_string.to_string());
            let rows = if query_string.as_str().starts_with("SELECT COUNT(*)") {
                json!([{"count_star()": 1234}])
            } else if query_string.as_str().contains("GROUP BY user_type") {
                json!([
                    {"user_type": "Subscriber", "count_star()": 10},
                    {"user_type": "Customer", "count_star()": "3"},
                ])
            } else {
                json!({"message": "Binder Error: unsupported query"})
            };
            let reply = ServerMessage::Result {
                query_string,
                rows: serde_json::from_value(rows).unwrap(),
                query_time: Some(1.0),
            };
            if inbound.send(reply).is_err() {
                break;
            }
        }
        executed
    })
}

#[tokio::test]
async fn test_dashboard_queries_end_to_end() {
    let config = ClientConfig::default();
    let (transport, outbound) = ChannelTransport::new();
    let client = QueryClient::builder()
        .config(config.clone())
        .build(dashboard_registry(&config), transport);

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let backend = fake_backend(outbound, inbound_tx);
    let adapter = client.transport().clone();
    let router = tokio::spawn(async move { adapter.run(inbound_rx).await });

    let total = client.query::<TotalTrips>(()).unwrap();
    let total_again = client.query::<TotalTrips>(()).unwrap();
    let user_types = client.query::<TripCountsByUserType>(72).unwrap();
    let mut slot = QuerySlot::new();
    let day_hour = client
        .query_in_slot::<TripCountsByDayHour>(&mut slot, 72)
        .unwrap();

    let timeout = Duration::from_secs(5);
    assert_eq!(*tokio::time::timeout(timeout, total).await.unwrap(), Ok(1234));
    assert_eq!(*tokio::time::timeout(timeout, total_again).await.unwrap(), Ok(1234));

    let user_types = tokio::time::timeout(timeout, user_types).await.unwrap();
    assert_eq!(user_types.subscriber, 10);
    assert_eq!(user_types.customer, 3);

    // Backend errors fall back to an all-zero grid.
    let day_hour = tokio::time::timeout(timeout, day_hour).await.unwrap();
    assert_eq!(day_hour.station_id, 72);
    assert!(day_hour.trip_count_by_day.iter().flatten().all(|&n| n == 0));

    // The backend stops once every outbound sender is gone.
    router.abort();
    assert!(router.await.unwrap_err().is_cancelled());
    drop(slot);
    drop(client);
    let executed = tokio::time::timeout(timeout, backend).await.unwrap().unwrap();
    assert_eq!(executed.len(), 3);
    assert_eq!(executed[0], "SELECT COUNT(*) FROM citibike_trips");
}

#[tokio::test]
async fn test_frames_from_the_wire() {
    let config = ClientConfig {
        table_name: "trips_2019".to_string(),
        ..ClientConfig::default()
    };
    let (transport, mut outbound) = ChannelTransport::new();
    let client = QueryClient::builder()
        .config(config.clone())
        .build(dashboard_registry(&config), transport);

    let total = client.query::<TotalTrips>(()).unwrap();
    let sent = outbound.recv().await.unwrap();
    assert_eq!(
        serde_json::to_value(&sent).unwrap(),
        json!({"type": "execute", "queryString": "SELECT COUNT(*) FROM trips_2019"})
    );

    let frame = json!({
        "type": "result",
        "queryString": "SELECT COUNT(*) FROM trips_2019",
        "rows": {"message": "Catalog Error: Table trips_2019 does not exist"},
    })
    .to_string();
    assert_eq!(client.transport().handle_frame(&frame).unwrap(), 1);
    assert_eq!(
        *total.await,
        Err(QueryFailure::Backend {
            message: "Catalog Error: Table trips_2019 does not exist".to_string()
        })
    );

    assert!(client.transport().handle_frame("{not json").is_err());
}

#[test]
fn test_queries_by_name_use_registered_names() {
    let config = ClientConfig::default();
    let (transport, mut outbound) = ChannelTransport::new();
    let client = QueryClient::new(dashboard_registry(&config), transport);

    let handle = client.query_by_name("tripCountsByUserType", json!(5)).unwrap();
    assert_eq!(
        handle.query_string().as_str(),
        "SELECT user_type, COUNT(*) FROM citibike_trips WHERE start_station_id=5 GROUP BY user_type"
    );
    assert!(matches!(
        outbound.try_recv(),
        Ok(ClientMessage::Execute { .. })
    ));
}
