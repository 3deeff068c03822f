//! End-to-end tests of the gateway runtime against virtual PLCs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use scada_gateway::core::{ConnectionState, PlcConnector, Value, WriteValue};
use scada_gateway::gateway::{Gateway, GatewayConfig, TelemetryFrame, Visibility, WriteRequest};
use scada_gateway::protocols::virtual_plc::{Fault, Operation, VirtualConnector};

const NORTH: &str = "opc.tcp://north:4840";
const SOUTH: &str = "opc.tcp://south:4840";

fn config() -> GatewayConfig {
    GatewayConfig::from_toml_str(&format!(
        r#"
        [gateway]
        name = "Test Parks"
        poll_interval_ms = 100
        reconnect_backoff_secs = 300
        common_root_node = "root"

        [gateway.timeouts]
        connect_ms = 500
        metadata_ms = 200
        discovery_ms = 500
        shutdown_ms = 500

        [[endpoints]]
        address = "{NORTH}"
        name = "North"

        [[endpoints]]
        address = "{SOUTH}"
        name = "South"
        "#
    ))
    .unwrap()
}

fn gateway() -> (Gateway, VirtualConnector) {
    let connector = VirtualConnector::demo([NORTH, SOUTH], "root");
    let shared: Arc<dyn PlcConnector> = Arc::new(connector.clone());
    (Gateway::new(config(), shared).unwrap(), connector)
}

fn decode(frame: &str) -> TelemetryFrame {
    serde_json::from_str(frame).unwrap()
}

#[tokio::test]
async fn streams_filtered_frames_to_subscribers() {
    let (gateway, _connector) = gateway();
    let (tx_north, mut rx_north) = mpsc::channel(16);
    let (tx_all, mut rx_all) = mpsc::channel(16);
    gateway
        .subscribe("north-operator", Visibility::only([NORTH]), tx_north)
        .await;
    gateway.subscribe("admin", Visibility::All, tx_all).await;

    gateway.start();

    let frame = tokio::time::timeout(Duration::from_secs(5), rx_north.recv())
        .await
        .unwrap()
        .unwrap();
    let frame = decode(&frame);
    assert_eq!(frame.snapshots().len(), 1);
    assert_eq!(frame.snapshots()[0].address, NORTH);
    assert_eq!(frame.snapshots()[0].status, ConnectionState::Connected);

    let frame = decode(&rx_all.recv().await.unwrap());
    let addresses: Vec<&str> = frame.snapshots().iter().map(|s| s.address.as_str()).collect();
    assert_eq!(addresses, vec![NORTH, SOUTH]);

    gateway.shutdown().await;
}

#[tokio::test]
async fn current_data_reads_visible_endpoints() {
    let (gateway, connector) = gateway();
    gateway.poller().tick().await;

    connector
        .plc(SOUTH)
        .unwrap()
        .set_value("ns=2;s=Plc2.Power", Value::Float(f64::NAN));

    let frame = gateway.current_data(&Visibility::only([SOUTH])).await;
    assert_eq!(frame.snapshots().len(), 1);
    assert_eq!(frame.snapshots()[0].value("Power"), Some(&Value::Null));

    let json = frame.to_json().unwrap();
    assert!(!json.contains("NaN"));
}

#[tokio::test]
async fn write_then_read_back() {
    let (gateway, connector) = gateway();
    gateway.poller().tick().await;

    let ack = gateway
        .write(&WriteRequest::new(NORTH, "Setpoint", WriteValue::Text("250".into())).with_actor("ops"))
        .await
        .unwrap();
    assert_eq!(ack.status, "success");

    let ack = gateway
        .write(&WriteRequest::new(
            NORTH,
            "CMD_Instant_Cutoff",
            WriteValue::Bits(vec![false, true]),
        ))
        .await
        .unwrap();
    assert_eq!(ack.written, Some(vec![false, true]));

    let snapshots = gateway.poller().tick().await;
    assert_eq!(snapshots[0].value("Setpoint"), Some(&Value::Integer(250)));
    assert_eq!(snapshots[0].value("[1]"), Some(&Value::Bool(true)));

    let plc = connector.plc(NORTH).unwrap();
    assert_eq!(plc.journal().len(), 3);
}

#[tokio::test]
async fn write_to_disconnected_endpoint_is_refused() {
    let (gateway, connector) = gateway();
    connector
        .plc(SOUTH)
        .unwrap()
        .set_fault(Operation::Connect, Fault::Fail("unreachable".into()));
    gateway.poller().tick().await;

    let err = gateway
        .write(&WriteRequest::new(SOUTH, "Setpoint", WriteValue::Integer(1)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), 404);

    let json = serde_json::to_value(&err).unwrap();
    assert_eq!(json["status"], "error");
}

#[tokio::test]
async fn endpoint_summaries_report_identity_and_status() {
    let (gateway, connector) = gateway();
    connector
        .plc(SOUTH)
        .unwrap()
        .set_fault(Operation::Connect, Fault::Fail("unreachable".into()));
    gateway.poller().tick().await;

    let summaries = gateway.endpoints();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].status, ConnectionState::Connected);
    assert_eq!(summaries[0].server_name.as_deref(), Some("Virtual PLC 1"));
    assert!(summaries[0].points > 0);
    assert_eq!(summaries[1].status, ConnectionState::Disconnected);
    assert!(summaries[1].last_attempt_at.is_some());
    assert!(summaries[1].last_error.is_some());
}

#[tokio::test]
async fn shutdown_is_bounded_when_transport_hangs() {
    let (gateway, connector) = gateway();
    gateway.poller().tick().await;
    connector
        .plc(NORTH)
        .unwrap()
        .set_fault(Operation::Read, Fault::Hang);
    gateway.start();
    tokio::time::sleep(Duration::from_millis(250)).await;

    let started = std::time::Instant::now();
    gateway.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    assert!(gateway.is_shutting_down());
    for summary in gateway.endpoints() {
        assert_eq!(summary.status, ConnectionState::Disconnected);
    }
    assert_eq!(connector.plc(NORTH).unwrap().close_count(), 1);
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let (gateway, _connector) = gateway();
    let (tx, mut rx) = mpsc::channel(16);
    let session = gateway.subscribe("viewer", Visibility::All, tx).await;

    gateway.poller().tick().await;
    assert!(rx.recv().await.is_some());

    assert!(gateway.unsubscribe(session).await);
    assert!(!gateway.unsubscribe(session).await);
    gateway.poller().tick().await;
    assert!(rx.recv().await.is_none());
}
