//! End-to-end proxy tests over real WebSocket connections: welcome,
//! subscribe protocol, filtered fan-out and application-level ping.

use futures_util::{SinkExt, StreamExt};
use marketflow_core::{
    DataType, MarketData, Metadata, Payload, TickerPayload, TradePayload, TradeSide,
};
use marketflow_proxy::{serve, ProxyConfig, WebSocketProxy};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_proxy(config: ProxyConfig) -> (Arc<WebSocketProxy>, String) {
    let proxy = Arc::new(WebSocketProxy::new(config));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_proxy = Arc::clone(&proxy);
    tokio::spawn(async move {
        let _ = serve(listener, server_proxy).await;
    });
    (proxy, format!("ws://{addr}/ws"))
}

async fn connect(url: &str) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

/// Receive the next JSON envelope, skipping transport frames.
async fn next_envelope(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("receive error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(payload) => {
                let _ = client.send(Message::Pong(payload)).await;
            }
            _ => continue,
        }
    }
}

async fn expect_type(client: &mut Client, msg_type: &str) -> Value {
    let envelope = next_envelope(client).await;
    assert_eq!(envelope["type"], msg_type, "unexpected envelope: {envelope}");
    envelope
}

async fn subscribe(client: &mut Client, payload: Value) -> Value {
    let frame = json!({"type": "subscribe", "payload": payload, "timestamp": 1}).to_string();
    client.send(Message::Text(frame.into())).await.unwrap();
    expect_type(client, "subscribed").await
}

fn trade(symbol: &str) -> MarketData {
    MarketData {
        exchange: "binance".to_string(),
        symbol: symbol.to_string(),
        data_type: DataType::Trade,
        event_timestamp: 1,
        received_timestamp: 1,
        payload: Payload::Trade(TradePayload {
            id: "1".to_string(),
            price: Decimal::ONE,
            quantity: Decimal::ONE,
            side: TradeSide::Buy,
            timestamp: 1,
        }),
        metadata: Metadata::new("test"),
    }
}

fn ticker(symbol: &str) -> MarketData {
    MarketData {
        exchange: "binance".to_string(),
        symbol: symbol.to_string(),
        data_type: DataType::Ticker,
        event_timestamp: 1,
        received_timestamp: 1,
        payload: Payload::Ticker(TickerPayload {
            last: Decimal::ONE,
            open: Decimal::ONE,
            high: Decimal::ONE,
            low: Decimal::ONE,
            volume: Decimal::ONE,
            quote_volume: Decimal::ONE,
            bid: None,
            ask: None,
            price_change_pct: None,
        }),
        metadata: Metadata::new("test"),
    }
}

#[tokio::test]
async fn test_welcome_and_app_ping() {
    let (_proxy, url) = start_proxy(ProxyConfig::default()).await;
    let mut client = connect(&url).await;

    let welcome = expect_type(&mut client, "welcome").await;
    assert!(welcome["payload"]["clientId"].is_string());
    assert!(welcome["payload"]["serverTime"].is_i64());

    client
        .send(Message::Text(
            json!({"type": "ping", "payload": null, "timestamp": 1})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
    expect_type(&mut client, "pong").await;
}

#[tokio::test]
async fn test_filtered_fanout() {
    // A subscribes by symbol, B by data type.
    let (proxy, url) = start_proxy(ProxyConfig::default()).await;

    let mut a = connect(&url).await;
    expect_type(&mut a, "welcome").await;
    subscribe(&mut a, json!({"symbols": ["BTC/USDT"]})).await;

    let mut b = connect(&url).await;
    expect_type(&mut b, "welcome").await;
    subscribe(&mut b, json!({"dataTypes": ["ticker"]})).await;

    // Trade on BTC/USDT: A only.
    assert_eq!(proxy.forward_message(&trade("BTC/USDT"), None), 1);
    let data = expect_type(&mut a, "data").await;
    assert_eq!(data["payload"]["symbol"], "BTC/USDT");
    assert_eq!(data["payload"]["type"], "trade");

    // Ticker on ETH/USDT: B only.
    assert_eq!(proxy.forward_message(&ticker("ETH/USDT"), None), 1);
    let data = expect_type(&mut b, "data").await;
    assert_eq!(data["payload"]["symbol"], "ETH/USDT");

    // Ticker on BTC/USDT: both, exactly once each.
    assert_eq!(proxy.forward_message(&ticker("BTC/USDT"), None), 2);
    let data = expect_type(&mut a, "data").await;
    assert_eq!(data["payload"]["type"], "ticker");
    let data = expect_type(&mut b, "data").await;
    assert_eq!(data["payload"]["symbol"], "BTC/USDT");
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (proxy, url) = start_proxy(ProxyConfig::default()).await;
    let mut client = connect(&url).await;
    expect_type(&mut client, "welcome").await;

    let subscribed = subscribe(&mut client, json!({"symbols": ["BTC/USDT"]})).await;
    let filter_id = subscribed["payload"]["filterId"].as_str().unwrap().to_string();
    assert_eq!(proxy.forward_message(&trade("BTC/USDT"), None), 1);
    expect_type(&mut client, "data").await;

    client
        .send(Message::Text(
            json!({"type": "unsubscribe", "payload": {"filterId": filter_id}, "timestamp": 1})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
    let unsubscribed = expect_type(&mut client, "unsubscribed").await;
    assert!(unsubscribed["payload"]["filterId"].is_string());

    assert_eq!(proxy.forward_message(&trade("BTC/USDT"), None), 0);
}

#[tokio::test]
async fn test_get_stats() {
    let (_proxy, url) = start_proxy(ProxyConfig::default()).await;
    let mut client = connect(&url).await;
    expect_type(&mut client, "welcome").await;
    subscribe(&mut client, json!({"symbols": ["BTC/USDT"]})).await;

    client
        .send(Message::Text(
            json!({"type": "getStats", "payload": null, "timestamp": 1})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
    let stats = expect_type(&mut client, "stats").await;
    assert_eq!(stats["payload"]["pool"]["clients"], 1);
    assert_eq!(stats["payload"]["subscription"]["filters"], 1);
    assert_eq!(stats["payload"]["health"]["healthy"], true);
}

#[tokio::test]
async fn test_bad_message_gets_error_envelope() {
    let (_proxy, url) = start_proxy(ProxyConfig::default()).await;
    let mut client = connect(&url).await;
    expect_type(&mut client, "welcome").await;

    client
        .send(Message::Text(
            json!({"type": "orders", "payload": {}, "timestamp": 1})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
    let error = expect_type(&mut client, "error").await;
    assert!(error["payload"]["message"]
        .as_str()
        .unwrap()
        .contains("unknown message type"));
}

#[tokio::test]
async fn test_capacity_close() {
    let (_proxy, url) = start_proxy(ProxyConfig {
        max_clients: 1,
        ..Default::default()
    })
    .await;

    let mut first = connect(&url).await;
    expect_type(&mut first, "welcome").await;

    // Second client is closed with 1013.
    let mut second = connect(&url).await;
    loop {
        match second.next().await {
            Some(Ok(Message::Close(frame))) => {
                let frame = frame.expect("close frame should carry a code");
                assert_eq!(u16::from(frame.code), 1013);
                break;
            }
            Some(Ok(_)) => continue,
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}
