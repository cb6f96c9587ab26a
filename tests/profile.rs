mod common;

use std::sync::Arc;
use std::time::Duration;

use lite_rs::profile::{ChannelWriter, ProfileTest, ProfileTestOptions};
use lite_rs::proxy::Registry;
use lite_rs::request::PingOption;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn options(mode: &str, concurrency: i64) -> ProfileTestOptions {
    ProfileTestOptions {
        speed_test_mode: mode.into(),
        concurrency,
        sort_method: "ping".into(),
        timeout: Duration::from_secs(5),
        output_mode: 2,
        ..Default::default()
    }
}

fn quick_ping() -> PingOption {
    PingOption {
        attempts: 2,
        timeout: Duration::from_secs(2),
    }
}

async fn run(test: ProfileTest, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) -> (Vec<lite_rs::profile::Node>, Vec<Value>) {
    let test = Arc::new(test);
    let nodes = test.test_all(CancellationToken::new()).await.unwrap();
    drop(test);
    let mut events = Vec::new();
    while let Some(raw) = rx.recv().await {
        events.push(serde_json::from_slice(&raw).unwrap());
    }
    (nodes, events)
}

fn count(events: &[Value], info: &str) -> usize {
    events.iter().filter(|e| e["info"] == info).count()
}

/// Answers the probe like clients3.google.com would, a little late so the
/// measured round trip is never zero.
async fn generate_204_server() -> std::net::SocketAddr {
    common::ss_server(|_, mut conn| async move {
        common::read_head(&mut conn).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = conn
            .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
            .await;
        let _ = conn.flush().await;
    })
    .await
}

#[tokio::test]
async fn batch_of_five_ends_with_eof() {
    let dead = common::closed_port().await;
    let links: Vec<String> = (0..5).map(|i| common::ss_link(dead, &format!("node{}", i))).collect();
    let (tx, rx) = mpsc::unbounded_channel();
    let test = ProfileTest::new(
        Arc::new(Registry::with_defaults()),
        Arc::new(ChannelWriter(tx)),
        options("all", 2),
        links,
    )
    .with_ping_option(quick_ping());

    let (nodes, events) = run(test, rx).await;
    assert_eq!(count(&events, "endone"), 5);
    assert_eq!(count(&events, "eof"), 1);
    assert_eq!(events.last().unwrap()["info"], "eof");
    assert_eq!(events[0]["info"], "started");
    assert_eq!(events[1]["info"], "gotservers");
    assert_eq!(events[1]["servers"].as_array().unwrap().len(), 5);

    // ping failures never start a speed test
    assert_eq!(count(&events, "startspeed"), 0);
    assert_eq!(nodes.len(), 5);
    for node in &nodes {
        assert!(!node.is_ok);
        assert_eq!(node.ping, 0);
        assert_eq!(node.max_speed, 0);
    }
    let mut ids: Vec<usize> = nodes.iter().map(|n| n.id).collect();
    ids.sort();
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn per_node_events_are_ordered() {
    let server = generate_204_server().await;
    let links: Vec<String> = (0..3).map(|i| common::ss_link(server, &format!("n{}", i))).collect();
    let (tx, rx) = mpsc::unbounded_channel();
    let test = ProfileTest::new(
        Arc::new(Registry::with_defaults()),
        Arc::new(ChannelWriter(tx)),
        options("pingonly", 2),
        links,
    )
    .with_ping_option(quick_ping());

    let (nodes, events) = run(test, rx).await;
    for id in 0..3 {
        let seq: Vec<&str> = events
            .iter()
            .filter(|e| e["id"] == id && e["info"] != "gotservers")
            .filter_map(|e| e["info"].as_str())
            .collect();
        assert_eq!(seq, vec!["startping", "gotping", "gotspeed", "endone"], "node {}", id);
    }
    for node in &nodes {
        assert!(node.is_ok, "{:?}", node);
        assert!(node.ping >= 20);
        assert_eq!(node.protocol, "ss");
    }
    // ping ascending
    assert!(nodes.windows(2).all(|w| w[0].ping <= w[1].ping));
}

#[tokio::test]
async fn speed_test_counts_body_bytes() {
    const BODY: usize = 200_000;
    let server = common::ss_server(|_, mut conn| async move {
        let head = common::read_head(&mut conn).await;
        assert!(head.starts_with(b"GET /file HTTP/1.1"));
        let resp = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", BODY);
        let _ = conn.write_all(resp.as_bytes()).await;
        let _ = conn.write_all(&vec![7u8; BODY]).await;
        let _ = conn.flush().await;
    })
    .await;
    let (tx, rx) = mpsc::unbounded_channel();
    let test = ProfileTest::new(
        Arc::new(Registry::with_defaults()),
        Arc::new(ChannelWriter(tx)),
        options("speedonly", 1),
        vec![common::ss_link(server, "fast")],
    )
    .with_download_url("http://speed.test/file");

    let (nodes, events) = run(test, rx).await;
    assert_eq!(count(&events, "startping"), 0);
    assert_eq!(count(&events, "startspeed"), 1);
    assert!(count(&events, "gotspeed") >= 1);
    let node = &nodes[0];
    assert!(node.is_ok);
    assert_eq!(node.traffic, BODY as i64);
    assert!(node.max_speed > 0);
    assert!(node.avg_speed > 0);
}

#[tokio::test]
async fn json_output_is_written() {
    let dir = std::env::temp_dir().join(format!("lite-rs-profile-{}", std::process::id()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let dead = common::closed_port().await;
    let (tx, rx) = mpsc::unbounded_channel();
    let mut opts = options("all", 1);
    opts.output_mode = 3;
    let test = ProfileTest::new(
        Arc::new(Registry::with_defaults()),
        Arc::new(ChannelWriter(tx)),
        opts,
        vec![common::ss_link(dead, "gone")],
    )
    .with_ping_option(quick_ping())
    .with_output_dir(&dir);

    run(test, rx).await;
    let data = tokio::fs::read(dir.join("output.json")).await.unwrap();
    let v: Value = serde_json::from_slice(&data).unwrap();
    assert_eq!(v["linksCount"], 1);
    assert_eq!(v["successCount"], 0);
    assert_eq!(v["nodes"][0]["remarks"], "gone");
    assert_eq!(v["options"]["speedtestMode"], "all");
    let _ = tokio::fs::remove_dir_all(&dir).await;
}
