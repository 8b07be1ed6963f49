//! Integration tests for the line-protocol front-end and sharded registry.

use tally::server::{Db, Server, ServerConfig};
use tally::Timeline;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

fn test_config(dir: &TempDir) -> ServerConfig {
    ServerConfig::default()
        .with_addr("127.0.0.1:0")
        .with_data_dir(dir.path())
        .with_resolution(10)
        .with_shards(2)
}

#[tokio::test]
async fn test_put_over_tcp_round_trip() {
    let dir = TempDir::new().unwrap();
    let server = Server::bind(test_config(&dir)).await.unwrap();
    let addr = server.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let running = tokio::spawn(server.run_until(async {
        shutdown_rx.await.ok();
    }));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"web.hits 5 100\n\
              web.hits 3 100\n\
              web.hits 7 110\n\
              api.errors 2 100\n\
              not a valid line at all\n\
              bad/key 1 100\n",
        )
        .await
        .unwrap();
    stream.shutdown().await.unwrap();
    drop(stream);

    // Wait for the records to reach the shards, then shut down; the drain
    // applies everything still queued before the workers flush and stop.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !(dir.path().join("web.hits").is_dir() && dir.path().join("api.errors").is_dir()) {
        assert!(std::time::Instant::now() < deadline, "records never arrived");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    shutdown_tx.send(()).unwrap();
    running.await.unwrap().unwrap();

    let timeline = Timeline::from_directory(dir.path().join("web.hits"), 10).unwrap();
    let summary = timeline.summary();
    assert_eq!(summary.sum, 15);
    assert_eq!(summary.n, 2);

    let timeline = Timeline::from_directory(dir.path().join("api.errors"), 10).unwrap();
    assert_eq!(timeline.summary().sum, 2);

    // The malformed line and the unsafe key left nothing behind.
    assert!(!dir.path().join("bad").exists());
    assert!(!dir.path().join("bad/key").exists());
}

#[tokio::test]
async fn test_db_commands_round_trip() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(&test_config(&dir)).unwrap();
    let client = db.client();

    client.put("cpu".to_string(), 100, 5).await;
    client.put("cpu".to_string(), 110, 7).await;

    // Commands for one key share a shard, so the puts are already applied.
    let summary = client.summary("cpu").await.unwrap().unwrap();
    assert_eq!(summary.sum, 12);
    assert_eq!(summary.n, 2);

    let got = client.get("cpu", 110).await.unwrap().unwrap();
    assert_eq!(got.value.value, 7);

    let diff = client.diff("cpu", 100, 120).await.unwrap().unwrap();
    assert_eq!(diff.sum, 12);
    assert_eq!(diff.n, 2);

    db.shutdown().await;
}

#[tokio::test]
async fn test_queries_for_unknown_key_return_none() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(&test_config(&dir)).unwrap();
    let client = db.client();

    assert!(client.summary("nope").await.unwrap().is_none());
    assert!(client.get("nope", 100).await.unwrap().is_none());
    assert!(client.diff("nope", 0, 100).await.unwrap().is_none());

    db.shutdown().await;
}

#[tokio::test]
async fn test_db_reopens_existing_timelines() {
    let dir = TempDir::new().unwrap();

    {
        let mut timeline = Timeline::from_directory(dir.path().join("disk.used"), 10).unwrap();
        assert!(timeline.put(100, 9).unwrap());
        timeline.flush().unwrap();
    }

    let db = Db::open(&test_config(&dir)).unwrap();
    let client = db.client();

    let summary = client.summary("disk.used").await.unwrap().unwrap();
    assert_eq!(summary.sum, 9);

    db.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_flushes_ingested_data() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(&test_config(&dir)).unwrap();
    let client = db.client();

    for i in 0..100u64 {
        client.put("stream".to_string(), 100 + i * 10, 1).await;
    }

    drop(client);
    db.shutdown().await;

    let timeline = Timeline::from_directory(dir.path().join("stream"), 10).unwrap();
    assert_eq!(timeline.summary().sum, 100);
    assert_eq!(timeline.bucket_count(), 100);
}
