//! End-to-end client/server behaviour

mod common;

use avalanche_network::{Client, ConnectionConfig, LocalDiscovery, ServerConfig};
use avalanche_protocol::{Key, Stats, MAX_CHUNK_SIZE};
use common::{loopback_config, TestServer};
use std::time::Duration;

async fn put_blob(client: &Client, key: &Key, payload: &[u8]) -> bool {
    match client.put(key).await.unwrap() {
        Some(mut upload) => {
            upload.write(payload).await.unwrap();
            upload.close().await.unwrap()
        }
        None => false,
    }
}

async fn get_blob(client: &Client, key: &Key) -> Option<Vec<u8>> {
    let stream = client.get(key).await.unwrap()?;
    Some(stream.read_to_end().await.unwrap())
}

#[tokio::test]
async fn test_case_server_scenario() {
    let server = TestServer::start(&LocalDiscovery::new()).await;
    let client = server.client();
    let key = Key::new(1, 2, 3, 4);
    let payload = b"Hello world!\0";

    assert!(client.ping().await);
    assert!(client.get(&key).await.unwrap().is_none());

    let mut upload = client.put(&key).await.unwrap().unwrap();
    upload.write(payload).await.unwrap();
    assert_eq!(upload.written(), 13);
    assert!(upload.close().await.unwrap());

    let stream = client.get(&key).await.unwrap().unwrap();
    assert_eq!(stream.available(), 13);
    assert_eq!(stream.read_to_end().await.unwrap(), payload);

    client.disconnect();
    drop(client);
    assert!(server.wait_for_connections(0).await);
}

#[tokio::test]
async fn test_put_never_replaces() {
    let server = TestServer::start(&LocalDiscovery::new()).await;
    let client = server.client();
    let key = Key::new(0, 0, 0, 10);

    assert!(put_blob(&client, &key, b"first").await);
    assert!(client.put(&key).await.unwrap().is_none());
    assert!(!put_blob(&client, &key, b"second").await);

    assert_eq!(get_blob(&client, &key).await.unwrap(), b"first");
}

#[tokio::test]
async fn test_evict_removes() {
    let server = TestServer::start(&LocalDiscovery::new()).await;
    let client = server.client();
    let key = Key::new(0, 0, 0, 11);

    assert!(put_blob(&client, &key, b"evict me").await);
    assert!(client.have(&key).await.unwrap());

    assert!(client.evict(&[key]).await.unwrap());
    assert!(client.get(&key).await.unwrap().is_none());
    assert!(!client.have(&key).await.unwrap());

    // A second eviction reports failure and the connection stays usable.
    assert!(!client.evict(&[key]).await.unwrap());
    assert!(client.ping().await);
    assert_eq!(client.stats().await.unwrap(), Stats::default());
}

#[tokio::test]
async fn test_stats_track_contents() {
    let server = TestServer::start(&LocalDiscovery::new()).await;
    let client = server.client();
    let keys = [Key::new(1, 0, 0, 1), Key::new(1, 0, 0, 2), Key::new(1, 0, 0, 3)];

    assert!(put_blob(&client, &keys[0], &[1u8; 100]).await);
    assert!(put_blob(&client, &keys[1], &[2u8; 250]).await);
    assert!(put_blob(&client, &keys[2], &[]).await);
    assert_eq!(
        client.stats().await.unwrap(),
        Stats {
            blob_count: 3,
            memory_usage: 350
        }
    );

    assert!(client.evict(&keys[..1]).await.unwrap());
    assert_eq!(
        client.stats().await.unwrap(),
        Stats {
            blob_count: 2,
            memory_usage: 250
        }
    );
    assert_eq!(client.stats().await.unwrap(), server.dictionary.stats().await);
}

#[tokio::test]
async fn test_discard_leaves_nothing() {
    let server = TestServer::start(&LocalDiscovery::new()).await;
    let client = server.client();
    let key = Key::new(0, 0, 0, 12);

    let mut upload = client.put(&key).await.unwrap().unwrap();
    upload.write(b"never committed").await.unwrap();
    upload.discard().await.unwrap();

    assert!(!client.have(&key).await.unwrap());
    assert_eq!(client.stats().await.unwrap(), Stats::default());

    // The key can still be uploaded afterwards.
    assert!(put_blob(&client, &key, b"committed").await);
    assert_eq!(get_blob(&client, &key).await.unwrap(), b"committed");
}

#[tokio::test]
async fn test_touch_batch() {
    let server = TestServer::start(&LocalDiscovery::new()).await;
    let client = server.client();
    let keys: Vec<Key> = (1..=4).map(|i| Key::new(2, 0, 0, i)).collect();
    for key in &keys {
        assert!(put_blob(&client, key, b"t").await);
    }

    assert!(client.touch(&keys).await.unwrap());
    assert!(client.touch(&[]).await.unwrap());

    let mut with_missing = keys.clone();
    with_missing.insert(2, Key::new(9, 9, 9, 9));
    assert!(!client.touch(&with_missing).await.unwrap());

    // Touching never removes anything.
    assert_eq!(client.stats().await.unwrap().blob_count, 4);
}

#[tokio::test]
async fn test_keys_enumeration() {
    let server = TestServer::start(&LocalDiscovery::new()).await;
    let client = server.client();
    assert!(client.keys().await.unwrap().is_empty());

    let mut expected: Vec<Key> = (1..=5).map(|i| Key::new(3, i, 0, 0)).collect();
    for key in &expected {
        assert!(put_blob(&client, key, b"k").await);
    }

    let mut keys = client.keys().await.unwrap();
    keys.sort();
    expected.sort();
    assert_eq!(keys, expected);
}

#[tokio::test]
async fn test_large_blob_spans_chunks() {
    let server = TestServer::start(&LocalDiscovery::new()).await;
    let client = server.client();
    let key = Key::new(4, 4, 4, 4);
    let payload: Vec<u8> = (0..(2 * MAX_CHUNK_SIZE as usize + 1234))
        .map(|i| (i % 251) as u8)
        .collect();

    let mut upload = client.put(&key).await.unwrap().unwrap();
    let sent = upload.write_from(&mut payload.as_slice()).await.unwrap();
    assert_eq!(sent, payload.len() as u64);
    assert!(upload.close().await.unwrap());

    assert_eq!(client.stat(&key).await.unwrap(), Some(payload.len() as u64));
    assert_eq!(get_blob(&client, &key).await.unwrap(), payload);
}

#[tokio::test]
async fn test_partial_get_close_drains() {
    let server = TestServer::start(&LocalDiscovery::new()).await;
    let client = server.client();
    let key = Key::new(5, 5, 5, 5);
    assert!(put_blob(&client, &key, &[7u8; 200_000]).await);
    client.disconnect();

    let mut stream = client.get(&key).await.unwrap().unwrap();
    let mut buf = [0u8; 1000];
    let read = stream.read(&mut buf).await.unwrap();
    assert!(read > 0);
    assert_eq!(stream.available(), 200_000 - read as u64);

    stream.close().await.unwrap();
    assert_eq!(client.pooled_count(), 1);

    // The drained socket serves the next request.
    assert!(client.ping().await);
    assert_eq!(client.pooled_count(), 1);
}

#[tokio::test]
async fn test_dropped_upload_is_abandoned() {
    let server = TestServer::start(&LocalDiscovery::new()).await;
    let client = server.client();
    let key = Key::new(6, 6, 6, 6);

    let mut upload = client.put(&key).await.unwrap().unwrap();
    upload.write(b"half").await.unwrap();
    drop(upload);

    assert!(server.wait_for_connections(0).await);
    assert!(!client.have(&key).await.unwrap());
    assert!(put_blob(&client, &key, b"whole").await);
}

#[tokio::test]
async fn test_stale_pooled_socket_is_replaced() {
    let config = ServerConfig {
        connection: ConnectionConfig {
            idle_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        },
        ..loopback_config()
    };
    let server = TestServer::start_with(config, &LocalDiscovery::new()).await;
    let client = server.client();

    assert!(client.ping().await);
    assert_eq!(client.pooled_count(), 1);

    // The server closes the idle session behind the pooled socket.
    assert!(server.wait_for_connections(0).await);
    assert!(client.ping().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients() {
    let server = TestServer::start(&LocalDiscovery::new()).await;
    let address = server.address;

    let mut tasks = Vec::new();
    for i in 1..=16u32 {
        tasks.push(tokio::spawn(async move {
            let client = Client::new(address);
            let key = Key::new(7, 0, 0, i);
            let payload = vec![i as u8; 10_000 + i as usize];
            assert!(put_blob(&client, &key, &payload).await);
            assert_eq!(get_blob(&client, &key).await.unwrap(), payload);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let client = server.client();
    assert_eq!(client.stats().await.unwrap().blob_count, 16);
    for i in 1..=16u32 {
        assert!(client.have(&Key::new(7, 0, 0, i)).await.unwrap());
    }
}

#[tokio::test]
async fn test_shared_client_across_tasks() {
    let server = TestServer::start(&LocalDiscovery::new()).await;
    let client = server.client();

    let mut tasks = Vec::new();
    for i in 1..=8u32 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let key = Key::new(8, 0, 0, i);
            assert!(put_blob(&client, &key, &i.to_be_bytes()).await);
            assert!(client.have(&key).await.unwrap());
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(client.keys().await.unwrap().len(), 8);
}

#[tokio::test]
async fn test_disk_backed_server_persists() {
    let dir = tempfile::tempdir().unwrap();
    let key = Key::new(9, 0, 0, 1);
    let config = ServerConfig {
        blobs_path: Some(dir.path().to_path_buf()),
        ..loopback_config()
    };

    {
        let server = TestServer::start_with(config.clone(), &LocalDiscovery::new()).await;
        let client = server.client();
        assert!(put_blob(&client, &key, b"on disk").await);
        assert!(dir.path().join(format!("{}.blob", key)).exists());
    }

    let server = TestServer::start_with(config, &LocalDiscovery::new()).await;
    let client = server.client();
    assert_eq!(get_blob(&client, &key).await.unwrap(), b"on disk");
    assert_eq!(
        client.stats().await.unwrap(),
        Stats {
            blob_count: 1,
            memory_usage: 7
        }
    );
}
