//! End-to-end ASTM session over a real TCP socket: ENQ/ACK handshake, one
//! frame carrying a full H/P/O/R/L record stream, EOT, and confirmation that
//! the message landed in the store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lis_ingest::connection::Connection;
use lis_ingest::events::EventBus;
use lis_ingest::mapper::FieldMap;
use lis_ingest::model::Protocol;
use lis_ingest::persistence::Store;
use lis_ingest::protocol::astm::constants::{ACK, EOT, ENQ};
use lis_ingest::protocol::astm::Frame;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn temp_store() -> (Arc<Store>, PathBuf) {
    let path = std::env::temp_dir().join(format!("lis-ingest-astm-{}.sqlite3", uuid::Uuid::new_v4()));
    let store = Store::connect(path.to_str().unwrap()).await.unwrap();
    (Arc::new(store), path)
}

#[tokio::test]
async fn astm_session_persists_message_and_acks_every_frame() {
    let (store, db_path) = temp_store().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server_store = store.clone();
    let events = EventBus::new(16);
    let server_events = events.clone();
    tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        let connection = Connection::new(
            stream,
            peer,
            port,
            "SYSMEX-XN".to_string(),
            Protocol::Astm,
            FieldMap::default_astm(),
            Duration::from_secs(5),
            server_store,
            server_events,
            None,
        );
        let _ = connection.run().await;
    });

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    client.write_all(&[ENQ]).await.unwrap();
    let mut reply = [0u8; 1];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], ACK);

    let records = [
        "H|\\^&|||host|||||||P|1394-97|20260101120000",
        "P|1|98765||12345||Doe^Jane",
        "O|1|SAMPLE01||^^^GLU",
        "R|1|^^^GLU|5.3|mmol/L|3.9-6.1|N||F|||20260101120500",
        "L|1|N",
    ];
    let mut payload = records.join("\r");
    payload.push('\r');
    let frame = lis_ingest::protocol::astm::Frame::new(1, payload.into_bytes(), true);
    client.write_all(&frame.encode()).await.unwrap();
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], ACK);

    client.write_all(&[EOT]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let batch = store.fetch_sync_batch(10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].patient_external_id, "12345");
    assert_eq!(batch[0].order_sample_id, "SAMPLE01");
    assert_eq!(batch[0].test_code, "GLU");

    drop(client);
    let _ = std::fs::remove_file(db_path);
}

#[tokio::test]
async fn bad_checksum_is_nakked_and_retransmit_succeeds() {
    let (store, db_path) = temp_store().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server_store = store.clone();
    let events = EventBus::new(16);
    let server_events = events.clone();
    tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        let connection = Connection::new(
            stream,
            peer,
            port,
            "SYSMEX-XN".to_string(),
            Protocol::Astm,
            FieldMap::default_astm(),
            Duration::from_secs(5),
            server_store,
            server_events,
            None,
        );
        let _ = connection.run().await;
    });

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(&[ENQ]).await.unwrap();
    let mut reply = [0u8; 1];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], ACK);

    let frame = Frame::new(1, b"P|1|98765||12345||Doe^Jane".to_vec(), true);
    let mut corrupted = frame.encode();
    let len = corrupted.len();
    corrupted[len - 4] = b'0';
    corrupted[len - 3] = b'0';
    client.write_all(&corrupted).await.unwrap();
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], lis_ingest::protocol::astm::constants::NAK);

    client.write_all(&frame.encode()).await.unwrap();
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], ACK);

    client.write_all(&[EOT]).await.unwrap();
    drop(client);
    let _ = std::fs::remove_file(db_path);
}
