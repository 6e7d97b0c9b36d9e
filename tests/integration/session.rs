//! Encrypted transport scenarios: first records, nonce discipline,
//! argument validation, and the ping service.

use std::sync::Arc;

use anyhow::Result;
use coda_client::{Command, SessionConfig};

use crate::mock::MockConfig;
use crate::{client_config, establish, Sink};

#[tokio::test]
async fn first_encrypted_record_carries_the_cache_hash() -> Result<()> {
    let config = SessionConfig {
        cache_hash: "ff".repeat(20),
        ..client_config()
    };
    let (connection, mut server) = establish(config, MockConfig::default()).await?;
    let client = connection.client();

    client.send_cache_hash().await?;

    // 3-byte header + 20-byte digest + 4-byte MAC on the wire.
    let record = server.read_raw(27).await?;
    let (command, payload) = server.decrypt_record(&record)?;
    assert_eq!(command, u8::from(Command::CacheHash));
    assert_eq!(payload, vec![0xff; 20]);

    assert_eq!(client.send_iv().await, 1);
    assert_eq!(server.recv_iv(), 1);
    Ok(())
}

#[tokio::test]
async fn substream_requests_encode_word_positions() -> Result<()> {
    let (connection, mut server) = establish(client_config(), MockConfig::default()).await?;
    let client = connection.client();

    let id = client
        .request_substream(&[0xab; 20], 8192, 16384, Arc::new(Sink))
        .await?;

    let (command, payload) = server.recv_packet().await?;
    assert_eq!(command, u8::from(Command::GetSubstream));
    assert_eq!(payload.len(), 44);
    assert_eq!(&payload[0..2], &id.to_be_bytes());
    assert_eq!(&payload[16..36], &[0xab; 20][..]);
    assert_eq!(&payload[36..40], &2048u32.to_be_bytes());
    assert_eq!(&payload[40..44], &6144u32.to_be_bytes());
    Ok(())
}

#[tokio::test]
async fn rejected_arguments_leave_no_trace() -> Result<()> {
    let (connection, mut server) = establish(client_config(), MockConfig::default()).await?;
    let client = connection.client();

    // Unaligned substream offset, zero search limit: both refused locally.
    assert!(client
        .request_substream(&[0; 20], 4095, 4096, Arc::new(Sink))
        .await
        .is_err());
    assert!(client.search("x", 0, 0, Arc::new(Sink)).await.is_err());

    // No channel was kept, no nonce was drawn, nothing hit the wire.
    assert_eq!(client.open_channels(), 0);
    assert_eq!(client.send_iv().await, 0);

    // The session is still healthy.
    client.request_play().await?;
    let (command, payload) = server.recv_packet().await?;
    assert_eq!(command, u8::from(Command::RequestPlay));
    assert!(payload.is_empty());
    Ok(())
}

#[tokio::test]
async fn server_pings_are_answered() -> Result<()> {
    let (connection, mut server) = establish(client_config(), MockConfig::default()).await?;
    let (_client, _pump) = connection.start();

    server.send_packet(u8::from(Command::Ping), &[]).await?;

    let (command, payload) = server.recv_packet().await?;
    assert_eq!(command, u8::from(Command::Pong));
    assert_eq!(payload, vec![0, 0, 0, 0]);
    Ok(())
}

#[tokio::test]
async fn ten_contending_senders_use_nonces_zero_through_nine() -> Result<()> {
    let (connection, mut server) = establish(client_config(), MockConfig::default()).await?;
    let client = connection.client();

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move { client.request_play().await }));
    }
    for task in tasks {
        task.await??;
    }
    assert_eq!(client.send_iv().await, 10);

    // All ten records decrypt, in wire order, under nonces 0..=9.
    for n in 0..10u32 {
        assert_eq!(server.recv_iv(), n);
        let (command, _) = server.recv_packet().await?;
        assert_eq!(command, u8::from(Command::RequestPlay));
    }
    Ok(())
}

#[tokio::test]
async fn token_notify_is_an_empty_record() -> Result<()> {
    let (connection, mut server) = establish(client_config(), MockConfig::default()).await?;
    let client = connection.client();

    client.send_token_notify().await?;

    let (command, payload) = server.recv_packet().await?;
    assert_eq!(command, u8::from(Command::TokenNotify));
    assert!(payload.is_empty());
    Ok(())
}
