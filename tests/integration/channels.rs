//! Channel multiplexing scenarios: routing, retirement, and errors.

use std::sync::Arc;

use anyhow::Result;
use coda_client::{BrowseKind, Command, ProtocolError, SEARCH_UNLIMITED};

use crate::mock::MockConfig;
use crate::{client_config, establish, ChannelEvent, Recorder, Sink};

#[tokio::test]
async fn search_results_route_to_the_registered_channel() -> Result<()> {
    let (connection, mut server) = establish(client_config(), MockConfig::default()).await?;
    let (recorder, mut events) = Recorder::new();
    let (client, _pump) = connection.start();

    let id = client.search("abba", 0, SEARCH_UNLIMITED, recorder).await?;

    let (command, payload) = server.recv_packet().await?;
    assert_eq!(command, u8::from(Command::Search));
    assert_eq!(&payload[0..2], &id.to_be_bytes());

    // First reply fragment: channel stays open.
    let mut fragment = id.to_be_bytes().to_vec();
    fragment.extend_from_slice(b"result");
    server
        .send_packet(u8::from(Command::ChannelData), &fragment)
        .await?;

    assert_eq!(
        events.recv().await,
        Some(ChannelEvent::Data(id, b"result".to_vec()))
    );
    assert_eq!(client.open_channels(), 1);

    // End-of-channel marker retires it.
    server
        .send_packet(u8::from(Command::ChannelData), &id.to_be_bytes())
        .await?;
    assert_eq!(events.recv().await, Some(ChannelEvent::End(id)));
    assert_eq!(client.open_channels(), 0);
    Ok(())
}

#[tokio::test]
async fn aes_keys_arrive_as_channel_data() -> Result<()> {
    let (connection, mut server) = establish(client_config(), MockConfig::default()).await?;
    let (recorder, mut events) = Recorder::new();
    let (client, _pump) = connection.start();

    let id = client.request_key(&[0x0a; 20], &[0x0b; 16], recorder).await?;

    let (command, payload) = server.recv_packet().await?;
    assert_eq!(command, u8::from(Command::RequestKey));
    assert_eq!(payload.len(), 40);
    // This request carries its channel id at the tail.
    assert_eq!(&payload[38..40], &id.to_be_bytes());

    let mut reply = id.to_be_bytes().to_vec();
    reply.extend_from_slice(&[0xee; 16]);
    server
        .send_packet(u8::from(Command::AesKey), &reply)
        .await?;

    assert_eq!(
        events.recv().await,
        Some(ChannelEvent::Data(id, vec![0xee; 16]))
    );
    Ok(())
}

#[tokio::test]
async fn channel_errors_retire_the_channel() -> Result<()> {
    let (connection, mut server) = establish(client_config(), MockConfig::default()).await?;
    let (recorder, mut events) = Recorder::new();
    let (client, _pump) = connection.start();

    let id = client.request_image(&[0x01; 20], recorder).await?;
    server.recv_packet().await?; // drain the image request

    server
        .send_packet(u8::from(Command::ChannelError), &id.to_be_bytes())
        .await?;

    assert_eq!(events.recv().await, Some(ChannelEvent::Error(id)));
    assert_eq!(client.open_channels(), 0);
    Ok(())
}

#[tokio::test]
async fn browse_arity_is_enforced_before_sending() -> Result<()> {
    let (connection, _server) = establish(client_config(), MockConfig::default()).await?;
    let client = connection.client();

    let result = client
        .browse(BrowseKind::Artist, &[[0; 16], [1; 16]], Arc::new(Sink))
        .await;
    assert!(matches!(result, Err(ProtocolError::InvalidArgument(_))));
    assert_eq!(client.open_channels(), 0);
    Ok(())
}

#[tokio::test]
async fn concurrent_channels_keep_distinct_ids() -> Result<()> {
    let (connection, mut server) = establish(client_config(), MockConfig::default()).await?;
    let (first_recorder, mut first_events) = Recorder::new();
    let (second_recorder, mut second_events) = Recorder::new();
    let (client, _pump) = connection.start();

    let first = client.search("one", 0, 10, first_recorder).await?;
    let second = client.search("two", 0, 10, second_recorder).await?;
    assert_ne!(first, second);
    assert_eq!(client.open_channels(), 2);
    server.recv_packet().await?;
    server.recv_packet().await?;

    // Only the addressed channel hears the fragment.
    let mut fragment = second.to_be_bytes().to_vec();
    fragment.extend_from_slice(b"two!");
    server
        .send_packet(u8::from(Command::ChannelData), &fragment)
        .await?;

    assert_eq!(
        second_events.recv().await,
        Some(ChannelEvent::Data(second, b"two!".to_vec()))
    );
    assert!(first_events.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn playlist_fetch_opens_a_channel() -> Result<()> {
    let (connection, mut server) = establish(client_config(), MockConfig::default()).await?;
    let client = connection.client();

    let id = client
        .request_playlist(&[0x11; 17], Arc::new(Sink))
        .await?;

    let (command, payload) = server.recv_packet().await?;
    assert_eq!(command, u8::from(Command::GetPlaylist));
    assert_eq!(payload.len(), 32);
    assert_eq!(&payload[0..2], &id.to_be_bytes());
    assert_eq!(payload[31], 0x01);
    assert_eq!(client.open_channels(), 1);
    Ok(())
}
