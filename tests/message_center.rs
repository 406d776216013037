//! Exercises the relay over real localhost sockets. Clients speak the
//! raw wire format: a u32 big-endian length prefix, then the payload.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use workmill::error::Error;
use workmill::message_center::MessageCenter;
use workmill::pool::MessageTag;

const CEILING: usize = 16;

async fn connect(center: &MessageCenter) -> TcpStream {
    TcpStream::connect(("127.0.0.1", center.port()))
        .await
        .unwrap()
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_u32(payload.len() as u32).await.unwrap();
    stream.write_all(payload).await.unwrap();
    stream.flush().await.unwrap();
}

async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let len = stream.read_u32().await.unwrap() as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

#[tokio::test(flavor = "multi_thread")]
async fn messages_are_relayed_and_responses_come_back() {
    let mut center = MessageCenter::new(0, CEILING).await.unwrap();
    let mut client = connect(&center).await;

    write_frame(&mut client, b"hello").await;
    let msg = center
        .next_message(Some(Duration::from_secs(5)))
        .await
        .unwrap()
        .expect("the frame should be relayed");
    assert_eq!(msg.client_id, 1);
    assert_eq!(msg.tag, MessageTag::Oob);
    assert_eq!(msg.data, b"hello");

    center.send_response(msg.client_id, b"hi back").await.unwrap();
    assert_eq!(read_frame(&mut client).await, b"hi back");
    center.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn clients_get_distinct_ids() {
    let mut center = MessageCenter::new(0, CEILING).await.unwrap();
    let mut first = connect(&center).await;
    write_frame(&mut first, b"one").await;
    let msg = center
        .next_message(Some(Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.client_id, 1);

    let mut second = connect(&center).await;
    write_frame(&mut second, b"two").await;
    let msg = center
        .next_message(Some(Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.client_id, 2);
    assert_eq!(msg.data, b"two");
    center.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn has_unseen_messages_reports_queued_traffic() {
    let mut center = MessageCenter::new(0, CEILING).await.unwrap();
    assert!(!center.has_unseen_messages());

    let mut client = connect(&center).await;
    write_frame(&mut client, b"ping").await;
    // the relay runs on its own tasks; give the frame a moment to land
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !center.has_unseen_messages() {
        assert!(tokio::time::Instant::now() < deadline, "nothing arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let msg = center
        .next_message(Some(Duration::ZERO))
        .await
        .unwrap()
        .expect("the queued message should be delivered");
    assert_eq!(msg.data, b"ping");
    assert!(!center.has_unseen_messages());
    center.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn an_over_ceiling_frame_is_an_error_and_is_never_forwarded() {
    let mut center = MessageCenter::new(0, CEILING).await.unwrap();
    let mut client = connect(&center).await;
    // a frame header promising more than the ceiling allows
    client.write_u32(100).await.unwrap();
    client.write_all(&[0u8; 100]).await.unwrap();
    client.flush().await.unwrap();

    let err = center
        .next_message(Some(Duration::from_secs(5)))
        .await
        .expect_err("the oversized frame should be rejected");
    assert!(matches!(err, Error::Protocol(_)));
    // nothing from the bad frame reaches the owner
    assert_eq!(
        center
            .next_message(Some(Duration::from_millis(100)))
            .await
            .unwrap(),
        None
    );
    center.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn responses_are_bounded_by_the_ceiling_and_never_empty() {
    let mut center = MessageCenter::new(0, CEILING).await.unwrap();
    let mut client = connect(&center).await;
    write_frame(&mut client, b"hello").await;
    let msg = center
        .next_message(Some(Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap();

    let too_big = vec![b'x'; CEILING + 1];
    assert!(matches!(
        center.send_response(msg.client_id, &too_big).await,
        Err(Error::Protocol(_))
    ));
    assert!(matches!(
        center.send_response(msg.client_id, b"").await,
        Err(Error::Protocol(_))
    ));
    assert!(matches!(
        center.send_response(99, b"nobody").await,
        Err(Error::UnknownId)
    ));
    center.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_sends_the_zero_length_sentinel() {
    let mut center = MessageCenter::new(0, CEILING).await.unwrap();
    let mut client = connect(&center).await;
    write_frame(&mut client, b"hello").await;
    let msg = center
        .next_message(Some(Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap();

    center.disconnect_client(msg.client_id).await.unwrap();
    // the sentinel is an empty frame: a length prefix of zero
    assert_eq!(client.read_u32().await.unwrap(), 0);
    // then the connection closes
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    // the client is gone from the directory
    assert!(matches!(
        center.send_response(msg.client_id, b"late").await,
        Err(Error::UnknownId)
    ));
    center.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn an_empty_inbound_frame_is_a_protocol_error() {
    let mut center = MessageCenter::new(0, CEILING).await.unwrap();
    let mut client = connect(&center).await;
    // zero-length frames are only meaningful outbound
    client.write_u32(0).await.unwrap();
    client.flush().await.unwrap();

    let err = center
        .next_message(Some(Duration::from_secs(5)))
        .await
        .expect_err("the empty frame should be rejected");
    assert!(matches!(err, Error::Protocol(_)));
    center.shutdown();
}
