//! A TCP-facing relay for interactive control and telemetry clients.
//!
//! One long-lived listener task accepts connections; each accepted
//! client gets a dedicated reader task that relays its length-prefixed
//! messages to the owning process over the same channel substrate the
//! worker pool uses, tagged with a per-client numeric id. This is a
//! side channel for small control messages, not bulk work transport.

use crate::error::Error;
use crate::pool::MessageTag;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{info, warn};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// The port clients connect to unless one is configured.
pub const DEFAULT_PORT: u16 = 7899;
/// The listen backlog.
pub const DEFAULT_BACKLOG: u32 = 10;
/// The inbound message size ceiling unless one is configured. Frames
/// above the ceiling are a protocol error, never truncated.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 255;

/// One message relayed from a connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    /// The relay-assigned id of the sending client
    pub client_id: u32,
    /// Always [`MessageTag::Oob`]: relayed on behalf of someone else
    pub tag: MessageTag,
    /// The message bytes, exactly as received
    pub data: Vec<u8>,
}

enum CenterEvent {
    Connected { client_id: u32, writer: mpsc::Sender<WriterCmd> },
    Message(ClientMessage),
    ProtocolError { client_id: u32, what: String },
    Disconnected { client_id: u32 },
}

enum WriterCmd {
    Send(Vec<u8>),
    /// The zero-length sentinel frame, then close
    Disconnect,
}

/// The owning process's handle to the relay.
pub struct MessageCenter {
    events: mpsc::Receiver<CenterEvent>,
    clients: HashMap<u32, mpsc::Sender<WriterCmd>>,
    unseen: VecDeque<ClientMessage>,
    deferred_error: Option<Error>,
    max_message_length: usize,
    listener: tokio::task::JoinHandle<()>,
    port: u16,
}

impl MessageCenter {
    /// Binds the listener and starts accepting clients. `port` 0 picks
    /// an ephemeral port (useful in tests); the bound port is available
    /// via [`port`](Self::port).
    pub async fn new(
        port: u16,
        max_message_length: usize,
    ) -> Result<Self, Error> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(format!("127.0.0.1:{}", port).parse().unwrap())?;
        let bound_port = socket.local_addr()?.port();
        let listener = socket.listen(DEFAULT_BACKLOG)?;
        info!("message center listening on port {}", bound_port);

        let (event_tx, events) = mpsc::channel(64);
        let handle = tokio::spawn(async move {
            let mut next_client_id: u32 = 1;
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("message center accept failed: {}", e);
                        break;
                    }
                };
                let client_id = next_client_id;
                next_client_id += 1;
                info!("client {} connected from {}", client_id, addr);
                spawn_client_tasks(
                    client_id,
                    stream,
                    event_tx.clone(),
                    max_message_length,
                )
                .await;
            }
        });

        Ok(MessageCenter {
            events,
            clients: HashMap::new(),
            unseen: VecDeque::new(),
            deferred_error: None,
            max_message_length,
            listener: handle,
            port: bound_port,
        })
    }

    /// The port the listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `true` if a relayed message is waiting. Never blocks.
    pub fn has_unseen_messages(&mut self) -> bool {
        self.drain_ready();
        !self.unseen.is_empty()
    }

    /// Returns the next relayed client message, waiting up to `timeout`
    /// (`None` blocks indefinitely, zero polls). `Ok(None)` means the
    /// wait elapsed with nothing to deliver.
    ///
    /// ## Errors
    /// `Error::Protocol` when a client violated the wire format, e.g.
    /// sent a frame above the configured ceiling. Nothing from that
    /// frame is ever forwarded.
    pub async fn next_message(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<ClientMessage>, Error> {
        loop {
            self.drain_ready_checked()?;
            if let Some(msg) = self.unseen.pop_front() {
                return Ok(Some(msg));
            }
            let event = match timeout {
                None => self.events.recv().await,
                Some(d) if d.is_zero() => return Ok(None),
                Some(d) => {
                    match tokio::time::timeout(d, self.events.recv())
                        .await
                    {
                        Ok(event) => event,
                        Err(_) => return Ok(None),
                    }
                }
            };
            match event {
                Some(event) => self.apply(event)?,
                None => return Err(Error::StreamClosed),
            }
        }
    }

    /// Sends `msg` back to the client with `client_id`.
    pub async fn send_response(
        &mut self,
        client_id: u32,
        msg: &[u8],
    ) -> Result<(), Error> {
        if msg.len() > self.max_message_length {
            return Err(Error::Protocol(format!(
                "response of {} bytes exceeds the {}-byte ceiling",
                msg.len(),
                self.max_message_length
            )));
        }
        if msg.is_empty() {
            return Err(Error::Protocol(
                "empty messages are reserved for disconnection"
                    .to_string(),
            ));
        }
        self.drain_ready();
        match self.clients.get(&client_id) {
            None => Err(Error::UnknownId),
            Some(writer) => writer
                .send(WriterCmd::Send(msg.to_vec()))
                .await
                .map_err(|_| Error::UnknownId),
        }
    }

    /// Sends the client the zero-length disconnect sentinel and drops
    /// the connection.
    pub async fn disconnect_client(
        &mut self,
        client_id: u32,
    ) -> Result<(), Error> {
        self.drain_ready();
        match self.clients.remove(&client_id) {
            None => Err(Error::UnknownId),
            Some(writer) => {
                let _ = writer.send(WriterCmd::Disconnect).await;
                Ok(())
            }
        }
    }

    /// Stops accepting new clients and drops all connections.
    pub fn shutdown(self) {
        self.listener.abort();
    }

    /// Applies all events that are already queued, deferring protocol
    /// errors.
    fn drain_ready(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            // protocol errors surface on the next next_message call
            if let Err(e) = self.apply(event) {
                self.deferred_error = Some(e);
            }
        }
    }

    fn drain_ready_checked(&mut self) -> Result<(), Error> {
        if let Some(e) = self.deferred_error.take() {
            return Err(e);
        }
        while let Ok(event) = self.events.try_recv() {
            self.apply(event)?;
        }
        Ok(())
    }

    fn apply(&mut self, event: CenterEvent) -> Result<(), Error> {
        match event {
            CenterEvent::Connected { client_id, writer } => {
                self.clients.insert(client_id, writer);
                Ok(())
            }
            CenterEvent::Message(msg) => {
                self.unseen.push_back(msg);
                Ok(())
            }
            CenterEvent::Disconnected { client_id } => {
                self.clients.remove(&client_id);
                Ok(())
            }
            CenterEvent::ProtocolError { client_id, what } => {
                self.clients.remove(&client_id);
                Err(Error::Protocol(format!(
                    "client {}: {}",
                    client_id, what
                )))
            }
        }
    }
}

/// Spawns the reader and writer tasks for one accepted client.
async fn spawn_client_tasks(
    client_id: u32,
    stream: TcpStream,
    events: mpsc::Sender<CenterEvent>,
    max_message_length: usize,
) {
    let codec = || {
        LengthDelimitedCodec::builder()
            .max_frame_length(max_message_length)
            .new_codec()
    };
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read_half, codec());
    let mut writer = FramedWrite::new(write_half, codec());

    let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCmd>(16);
    let _ = events
        .send(CenterEvent::Connected { client_id, writer: writer_tx })
        .await;

    tokio::spawn(async move {
        while let Some(cmd) = writer_rx.recv().await {
            match cmd {
                WriterCmd::Send(data) => {
                    if writer.send(Bytes::from(data)).await.is_err() {
                        break;
                    }
                }
                WriterCmd::Disconnect => {
                    let _ = writer.send(Bytes::new()).await;
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        loop {
            match reader.next().await {
                Some(Ok(frame)) => {
                    if frame.is_empty() {
                        let _ = events
                            .send(CenterEvent::ProtocolError {
                                client_id,
                                what: "empty message".to_string(),
                            })
                            .await;
                        break;
                    }
                    let msg = ClientMessage {
                        client_id,
                        tag: MessageTag::Oob,
                        data: frame.to_vec(),
                    };
                    if events
                        .send(CenterEvent::Message(msg))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Err(e)) => {
                    // an over-ceiling frame lands here; nothing from
                    // it is forwarded
                    let _ = events
                        .send(CenterEvent::ProtocolError {
                            client_id,
                            what: e.to_string(),
                        })
                        .await;
                    break;
                }
                None => {
                    let _ = events
                        .send(CenterEvent::Disconnected { client_id })
                        .await;
                    break;
                }
            }
        }
    });
}
