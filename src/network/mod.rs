//! Framed TCP messaging between the distributor and its receivers.
//!
//! Every connection carries length-delimited bincode frames; the
//! distributor doubles as the registration endpoint, so a receiver's
//! first message is always an [`Introduction`](WorkMsg::Introduction)
//! carrying its rank.

use crate::error::Error;
use crate::work_package::WorkPackage;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};

mod codec;
pub use codec::MessageCodec;

pub type FramedStream<T> =
    FramedRead<ReadHalf<TcpStream>, MessageCodec<T>>;
pub type FramedSink<T> = FramedWrite<WriteHalf<TcpStream>, MessageCodec<T>>;

/// A connection to one peer, holding the sink for directed sends.
pub struct Connection<T> {
    /// The `IP:Port` of the peer
    pub address: SocketAddr,
    /// The framed write half used for sending messages to the peer
    pub sink: FramedSink<T>,
}

/// An envelope for every message on the wire.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Message<T> {
    /// The id of this message, monotonically increasing per sender
    pub msg_id: usize,
    /// The rank of the sender
    pub sender_id: usize,
    /// The rank of the addressee
    pub target_id: usize,
    /// The body of the message
    pub msg: T,
}

impl<T> Message<T> {
    /// Creates a new `Message`.
    pub fn new(
        msg_id: usize,
        sender_id: usize,
        target_id: usize,
        msg: T,
    ) -> Self {
        Message { msg_id, sender_id, target_id, msg }
    }
}

/// The distributor/receiver work protocol.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum WorkMsg {
    /// A receiver's first message after connecting: its rank
    Introduction { rank: usize },
    /// A receiver asks for the next package
    RequestWork,
    /// The distributor answers a request with a package
    Work(WorkPackage),
    /// The distributor answers a request once the input is exhausted or
    /// the job is draining
    NoMoreWork,
    /// A receiver confirms it has shut its local pool down
    Acknowledge,
    /// A processor asked for the whole job to stop; propagated upward
    TerminateJob { reason: String },
}

/// Reads the next message from the given framed `reader`.
pub(crate) async fn read_msg<T: DeserializeOwned>(
    reader: &mut FramedStream<T>,
) -> Result<Message<T>, Error> {
    match reader.next().await {
        None => Err(Error::StreamClosed),
        Some(x) => x,
    }
}

/// Sends the given `message` to the peer with `target_id` via its
/// directory [`Connection`].
pub(crate) async fn send_msg<T: Serialize>(
    target_id: usize,
    message: Message<T>,
    directory: &mut HashMap<usize, Connection<T>>,
) -> Result<(), Error> {
    use futures::SinkExt;
    match directory.get_mut(&target_id) {
        None => Err(Error::UnknownId),
        Some(conn) => {
            conn.sink.send(message).await?;
            Ok(())
        }
    }
}
