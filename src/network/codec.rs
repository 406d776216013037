//! A bincode codec layered over length-delimited frames.

use crate::error::Error;
use crate::network::Message;
use bincode::{deserialize, serialize};
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

const MAX_FRAME_SIZE: usize = 1_073_741_824; // 1 GB

/// Encodes and decodes [`Message`]s as length-prefixed bincode frames.
#[derive(Debug)]
pub struct MessageCodec<T> {
    phantom: std::marker::PhantomData<T>,
    codec: LengthDelimitedCodec,
}

impl<T> MessageCodec<T> {
    /// Creates a new `MessageCodec`.
    pub fn new() -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_SIZE)
            .new_codec();
        MessageCodec { phantom: std::marker::PhantomData, codec }
    }
}

impl<T> Default for MessageCodec<T> {
    fn default() -> Self {
        MessageCodec::new()
    }
}

impl<T: DeserializeOwned> Decoder for MessageCodec<T> {
    type Item = Message<T>;
    type Error = Error;

    /// Decodes a message by reading the frame length at the start of a
    /// frame and then deserializing that many bytes.
    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        match self.codec.decode(src)? {
            Some(data) => Ok(Some(deserialize(&data)?)),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<Message<T>> for MessageCodec<T> {
    type Error = Error;

    /// Encodes a message by writing the serialized length at the start
    /// of a frame followed by the serialized bytes.
    fn encode(
        &mut self,
        item: Message<T>,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let serialized = serialize(&item)?;
        Ok(self.codec.encode(Bytes::from(serialized), dst)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::WorkMsg;

    #[test]
    fn round_trips_a_message_through_the_codec() {
        let mut codec = MessageCodec::<WorkMsg>::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::new(7, 2, 0, WorkMsg::RequestWork), &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.msg_id, 7);
        assert_eq!(decoded.sender_id, 2);
        assert_eq!(decoded.target_id, 0);
        assert!(matches!(decoded.msg, WorkMsg::RequestWork));
    }

    #[test]
    fn partial_frame_decodes_to_none() {
        let mut codec = MessageCodec::<WorkMsg>::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::new(0, 1, 0, WorkMsg::Acknowledge), &mut buf)
            .unwrap();
        let partial = buf.split_to(buf.len() - 1);
        let mut partial = BytesMut::from(&partial[..]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }
}
