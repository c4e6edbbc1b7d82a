//! The unit exchanged over a pipe.
//!
//! A [`Message`] carries a kind tag, an id, an opaque payload, and zero or more [`TypedBuffer`]s. The typed
//! buffers travel separately from the payload so that the transport can place them straight into buffers
//! allocated from the descriptor, without an intermediate copy of the whole message.

use std::{borrow::Cow, fmt};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ResponseError;

/// Identifier matching a response to its request, unique among one pipe's outstanding requests.
pub type MessageId = u64;

/// The kind tag of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// A request expecting a response.
    Request,
    /// A successful response.
    Response,
    /// A response reporting that handling the request failed. The payload is the UTF-8 failure text.
    Exception,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Request => write!(f, "request"),
            MessageKind::Response => write!(f, "response"),
            MessageKind::Exception => write!(f, "exception"),
        }
    }
}

/// A separately transferred buffer with an opaque type tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypedBuffer {
    /// Application defined tag describing the buffer contents.
    pub type_tag: Cow<'static, str>,
    /// The buffer bytes.
    pub data: Bytes,
}

impl TypedBuffer {
    /// Creates a new typed buffer.
    pub fn new(type_tag: impl Into<Cow<'static, str>>, data: impl Into<Bytes>) -> Self {
        TypedBuffer {
            type_tag: type_tag.into(),
            data: data.into(),
        }
    }
}

/// A request or response unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    id: MessageId,
    payload: Bytes,
    buffers: Vec<TypedBuffer>,
}

impl Message {
    /// Creates a message from its parts.
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>, buffers: Vec<TypedBuffer>) -> Self {
        Message {
            kind,
            id: 0,
            payload: payload.into(),
            buffers,
        }
    }

    /// Creates a request. Its id is assigned by the agent when sent.
    pub fn request(payload: impl Into<Bytes>) -> Self {
        Message::new(MessageKind::Request, payload, Vec::new())
    }

    /// Creates a successful response.
    pub fn response(payload: impl Into<Bytes>) -> Self {
        Message::new(MessageKind::Response, payload, Vec::new())
    }

    /// Creates an exception response answering the request with the given id.
    pub fn exception(description: &str, id: MessageId) -> Self {
        Message::new(
            MessageKind::Exception,
            Bytes::copy_from_slice(description.as_bytes()),
            Vec::new(),
        )
        .with_id(id)
    }

    /// Attaches a separately transferred buffer.
    pub fn with_buffer(mut self, buffer: TypedBuffer) -> Self {
        self.buffers.push(buffer);
        self
    }

    /// Sets the message id.
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    /// The kind tag.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Returns `true` for request messages.
    pub fn is_request(&self) -> bool {
        self.kind == MessageKind::Request
    }

    /// The message id.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Sets the message id.
    pub fn set_id(&mut self, id: MessageId) {
        self.id = id;
    }

    /// The opaque payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The separately transferred buffers.
    pub fn buffers(&self) -> &[TypedBuffer] {
        &self.buffers
    }

    /// Splits the message into its payload and buffers.
    pub fn into_parts(self) -> (Bytes, Vec<TypedBuffer>) {
        (self.payload, self.buffers)
    }

    /// Interprets a received response: exception responses become a [`ResponseError::Remote`] carrying the
    /// decoded failure text, anything else is returned as is.
    pub fn into_result(self) -> Result<Message, ResponseError> {
        match self.kind {
            MessageKind::Exception => Err(ResponseError::remote(
                String::from_utf8_lossy(&self.payload).as_ref(),
            )),
            _ => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_payload_becomes_remote_error() {
        let msg = Message::exception("division by zero", 7);
        assert_eq!(msg.id(), 7);
        assert_eq!(
            msg.into_result().unwrap_err(),
            ResponseError::remote("division by zero")
        );
    }

    #[test]
    fn responses_are_never_errors() {
        let msg = Message::response("ok").with_id(1);
        assert_eq!(msg.clone().into_result().unwrap(), msg);
    }

    #[test]
    fn buffers_keep_their_order() {
        let msg = Message::request("p")
            .with_buffer(TypedBuffer::new("f32", vec![1, 2, 3, 4]))
            .with_buffer(TypedBuffer::new("u8", vec![9]));
        let tags: Vec<_> = msg.buffers().iter().map(|b| b.type_tag.as_ref()).collect();
        assert_eq!(tags, ["f32", "u8"]);
    }
}
