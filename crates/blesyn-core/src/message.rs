use std::fmt;

/// Wire text for the responder's opening advertisement marker.
pub const SYN_TEXT: &str = "SYN";
/// Wire text the initiator writes once it has found the responder.
pub const SYN_ACK_TEXT: &str = "SYN+ACK";
/// Wire text the responder serves on the first read.
pub const ACK_TEXT: &str = "ACK";
/// Wire text the responder serves after the initiator's closing write.
pub const FINAL_ACK_TEXT: &str = "Final ACK";

/// Payload served by the responder when no outbound text is configured.
pub const DEFAULT_OUTBOUND_TEXT: &str = "hello world";
/// Body of the initiator's acknowledgment for a delivered payload.
pub const RECEIVED_MESSAGE_ACK: &str = "Received Message";

/// One characteristic value exchanged by the handshake.
///
/// Control messages are recognised by exact byte equality with their wire
/// text. Every other value, including bytes that are not valid UTF-8, is
/// carried as opaque [`Message::Data`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Message {
    Syn,
    SynAck,
    Ack,
    Data(String),
    FinalAck,
}

impl Message {
    /// Decodes a characteristic value. Never fails.
    pub fn decode(bytes: &[u8]) -> Self {
        match bytes {
            b if b == SYN_TEXT.as_bytes() => Message::Syn,
            b if b == SYN_ACK_TEXT.as_bytes() => Message::SynAck,
            b if b == ACK_TEXT.as_bytes() => Message::Ack,
            b if b == FINAL_ACK_TEXT.as_bytes() => Message::FinalAck,
            other => Message::Data(String::from_utf8_lossy(other).into_owned()),
        }
    }

    /// Encodes the message as the UTF-8 bytes written to the characteristic.
    pub fn encode(&self) -> Vec<u8> {
        self.as_text().as_bytes().to_vec()
    }

    pub fn as_text(&self) -> &str {
        match self {
            Message::Syn => SYN_TEXT,
            Message::SynAck => SYN_ACK_TEXT,
            Message::Ack => ACK_TEXT,
            Message::FinalAck => FINAL_ACK_TEXT,
            Message::Data(text) => text,
        }
    }

    pub fn is_control(&self) -> bool {
        !matches!(self, Message::Data(_))
    }

    /// The initiator's fixed acknowledgment for a received payload.
    pub fn received_ack() -> Self {
        Message::Data(RECEIVED_MESSAGE_ACK.to_string())
    }

    /// Builds a data message, substituting the default text for empty input.
    pub fn outbound(text: &str) -> Self {
        if text.is_empty() {
            Message::Data(DEFAULT_OUTBOUND_TEXT.to_string())
        } else {
            Message::Data(text.to_string())
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_text())
    }
}
