//! Messages exchanged over the bootstrap endpoint

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::{Message, MessageType};
use crate::registry::EndpointId;

pub(crate) const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Handshake {
    /// First message from the parent
    Hello { version: u32, child_token: String },
    /// The child's reply to `Hello`
    HelloAck { version: u32 },
    /// The parent attached `endpoint` for the pipe named `token`
    Offer { token: String, endpoint: EndpointId },
}

impl Handshake {
    pub(crate) fn to_message(&self) -> Result<Message> {
        let payload = rmp_serde::to_vec(self)?;
        Ok(Message::from_payload(MessageType::Endpoint, &payload)?)
    }

    pub(crate) fn from_message(message: &Message) -> Result<Self> {
        Ok(rmp_serde::from_slice(message.payload())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_survives_framing() {
        let offer = Handshake::Offer {
            token: "abc".to_string(),
            endpoint: EndpointId::new(5),
        };
        let message = offer.to_message().unwrap();
        assert_eq!(message.message_type(), MessageType::Endpoint);
        assert_eq!(Handshake::from_message(&message).unwrap(), offer);
    }

    #[test]
    fn test_unknown_payload_rejected() {
        let message = Message::from_payload(MessageType::Endpoint, b"\x93\x01\x02\x03").unwrap();
        assert!(Handshake::from_message(&message).is_err());
    }
}
