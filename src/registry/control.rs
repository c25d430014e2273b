//! Registry control messages
//!
//! Control messages travel as `EndpointControl` frames. The route names the
//! endpoints involved (source on the sender, destination on the receiver);
//! the payload is the MessagePack encoding of [`ControlMessage`].

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::{Message, MessageType, Route};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum ControlMessage {
    /// Run the destination endpoint with the source as its remote
    RunEndpoint,
    /// The sender removed the source endpoint
    RemoveEndpoint,
    /// The sender saw our `RemoveEndpoint` for the destination endpoint
    RemoveEndpointAck,
}

impl ControlMessage {
    /// Frame this control message for the given route
    pub(crate) fn to_message(self, route: Route) -> Result<Message> {
        let payload = rmp_serde::to_vec(&self)?;
        let mut message = Message::from_payload(MessageType::EndpointControl, &payload)?;
        message.set_route(route)?;
        Ok(message)
    }

    pub(crate) fn from_message(message: &Message) -> Result<(Self, Route)> {
        let route = message.route()?;
        let control = rmp_serde::from_slice(message.payload())?;
        Ok((control, route))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_framing() {
        let route = Route {
            source: 4,
            destination: 7,
        };
        let message = ControlMessage::RemoveEndpointAck.to_message(route).unwrap();
        assert_eq!(message.message_type(), MessageType::EndpointControl);

        let decoded = Message::deserialize(message.data()).unwrap();
        let (control, decoded_route) = ControlMessage::from_message(&decoded).unwrap();
        assert_eq!(control, ControlMessage::RemoveEndpointAck);
        assert_eq!(decoded_route, route);
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let mut message = Message::from_payload(MessageType::EndpointControl, &[0xc1]).unwrap();
        message.set_route(Route::default()).unwrap();
        assert!(ControlMessage::from_message(&message).is_err());
    }
}
