//! Two-phase endpoint removal
//!
//! An entry leaves the table only once both sides agree it is gone: the local
//! owner detached it, and the peer either acknowledged our removal or removed
//! its own side first. Until then the identifier stays reserved so a late
//! message from the peer can never reach a reused id.
//!
//! ```text
//!                       LocalDetach / send Remove
//!   Normal ─────────────────────────────────────────▶ WaitRemoteRemoveAck ──Ack──▶ (removed)
//!     │  ╲                                                    ▲    ⟲ RemoteRemove / send Ack
//!     │   ╲ ForcedRemove / send Remove, notify                │
//!     │    ▼                                                  │ LocalDetach
//!     │   WaitLocalDetachAndRemoteRemoveAck ──────────────────┘
//!     │    │  ⟲ RemoteRemove / send Ack
//!     │    │ Ack
//!     │    ▼
//!     └──▶ WaitLocalDetach ──LocalDetach──▶ (removed)
//!  RemoteRemove / notify, send Ack
//! ```

/// Removal progress of one registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointState {
    /// Attached and routable
    Normal,
    /// The peer removed its side; waiting for the local owner to detach
    WaitLocalDetach,
    /// Detached locally; waiting for the peer to acknowledge
    WaitRemoteRemoveAck,
    /// Removed by the registry; waiting for both the owner and the peer
    WaitLocalDetachAndRemoteRemoveAck,
}

/// Something that moves an entry towards removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalEvent {
    /// The local owner detached the endpoint
    LocalDetach,
    /// The registry removed the endpoint on its own (the owner is told the
    /// peer is gone and still has to detach)
    ForcedRemove,
    /// The peer sent `RemoveEndpoint`
    RemoteRemove,
    /// The peer sent `RemoveEndpointAck`
    RemoteRemoveAck,
}

/// Where an entry goes after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Next {
    Stay(EndpointState),
    Remove,
}

/// The effects of one accepted event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub next: Next,
    /// Send `RemoveEndpoint` to the peer
    pub send_remove: bool,
    /// Send `RemoveEndpointAck` to the peer
    pub send_ack: bool,
    /// Tell the endpoint its peer is gone
    pub notify_peer_closed: bool,
}

impl Transition {
    const fn to(next: Next) -> Self {
        Self {
            next,
            send_remove: false,
            send_ack: false,
            notify_peer_closed: false,
        }
    }

    const fn send_remove(mut self) -> Self {
        self.send_remove = true;
        self
    }

    const fn send_ack(mut self) -> Self {
        self.send_ack = true;
        self
    }

    const fn notify(mut self) -> Self {
        self.notify_peer_closed = true;
        self
    }
}

impl EndpointState {
    /// Whether messages for the entry are still delivered
    pub fn is_routable(self) -> bool {
        self == EndpointState::Normal
    }

    /// Apply `event`; `None` means the event is a protocol error in this state
    pub(crate) fn on_event(self, event: RemovalEvent) -> Option<Transition> {
        use EndpointState::*;
        use RemovalEvent::*;

        let transition = match (self, event) {
            (Normal, LocalDetach) => Transition::to(Next::Stay(WaitRemoteRemoveAck)).send_remove(),
            (Normal, ForcedRemove) => {
                Transition::to(Next::Stay(WaitLocalDetachAndRemoteRemoveAck))
                    .send_remove()
                    .notify()
            }
            (Normal, RemoteRemove) => Transition::to(Next::Stay(WaitLocalDetach))
                .send_ack()
                .notify(),

            (WaitLocalDetach, LocalDetach) => Transition::to(Next::Remove),

            (WaitRemoteRemoveAck, RemoteRemoveAck) => Transition::to(Next::Remove),
            // Both sides removed at once; each acknowledges the other.
            (WaitRemoteRemoveAck, RemoteRemove) => {
                Transition::to(Next::Stay(WaitRemoteRemoveAck)).send_ack()
            }

            (WaitLocalDetachAndRemoteRemoveAck, LocalDetach) => {
                Transition::to(Next::Stay(WaitRemoteRemoveAck))
            }
            (WaitLocalDetachAndRemoteRemoveAck, RemoteRemoveAck) => {
                Transition::to(Next::Stay(WaitLocalDetach))
            }
            (WaitLocalDetachAndRemoteRemoveAck, RemoteRemove) => {
                Transition::to(Next::Stay(WaitLocalDetachAndRemoteRemoveAck)).send_ack()
            }

            _ => return None,
        };
        Some(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EndpointState::*;
    use RemovalEvent::*;

    fn run(events: &[RemovalEvent]) -> Option<Next> {
        let mut next = Next::Stay(Normal);
        for event in events {
            let Next::Stay(state) = next else {
                return None;
            };
            next = state.on_event(*event)?.next;
        }
        Some(next)
    }

    #[test]
    fn test_local_detach_then_ack() {
        let transition = Normal.on_event(LocalDetach).unwrap();
        assert!(transition.send_remove);
        assert!(!transition.notify_peer_closed);
        assert_eq!(run(&[LocalDetach, RemoteRemoveAck]), Some(Next::Remove));
    }

    #[test]
    fn test_remote_remove_then_local_detach() {
        let transition = Normal.on_event(RemoteRemove).unwrap();
        assert!(transition.send_ack);
        assert!(transition.notify_peer_closed);
        assert_eq!(run(&[RemoteRemove, LocalDetach]), Some(Next::Remove));
    }

    #[test]
    fn test_simultaneous_removal() {
        let transition = WaitRemoteRemoveAck.on_event(RemoteRemove).unwrap();
        assert_eq!(transition.next, Next::Stay(WaitRemoteRemoveAck));
        assert!(transition.send_ack);
        assert_eq!(
            run(&[LocalDetach, RemoteRemove, RemoteRemoveAck]),
            Some(Next::Remove)
        );
    }

    #[test]
    fn test_forced_remove_needs_both_halves() {
        assert_eq!(
            run(&[ForcedRemove, LocalDetach, RemoteRemoveAck]),
            Some(Next::Remove)
        );
        assert_eq!(
            run(&[ForcedRemove, RemoteRemoveAck, LocalDetach]),
            Some(Next::Remove)
        );
        assert_eq!(
            run(&[ForcedRemove, RemoteRemoveAck]),
            Some(Next::Stay(WaitLocalDetach))
        );
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(Normal.on_event(RemoteRemoveAck).is_none());
        assert!(WaitLocalDetach.on_event(RemoteRemove).is_none());
        assert!(WaitLocalDetach.on_event(RemoteRemoveAck).is_none());
        assert!(WaitLocalDetach.on_event(ForcedRemove).is_none());
        assert!(WaitRemoteRemoveAck.on_event(LocalDetach).is_none());
        assert!(WaitLocalDetachAndRemoteRemoveAck.on_event(ForcedRemove).is_none());
    }

    #[test]
    fn test_only_normal_is_routable() {
        assert!(Normal.is_routable());
        assert!(!WaitLocalDetach.is_routable());
        assert!(!WaitRemoteRemoveAck.is_routable());
        assert!(!WaitLocalDetachAndRemoteRemoveAck.is_routable());
    }
}
