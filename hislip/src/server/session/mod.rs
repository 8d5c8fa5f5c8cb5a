use async_std::channel::{self, Receiver, Sender};

use crate::common::Protocol;

pub(crate) mod asynchronous;
pub(crate) mod synchronous;

/// First message id sent by the server, see HiSLIP specification 6.1.3
pub(crate) const INITIAL_SENT_MESSAGE_ID: u32 = 0xFFFF_FF00;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionMode {
    Synchronized,
    Overlapped,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub(crate) enum SessionState {
    /// Synchronous channel established, waiting for the asynchronous channel
    Handshake,
    /// Both channels established
    Normal,
}

/// Mutable per-session state, shared between the synchronous and the
/// asynchronous channel of one session.
///
/// The mutex around it is held for field access only, never across I/O.
/// Response payloads are computed while holding it and written after release.
pub(crate) struct SharedSession {
    /// Negotiated protocol
    pub(crate) protocol: Protocol,

    /// Current state of session
    state: SessionState,

    /// Negotiated session mode
    pub(crate) mode: SessionMode,

    /// Sub-address of the device this session controls
    pub(crate) sub_address: String,

    /// Negotiated maximum message size
    pub(crate) max_message_size: u64,

    /// Should enable remote automatically
    pub(crate) enable_remote: bool,

    /// Last message id read from the synchronous channel
    pub(crate) read_message_id: u32,

    /// Outbound message id counter
    pub(crate) sent_message_id: u32,

    /// Message available: response data has been queued and not yet
    /// acknowledged by an RMT. Mirrored into bit 4 of the status byte.
    pub(crate) mav: bool,

    /// The next inbound Data/DataEnd should carry the RMT flag
    pub(crate) rmt_expected: bool,

    /// Device clear fence between the two channels
    clear: (Sender<()>, Receiver<()>),
}

impl SharedSession {
    pub(crate) fn new(
        protocol: Protocol,
        sub_address: String,
        mode: SessionMode,
        max_message_size: u64,
    ) -> Self {
        Self {
            protocol,
            state: SessionState::Handshake,
            mode,
            sub_address,
            max_message_size,
            enable_remote: true,
            read_message_id: 0,
            sent_message_id: INITIAL_SENT_MESSAGE_ID,
            mav: false,
            rmt_expected: false,
            clear: channel::bounded(1),
        }
    }

    /// Get the session's state.
    #[must_use]
    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    /// Set the session's state.
    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// Status byte with the session's MAV bit folded into the device status.
    pub(crate) fn stb(&self, device_status: u8) -> u8 {
        let mav = if self.mav { 0x10 } else { 0x00 };
        device_status & 0xEF | mav
    }

    /// An RMT was delivered on an inbound message, see HiSLIP 4.14.1
    pub(crate) fn rmt_delivered(&mut self) {
        self.mav = false;
        self.rmt_expected = false;
    }

    /// Discard queued response state during a device clear
    pub(crate) fn clear_pending_output(&mut self) {
        self.mav = false;
        self.rmt_expected = false;
    }

    pub(crate) fn get_clear_receiver(&self) -> Receiver<()> {
        self.clear.1.clone()
    }

    pub(crate) fn get_clear_sender(&self) -> Sender<()> {
        self.clear.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PROTOCOL_1_0;

    #[test]
    fn test_stb_mav_bit() {
        let mut session = SharedSession::new(
            PROTOCOL_1_0,
            "hislip0".to_string(),
            SessionMode::Synchronized,
            1024,
        );

        assert_eq!(session.stb(0x00), 0x00);
        session.mav = true;
        // Bit 4 of the device status is overwritten by the session MAV
        assert_eq!(session.stb(0x00), 0x10);
        assert_eq!(session.stb(0xFF), 0xFF);
        session.rmt_delivered();
        assert_eq!(session.stb(0xFF), 0xEF);
    }
}
