// ABOUTME: Voice handshake accumulator
// ABOUTME: Holds the session id and server update until both halves have arrived

use crate::gateway::VoiceServerUpdate;
use crate::protocol::messages::OutgoingMessage;

/// Two-slot accumulator for the voice handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoiceSlots {
    session_id: Option<String>,
    event: Option<VoiceServerUpdate>,
}

impl VoiceSlots {
    /// Fill the state half
    pub fn set_session(&mut self, session_id: String) {
        self.session_id = Some(session_id);
    }

    /// Fill the server half
    pub fn set_server(&mut self, event: VoiceServerUpdate) {
        self.event = Some(event);
    }

    /// Whether both halves are present
    pub fn ready(&self) -> bool {
        self.session_id.is_some() && self.event.is_some()
    }

    /// Combined `voiceUpdate` once both halves are present
    pub fn combined(&self, guild_id: u64) -> Option<OutgoingMessage> {
        match (&self.session_id, &self.event) {
            (Some(session_id), Some(event)) => Some(OutgoingMessage::VoiceUpdate {
                guild_id,
                session_id: session_id.clone(),
                event: event.clone(),
            }),
            _ => None,
        }
    }

    /// Session id from the last state update
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Drop both halves
    pub fn clear(&mut self) {
        self.session_id = None;
        self.event = None;
    }
}
