//! Link to the relay node
//!
//! The transport beneath the codec is external. Producers and consumers
//! only need to know whether a relay is reachable and how to hand it a
//! payload of a given packet type.

use bytes::Bytes;

/// Packet types exchanged with the relay
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// One avatar snapshot, prefixed by a u16 sequence number
    AvatarData,
    /// Many `[uuid][snapshot]` segments from the relay
    BulkAvatarData,
    /// Display name and identity flags
    AvatarIdentity,
    /// Avatar left or was ignored
    KillAvatar,
    /// Client trait batch, or a trait override from the relay
    SetAvatarTraits,
    /// Relay trait batch for many avatars
    BulkAvatarTraits,
    /// Echo of a bulk trait batch sequence number
    BulkAvatarTraitsAck,
}

impl PacketType {
    /// Packets that require reliable, ordered delivery
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            PacketType::AvatarIdentity
                | PacketType::KillAvatar
                | PacketType::SetAvatarTraits
                | PacketType::BulkAvatarTraits
        )
    }
}

/// Outgoing packet handed to the transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingPacket {
    pub packet_type: PacketType,
    pub payload: Bytes,
}

impl OutgoingPacket {
    pub fn new(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        OutgoingPacket {
            packet_type,
            payload: payload.into(),
        }
    }
}

/// Transport-side view of the relay (avatar mixer)
pub trait MixerLink: Send + Sync {
    /// A relay is known and has an active socket
    fn has_active_mixer(&self) -> bool;

    /// Hand a packet to the relay; delivery follows the packet type's
    /// reliability class
    fn send_to_mixer(&self, packet: OutgoingPacket);
}
