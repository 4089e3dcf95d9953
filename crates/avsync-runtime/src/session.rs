//! Outbound avatar session
//!
//! One [`AvatarSession`] per local avatar, ticked once per frame by the
//! thread that owns the avatar. Every tick sends one avatar data packet
//! and, when the trait window is open, the identity and any dirty traits.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use rand::Rng;
use tracing::{debug, info, trace};

use avsync_core::{AvatarDataDetail, AvatarId, MixerLink, OutgoingPacket, PacketType};
use avsync_traits::{AvatarTraitStore, ClientTraitsHandler, TraitMarker};
use avsync_wire::{
    done_encoding, encode, wanted_flags, AvatarFields, AvatarIdentity, AvatarState, DataRates,
    EncodeParams, IdentityFlags, RateDirection, ReconcileThresholds, SendStatus,
};

use crate::{SessionStats, SyncConfig, SEQUENCE_NUMBER_SIZE};

/// Sequence number carried in front of every avatar data packet
pub type AvatarDataSequenceNumber = u16;

/// The local avatar's connection to the relay
pub struct AvatarSession {
    config: SyncConfig,
    avatar: Arc<AvatarState>,
    traits_store: Arc<AvatarTraitStore>,
    traits: Arc<ClientTraitsHandler>,
    link: Arc<dyn MixerLink>,
    identity: AvatarIdentity,
    identity_changed: bool,
    sequence_number: AvatarDataSequenceNumber,
    send_status: SendStatus,
    last_sent_time: Option<Instant>,
    next_traits_send_window: Instant,
    outbound_rates: DataRates,
    stats: SessionStats,
}

impl AvatarSession {
    pub fn new(
        config: SyncConfig,
        avatar: Arc<AvatarState>,
        traits_store: Arc<AvatarTraitStore>,
        link: Arc<dyn MixerLink>,
    ) -> Self {
        let traits = Arc::new(ClientTraitsHandler::new(traits_store.clone(), link.clone()));
        traits_store.attach_marker(Arc::downgrade(&traits) as Weak<dyn TraitMarker>);
        let outbound_rates = DataRates::with_interval(RateDirection::Outbound, config.rate_window);
        let identity = AvatarIdentity::new(avatar.session_id(), 0);

        AvatarSession {
            config,
            avatar,
            traits_store,
            traits,
            link,
            identity,
            identity_changed: true,
            sequence_number: 0,
            send_status: SendStatus::default(),
            last_sent_time: None,
            next_traits_send_window: Instant::now(),
            outbound_rates,
            stats: SessionStats::default(),
        }
    }

    pub fn avatar(&self) -> &Arc<AvatarState> {
        &self.avatar
    }

    pub fn traits_store(&self) -> &Arc<AvatarTraitStore> {
        &self.traits_store
    }

    pub fn traits(&self) -> &Arc<ClientTraitsHandler> {
        &self.traits
    }

    pub fn identity(&self) -> &AvatarIdentity {
        &self.identity
    }

    pub fn sequence_number(&self) -> AvatarDataSequenceNumber {
        self.sequence_number
    }

    pub fn send_status(&self) -> &SendStatus {
        &self.send_status
    }

    pub fn next_traits_send_window(&self) -> Instant {
        self.next_traits_send_window
    }

    pub fn outbound_rates(&self) -> &DataRates {
        &self.outbound_rates
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn set_display_name(&mut self, name: &str) {
        if self.identity.display_name != name {
            self.identity.display_name = name.to_owned();
            self.identity_changed = true;
        }
    }

    pub fn set_session_display_name(&mut self, name: &str) {
        if self.identity.session_display_name != name {
            self.identity.session_display_name = name.to_owned();
            self.identity_changed = true;
        }
    }

    pub fn set_identity_flag(&mut self, bit: u32, value: bool) {
        if self.identity.flags.has(bit) != value {
            self.identity.flags.set(bit, value);
            self.identity_changed = true;
        }
    }

    pub fn identity_flags(&self) -> IdentityFlags {
        self.identity.flags
    }

    /// A relay became reachable: restart the trait channel and resend the
    /// identity and a full snapshot.
    pub fn on_mixer_connected(&mut self, session_id: AvatarId) {
        info!(avatar = %session_id, "relay connected, resetting avatar session");
        self.avatar.set_session_id(session_id);
        self.identity.avatar_id = session_id;
        self.identity_changed = true;
        self.send_status.reset();
        self.last_sent_time = None;
        self.traits.reset_for_new_mixer();
    }

    /// Send everything due this frame at the configured detail
    pub fn tick(&mut self, now: Instant) -> usize {
        self.send_all_packets(self.config.default_detail, now)
    }

    /// Send everything due this frame. Returns the bytes handed to the link.
    pub fn send_all_packets(&mut self, detail: AvatarDataDetail, now: Instant) -> usize {
        let started = Instant::now();
        self.stats.frames += 1;
        let mut bytes_sent = 0;

        if now > self.next_traits_send_window {
            self.stats.trait_windows += 1;
            if self.identity_changed {
                bytes_sent += self.send_identity_packet();
            }
            let trait_bytes = self.traits.send_changed_traits_to_mixer();
            self.stats.trait_bytes += trait_bytes as u64;
            bytes_sent += trait_bytes;

            let wait_ms = (bytes_sent as f64 / self.config.trait_bytes_per_ms()).floor() as u64;
            self.next_traits_send_window += Duration::from_millis(wait_ms);
            // Never lag behind when little was sent
            if self.next_traits_send_window < now {
                self.next_traits_send_window = now;
            }
        }

        bytes_sent += self.send_avatar_data_packet(detail, now);
        self.stats.last_frame_duration = started.elapsed();
        bytes_sent
    }

    fn send_identity_packet(&mut self) -> usize {
        if !self.link.has_active_mixer() {
            return 0;
        }
        self.identity.sequence = self.identity.sequence.wrapping_add(1);
        let payload = self.identity.encode();
        let size = payload.len();
        self.link
            .send_to_mixer(OutgoingPacket::new(PacketType::AvatarIdentity, payload));
        self.identity_changed = false;
        self.stats.identity_packets += 1;
        debug!(
            avatar = %self.identity.avatar_id,
            sequence = self.identity.sequence,
            "sent identity"
        );
        size
    }

    fn send_avatar_data_packet(&mut self, detail: AvatarDataDetail, now: Instant) -> usize {
        if !self.link.has_active_mixer() {
            return 0;
        }

        // A random full update repairs joints whose last change was lost
        let detail = if rand::thread_rng().gen::<f32>() < self.config.full_update_ratio {
            self.stats.full_updates += 1;
            AvatarDataDetail::SendAllData
        } else {
            detail
        };

        let flags_init = if self.send_status.is_continuing() {
            self.send_status.item_flags
        } else {
            let flags = wanted_flags(self.avatar.as_ref(), detail, self.last_sent_time, false);
            self.last_sent_time = Some(now);
            flags
        };

        let last_sent = self.avatar.last_sent_joint_data();
        let params = EncodeParams::new(detail, flags_init, &last_sent)
            .with_max_data_size(self.config.max_snapshot_bytes())
            .with_outbound_rates(&self.outbound_rates);
        let encoded = encode(self.avatar.as_ref(), &params, &mut self.send_status);

        done_encoding(
            self.avatar.as_ref(),
            detail.culls_small_changes(),
            &self.send_status,
            ReconcileThresholds::default(),
        );

        if self.send_status.is_continuing() {
            self.stats.partial_frames += 1;
        }

        let mut payload = BytesMut::with_capacity(SEQUENCE_NUMBER_SIZE + encoded.bytes.len());
        payload.put_u16_le(self.sequence_number);
        payload.put_slice(&encoded.bytes);
        self.sequence_number = self.sequence_number.wrapping_add(1);

        let size = payload.len();
        self.link
            .send_to_mixer(OutgoingPacket::new(PacketType::AvatarData, payload.freeze()));
        self.stats.avatar_packets += 1;
        self.stats.avatar_bytes += size as u64;
        trace!(
            avatar = %self.avatar.session_id(),
            size,
            included = encoded.included.bits(),
            "sent avatar data"
        );
        size
    }
}
