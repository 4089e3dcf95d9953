//! Receive dispatcher
//!
//! Runs on the network thread and routes relay packets to the remote
//! avatars it owns:
//! - bulk trait batches (acknowledged first, applied all-or-nothing)
//! - bulk avatar data (`[uuid][snapshot]` segments)
//! - identity packets
//! - kill packets
//! - trait overrides for the local avatar

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use avsync_core::{AvatarId, MixerLink, OutgoingPacket, PacketType, NUM_BYTES_UUID};
use avsync_traits::{
    encode_traits_ack, parse_bulk_traits, read_bulk_sequence, AvatarTraitStore, ClientTraitsHandler,
    TraitSource, TraitTable, TraitVersion, DEFAULT_TRAIT_VERSION,
};
use avsync_wire::{decode_identified, AvatarFields, AvatarIdentity, AvatarState, IdentitySequence};

use crate::{DispatchStats, SyncConfig};

/// Why the relay removed an avatar
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum KillAvatarReason {
    NoReason = 0,
    AvatarDisconnected = 1,
    AvatarIgnored = 2,
    TheirAvatarEnteredYourBubble = 3,
    YourAvatarEnteredTheirBubble = 4,
}

impl KillAvatarReason {
    pub fn from_wire(value: u8) -> Self {
        match value {
            1 => KillAvatarReason::AvatarDisconnected,
            2 => KillAvatarReason::AvatarIgnored,
            3 => KillAvatarReason::TheirAvatarEnteredYourBubble,
            4 => KillAvatarReason::YourAvatarEnteredTheirBubble,
            _ => KillAvatarReason::NoReason,
        }
    }
}

/// Everything received about one remote avatar
pub struct RemoteAvatar {
    state: Arc<AvatarState>,
    traits: Arc<AvatarTraitStore>,
    identity: Option<AvatarIdentity>,
    identity_sequence: IdentitySequence,
}

impl RemoteAvatar {
    fn new(id: AvatarId, config: &SyncConfig, default_model_url: &str) -> Self {
        RemoteAvatar {
            state: Arc::new(AvatarState::new(id).with_error_log_interval(config.error_log_interval)),
            traits: Arc::new(AvatarTraitStore::new(default_model_url)),
            identity: None,
            identity_sequence: IdentitySequence::default(),
        }
    }

    pub fn state(&self) -> &Arc<AvatarState> {
        &self.state
    }

    pub fn traits(&self) -> &Arc<AvatarTraitStore> {
        &self.traits
    }

    pub fn identity(&self) -> Option<&AvatarIdentity> {
        self.identity.as_ref()
    }
}

/// Routes inbound relay packets
pub struct ReceiveDispatcher {
    config: SyncConfig,
    link: Arc<dyn MixerLink>,
    local_traits: Arc<ClientTraitsHandler>,
    local_id: AvatarId,
    default_model_url: String,
    avatars: HashMap<AvatarId, RemoteAvatar>,
    processed_trait_versions: HashMap<AvatarId, TraitTable<TraitVersion>>,
    ignored: HashSet<AvatarId>,
    stats: DispatchStats,
}

impl ReceiveDispatcher {
    pub fn new(
        config: SyncConfig,
        link: Arc<dyn MixerLink>,
        local_traits: Arc<ClientTraitsHandler>,
        default_model_url: impl Into<String>,
    ) -> Self {
        ReceiveDispatcher {
            config,
            link,
            local_traits,
            local_id: AvatarId::NULL,
            default_model_url: default_model_url.into(),
            avatars: HashMap::new(),
            processed_trait_versions: HashMap::new(),
            ignored: HashSet::new(),
            stats: DispatchStats::default(),
        }
    }

    /// The relay assigned the local avatar a new session id
    pub fn set_local_id(&mut self, id: AvatarId) {
        self.local_id = id;
    }

    pub fn avatar(&self, id: AvatarId) -> Option<&RemoteAvatar> {
        self.avatars.get(&id)
    }

    pub fn avatar_count(&self) -> usize {
        self.avatars.len()
    }

    pub fn processed_trait_versions(&self, id: AvatarId) -> Option<&TraitTable<TraitVersion>> {
        self.processed_trait_versions.get(&id)
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn is_ignoring(&self, id: AvatarId) -> bool {
        self.ignored.contains(&id)
    }

    /// Start or stop ignoring an avatar. Ignoring removes what we hold.
    pub fn set_ignored(&mut self, id: AvatarId, ignored: bool) {
        if ignored {
            self.ignored.insert(id);
            self.kill_avatar(id, KillAvatarReason::AvatarIgnored);
        } else {
            self.ignored.remove(&id);
        }
    }

    pub fn handle_packet(&mut self, packet_type: PacketType, payload: &[u8]) {
        self.stats.packets_in += 1;
        match packet_type {
            PacketType::BulkAvatarTraits => self.process_bulk_avatar_traits(payload),
            PacketType::BulkAvatarData => self.process_bulk_avatar_data(payload),
            PacketType::AvatarIdentity => self.process_identity(payload),
            PacketType::KillAvatar => self.process_kill_avatar(payload),
            PacketType::SetAvatarTraits => {
                let applied = self.local_traits.process_trait_override(payload);
                self.stats.overrides_applied += applied as u64;
            }
            PacketType::AvatarData | PacketType::BulkAvatarTraitsAck => {
                debug!(?packet_type, "unexpected packet from relay");
            }
        }
    }

    fn remote(&mut self, id: AvatarId) -> &RemoteAvatar {
        let (config, url) = (&self.config, &self.default_model_url);
        self.avatars
            .entry(id)
            .or_insert_with(|| RemoteAvatar::new(id, config, url))
    }

    pub fn process_bulk_avatar_traits(&mut self, payload: &[u8]) {
        let sequence = match read_bulk_sequence(payload) {
            Ok(sequence) => sequence,
            Err(err) => {
                warn!(%err, "malformed bulk trait packet");
                self.stats.malformed_packets += 1;
                return;
            }
        };

        // Acknowledge before applying so the relay can move on
        if self.link.has_active_mixer() {
            self.link.send_to_mixer(OutgoingPacket::new(
                PacketType::BulkAvatarTraitsAck,
                encode_traits_ack(sequence),
            ));
            self.stats.acks_sent += 1;
        }

        let bulk = match parse_bulk_traits(payload) {
            Ok(bulk) => bulk,
            Err(err) => {
                warn!(%err, sequence, "malformed bulk trait packet, dropping it whole");
                self.stats.malformed_packets += 1;
                return;
            }
        };
        self.stats.trait_batches += 1;

        for avatar in bulk.avatars {
            if self.ignored.contains(&avatar.avatar_id) {
                debug!(avatar = %avatar.avatar_id, "discarding traits for ignored avatar");
                self.stats.traits_stale += avatar.records.len() as u64;
                continue;
            }
            let store = self.remote(avatar.avatar_id).traits.clone();
            let versions = self
                .processed_trait_versions
                .entry(avatar.avatar_id)
                .or_insert_with(|| TraitTable::new(DEFAULT_TRAIT_VERSION));

            for record in avatar.records {
                let last = match record.instance {
                    Some(instance) => versions.instance_or_default(record.trait_type, instance),
                    None => versions.get(record.trait_type),
                };
                if record.version <= last {
                    trace!(
                        avatar = %avatar.avatar_id,
                        trait_type = ?record.trait_type,
                        version = record.version,
                        last,
                        "skipping stale trait"
                    );
                    self.stats.traits_stale += 1;
                    continue;
                }

                match (record.instance, &record.payload) {
                    (Some(instance), None) => {
                        store.process_deleted_trait_instance(record.trait_type, instance)
                    }
                    (Some(instance), Some(data)) => {
                        store.process_trait_instance(record.trait_type, instance, data)
                    }
                    (None, Some(data)) => store.process_trait(record.trait_type, data),
                    // Rejected by the parser
                    (None, None) => continue,
                }

                match record.instance {
                    Some(instance) => versions.insert_instance(record.trait_type, instance, record.version),
                    None => versions.set(record.trait_type, record.version),
                }
                self.stats.traits_applied += 1;
            }
        }
    }

    pub fn process_bulk_avatar_data(&mut self, payload: &[u8]) {
        let mut offset = 0;
        while offset < payload.len() {
            let segment = &payload[offset..];
            if segment.len() < NUM_BYTES_UUID {
                warn!(remaining = segment.len(), "truncated avatar id in bulk avatar data");
                self.stats.malformed_packets += 1;
                return;
            }

            let mut id = [0u8; NUM_BYTES_UUID];
            id.copy_from_slice(&segment[..NUM_BYTES_UUID]);
            let id = AvatarId::from_bytes(id);

            let consumed = if id == self.local_id || self.ignored.contains(&id) {
                debug!(avatar = %id, is_self = id == self.local_id, "discarding received avatar data");
                self.stats.snapshots_skipped += 1;
                // Decode into a throwaway to find where the next segment starts
                let dummy = AvatarState::new(id);
                decode_identified(segment, |_| &dummy as &dyn AvatarFields).map(|(_, n)| n)
            } else {
                self.stats.snapshots_decoded += 1;
                let state = self.remote(id).state.clone();
                decode_identified(segment, |_| state.as_ref() as &dyn AvatarFields).map(|(_, n)| n)
            };

            match consumed {
                Some(consumed) => offset += consumed,
                None => return,
            }
        }
    }

    pub fn process_identity(&mut self, payload: &[u8]) {
        let identity = match AvatarIdentity::decode(payload) {
            Ok(identity) => identity,
            Err(err) => {
                debug!(%err, "refusing identity packet");
                self.stats.malformed_packets += 1;
                return;
            }
        };
        if self.ignored.contains(&identity.avatar_id) {
            return;
        }

        let (config, url) = (&self.config, &self.default_model_url);
        let remote = self
            .avatars
            .entry(identity.avatar_id)
            .or_insert_with(|| RemoteAvatar::new(identity.avatar_id, config, url));
        match remote.identity_sequence.accept(&identity) {
            Ok(()) => {
                remote.identity = Some(identity);
                self.stats.identities_applied += 1;
            }
            Err(err) => {
                debug!(%err, "ignoring identity");
                self.stats.identities_stale += 1;
            }
        }
    }

    pub fn process_kill_avatar(&mut self, payload: &[u8]) {
        if payload.len() < NUM_BYTES_UUID {
            warn!(len = payload.len(), "truncated kill avatar packet");
            self.stats.malformed_packets += 1;
            return;
        }
        let mut id = [0u8; NUM_BYTES_UUID];
        id.copy_from_slice(&payload[..NUM_BYTES_UUID]);
        let reason = payload
            .get(NUM_BYTES_UUID)
            .map_or(KillAvatarReason::NoReason, |b| KillAvatarReason::from_wire(*b));
        self.kill_avatar(AvatarId::from_bytes(id), reason);
    }

    /// Drop an avatar and forget the trait versions processed for it
    pub fn kill_avatar(&mut self, id: AvatarId, reason: KillAvatarReason) {
        if self.avatars.remove(&id).is_some() {
            self.stats.avatars_killed += 1;
            debug!(avatar = %id, ?reason, "removed avatar");
        }
        self.processed_trait_versions.remove(&id);
    }

    /// The relay went away; everything received from it is stale
    pub fn on_mixer_lost(&mut self) {
        info!(avatars = self.avatars.len(), "relay lost, clearing remote avatars");
        self.avatars.clear();
        self.processed_trait_versions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avsync_core::{AvatarDataDetail, InstanceId};
    use avsync_traits::{
        pack_instanced_trait, pack_instanced_trait_delete, pack_versioned_trait, TraitType,
    };
    use avsync_wire::{encode, EncodeParams, HasFlags, SendStatus};
    use bytes::{BufMut, BytesMut};
    use glam::Vec3;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    const DEFAULT_URL: &str = "https://cdn.example.com/avatars/default.fst";

    #[derive(Default)]
    struct TestLink {
        active: AtomicBool,
        sent: Mutex<Vec<OutgoingPacket>>,
    }

    impl MixerLink for TestLink {
        fn has_active_mixer(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }

        fn send_to_mixer(&self, packet: OutgoingPacket) {
            self.sent.lock().push(packet);
        }
    }

    fn dispatcher() -> (ReceiveDispatcher, Arc<TestLink>) {
        let link = Arc::new(TestLink::default());
        link.active.store(true, Ordering::SeqCst);
        let store = Arc::new(AvatarTraitStore::new(DEFAULT_URL));
        let handler = Arc::new(ClientTraitsHandler::new(store, link.clone()));
        let dispatcher = ReceiveDispatcher::new(SyncConfig::default(), link.clone(), handler, DEFAULT_URL);
        (dispatcher, link)
    }

    fn bulk(sequence: i64, avatar: AvatarId, body: impl FnOnce(&mut BytesMut)) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_i64_le(sequence);
        buf.put_slice(&avatar.to_bytes());
        body(&mut buf);
        buf.put_i8(TraitType::NULL_TRAIT);
        buf.to_vec()
    }

    fn url_trait(buf: &mut BytesMut, version: TraitVersion, url: &str) {
        pack_versioned_trait(buf, TraitType::SkeletonModelUrl, version, url.as_bytes());
    }

    #[test]
    fn test_ack_echoes_sequence() {
        let (mut dispatcher, link) = dispatcher();
        let avatar = AvatarId::random();
        dispatcher.handle_packet(
            PacketType::BulkAvatarTraits,
            &bulk(42, avatar, |buf| url_trait(buf, 1, "https://a/x.fst")),
        );
        let sent = link.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet_type, PacketType::BulkAvatarTraitsAck);
        assert_eq!(&sent[0].payload[..], &42i64.to_le_bytes());
    }

    #[test]
    fn test_versions_strictly_increase() {
        let (mut dispatcher, _link) = dispatcher();
        let avatar = AvatarId::random();

        dispatcher.process_bulk_avatar_traits(&bulk(1, avatar, |buf| url_trait(buf, 5, "https://a/five.fst")));
        let store = dispatcher.avatar(avatar).unwrap().traits().clone();
        assert_eq!(store.skeleton_model_url(), "https://a/five.fst");

        // Reordered older batch and a duplicate are both no-ops
        dispatcher.process_bulk_avatar_traits(&bulk(2, avatar, |buf| url_trait(buf, 4, "https://a/four.fst")));
        dispatcher.process_bulk_avatar_traits(&bulk(3, avatar, |buf| url_trait(buf, 5, "https://a/dup.fst")));
        assert_eq!(store.skeleton_model_url(), "https://a/five.fst");
        assert_eq!(dispatcher.stats().traits_stale, 2);

        dispatcher.process_bulk_avatar_traits(&bulk(4, avatar, |buf| url_trait(buf, 6, "https://a/six.fst")));
        assert_eq!(store.skeleton_model_url(), "https://a/six.fst");
        assert_eq!(
            dispatcher.processed_trait_versions(avatar).unwrap().get(TraitType::SkeletonModelUrl),
            6
        );
    }

    #[test]
    fn test_instances_and_deletes() {
        let (mut dispatcher, _link) = dispatcher();
        let avatar = AvatarId::random();
        let entity = InstanceId::random();

        dispatcher.process_bulk_avatar_traits(&bulk(1, avatar, |buf| {
            pack_instanced_trait(buf, TraitType::AvatarEntity, entity, b"props", 2);
        }));
        let store = dispatcher.avatar(avatar).unwrap().traits().clone();
        assert_eq!(store.avatar_entity_payload(entity).as_deref(), Some(&b"props"[..]));

        // Delete at an older version is stale
        dispatcher.process_bulk_avatar_traits(&bulk(2, avatar, |buf| {
            pack_instanced_trait_delete(buf, TraitType::AvatarEntity, entity, 2);
        }));
        assert!(store.avatar_entity_payload(entity).is_some());

        dispatcher.process_bulk_avatar_traits(&bulk(3, avatar, |buf| {
            pack_instanced_trait_delete(buf, TraitType::AvatarEntity, entity, 3);
        }));
        assert!(store.avatar_entity_payload(entity).is_none());
        assert_eq!(
            dispatcher
                .processed_trait_versions(avatar)
                .unwrap()
                .instance(TraitType::AvatarEntity, entity),
            Some(3)
        );
    }

    #[test]
    fn test_malformed_packet_applies_nothing() {
        let (mut dispatcher, link) = dispatcher();
        let avatar = AvatarId::random();
        let mut packet = bulk(9, avatar, |buf| {
            url_trait(buf, 1, "https://a/first.fst");
            buf.put_i8(TraitType::SkeletonData.to_wire());
            buf.put_i32_le(1);
            buf.put_i16_le(500);
            buf.put_slice(b"short");
        });
        packet.pop();

        dispatcher.process_bulk_avatar_traits(&packet);
        // Still acknowledged, nothing applied
        assert_eq!(link.sent.lock().len(), 1);
        assert!(dispatcher.avatar(avatar).is_none());
        assert_eq!(dispatcher.stats().malformed_packets, 1);
        assert_eq!(dispatcher.stats().traits_applied, 0);
    }

    #[test]
    fn test_short_sequence_not_acked() {
        let (mut dispatcher, link) = dispatcher();
        dispatcher.process_bulk_avatar_traits(&[1, 2, 3]);
        assert!(link.sent.lock().is_empty());
        assert_eq!(dispatcher.stats().malformed_packets, 1);
    }

    fn snapshot(avatar: &AvatarState) -> Vec<u8> {
        let params = EncodeParams::new(
            AvatarDataDetail::SendAllData,
            HasFlags(HasFlags::GLOBAL_POSITION | HasFlags::AUDIO_LOUDNESS),
            &[],
        );
        encode(avatar, &params, &mut SendStatus::with_uuid()).bytes.to_vec()
    }

    #[test]
    fn test_bulk_avatar_data_segments() {
        let (mut dispatcher, _link) = dispatcher();
        let local = AvatarState::new(AvatarId::random());
        local.set_global_position(Vec3::new(9.0, 9.0, 9.0));
        dispatcher.set_local_id(local.session_id());

        let a = AvatarState::new(AvatarId::random());
        a.set_global_position(Vec3::new(1.0, 2.0, 3.0));
        let b = AvatarState::new(AvatarId::random());
        b.set_global_position(Vec3::new(-4.0, 0.5, 8.0));
        b.set_audio_loudness(12.0);

        let mut packet = snapshot(&a);
        packet.extend(snapshot(&local));
        packet.extend(snapshot(&b));
        dispatcher.handle_packet(PacketType::BulkAvatarData, &packet);

        assert_eq!(dispatcher.avatar_count(), 2);
        assert!(dispatcher.avatar(local.session_id()).is_none());
        let remote_a = dispatcher.avatar(a.session_id()).unwrap().state().clone();
        let remote_b = dispatcher.avatar(b.session_id()).unwrap().state().clone();
        assert_eq!(remote_a.global_position(), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(remote_b.global_position(), Vec3::new(-4.0, 0.5, 8.0));
        assert!(remote_b.audio_loudness() > 0.0);
        assert_eq!(dispatcher.stats().snapshots_skipped, 1);
        assert_eq!(dispatcher.stats().snapshots_decoded, 2);
    }

    #[test]
    fn test_ignored_avatar_data_discarded() {
        let (mut dispatcher, _link) = dispatcher();
        let a = AvatarState::new(AvatarId::random());
        a.set_global_position(Vec3::X);
        let b = AvatarState::new(AvatarId::random());
        b.set_global_position(Vec3::Y);

        dispatcher.set_ignored(a.session_id(), true);
        let mut packet = snapshot(&a);
        packet.extend(snapshot(&b));
        dispatcher.process_bulk_avatar_data(&packet);

        assert!(dispatcher.avatar(a.session_id()).is_none());
        assert_eq!(dispatcher.avatar(b.session_id()).unwrap().state().global_position(), Vec3::Y);

        dispatcher.set_ignored(a.session_id(), false);
        dispatcher.process_bulk_avatar_data(&snapshot(&a));
        assert!(dispatcher.avatar(a.session_id()).is_some());
    }

    #[test]
    fn test_identity_sequence() {
        let (mut dispatcher, _link) = dispatcher();
        let id = AvatarId::random();
        let mut identity = AvatarIdentity::new(id, 4);
        identity.display_name = "Grace".into();
        dispatcher.handle_packet(PacketType::AvatarIdentity, &identity.encode());

        let older = AvatarIdentity {
            sequence: 3,
            display_name: "Old".into(),
            ..identity.clone()
        };
        dispatcher.handle_packet(PacketType::AvatarIdentity, &older.encode());
        assert_eq!(dispatcher.avatar(id).unwrap().identity().unwrap().display_name, "Grace");
        assert_eq!(dispatcher.stats().identities_stale, 1);

        let null = AvatarIdentity::new(AvatarId::NULL, 10);
        dispatcher.handle_packet(PacketType::AvatarIdentity, &null.encode());
        assert_eq!(dispatcher.avatar_count(), 1);
    }

    #[test]
    fn test_kill_forgets_trait_versions() {
        let (mut dispatcher, _link) = dispatcher();
        let avatar = AvatarId::random();
        dispatcher.process_bulk_avatar_traits(&bulk(1, avatar, |buf| url_trait(buf, 7, "https://a/x.fst")));
        assert!(dispatcher.processed_trait_versions(avatar).is_some());

        let mut kill = avatar.to_bytes().to_vec();
        kill.push(KillAvatarReason::AvatarDisconnected as u8);
        dispatcher.handle_packet(PacketType::KillAvatar, &kill);
        assert!(dispatcher.avatar(avatar).is_none());
        assert!(dispatcher.processed_trait_versions(avatar).is_none());

        // A rejoining avatar starts from scratch
        dispatcher.process_bulk_avatar_traits(&bulk(2, avatar, |buf| url_trait(buf, 1, "https://a/y.fst")));
        assert_eq!(
            dispatcher.avatar(avatar).unwrap().traits().skeleton_model_url(),
            "https://a/y.fst"
        );
    }

    #[test]
    fn test_relay_loss_clears_everything() {
        let (mut dispatcher, _link) = dispatcher();
        for _ in 0..3 {
            dispatcher.process_bulk_avatar_traits(&bulk(1, AvatarId::random(), |buf| {
                url_trait(buf, 1, "https://a/x.fst")
            }));
        }
        assert_eq!(dispatcher.avatar_count(), 3);
        dispatcher.on_mixer_lost();
        assert_eq!(dispatcher.avatar_count(), 0);
    }

    proptest! {
        #[test]
        fn prop_only_newer_versions_apply(versions in proptest::collection::vec(1i32..50, 1..20)) {
            let (mut dispatcher, _link) = dispatcher();
            let avatar = AvatarId::random();
            let mut best = 0;
            for (seq, version) in versions.iter().enumerate() {
                let url = format!("https://a/{version}.fst");
                dispatcher.process_bulk_avatar_traits(&bulk(seq as i64, avatar, |buf| url_trait(buf, *version, &url)));
                best = best.max(*version);
                let store = dispatcher.avatar(avatar).unwrap().traits().clone();
                prop_assert_eq!(store.skeleton_model_url(), format!("https://a/{best}.fst"));
            }
            let stats = dispatcher.stats();
            prop_assert_eq!(stats.traits_seen(), versions.len() as u64);
        }
    }

    #[test]
    fn test_kill_reason_wire() {
        assert_eq!(KillAvatarReason::from_wire(2), KillAvatarReason::AvatarIgnored);
        assert_eq!(KillAvatarReason::from_wire(200), KillAvatarReason::NoReason);
    }
}
