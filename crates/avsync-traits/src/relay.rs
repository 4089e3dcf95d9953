//! Relay-side trait forwarding
//!
//! The relay keeps, per sending avatar, the last version received for
//! each trait, and per (listener, sender) the last version forwarded.
//! Deleted instances keep their version as a negative number so a later
//! delete can still be ordered against it.

use std::collections::{BTreeMap, HashMap};

use bytes::{BufMut, BytesMut};
use tracing::{debug, trace, warn};
use url::Url;

use avsync_core::{AvatarId, InstanceId, OutgoingPacket, PacketType};

use crate::{
    pack_instanced_trait, pack_instanced_trait_delete, pack_versioned_trait, wire_safe_url,
    AvatarTraitStore, TraitMessageSequence, TraitReader, TraitSource, TraitTable, TraitType,
    TraitVersion, DEFAULT_TRAIT_VERSION, DELETED_TRAIT_SIZE,
};

/// Which skeleton model URLs the relay lets through
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SkeletonUrlPolicy {
    /// URL prefixes (host plus leading path); empty allows every URL
    pub whitelist: Vec<String>,
    /// Sanctioned URL substituted for anything not whitelisted
    pub replacement_url: String,
}

fn parse_user_url(input: &str) -> Option<Url> {
    Url::parse(input)
        .ok()
        .filter(|url| url.has_host())
        .or_else(|| Url::parse(&format!("http://{input}")).ok())
}

impl SkeletonUrlPolicy {
    /// Host matches a whitelisted prefix and the path starts with its path
    pub fn allows(&self, url: &str) -> bool {
        if self.whitelist.is_empty() {
            return true;
        }
        let Some(url) = parse_user_url(url) else {
            return false;
        };
        let host = url.host_str().unwrap_or_default();
        let path = url.path().to_ascii_lowercase();

        self.whitelist.iter().filter_map(|prefix| parse_user_url(prefix)).any(|prefix| {
            prefix.host_str().unwrap_or_default().eq_ignore_ascii_case(host)
                && path.starts_with(&prefix.path().to_ascii_lowercase())
        })
    }
}

/// Result of ingesting one client trait batch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetTraitsOutcome {
    pub any_traits_changed: bool,
    pub skeleton_changed: bool,
    /// Skeleton override to send back to the client
    pub override_packet: Option<OutgoingPacket>,
}

/// Relay state for one sending avatar
pub struct SenderTraits {
    avatar: AvatarTraitStore,
    last_received: TraitTable<TraitVersion>,
    change_count: u64,
}

impl SenderTraits {
    pub fn new(default_model_url: impl Into<String>) -> Self {
        SenderTraits {
            avatar: AvatarTraitStore::new(default_model_url),
            last_received: TraitTable::new(DEFAULT_TRAIT_VERSION),
            change_count: 0,
        }
    }

    pub fn store(&self) -> &AvatarTraitStore {
        &self.avatar
    }

    pub fn last_received_versions(&self) -> &TraitTable<TraitVersion> {
        &self.last_received
    }

    /// Bumped whenever an ingested batch changes a trait
    pub fn change_count(&self) -> u64 {
        self.change_count
    }

    /// Ingest a `SetAvatarTraits` batch. Traits whose version is not newer
    /// than the last one received are skipped. A malformed tuple stops
    /// the batch; tuples before it stay applied.
    pub fn process_set_traits(&mut self, payload: &[u8], policy: Option<&SkeletonUrlPolicy>) -> SetTraitsOutcome {
        let mut outcome = SetTraitsOutcome::default();
        let mut reader = TraitReader::new(payload);
        let Ok(version) = reader.read_i32() else {
            warn!("set traits packet without a version");
            return outcome;
        };

        while reader.remaining() > 0 {
            let Ok(raw_type) = reader.read_i8() else { break };
            let Some(trait_type) = TraitType::from_wire(raw_type) else {
                warn!(trait_type = raw_type, "refusing to process traits of unknown type");
                break;
            };

            let instance = if trait_type.is_instanced() {
                match reader.read_uuid() {
                    Ok(bytes) => Some(InstanceId::from_bytes(bytes)),
                    Err(_) => {
                        warn!("received an instanced trait with no instance id");
                        break;
                    }
                }
            } else {
                None
            };

            let size = match reader.read_i16() {
                Ok(size) if size == DELETED_TRAIT_SIZE || (size >= 0 && size as usize <= reader.remaining()) => size,
                Ok(size) => {
                    warn!(?trait_type, size, "refusing to process trait of invalid size");
                    break;
                }
                Err(_) => {
                    warn!(?trait_type, "trait without a size");
                    break;
                }
            };
            let data = if size > 0 {
                match reader.read_bytes(size as usize) {
                    Ok(data) => data,
                    Err(_) => break,
                }
            } else {
                &[][..]
            };

            match instance {
                None => {
                    if size == DELETED_TRAIT_SIZE {
                        warn!(?trait_type, "simple traits cannot be deleted");
                        break;
                    }
                    if version <= self.last_received.get(trait_type) {
                        debug!(?trait_type, version, "skipping stale trait");
                        continue;
                    }
                    self.avatar.process_trait(trait_type, data);
                    self.last_received.set(trait_type, version);
                    if trait_type == TraitType::SkeletonModelUrl {
                        outcome.skeleton_changed = true;
                        if let Some(policy) = policy {
                            outcome.override_packet = self.check_skeleton_url(policy, version);
                        }
                    }
                    outcome.any_traits_changed = true;
                }
                Some(instance) => {
                    let last = self.last_received.instance_or_default(trait_type, instance);
                    if version <= last.abs() {
                        debug!(?trait_type, %instance, version, "skipping stale trait instance");
                        continue;
                    }
                    if size == DELETED_TRAIT_SIZE {
                        self.avatar.process_deleted_trait_instance(trait_type, instance);
                        // The relay forwards deletes itself
                        self.avatar.take_recently_removed_ids();
                        self.last_received.insert_instance(trait_type, instance, -version);
                    } else {
                        self.avatar.process_trait_instance(trait_type, instance, data);
                        self.last_received.insert_instance(trait_type, instance, version);
                    }
                    outcome.any_traits_changed = true;
                }
            }
        }

        if outcome.any_traits_changed {
            self.change_count += 1;
        }
        outcome
    }

    /// Substitute the sanctioned URL when the received one is not allowed,
    /// returning the override to send back under the client's version
    fn check_skeleton_url(&self, policy: &SkeletonUrlPolicy, version: TraitVersion) -> Option<OutgoingPacket> {
        if policy.allows(&self.avatar.skeleton_model_url()) {
            return None;
        }
        if self.avatar.wire_safe_skeleton_model_url() == wire_safe_url(&policy.replacement_url) {
            return None;
        }
        debug!(
            from = %self.avatar.wire_safe_skeleton_model_url(),
            to = %policy.replacement_url,
            "overriding avatar skeleton URL"
        );
        self.avatar.set_skeleton_model_url(&policy.replacement_url);

        let mut buf = BytesMut::new();
        let payload = self.avatar.pack_trait(TraitType::SkeletonModelUrl);
        pack_versioned_trait(&mut buf, TraitType::SkeletonModelUrl, version, &payload);
        Some(OutgoingPacket::new(PacketType::SetAvatarTraits, buf.freeze()))
    }
}

/// What one listener has been sent about one sender
#[derive(Clone, Debug)]
struct SentTraits {
    sent: TraitTable<TraitVersion>,
    acked: TraitTable<TraitVersion>,
    /// Sender change count at the last forward
    send_point: u64,
}

impl Default for SentTraits {
    fn default() -> Self {
        SentTraits {
            sent: TraitTable::new(DEFAULT_TRAIT_VERSION),
            acked: TraitTable::new(DEFAULT_TRAIT_VERSION),
            send_point: 0,
        }
    }
}

/// Relay state for one listening client
#[derive(Debug, Default)]
pub struct ListenerTraits {
    per_sender: HashMap<AvatarId, SentTraits>,
    pending: BTreeMap<TraitMessageSequence, HashMap<AvatarId, TraitTable<TraitVersion>>>,
    next_sequence: TraitMessageSequence,
}

impl ListenerTraits {
    pub fn new() -> Self {
        ListenerTraits::default()
    }

    /// Last version forwarded for a simple trait of `sender`
    pub fn sent_version(&self, sender: AvatarId, trait_type: TraitType) -> TraitVersion {
        self.per_sender
            .get(&sender)
            .map_or(DEFAULT_TRAIT_VERSION, |s| s.sent.get(trait_type))
    }

    /// Last version acknowledged for a simple trait of `sender`
    pub fn acked_version(&self, sender: AvatarId, trait_type: TraitType) -> TraitVersion {
        self.per_sender
            .get(&sender)
            .map_or(DEFAULT_TRAIT_VERSION, |s| s.acked.get(trait_type))
    }

    pub fn pending_sequences(&self) -> usize {
        self.pending.len()
    }

    /// Append `sender`'s traits that this listener has not seen yet,
    /// terminated by `NULL_TRAIT`. Returns bytes written; nothing is
    /// written when the sender has not changed since the last forward.
    pub fn add_changed_traits(
        &mut self,
        sequence: TraitMessageSequence,
        sender_id: AvatarId,
        sender: &SenderTraits,
        buf: &mut BytesMut,
    ) -> usize {
        let state = self.per_sender.entry(sender_id).or_default();
        if sender.change_count() <= state.send_point {
            return 0;
        }

        let mut pending = TraitTable::new(DEFAULT_TRAIT_VERSION);
        let mut written = sender_id.to_bytes().len();
        buf.put_slice(&sender_id.to_bytes());

        let received = sender.last_received_versions();
        for (trait_type, received_version) in received.simple_iter() {
            if received_version > state.sent.get(trait_type) {
                let payload = sender.store().pack_trait(trait_type);
                written += pack_versioned_trait(buf, trait_type, received_version, &payload);
                state.sent.set(trait_type, received_version);
                pending.set(trait_type, received_version);
            }
        }

        for (trait_type, instances) in received.instanced_iter() {
            for &(instance, received_version) in instances {
                let is_deleted = received_version < 0;
                let absolute_version = received_version.abs();
                let sent = state.sent.instance(trait_type, instance);

                if !is_deleted && sent.map_or(true, |v| received_version > v) {
                    let payload = sender.store().pack_trait_instance(trait_type, instance);
                    written += pack_instanced_trait(buf, trait_type, instance, &payload, received_version);
                    state.sent.insert_instance(trait_type, instance, received_version);
                    pending.insert_instance(trait_type, instance, received_version);
                } else if is_deleted && sent.is_some_and(|v| absolute_version > v) {
                    written += pack_instanced_trait_delete(buf, trait_type, instance, absolute_version);
                    state.sent.insert_instance(trait_type, instance, absolute_version);
                    pending.insert_instance(trait_type, instance, absolute_version);
                }
            }
        }

        buf.put_i8(TraitType::NULL_TRAIT);
        written += 1;
        state.send_point = sender.change_count();

        if !pending.is_empty() {
            self.pending.entry(sequence).or_default().insert(sender_id, pending);
        }
        written
    }

    /// Build one `BulkAvatarTraits` packet covering every changed sender
    pub fn build_bulk_packet<'a>(
        &mut self,
        senders: impl IntoIterator<Item = (AvatarId, &'a SenderTraits)>,
    ) -> Option<OutgoingPacket> {
        let sequence = self.next_sequence;
        let mut buf = BytesMut::new();
        buf.put_i64_le(sequence);

        let mut written = 0;
        for (sender_id, sender) in senders {
            written += self.add_changed_traits(sequence, sender_id, sender, &mut buf);
        }
        if written == 0 {
            return None;
        }

        self.next_sequence += 1;
        trace!(sequence, bytes = written, "bulk traits packet");
        Some(OutgoingPacket::new(PacketType::BulkAvatarTraits, buf.freeze()))
    }

    /// Record the listener's acknowledgement of a bulk packet
    pub fn process_ack(&mut self, sequence: TraitMessageSequence) {
        let Some(per_sender) = self.pending.remove(&sequence) else {
            if sequence >= self.next_sequence {
                warn!(sequence, "bulk traits ack with future sequence (relay restart?)");
            }
            return;
        };

        for (sender_id, versions) in per_sender {
            let Some(state) = self.per_sender.get_mut(&sender_id) else {
                continue;
            };
            for (trait_type, version) in versions.simple_iter() {
                if version != DEFAULT_TRAIT_VERSION {
                    state.acked.set(trait_type, version);
                }
            }
            for (trait_type, instances) in versions.instanced_iter() {
                for &(instance, version) in instances {
                    state.acked.insert_instance(trait_type, instance, version);
                }
            }
        }
    }

    /// Forget everything sent about `sender` so it is resent in full
    pub fn reset_sent_trait_data(&mut self, sender: AvatarId) {
        self.per_sender.remove(&sender);
        for per_sender in self.pending.values_mut() {
            per_sender.remove(&sender);
        }
    }
}
