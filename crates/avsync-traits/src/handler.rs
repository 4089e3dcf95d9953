//! Client-side trait transmitter
//!
//! [`ClientTraitsHandler`] tracks which traits changed since the last
//! batch and sends them to the relay under one shared version. The
//! status table lives behind a re-entrant lock: applying a relay
//! override calls back into the trait source, which marks the trait
//! dirty on the same thread.

use std::cell::RefCell;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::ReentrantMutex;
use tracing::{debug, trace, warn};

use avsync_core::{AvsyncError, AvsyncResult, InstanceId, MixerLink, OutgoingPacket, PacketType};

use crate::{
    pack_instanced_trait, pack_instanced_trait_delete, pack_trait, TraitReader, TraitStatus,
    TraitStatusTable, TraitType, TraitVersion, DEFAULT_TRAIT_VERSION, NULL_TRAIT_VERSION,
};

/// Owner of trait payloads, as seen by the transmitter
pub trait TraitSource: Send + Sync {
    /// Current payload of a simple trait
    fn pack_trait(&self, trait_type: TraitType) -> Bytes;

    /// Current payload of one instance; empty when the instance is gone
    fn pack_trait_instance(&self, trait_type: TraitType, instance: InstanceId) -> Bytes;

    fn process_trait(&self, trait_type: TraitType, payload: &[u8]);

    fn process_trait_instance(&self, trait_type: TraitType, instance: InstanceId, payload: &[u8]);

    fn process_deleted_trait_instance(&self, trait_type: TraitType, instance: InstanceId);

    /// Re-mark every held instance for sending
    fn prepare_reset_trait_instances(&self);
}

/// Sink for dirty notifications from a trait source
pub trait TraitMarker: Send + Sync {
    fn mark_trait_updated(&self, trait_type: TraitType);
    fn mark_instanced_trait_updated(&self, trait_type: TraitType, instance: InstanceId);
    fn mark_instanced_trait_deleted(&self, trait_type: TraitType, instance: InstanceId);
}

#[derive(Debug)]
struct HandlerState {
    statuses: TraitStatusTable,
    has_changed_traits: bool,
    current_trait_version: TraitVersion,
    current_skeleton_version: TraitVersion,
    should_perform_initial_send: bool,
}

/// Sends changed traits of the local avatar to the relay
pub struct ClientTraitsHandler {
    source: Arc<dyn TraitSource>,
    link: Arc<dyn MixerLink>,
    state: ReentrantMutex<RefCell<HandlerState>>,
}

impl ClientTraitsHandler {
    pub fn new(source: Arc<dyn TraitSource>, link: Arc<dyn MixerLink>) -> Self {
        ClientTraitsHandler {
            source,
            link,
            state: ReentrantMutex::new(RefCell::new(HandlerState {
                statuses: TraitStatusTable::unchanged(),
                has_changed_traits: false,
                current_trait_version: DEFAULT_TRAIT_VERSION,
                current_skeleton_version: NULL_TRAIT_VERSION,
                should_perform_initial_send: false,
            })),
        }
    }

    pub fn current_trait_version(&self) -> TraitVersion {
        self.state.lock().borrow().current_trait_version
    }

    pub fn has_changed_traits(&self) -> bool {
        self.state.lock().borrow().has_changed_traits
    }

    pub fn trait_status(&self, trait_type: TraitType) -> TraitStatus {
        self.state.lock().borrow().statuses.get(trait_type)
    }

    pub fn instance_status(&self, trait_type: TraitType, instance: InstanceId) -> TraitStatus {
        self.state
            .lock()
            .borrow()
            .statuses
            .instance_or_default(trait_type, instance)
    }

    /// Start over with a relay that has no state for this avatar: the
    /// version restarts, every simple trait goes out on the next send and
    /// every held instance is queued again.
    pub fn reset_for_new_mixer(&self) {
        let guard = self.state.lock();
        {
            let mut state = guard.borrow_mut();
            state.current_trait_version = DEFAULT_TRAIT_VERSION;
            state.should_perform_initial_send = true;
            state.statuses.reset();
        }
        self.source.prepare_reset_trait_instances();
    }

    /// Send every dirty trait as one batch. Returns trait bytes written;
    /// `0` when nothing is dirty or no relay is reachable.
    pub fn send_changed_traits_to_mixer(&self) -> usize {
        let guard = self.state.lock();

        let (statuses, initial_send, version) = {
            let mut state = guard.borrow_mut();
            if !state.has_changed_traits && !state.should_perform_initial_send {
                return 0;
            }
            if !self.link.has_active_mixer() {
                return 0;
            }

            state.current_trait_version += 1;
            let statuses = state.statuses.take();
            state.has_changed_traits = false;
            let initial_send = std::mem::take(&mut state.should_perform_initial_send);
            (statuses, initial_send, state.current_trait_version)
        };

        let mut buf = BytesMut::new();
        buf.put_i32_le(version);
        let mut bytes_written = 0;

        for (trait_type, status) in statuses.simple_iter() {
            if !initial_send && status != TraitStatus::Updated {
                continue;
            }
            let payload = self.source.pack_trait(trait_type);
            match pack_trait(&mut buf, trait_type, &payload) {
                0 => self.mark_trait_updated(trait_type),
                written => {
                    bytes_written += written;
                    if trait_type == TraitType::SkeletonModelUrl {
                        guard.borrow_mut().current_skeleton_version = version;
                    }
                }
            }
        }

        for (trait_type, instances) in statuses.instanced_iter() {
            for &(instance, status) in instances {
                match status {
                    TraitStatus::Updated => {
                        let payload = self.source.pack_trait_instance(trait_type, instance);
                        match pack_instanced_trait(&mut buf, trait_type, instance, &payload, DEFAULT_TRAIT_VERSION) {
                            0 => self.mark_instanced_trait_updated(trait_type, instance),
                            written => bytes_written += written,
                        }
                    }
                    // A relay that never saw the instance has nothing to delete
                    TraitStatus::Deleted if !initial_send => {
                        bytes_written +=
                            pack_instanced_trait_delete(&mut buf, trait_type, instance, DEFAULT_TRAIT_VERSION);
                    }
                    _ => {}
                }
            }
        }

        if bytes_written > 0 {
            trace!(version, bytes = bytes_written, "sending changed traits");
            self.link
                .send_to_mixer(OutgoingPacket::new(PacketType::SetAvatarTraits, buf.freeze()));
        }
        bytes_written
    }

    /// Apply a relay override batch of `(i8 type, i32 version, i16 size,
    /// payload)` tuples. Only a skeleton URL override for the version this
    /// client last sent, with no newer local edit, is applied. Returns the
    /// number of overrides applied.
    pub fn process_trait_override(&self, payload: &[u8]) -> usize {
        let guard = self.state.lock();
        let mut reader = TraitReader::new(payload);
        let mut applied = 0;

        while reader.remaining() > 0 {
            let Ok((raw_type, version, data)) = read_override(&mut reader) else {
                warn!("malformed trait override packet");
                return applied;
            };

            let accept = {
                let state = guard.borrow();
                TraitType::from_wire(raw_type) == Some(TraitType::SkeletonModelUrl)
                    && version == state.current_skeleton_version
                    && state.statuses.get(TraitType::SkeletonModelUrl) != TraitStatus::Updated
            };
            if !accept {
                debug!(trait_type = raw_type, version, "ignoring trait override");
                continue;
            }

            // Applying the override marks the URL dirty; undo that so the
            // relay's own value is not echoed back
            let has_changes_before = guard.borrow().has_changed_traits;
            self.source.process_trait(TraitType::SkeletonModelUrl, data);
            let mut state = guard.borrow_mut();
            state.statuses.erase(TraitType::SkeletonModelUrl);
            state.has_changed_traits = has_changes_before;
            applied += 1;
        }
        applied
    }
}

fn read_override<'a>(reader: &mut TraitReader<'a>) -> AvsyncResult<(i8, TraitVersion, &'a [u8])> {
    let raw_type = reader.read_i8()?;
    let version = reader.read_i32()?;
    let size = reader.read_i16()?;
    if size < 0 {
        return Err(AvsyncError::MalformedTraitPacket("negative override size"));
    }
    let data = reader.read_bytes(size as usize)?;
    Ok((raw_type, version, data))
}

impl TraitMarker for ClientTraitsHandler {
    fn mark_trait_updated(&self, trait_type: TraitType) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.statuses.set(trait_type, TraitStatus::Updated);
        state.has_changed_traits = true;
    }

    fn mark_instanced_trait_updated(&self, trait_type: TraitType, instance: InstanceId) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state
            .statuses
            .insert_instance(trait_type, instance, TraitStatus::Updated);
        state.has_changed_traits = true;
    }

    fn mark_instanced_trait_deleted(&self, trait_type: TraitType, instance: InstanceId) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state
            .statuses
            .insert_instance(trait_type, instance, TraitStatus::Deleted);
        state.has_changed_traits = true;
    }
}
