//! Per-avatar trait values
//!
//! Holds the skeleton model URL, skeleton data, avatar-entity payloads
//! and grab payloads of one avatar. Entity and grab maps each have
//! their own lock and are never held together, nor while notifying the
//! attached [`TraitMarker`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};
use url::Url;

use avsync_core::{AvsyncError, AvsyncResult, InstanceId};

use crate::{pack_skeleton_data, unpack_skeleton_data, SkeletonJoint, TraitMarker, TraitSource, TraitType};

pub const MAX_NUM_AVATAR_ENTITIES: usize = 42;
pub const MAX_NUM_AVATAR_GRABS: usize = 6;

/// URL as it may be sent to other nodes: local files are meaningless
/// elsewhere and go out empty.
pub fn wire_safe_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "file" | "qrc") => String::new(),
        _ => url.to_owned(),
    }
}

pub struct AvatarTraitStore {
    default_model_url: String,
    skeleton_model_url: RwLock<String>,
    skeleton_data: RwLock<Vec<SkeletonJoint>>,
    entities: RwLock<HashMap<InstanceId, Bytes>>,
    grabs: RwLock<HashMap<InstanceId, Bytes>>,
    recently_removed: Mutex<HashSet<InstanceId>>,
    marker: RwLock<Option<Weak<dyn TraitMarker>>>,
}

impl AvatarTraitStore {
    pub fn new(default_model_url: impl Into<String>) -> Self {
        let default_model_url = default_model_url.into();
        AvatarTraitStore {
            skeleton_model_url: RwLock::new(default_model_url.clone()),
            default_model_url,
            skeleton_data: RwLock::new(Vec::new()),
            entities: RwLock::new(HashMap::new()),
            grabs: RwLock::new(HashMap::new()),
            recently_removed: Mutex::new(HashSet::new()),
            marker: RwLock::new(None),
        }
    }

    /// Report local edits to `marker` (the local avatar's transmitter)
    pub fn attach_marker(&self, marker: Weak<dyn TraitMarker>) {
        *self.marker.write() = Some(marker);
    }

    fn marker(&self) -> Option<Arc<dyn TraitMarker>> {
        self.marker.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn default_model_url(&self) -> &str {
        &self.default_model_url
    }

    pub fn skeleton_model_url(&self) -> String {
        self.skeleton_model_url.read().clone()
    }

    pub fn wire_safe_skeleton_model_url(&self) -> String {
        wire_safe_url(&self.skeleton_model_url.read())
    }

    /// Set the model URL; an empty URL selects the default model.
    /// Returns whether the URL changed.
    pub fn set_skeleton_model_url(&self, url: &str) -> bool {
        let url = if url.is_empty() { self.default_model_url.as_str() } else { url };
        {
            let mut current = self.skeleton_model_url.write();
            if *current == url {
                return false;
            }
            *current = url.to_owned();
        }
        if let Some(marker) = self.marker() {
            marker.mark_trait_updated(TraitType::SkeletonModelUrl);
        }
        true
    }

    pub fn skeleton_data(&self) -> Vec<SkeletonJoint> {
        self.skeleton_data.read().clone()
    }

    pub fn set_skeleton_data(&self, joints: Vec<SkeletonJoint>) {
        *self.skeleton_data.write() = joints;
        if let Some(marker) = self.marker() {
            marker.mark_trait_updated(TraitType::SkeletonData);
        }
    }

    pub fn avatar_entity_payload(&self, id: InstanceId) -> Option<Bytes> {
        self.entities.read().get(&id).cloned()
    }

    pub fn avatar_entity_ids(&self) -> Vec<InstanceId> {
        self.entities.read().keys().copied().collect()
    }

    /// Store an avatar-entity payload; new entities past the cap are refused
    pub fn store_avatar_entity_payload(&self, id: InstanceId, payload: Bytes) -> AvsyncResult<()> {
        {
            let mut entities = self.entities.write();
            if entities.len() >= MAX_NUM_AVATAR_ENTITIES && !entities.contains_key(&id) {
                warn!(entity = %id, limit = MAX_NUM_AVATAR_ENTITIES, "avatar entity limit reached");
                return Err(AvsyncError::InstanceLimitReached {
                    instance: id,
                    limit: MAX_NUM_AVATAR_ENTITIES,
                });
            }
            entities.insert(id, payload);
        }
        if let Some(marker) = self.marker() {
            marker.mark_instanced_trait_updated(TraitType::AvatarEntity, id);
        }
        Ok(())
    }

    /// Remove an avatar entity, remembering its id for
    /// [`take_recently_removed_ids`](Self::take_recently_removed_ids)
    pub fn clear_avatar_entity(&self, id: InstanceId) -> bool {
        if self.entities.write().remove(&id).is_none() {
            return false;
        }
        self.recently_removed.lock().insert(id);
        if let Some(marker) = self.marker() {
            marker.mark_instanced_trait_deleted(TraitType::AvatarEntity, id);
        }
        true
    }

    /// Entity ids removed since the last call
    pub fn take_recently_removed_ids(&self) -> HashSet<InstanceId> {
        std::mem::take(&mut *self.recently_removed.lock())
    }

    pub fn avatar_grab_data(&self, id: InstanceId) -> Option<Bytes> {
        self.grabs.read().get(&id).cloned()
    }

    pub fn grab_ids(&self) -> Vec<InstanceId> {
        self.grabs.read().keys().copied().collect()
    }

    /// Store grab data. Returns whether anything changed; new grabs past
    /// the cap are refused.
    pub fn update_avatar_grab_data(&self, id: InstanceId, data: Bytes) -> AvsyncResult<bool> {
        {
            let mut grabs = self.grabs.write();
            match grabs.get(&id) {
                Some(existing) if *existing == data => return Ok(false),
                Some(_) => {}
                None if grabs.len() >= MAX_NUM_AVATAR_GRABS => {
                    warn!(grab = %id, "can't create more grabs on avatar, limit reached");
                    return Err(AvsyncError::InstanceLimitReached {
                        instance: id,
                        limit: MAX_NUM_AVATAR_GRABS,
                    });
                }
                None => {}
            }
            grabs.insert(id, data);
        }
        if let Some(marker) = self.marker() {
            marker.mark_instanced_trait_updated(TraitType::Grab, id);
        }
        Ok(true)
    }

    pub fn clear_avatar_grab_data(&self, id: InstanceId) -> bool {
        if self.grabs.write().remove(&id).is_none() {
            return false;
        }
        if let Some(marker) = self.marker() {
            marker.mark_instanced_trait_deleted(TraitType::Grab, id);
        }
        true
    }
}

impl TraitSource for AvatarTraitStore {
    fn pack_trait(&self, trait_type: TraitType) -> Bytes {
        match trait_type {
            TraitType::SkeletonModelUrl => Bytes::from(self.wire_safe_skeleton_model_url()),
            TraitType::SkeletonData => match pack_skeleton_data(&self.skeleton_data.read()) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(%err, "unable to pack skeleton data");
                    Bytes::new()
                }
            },
            TraitType::AvatarEntity | TraitType::Grab => Bytes::new(),
        }
    }

    fn pack_trait_instance(&self, trait_type: TraitType, instance: InstanceId) -> Bytes {
        let payload = match trait_type {
            TraitType::AvatarEntity => self.avatar_entity_payload(instance),
            TraitType::Grab => self.avatar_grab_data(instance),
            _ => None,
        };
        payload.unwrap_or_default()
    }

    fn process_trait(&self, trait_type: TraitType, payload: &[u8]) {
        match trait_type {
            TraitType::SkeletonModelUrl => match std::str::from_utf8(payload) {
                Ok(url) => {
                    self.set_skeleton_model_url(url);
                }
                Err(_) => warn!("skeleton model URL is not UTF-8"),
            },
            TraitType::SkeletonData => match unpack_skeleton_data(payload) {
                Ok(joints) => self.set_skeleton_data(joints),
                Err(err) => warn!(%err, "rejected skeleton data"),
            },
            TraitType::AvatarEntity | TraitType::Grab => {
                debug!(?trait_type, "instanced trait sent without an instance")
            }
        }
    }

    fn process_trait_instance(&self, trait_type: TraitType, instance: InstanceId, payload: &[u8]) {
        let payload = Bytes::copy_from_slice(payload);
        // Refusals are logged by the store
        let _ = match trait_type {
            TraitType::AvatarEntity => self.store_avatar_entity_payload(instance, payload),
            TraitType::Grab => self.update_avatar_grab_data(instance, payload).map(|_| ()),
            _ => Ok(()),
        };
    }

    fn process_deleted_trait_instance(&self, trait_type: TraitType, instance: InstanceId) {
        match trait_type {
            TraitType::AvatarEntity => {
                self.clear_avatar_entity(instance);
            }
            TraitType::Grab => {
                self.clear_avatar_grab_data(instance);
            }
            _ => {}
        }
    }

    fn prepare_reset_trait_instances(&self) {
        let Some(marker) = self.marker() else {
            return;
        };
        for id in self.avatar_entity_ids() {
            marker.mark_instanced_trait_updated(TraitType::AvatarEntity, id);
        }
        for id in self.grab_ids() {
            marker.mark_instanced_trait_updated(TraitType::Grab, id);
        }
    }
}
