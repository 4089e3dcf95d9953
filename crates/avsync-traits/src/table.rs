//! Sparse per-trait value table
//!
//! Holds one value per simple trait type and a list of `(instance, value)`
//! pairs per instanced trait type. Used for dirty statuses on the client
//! and for received/sent versions on both sides of the relay.

use avsync_core::InstanceId;

use crate::TraitType;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraitTable<T: Copy> {
    default: T,
    simple: [T; TraitType::SIMPLE.len()],
    instanced: Vec<(TraitType, Vec<(InstanceId, T)>)>,
}

impl<T: Copy + PartialEq> TraitTable<T> {
    pub fn new(default: T) -> Self {
        TraitTable {
            default,
            simple: [default; TraitType::SIMPLE.len()],
            instanced: Vec::new(),
        }
    }

    #[inline]
    pub fn default_value(&self) -> T {
        self.default
    }

    fn simple_index(trait_type: TraitType) -> Option<usize> {
        TraitType::SIMPLE.iter().position(|t| *t == trait_type)
    }

    /// Value of a simple trait; instanced types read as the default
    pub fn get(&self, trait_type: TraitType) -> T {
        Self::simple_index(trait_type).map_or(self.default, |i| self.simple[i])
    }

    pub fn set(&mut self, trait_type: TraitType, value: T) {
        if let Some(i) = Self::simple_index(trait_type) {
            self.simple[i] = value;
        }
    }

    /// Reset a simple trait to the default value
    pub fn erase(&mut self, trait_type: TraitType) {
        self.set(trait_type, self.default);
    }

    /// Every simple trait type with its value, in wire order
    pub fn simple_iter(&self) -> impl Iterator<Item = (TraitType, T)> + '_ {
        TraitType::SIMPLE.iter().copied().zip(self.simple.iter().copied())
    }

    pub fn instances(&self, trait_type: TraitType) -> &[(InstanceId, T)] {
        self.instanced
            .iter()
            .find(|(t, _)| *t == trait_type)
            .map_or(&[], |(_, instances)| instances.as_slice())
    }

    fn instances_mut(&mut self, trait_type: TraitType) -> &mut Vec<(InstanceId, T)> {
        let index = match self.instanced.iter().position(|(t, _)| *t == trait_type) {
            Some(index) => index,
            None => {
                self.instanced.push((trait_type, Vec::new()));
                self.instanced.len() - 1
            }
        };
        &mut self.instanced[index].1
    }

    pub fn instance(&self, trait_type: TraitType, instance: InstanceId) -> Option<T> {
        self.instances(trait_type)
            .iter()
            .find(|(id, _)| *id == instance)
            .map(|(_, value)| *value)
    }

    /// Value of an instance, or the default when never set
    pub fn instance_or_default(&self, trait_type: TraitType, instance: InstanceId) -> T {
        self.instance(trait_type, instance).unwrap_or(self.default)
    }

    /// Insert or overwrite an instance value
    pub fn insert_instance(&mut self, trait_type: TraitType, instance: InstanceId, value: T) {
        let instances = self.instances_mut(trait_type);
        match instances.iter_mut().find(|(id, _)| *id == instance) {
            Some((_, slot)) => *slot = value,
            None => instances.push((instance, value)),
        }
    }

    pub fn remove_instance(&mut self, trait_type: TraitType, instance: InstanceId) -> Option<T> {
        let instances = self.instances_mut(trait_type);
        let index = instances.iter().position(|(id, _)| *id == instance)?;
        Some(instances.remove(index).1)
    }

    /// Every instanced trait type that has entries, in insertion order
    pub fn instanced_iter(&self) -> impl Iterator<Item = (TraitType, &[(InstanceId, T)])> + '_ {
        self.instanced
            .iter()
            .map(|(t, instances)| (*t, instances.as_slice()))
    }

    /// Every simple value back to the default, every instance dropped
    pub fn reset(&mut self) {
        self.simple = [self.default; TraitType::SIMPLE.len()];
        self.instanced.clear();
    }

    /// No simple value differs from the default and no instance is held
    pub fn is_empty(&self) -> bool {
        self.simple.iter().all(|v| *v == self.default)
            && self.instanced.iter().all(|(_, instances)| instances.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_values() {
        let mut table = TraitTable::new(0i32);
        assert!(table.is_empty());
        table.set(TraitType::SkeletonData, 7);
        assert_eq!(table.get(TraitType::SkeletonData), 7);
        assert_eq!(table.get(TraitType::SkeletonModelUrl), 0);
        assert!(!table.is_empty());

        // Instanced types are not simple slots
        table.set(TraitType::Grab, 3);
        assert_eq!(table.get(TraitType::Grab), 0);

        table.erase(TraitType::SkeletonData);
        assert!(table.is_empty());
    }

    #[test]
    fn test_instances_overwrite() {
        let mut table = TraitTable::new(-1i32);
        let a = InstanceId::random();
        let b = InstanceId::random();
        table.insert_instance(TraitType::AvatarEntity, a, 1);
        table.insert_instance(TraitType::AvatarEntity, b, 2);
        table.insert_instance(TraitType::AvatarEntity, a, 5);

        assert_eq!(table.instances(TraitType::AvatarEntity), &[(a, 5), (b, 2)]);
        assert_eq!(table.instance_or_default(TraitType::Grab, a), -1);
        assert_eq!(table.remove_instance(TraitType::AvatarEntity, b), Some(2));
        assert_eq!(table.instance(TraitType::AvatarEntity, b), None);

        table.reset();
        assert!(table.is_empty());
        assert_eq!(table.instanced_iter().count(), 0);
    }

    #[test]
    fn test_simple_iter_order() {
        let table = TraitTable::new(false);
        let types: Vec<_> = table.simple_iter().map(|(t, _)| t).collect();
        assert_eq!(types, vec![TraitType::SkeletonModelUrl, TraitType::SkeletonData]);
    }
}
