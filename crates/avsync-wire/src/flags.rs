//! Section presence flags and the additional-flags word

/// Section presence bits (2 bytes, little-endian on the wire)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct HasFlags(pub u16);

impl HasFlags {
    pub const NONE: HasFlags = HasFlags(0);

    // Section bits, in wire order
    pub const GLOBAL_POSITION: u16 = 1 << 0;
    pub const BOUNDING_BOX: u16 = 1 << 1;
    pub const ORIENTATION: u16 = 1 << 2;
    pub const SCALE: u16 = 1 << 3;
    pub const LOOK_AT_POSITION: u16 = 1 << 4;
    pub const AUDIO_LOUDNESS: u16 = 1 << 5;
    pub const SENSOR_TO_WORLD_MATRIX: u16 = 1 << 6;
    pub const ADDITIONAL_FLAGS: u16 = 1 << 7;
    pub const PARENT_INFO: u16 = 1 << 8;
    pub const LOCAL_POSITION: u16 = 1 << 9;
    pub const HAND_CONTROLLERS: u16 = 1 << 10;
    pub const FACE_TRACKER_INFO: u16 = 1 << 11;
    pub const JOINT_DATA: u16 = 1 << 12;
    pub const JOINT_DEFAULT_POSE_FLAGS: u16 = 1 << 13;
    pub const GRAB_JOINTS: u16 = 1 << 14;

    /// Every defined section
    pub const ALL: HasFlags = HasFlags((1 << 15) - 1);

    #[inline]
    pub fn new(bits: u16) -> Self {
        HasFlags(bits)
    }

    #[inline]
    pub fn bits(self) -> u16 {
        self.0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn has(self, bit: u16) -> bool {
        self.0 & bit == bit
    }

    #[inline]
    pub fn set(&mut self, bit: u16, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    #[inline]
    pub fn with(mut self, bit: u16) -> Self {
        self.0 |= bit;
        self
    }

    #[inline]
    pub fn without(mut self, bits: HasFlags) -> Self {
        self.0 &= !bits.0;
        self
    }

    #[inline]
    pub fn union(self, other: HasFlags) -> Self {
        HasFlags(self.0 | other.0)
    }

    #[inline]
    pub fn is_subset_of(self, other: HasFlags) -> bool {
        self.0 & !other.0 == 0
    }
}

impl From<u16> for HasFlags {
    fn from(bits: u16) -> Self {
        HasFlags(bits)
    }
}

impl From<HasFlags> for u16 {
    fn from(flags: HasFlags) -> Self {
        flags.0
    }
}

/// Keyboard edit state carried in the additional flags
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyState {
    #[default]
    NoKeyDown = 0,
    InsertKeyDown = 1,
    DeleteKeyDown = 2,
}

impl KeyState {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            1 => KeyState::InsertKeyDown,
            2 => KeyState::DeleteKeyDown,
            _ => KeyState::NoKeyDown,
        }
    }
}

/// Hand pointing state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct HandState(pub u8);

impl HandState {
    pub const NULL: u8 = 0;
    pub const LEFT_HAND_POINTING: u8 = 1;
    pub const RIGHT_HAND_POINTING: u8 = 2;
    pub const IS_FINGER_POINTING: u8 = 4;

    #[inline]
    pub fn is_finger_pointing(self) -> bool {
        self.0 & Self::IS_FINGER_POINTING != 0
    }

    #[inline]
    pub fn pointing_hand(self) -> u8 {
        self.0 & !Self::IS_FINGER_POINTING
    }
}

/// Additional-flags word (2 bytes, little-endian on the wire)
///
/// - Bits 0-1: key state
/// - Bits 2-3: hand state (without the finger pointing flag)
/// - Bit 4: scripted blendshapes
/// - Bit 5: procedural eye movement
/// - Bit 6: has referential (parented)
/// - Bit 7: finger pointing
/// - Bit 8: audio enabled face movement
/// - Bit 9: procedural eye face movement
/// - Bit 10: procedural blink face movement
/// - Bit 11: collide with other avatars
/// - Bit 12: hero priority
///
/// Bits 13-15 are undefined and always read as zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AdditionalFlags(pub u16);

impl AdditionalFlags {
    pub const KEY_STATE_START_BIT: u16 = 0;
    pub const HAND_STATE_START_BIT: u16 = 2;
    pub const HAS_SCRIPTED_BLENDSHAPES: u16 = 1 << 4;
    pub const HAS_PROCEDURAL_EYE_MOVEMENT: u16 = 1 << 5;
    pub const HAS_REFERENTIAL: u16 = 1 << 6;
    pub const HAND_STATE_FINGER_POINTING: u16 = 1 << 7;
    pub const AUDIO_ENABLED_FACE_MOVEMENT: u16 = 1 << 8;
    pub const PROCEDURAL_EYE_FACE_MOVEMENT: u16 = 1 << 9;
    pub const PROCEDURAL_BLINK_FACE_MOVEMENT: u16 = 1 << 10;
    pub const COLLIDE_WITH_OTHER_AVATARS: u16 = 1 << 11;
    pub const HAS_HERO_PRIORITY: u16 = 1 << 12;

    /// Bits with a defined meaning
    pub const KNOWN_BITS: u16 = (1 << 13) - 1;

    /// Parse a wire word, dropping undefined bits
    #[inline]
    pub fn from_wire(bits: u16) -> Self {
        AdditionalFlags(bits & Self::KNOWN_BITS)
    }

    #[inline]
    pub fn has(self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    #[inline]
    pub fn set(&mut self, bit: u16, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    #[inline]
    fn semi_nibble_at(self, start: u16) -> u8 {
        ((self.0 >> start) & 0b11) as u8
    }

    #[inline]
    fn set_semi_nibble_at(&mut self, start: u16, value: u8) {
        self.0 = (self.0 & !(0b11 << start)) | (((value & 0b11) as u16) << start);
    }

    pub fn key_state(self) -> KeyState {
        KeyState::from_bits(self.semi_nibble_at(Self::KEY_STATE_START_BIT))
    }

    pub fn set_key_state(&mut self, state: KeyState) {
        self.set_semi_nibble_at(Self::KEY_STATE_START_BIT, state as u8);
    }

    pub fn hand_state(self) -> HandState {
        let mut state = self.semi_nibble_at(Self::HAND_STATE_START_BIT);
        if self.has(Self::HAND_STATE_FINGER_POINTING) {
            state |= HandState::IS_FINGER_POINTING;
        }
        HandState(state)
    }

    pub fn set_hand_state(&mut self, state: HandState) {
        self.set_semi_nibble_at(Self::HAND_STATE_START_BIT, state.pointing_hand());
        self.set(Self::HAND_STATE_FINGER_POINTING, state.is_finger_pointing());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_flags_bits() {
        assert_eq!(HasFlags::ALL.0, 0x7fff);
        let flags = HasFlags::NONE.with(HasFlags::GLOBAL_POSITION).with(HasFlags::JOINT_DATA);
        assert!(flags.has(HasFlags::JOINT_DATA));
        assert!(!flags.has(HasFlags::GRAB_JOINTS));
        assert!(flags.is_subset_of(HasFlags::ALL));
        assert!(!HasFlags::ALL.is_subset_of(flags));
        assert_eq!(flags.without(HasFlags(HasFlags::JOINT_DATA)).0, HasFlags::GLOBAL_POSITION);
    }

    #[test]
    fn test_hand_state_packing() {
        let mut flags = AdditionalFlags::default();
        flags.set_hand_state(HandState(HandState::RIGHT_HAND_POINTING | HandState::IS_FINGER_POINTING));
        assert_eq!(flags.0, (2 << 2) | (1 << 7));
        let state = flags.hand_state();
        assert!(state.is_finger_pointing());
        assert_eq!(state.pointing_hand(), HandState::RIGHT_HAND_POINTING);
    }

    #[test]
    fn test_key_state_packing() {
        let mut flags = AdditionalFlags::default();
        flags.set(AdditionalFlags::HAS_HERO_PRIORITY, true);
        flags.set_key_state(KeyState::DeleteKeyDown);
        assert_eq!(flags.key_state(), KeyState::DeleteKeyDown);
        flags.set_key_state(KeyState::NoKeyDown);
        assert_eq!(flags.key_state(), KeyState::NoKeyDown);
        assert!(flags.has(AdditionalFlags::HAS_HERO_PRIORITY));
    }

    #[test]
    fn test_unknown_bits_dropped() {
        let flags = AdditionalFlags::from_wire(0xffff);
        assert_eq!(flags.0, 0x1fff);
    }
}
