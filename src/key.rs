//! Segment key codec.
//!
//! Every shared memory segment the server owns is keyed by a 32-bit value
//! laid out as `[class:8][instance:4][namespace-id:8][role:12]`. All key
//! classification in the crate goes through [`SegmentKey::decode`] and
//! [`SegmentKey::encode`]; no other module cracks key bits itself.

use thiserror::Error;

const CLASS_SHIFT: u32 = 24;
const INSTANCE_SHIFT: u32 = 20;
const NAMESPACE_SHIFT: u32 = 12;
const INSTANCE_MASK: u32 = 0xF;
const NAMESPACE_MASK: u32 = 0xFF;
const ROLE_MASK: u32 = 0xFFF;

const ROLE_BASE: u16 = 0;
const ROLE_TREE_INDEX: u16 = 1;

pub const MIN_NAMESPACE_ID: u8 = 1;
pub const MAX_NAMESPACE_ID: u8 = 32;
pub const MAX_INSTANCE: u8 = 15;

/// First stage ordinal for primary and secondary index arenas.
pub const STAGE_FLOOR: u16 = 0x100;
/// Last stage ordinal in any class.
pub const STAGE_CEILING: u16 = 0x8FF;

/// Class byte of a segment key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyClass {
    /// Primary index: base, tree-index, and arena stages.
    Primary,
    /// Secondary index: meta and arena stages.
    Secondary,
    /// Data stages, unordered and optional.
    Data,
}

impl KeyClass {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0xAE => Some(KeyClass::Primary),
            0xA2 => Some(KeyClass::Secondary),
            0xAD => Some(KeyClass::Data),
            _ => None,
        }
    }

    pub fn byte(&self) -> u8 {
        match self {
            KeyClass::Primary => 0xAE,
            KeyClass::Secondary => 0xA2,
            KeyClass::Data => 0xAD,
        }
    }
}

/// Role of a segment within its class, decoded from the low 12 key bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentRole {
    /// Primary role 0: carries the namespace name and structural metadata.
    Base,
    /// Primary role 1: opaque to this tool.
    TreeIndex,
    /// Secondary role 0: analogous to base for secondary indexes.
    Meta,
    /// Arena stage; the ordinal is the raw role value.
    Stage(u16),
}

impl SegmentRole {
    pub fn is_stage(&self) -> bool {
        matches!(self, SegmentRole::Stage(_))
    }

    pub fn stage_ordinal(&self) -> Option<u16> {
        match self {
            SegmentRole::Stage(ordinal) => Some(*ordinal),
            _ => None,
        }
    }

    fn bits(&self) -> u16 {
        match self {
            SegmentRole::Base | SegmentRole::Meta => ROLE_BASE,
            SegmentRole::TreeIndex => ROLE_TREE_INDEX,
            SegmentRole::Stage(ordinal) => *ordinal,
        }
    }
}

/// Fully decoded segment key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentKey {
    pub class: KeyClass,
    pub instance: u8,
    pub namespace_id: u8,
    pub role: SegmentRole,
}

impl SegmentKey {
    /// Decodes a raw 32-bit key, rejecting anything outside the key scheme.
    pub fn decode(raw: u32) -> Result<Self, KeyError> {
        let class = KeyClass::from_byte((raw >> CLASS_SHIFT) as u8)
            .ok_or(KeyError::UnknownClass(raw))?;
        let instance = ((raw >> INSTANCE_SHIFT) & INSTANCE_MASK) as u8;
        let namespace_id = ((raw >> NAMESPACE_SHIFT) & NAMESPACE_MASK) as u8;
        if !(MIN_NAMESPACE_ID..=MAX_NAMESPACE_ID).contains(&namespace_id) {
            return Err(KeyError::NamespaceIdOutOfRange { raw, namespace_id });
        }
        let role_bits = (raw & ROLE_MASK) as u16;
        let role = match class {
            KeyClass::Primary => match role_bits {
                ROLE_BASE => SegmentRole::Base,
                ROLE_TREE_INDEX => SegmentRole::TreeIndex,
                STAGE_FLOOR..=STAGE_CEILING => SegmentRole::Stage(role_bits),
                _ => {
                    return Err(KeyError::InvalidRole {
                        raw,
                        role: role_bits,
                        class,
                    })
                }
            },
            KeyClass::Secondary => match role_bits {
                ROLE_BASE => SegmentRole::Meta,
                STAGE_FLOOR..=STAGE_CEILING => SegmentRole::Stage(role_bits),
                _ => {
                    return Err(KeyError::InvalidRole {
                        raw,
                        role: role_bits,
                        class,
                    })
                }
            },
            KeyClass::Data => match role_bits {
                // Data stages start at ordinal 0; no tree-index or meta role.
                0..=STAGE_CEILING => SegmentRole::Stage(role_bits),
                _ => {
                    return Err(KeyError::InvalidRole {
                        raw,
                        role: role_bits,
                        class,
                    })
                }
            },
        };
        Ok(SegmentKey {
            class,
            instance,
            namespace_id,
            role,
        })
    }

    /// Produces the canonical 32-bit pattern for this key.
    pub fn encode(&self) -> u32 {
        (self.class.byte() as u32) << CLASS_SHIFT
            | ((self.instance as u32) & INSTANCE_MASK) << INSTANCE_SHIFT
            | ((self.namespace_id as u32) & NAMESPACE_MASK) << NAMESPACE_SHIFT
            | (self.role.bits() as u32) & ROLE_MASK
    }

    pub fn is_base(&self) -> bool {
        self.class == KeyClass::Primary && self.role == SegmentRole::Base
    }

    pub fn is_tree_index(&self) -> bool {
        self.class == KeyClass::Primary && self.role == SegmentRole::TreeIndex
    }

    pub fn is_meta(&self) -> bool {
        self.class == KeyClass::Secondary && self.role == SegmentRole::Meta
    }

    pub fn is_data_stage(&self) -> bool {
        self.class == KeyClass::Data
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key {0:#010x} does not carry a recognized class byte")]
    UnknownClass(u32),
    #[error("key {raw:#010x} namespace id {namespace_id} outside 1..=32")]
    NamespaceIdOutOfRange { raw: u32, namespace_id: u8 },
    #[error("key {raw:#010x} role {role:#05x} invalid for class {class:?}")]
    InvalidRole { raw: u32, role: u16, class: KeyClass },
}
