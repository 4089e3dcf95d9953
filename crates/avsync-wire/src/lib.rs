//! Avatar sync wire - Snapshot codec
//!
//! This crate implements the per-frame avatar snapshot:
//! - Bit vectors and lossy quantizers (six-byte quats, fixed point, ratios, gains)
//! - Section flags and the additional-flags word
//! - The encoder with its partial-send continuation cursor
//! - The bounds-checked decoder
//! - Per-section data rates and the identity packet

pub mod avatar;
pub mod bitvec;
pub mod decode;
pub mod encode;
pub mod fields;
pub mod flags;
pub mod identity;
pub mod layout;
pub mod quantize;
pub mod rates;
pub mod status;

pub use avatar::*;
pub use bitvec::*;
pub use decode::*;
pub use encode::*;
pub use fields::*;
pub use flags::*;
pub use identity::*;
pub use layout::*;
pub use quantize::*;
pub use rates::*;
pub use status::*;
