//! Avatar sync core - Fundamental types and primitives
//!
//! This crate defines the types shared by every layer of the avatar
//! synchronization stack:
//! - Identifiers (AvatarId, InstanceId)
//! - Joint data and faux joint references
//! - Snapshot detail levels
//! - Error taxonomy
//! - The link abstraction used to reach the relay (mixer)

pub mod detail;
pub mod error;
pub mod id;
pub mod joint;
pub mod link;

pub use detail::*;
pub use error::*;
pub use id::*;
pub use joint::*;
pub use link::*;
