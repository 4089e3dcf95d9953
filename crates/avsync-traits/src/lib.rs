//! Avatar sync traits - Versioned side channel
//!
//! Traits carry avatar data that is too large or too rarely changed to
//! ride in every snapshot:
//! - Trait model and the per-type value table
//! - Dirty tracking and the client-side transmitter
//! - Trait packing and bulk trait parsing
//! - The avatar trait store (skeleton URL, skeleton data, entities, grabs)
//! - Relay-side ingest and per-listener forwarding

pub mod handler;
pub mod model;
pub mod packing;
pub mod relay;
pub mod skeleton;
pub mod status;
pub mod store;
pub mod table;

pub use handler::*;
pub use model::*;
pub use packing::*;
pub use relay::*;
pub use skeleton::*;
pub use status::*;
pub use store::*;
pub use table::*;
