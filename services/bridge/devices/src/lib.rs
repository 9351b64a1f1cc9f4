//! Device queries for the bridge.
//!
//! [`DeviceOperations`] issues mesh-wide status queries (primary connection
//! only) and single-device queries over a
//! [`ReliableChannel`](bridge_session::ReliableChannel), parses the 24-byte
//! device structs carried by status broadcasts, and keeps the most recent
//! record per device in a bounded LRU [`DeviceCache`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod error;
pub mod info;
pub mod operations;

pub use cache::{DeviceCache, DEFAULT_CACHE_CAPACITY};
pub use error::DeviceError;
pub use info::{
    parse_device_struct, parse_status_packet, struct_region, Capabilities, DeviceClass,
    DeviceInfo, DEVICE_ID_LEN, DEVICE_STRUCT_LEN,
};
pub use operations::{DeviceOperations, DeviceOpsConfig, MeshResponse};
