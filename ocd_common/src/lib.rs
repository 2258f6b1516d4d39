//! OCD Common Library
//!
//! Shared building blocks of the host-side debug interconnect runtime:
//! packets, addressing, the base register map and the host-controller
//! message codec. Nothing in this crate spawns threads.
//!
//! # Module Structure
//!
//! - [`packet`] - Debug interconnect packets and type-qualifiers
//! - [`addr`] - diaddr subnet/local split
//! - [`reg`] - Base register map, register access widths and flags
//! - [`module`] - Module descriptors and standard module types
//! - [`wire`] - Tagged multi-part frames exchanged with the host controller
//! - [`error`] - Error taxonomy shared by all components
//! - [`config`] - Configuration loading traits and types
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use ocd_common::prelude::*;
//!
//! let pkt = Packet::new(0x0401, 7, PacketType::Event, EVENT_LAST, &[0x1234]);
//! assert_eq!(pkt.payload(), &[0x1234]);
//! ```

pub mod addr;
pub mod config;
pub mod error;
pub mod module;
pub mod packet;
pub mod prelude;
pub mod reg;
pub mod wire;
