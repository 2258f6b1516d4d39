//! Prelude module for common re-exports.
//!
//! ```rust
//! use ocd_common::prelude::*;
//! ```

// ─── Errors ─────────────────────────────────────────────────────────
pub use crate::error::{DiError, DiResult};

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    ConfigError, ConfigLoader, GatewayConfig, HostModConfig, LogLevel, SharedConfig, Timeouts,
};

// ─── Packets ────────────────────────────────────────────────────────
pub use crate::packet::{EVENT_CONT, EVENT_LAST, Packet, PacketType};

// ─── Registers & Modules ────────────────────────────────────────────
pub use crate::module::{ModuleDescriptor, StdModuleType};
pub use crate::reg::{RegFlags, RegWidth};

// ─── Host Controller Protocol ───────────────────────────────────────
pub use crate::wire::Message;
