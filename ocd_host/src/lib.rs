//! OCD Host Runtime
//!
//! Host-side participants of the debug interconnect. Every component runs
//! its network I/O on a dedicated [`worker::Worker`] thread and is driven
//! from the owner's thread through a message-based control channel.
//!
//! # Module Structure
//!
//! - [`worker`] - Background I/O thread with a control channel
//! - [`connection`] - Framed TCP connection to the host controller
//! - [`hostmod`] - Host module: register access and event channel
//! - [`gateway`] - Bridge between a device subnet and the host controller
//! - [`transport`] - Blocking device transports used by the gateway
//!
//! # Usage
//!
//! ```rust,no_run
//! use ocd_common::prelude::*;
//! use ocd_host::hostmod::HostMod;
//!
//! fn main() -> DiResult<()> {
//!     let hostmod = HostMod::new(HostModConfig::new("tcp://127.0.0.1:9537"))?;
//!     hostmod.connect()?;
//!     let desc = hostmod.describe_module(1)?;
//!     println!("{desc}");
//!     hostmod.disconnect()
//! }
//! ```

pub mod connection;
pub mod gateway;
pub mod hostmod;
pub mod transport;
pub mod worker;

pub use gateway::Gateway;
pub use hostmod::HostMod;
pub use worker::Worker;
