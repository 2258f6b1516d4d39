//! Debug interconnect addressing.
//!
//! A diaddr is 16 bits wide: the upper [`DIADDR_SUBNET_BITS`] bits select
//! the subnet, the lower [`DIADDR_LOCAL_BITS`] bits the module inside it.

use static_assertions::const_assert_eq;

/// Number of bits of the subnet part of a diaddr.
pub const DIADDR_SUBNET_BITS: u32 = 6;

/// Number of bits of the local part of a diaddr.
pub const DIADDR_LOCAL_BITS: u32 = 10;

/// Largest valid subnet address.
pub const DIADDR_SUBNET_MAX: u16 = (1 << DIADDR_SUBNET_BITS) - 1;

/// Largest valid local address.
pub const DIADDR_LOCAL_MAX: u16 = (1 << DIADDR_LOCAL_BITS) - 1;

/// diaddr value meaning "no address assigned".
pub const DIADDR_UNASSIGNED: u16 = 0;

const_assert_eq!(DIADDR_SUBNET_BITS + DIADDR_LOCAL_BITS, 16);

/// Subnet part of a diaddr.
#[inline]
pub const fn subnet(diaddr: u16) -> u16 {
    diaddr >> DIADDR_LOCAL_BITS
}

/// Local part of a diaddr (without the subnet).
#[inline]
pub const fn local(diaddr: u16) -> u16 {
    diaddr & DIADDR_LOCAL_MAX
}

/// Build a diaddr from subnet and local address.
///
/// Returns `None` if either part is out of range.
#[inline]
pub const fn build(subnet: u16, local: u16) -> Option<u16> {
    if subnet > DIADDR_SUBNET_MAX || local > DIADDR_LOCAL_MAX {
        return None;
    }
    Some(subnet << DIADDR_LOCAL_BITS | local)
}

/// Whether `diaddr` can identify a registered host module.
#[inline]
pub const fn is_assigned(diaddr: u16) -> bool {
    diaddr != DIADDR_UNASSIGNED
}
