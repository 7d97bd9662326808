use bytemuck::NoUninit;

use std::fmt;
use std::ops::*;

/// size in bytes in the target's address space
pub type ByteSize = u64;
/// offset in bytes in the target's address space
pub type ByteOffset = i64;

/// Address represents a virtual address in the *target* process. The target
/// is always modelled as a 64-bit address space, independent of the host the
/// inspector runs on. Address supports address arithmetic and formatting but
/// deliberately has no way to dereference itself: every access to target
/// memory goes through [`crate::vm::ChannelProtocol`].
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit)]
pub struct Address(u64);

static_assertions::const_assert_eq!(std::mem::size_of::<Address>(), 8);

/// Address + ByteSize (positive)
impl Add<ByteSize> for Address {
    type Output = Address;
    fn add(self, offset: ByteSize) -> Address {
        Address(self.0 + offset)
    }
}

/// Address += ByteSize (positive)
impl AddAssign<ByteSize> for Address {
    fn add_assign(&mut self, offset: ByteSize) {
        self.0 += offset;
    }
}

/// Address + ByteOffset (positive or negative)
impl Add<ByteOffset> for Address {
    type Output = Address;
    fn add(self, offset: ByteOffset) -> Address {
        Address((self.0 as i64 + offset) as u64)
    }
}

/// Address - ByteSize (positive)
impl Sub<ByteSize> for Address {
    type Output = Address;
    fn sub(self, offset: ByteSize) -> Address {
        Address(self.0 - offset)
    }
}

/// Address - Address (the first address must be higher)
impl Sub<Address> for Address {
    type Output = ByteSize;
    fn sub(self, other: Address) -> ByteSize {
        debug_assert!(
            self.0 >= other.0,
            "for (addr_a - addr_b), a({}) needs to be larger than b({})",
            self,
            other
        );
        self.0 - other.0
    }
}

/// Address & mask
impl BitAnd<u64> for Address {
    type Output = u64;
    fn bitand(self, other: u64) -> u64 {
        self.0 & other
    }
}

impl Address {
    /// The lowest possible address. Also used as the "no address" sentinel,
    /// the way the target VM itself uses a null pointer.
    pub const ZERO: Self = Address(0);

    /// creates an Address from a raw word read out of the target
    pub const fn from_raw(raw: u64) -> Address {
        Address(raw)
    }

    /// Add an offset to the address. The const fn version of the `Add` trait.
    #[allow(clippy::should_implement_trait)]
    pub const fn add(self, size: u64) -> Address {
        Address(self.0 + size)
    }

    /// Subtract an offset from the address. The const fn version of the `Sub` trait.
    #[allow(clippy::should_implement_trait)]
    pub const fn sub(self, size: u64) -> Address {
        Address(self.0 - size)
    }

    /// Bitwise 'and' with a mask.
    pub const fn and(self, mask: u64) -> u64 {
        self.0 & mask
    }

    /// is this address zero?
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// aligns down the address to the given alignment
    pub const fn align_down(self, align: ByteSize) -> Address {
        debug_assert!(align.is_power_of_two());
        Address(self.0 & !(align - 1))
    }

    /// is this address aligned to the given alignment
    pub const fn is_aligned_to(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two());
        self.0 & (align - 1) == 0
    }

    /// converts the Address to a raw 64-bit word
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// allows print Address as upper-case hex value
impl fmt::UpperHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

/// allows print Address as lower-case hex value
impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// allows Display format the Address (as hex value with 0x prefix)
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// allows Debug format the Address (as hex value with 0x prefix)
impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
