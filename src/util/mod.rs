//! Utilities used by other modules: target-process addresses, options, logging.

pub mod address;
pub mod logger;
pub mod options;
#[cfg(test)]
pub mod test_util;

pub use self::address::Address;
pub use self::address::ByteOffset;
pub use self::address::ByteSize;
