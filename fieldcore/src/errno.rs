//! Errno values carried in RPC `return_code` fields and error mappings.
//!
//! Numbering follows the newlib `errno.h` used by the device-side peers, so
//! codes round-trip unchanged between this crate and remote tooling.

pub const EIO: i32 = 5;
pub const EBADF: i32 = 9;
pub const EAGAIN: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const EACCES: i32 = 13;
pub const ENODEV: i32 = 19;
pub const EINVAL: i32 = 22;
pub const ENOSPC: i32 = 28;
pub const ETIMEDOUT: i32 = 116;
pub const ENOTCONN: i32 = 128;
pub const ENOTSUP: i32 = 134;
