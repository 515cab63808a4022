// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Wall-clock helpers used when stamping log lines.
pub mod time;

/// Number of bytes in one KiB.
pub const KIB: u64 = 1 << 10;
/// Number of bytes in one MiB.
pub const MIB: u64 = 1 << 20;
/// Number of bytes in one GiB.
pub const GIB: u64 = 1 << 30;

/// Safely converts a u64 value to a usize value.
/// This bypasses the Clippy lint check because we only support 64-bit platforms.
#[cfg(target_pointer_width = "64")]
#[inline]
#[allow(clippy::cast_possible_truncation)]
pub const fn u64_to_usize(num: u64) -> usize {
    num as usize
}

/// Safely converts a usize value to a u64 value.
/// This bypasses the Clippy lint check because we only support 64-bit platforms.
#[cfg(target_pointer_width = "64")]
#[inline]
#[allow(clippy::cast_possible_truncation)]
pub const fn usize_to_u64(num: usize) -> u64 {
    num as u64
}

/// Converts MiB to Bytes, saturating on overflow.
pub const fn mib_to_bytes(mib: u64) -> u64 {
    mib.saturating_mul(MIB)
}

/// Rounds `addr` up to the next multiple of `align`.
///
/// An alignment of zero is treated as one. Returns `None` on overflow.
pub const fn align_up(addr: u64, align: u64) -> Option<u64> {
    if align <= 1 {
        return Some(addr);
    }
    addr.checked_next_multiple_of(align)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), Some(0));
        assert_eq!(align_up(1, 8), Some(8));
        assert_eq!(align_up(0xF200, 8), Some(0xF200));
        assert_eq!(align_up(0x201, 0x1000), Some(0x1000));
        assert_eq!(align_up(7, 3), Some(9));
        assert_eq!(align_up(5, 0), Some(5));
        assert_eq!(align_up(u64::MAX, 2), None);
    }

    #[test]
    fn test_mib_to_bytes() {
        assert_eq!(mib_to_bytes(1), MIB);
        assert_eq!(mib_to_bytes(256), 256 * MIB);
        assert_eq!(mib_to_bytes(u64::MAX), u64::MAX);
    }
}
