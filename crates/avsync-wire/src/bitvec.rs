//! Per-joint validity bit vectors
//!
//! One bit per index, LSB first within each byte. The caller owns space
//! accounting; both directions touch exactly `bit_vector_size(n)` bytes.

use bytes::{Buf, BufMut};

const BITS_IN_BYTE: usize = 8;

/// Bytes needed for `num_bits` flags
#[inline]
pub fn bit_vector_size(num_bits: usize) -> usize {
    num_bits.div_ceil(BITS_IN_BYTE)
}

/// Write one bit per index in `0..num_bits`, returns bytes written
pub fn write_bit_vector<B, F>(buf: &mut B, num_bits: usize, mut predicate: F) -> usize
where
    B: BufMut,
    F: FnMut(usize) -> bool,
{
    let mut byte = 0u8;
    let mut bit = 0;
    for i in 0..num_bits {
        if predicate(i) {
            byte |= 1 << bit;
        }
        bit += 1;
        if bit == BITS_IN_BYTE {
            buf.put_u8(byte);
            byte = 0;
            bit = 0;
        }
    }
    if bit != 0 {
        buf.put_u8(byte);
    }
    bit_vector_size(num_bits)
}

/// Read `num_bits` flags, invoking `on_bit(index, value)` for each.
/// Returns bytes consumed.
pub fn read_bit_vector<B, F>(buf: &mut B, num_bits: usize, mut on_bit: F) -> usize
where
    B: Buf,
    F: FnMut(usize, bool),
{
    let mut byte = 0u8;
    for i in 0..num_bits {
        let bit = i % BITS_IN_BYTE;
        if bit == 0 {
            byte = buf.get_u8();
        }
        on_bit(i, byte & (1 << bit) != 0);
    }
    bit_vector_size(num_bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bit_vector_size() {
        assert_eq!(bit_vector_size(0), 0);
        assert_eq!(bit_vector_size(1), 1);
        assert_eq!(bit_vector_size(8), 1);
        assert_eq!(bit_vector_size(9), 2);
        assert_eq!(bit_vector_size(255), 32);
    }

    #[test]
    fn test_lsb_first_layout() {
        let mut buf = Vec::new();
        let written = write_bit_vector(&mut buf, 10, |i| i == 0 || i == 3 || i == 9);
        assert_eq!(written, 2);
        assert_eq!(buf, vec![0b0000_1001, 0b0000_0010]);
    }

    #[test]
    fn test_zero_bits_touch_nothing() {
        let mut buf = Vec::new();
        assert_eq!(write_bit_vector(&mut buf, 0, |_| true), 0);
        assert!(buf.is_empty());

        let mut calls = 0;
        let mut src: &[u8] = &[0xff];
        assert_eq!(read_bit_vector(&mut src, 0, |_, _| calls += 1), 0);
        assert_eq!(calls, 0);
        assert_eq!(src.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_bits_survive(bits in proptest::collection::vec(any::<bool>(), 0..300)) {
            let mut buf = Vec::new();
            let written = write_bit_vector(&mut buf, bits.len(), |i| bits[i]);
            prop_assert_eq!(written, buf.len());

            let mut read = vec![false; bits.len()];
            let mut src = buf.as_slice();
            let consumed = read_bit_vector(&mut src, bits.len(), |i, v| read[i] = v);
            prop_assert_eq!(consumed, written);
            prop_assert!(src.is_empty());
            prop_assert_eq!(read, bits);
        }
    }
}
