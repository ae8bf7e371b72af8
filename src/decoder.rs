/// Bounds-checked big-endian cursor over a byte slice.
///
/// Every read returns `None` instead of panicking when the slice is
/// exhausted, since the bytes being decoded may be damaged or partially
/// overwritten.
#[derive(Clone, Debug)]
pub struct Decoder<'bytes> {
    bytes: &'bytes [u8],
    pos: usize,
}

impl<'bytes> Decoder<'bytes> {
    #[inline]
    pub fn new(bytes: &'bytes [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    #[inline]
    pub fn try_read_u8(&mut self) -> Option<u8> {
        let byte = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    #[inline]
    pub fn try_read_u16(&mut self) -> Option<u16> {
        self.try_read_array().map(u16::from_be_bytes)
    }

    #[inline]
    pub fn try_read_u32(&mut self) -> Option<u32> {
        self.try_read_array().map(u32::from_be_bytes)
    }

    #[inline]
    pub fn try_read_varint(&mut self) -> Option<u64> {
        let (value, len) = read_varint(&self.bytes[self.pos.min(self.bytes.len())..])?;
        self.pos += len;
        Some(value)
    }

    #[inline]
    pub fn try_read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.try_read_bytes(N)?.try_into().ok()
    }

    #[inline]
    pub fn try_read_bytes(&mut self, len: usize) -> Option<&'bytes [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    /// Return a decoder over the same bytes positioned at `position`.
    #[inline]
    pub fn split_at(&self, position: usize) -> Decoder<'bytes> {
        Decoder { bytes: self.bytes, pos: position.min(self.bytes.len()) }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[allow(clippy::len_without_is_empty)]
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }
}

/// Decode a SQLite varint from the start of `bytes`.
///
/// Returns the value and the number of bytes consumed (1..=9), or `None` if
/// the slice ends before the varint does. The first eight bytes contribute
/// seven bits each; a ninth byte contributes all eight.
#[inline]
pub fn read_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut result = 0u64;
    for idx in 0..8 {
        let byte = *bytes.get(idx)?;
        result = (result << 7) | u64::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            return Some((result, idx + 1));
        }
    }

    let byte = *bytes.get(8)?;
    Some(((result << 8) | u64::from(byte), 9))
}

/// Decode a varint starting at `*pos`, advancing `pos` on success.
#[inline]
pub fn read_varint_at(bytes: &[u8], pos: &mut usize) -> Option<u64> {
    let (value, len) = read_varint(bytes.get(*pos..)?)?;
    *pos += len;
    Some(value)
}

/// Number of bytes the varint encoding of `value` occupies.
pub fn varint_len(value: u64) -> usize {
    if value > 0x00FF_FFFF_FFFF_FFFF {
        return 9;
    }
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}
