use std::sync::Arc;

/// A reference-counted, offset-bounded view over an immutable byte buffer.
///
/// Slicing is O(1) and shares the backing buffer; `copy()` is the only
/// operation that materializes a new owned allocation. Reading past the end
/// of the block never panics: indexed reads are bounds-checked and return
/// `None`, and constructing an out-of-range slice yields an empty block.
#[derive(Debug, Clone)]
pub struct DataBlock {
    buf: Arc<Vec<u8>>,
    offset: usize,
    length: usize,
}

impl DataBlock {
    /// Takes ownership of `data` as a block spanning the whole buffer.
    pub fn from_owned(data: Vec<u8>) -> Self {
        let length = data.len();
        Self {
            buf: Arc::new(data),
            offset: 0,
            length,
        }
    }

    pub fn empty() -> Self {
        Self {
            buf: Arc::new(Vec::new()),
            offset: 0,
            length: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// A cheap sub-view `[offset, offset+length)` of this block, clamped so
    /// it never extends past the current view. An out-of-range `offset`
    /// yields an empty block rather than failing.
    pub fn slice(&self, offset: usize, length: usize) -> DataBlock {
        if offset >= self.length {
            return DataBlock {
                buf: self.buf.clone(),
                offset: self.offset + self.length,
                length: 0,
            };
        }
        let avail = self.length - offset;
        DataBlock {
            buf: self.buf.clone(),
            offset: self.offset + offset,
            length: length.min(avail),
        }
    }

    /// Sub-view from `offset` to the end of this block.
    pub fn slice_from(&self, offset: usize) -> DataBlock {
        self.slice(offset, self.length.saturating_sub(offset))
    }

    /// Materializes an independent owned buffer of just the viewed range.
    pub fn copy(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.offset..self.offset + self.length]
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        if index >= self.length {
            None
        } else {
            Some(self.buf[self.offset + index])
        }
    }

    /// Reads a little-endian `u16` at `offset`, or `None` if it would run
    /// past the end of the block.
    pub fn read_u16_le(&self, offset: usize) -> Option<u16> {
        let bytes = self.as_slice().get(offset..offset + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32_le(&self, offset: usize) -> Option<u32> {
        let bytes = self.as_slice().get(offset..offset + 4)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    pub fn read_u64_le(&self, offset: usize) -> Option<u64> {
        let bytes = self.as_slice().get(offset..offset + 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Reads a `#[repr(C, packed)]` struct at `offset`, bounds-checked.
    pub fn read_struct<T: Copy>(&self, offset: usize) -> Option<T> {
        let size = std::mem::size_of::<T>();
        if offset + size > self.length {
            return None;
        }
        Some(unsafe { crate::structures::read_unaligned(self.as_slice(), offset) })
    }

    /// Decodes a UTF-16LE string of `code_units` units starting at `offset`.
    /// Unpaired surrogates are replaced per `char::decode_utf16` so a
    /// corrupt filename degrades to a lossy string rather than failing.
    pub fn read_utf16le(&self, offset: usize, code_units: usize) -> Option<String> {
        let needed = code_units * 2;
        let bytes = self.as_slice().get(offset..offset + needed)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Some(
            char::decode_utf16(units)
                .map(|r| r.unwrap_or('\u{FFFD}'))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slicing_out_of_range_yields_empty_block() {
        let block = DataBlock::from_owned(vec![1, 2, 3, 4]);
        let out = block.slice(100, 10);
        assert_eq!(out.len(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn slicing_is_clamped_not_extended() {
        let block = DataBlock::from_owned(vec![1, 2, 3, 4, 5]);
        let sub = block.slice(2, 100);
        assert_eq!(sub.copy(), vec![3, 4, 5]);
    }

    #[test]
    fn copy_is_independent_of_original() {
        let block = DataBlock::from_owned(vec![9, 9, 9]);
        let copied = block.copy();
        assert_eq!(copied, vec![9, 9, 9]);
    }

    #[test]
    fn read_helpers_respect_bounds() {
        let block = DataBlock::from_owned(vec![0x01, 0x00, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(block.read_u16_le(0), Some(1));
        assert_eq!(block.read_u32_le(2), Some(2));
        assert_eq!(block.read_u32_le(3), None);
    }

    #[test]
    fn utf16_decode_round_trips_ascii_name() {
        let name = "a.txt";
        let mut bytes = Vec::new();
        for c in name.encode_utf16() {
            bytes.extend_from_slice(&c.to_le_bytes());
        }
        let block = DataBlock::from_owned(bytes);
        assert_eq!(block.read_utf16le(0, name.len()), Some(name.to_string()));
    }
}
