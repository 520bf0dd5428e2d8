/// One contiguous byte range of a source file, uploaded as a numbered part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk {
    /// 1-based part number within the multipart upload.
    pub part_number: u16,
    /// Byte offset within the file.
    pub offset: u64,
    /// Length of the range in bytes.
    pub length: u64,
}

impl Chunk {
    /// Exclusive end offset of the range.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_is_exclusive() {
        let chunk = Chunk {
            part_number: 2,
            offset: 10,
            length: 5,
        };
        assert_eq!(chunk.end(), 15);
    }
}
