//! Shared plumbing for the `ResChunk_header` framed formats (resource tables and binary XML).

use crate::android::error::{ChunkError, ChunkResult};

pub const RES_STRING_POOL_TYPE: u16 = 0x0001;
pub const RES_TABLE_TYPE: u16 = 0x0002;
pub const RES_XML_TYPE: u16 = 0x0003;
pub const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;
pub const RES_TABLE_PACKAGE_TYPE: u16 = 0x0200;
pub const RES_TABLE_TYPE_TYPE: u16 = 0x0201;
pub const RES_TABLE_TYPE_SPEC_TYPE: u16 = 0x0202;

pub const CHUNK_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct ChunkHeader {
    pub chunk_type: u16,
    pub header_size: u16,
    pub chunk_size: u32,
    pub start: usize,
}

impl ChunkHeader {
    pub fn end(&self) -> usize {
        self.start + self.chunk_size as usize
    }

    pub fn body_start(&self) -> usize {
        self.start + self.header_size as usize
    }
}

/// Little-endian cursor over a borrowed chunk stream.
pub struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BinaryReader { data, pos: 0 }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self) -> ChunkResult<u8> {
        if self.pos + 1 > self.data.len() {
            fail!("Unexpected end of stream reading u8 at offset {}", self.pos);
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> ChunkResult<u16> {
        if self.pos + 2 > self.data.len() {
            fail!("Unexpected end of stream reading u16 at offset {}", self.pos);
        }
        let value = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    pub fn read_u32(&mut self) -> ChunkResult<u32> {
        if self.pos + 4 > self.data.len() {
            fail!("Unexpected end of stream reading u32 at offset {}", self.pos);
        }
        let value = u32::from_le_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(value)
    }

    pub fn read_bytes(&mut self, len: usize) -> ChunkResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| ChunkError::new("Byte run length overflow"))?;
        if end > self.data.len() {
            fail!("Unexpected end of stream reading {} bytes at offset {}", len, self.pos);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn seek(&mut self, offset: usize) -> ChunkResult<()> {
        if offset > self.data.len() {
            fail!("Attempted to seek to {} past end of stream ({})", offset, self.data.len());
        }
        self.pos = offset;
        Ok(())
    }

    /// Read a chunk header at the current position and check it fits in the stream.
    pub fn read_chunk_header(&mut self) -> ChunkResult<ChunkHeader> {
        let start = self.position();
        if self.remaining() < CHUNK_HEADER_SIZE {
            fail!("Truncated chunk header at offset {}", start);
        }
        let chunk_type = self.read_u16()?;
        let header_size = self.read_u16()?;
        let chunk_size = self.read_u32()?;
        if (header_size as usize) < CHUNK_HEADER_SIZE || chunk_size < header_size as u32 {
            fail!(
                "Invalid sizing (header {}, chunk {}) for chunk 0x{:04x} at offset {}",
                header_size,
                chunk_size,
                chunk_type,
                start
            );
        }
        let end = start
            .checked_add(chunk_size as usize)
            .ok_or_else(|| ChunkError::new("Chunk size overflow"))?;
        if end > self.data.len() {
            fail!(
                "Chunk 0x{:04x} at offset {} extends past end of stream ({} > {})",
                chunk_type,
                start,
                end,
                self.data.len()
            );
        }
        Ok(ChunkHeader {
            chunk_type,
            header_size,
            chunk_size,
            start,
        })
    }
}

pub fn write_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

pub fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn align_to_four(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

pub fn begin_chunk(buf: &mut Vec<u8>, chunk_type: u16, header_size: u16) -> usize {
    let start = buf.len();
    write_u16(buf, chunk_type);
    write_u16(buf, header_size);
    write_u32(buf, 0); // placeholder for chunk size
    start
}

pub fn finalize_chunk(buf: &mut Vec<u8>, chunk_start: usize) {
    align_to_four(buf);
    let size = (buf.len() - chunk_start) as u32;
    buf[chunk_start + 4..chunk_start + 8].copy_from_slice(&size.to_le_bytes());
}

/// Overwrite a previously reserved u32 slot.
pub fn patch_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_chunk_running_past_end() {
        let mut buf = Vec::new();
        write_u16(&mut buf, RES_TABLE_TYPE);
        write_u16(&mut buf, 12);
        write_u32(&mut buf, 64);
        write_u32(&mut buf, 1);
        let mut reader = BinaryReader::new(&buf);
        let err = reader.read_chunk_header().unwrap_err();
        assert!(err.to_string().contains("extends past end"), "{err}");
    }

    #[test]
    fn finalize_pads_and_patches_size() {
        let mut buf = Vec::new();
        let start = begin_chunk(&mut buf, RES_XML_TYPE, 8);
        write_u8(&mut buf, 7);
        finalize_chunk(&mut buf, start);
        assert_eq!(buf.len(), 12);
        assert_eq!(u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]), 12);
    }
}
