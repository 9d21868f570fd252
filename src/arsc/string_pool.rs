use std::collections::HashMap;

use crate::android::chunk::{
    align_to_four, begin_chunk, finalize_chunk, patch_u32, write_u16, write_u32, write_u8,
    BinaryReader, ChunkHeader, RES_STRING_POOL_TYPE,
};
use crate::android::error::{ChunkError, ChunkResult};

pub const SORTED_FLAG: u32 = 0x0000_0001;
pub const UTF8_FLAG: u32 = 0x0000_0100;

const POOL_HEADER_SIZE: u16 = 28;
const SPAN_END: u32 = 0xFFFF_FFFF;

/// A styled run inside a pool string. `name` is an index into the same pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StyleSpan {
    pub name: u32,
    pub first_char: u32,
    pub last_char: u32,
}

/// A `ResStringPool` chunk: an indexed arena of strings with optional style spans.
///
/// Style `i` belongs to string `i`; styled strings therefore always sit at the front.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StringPool {
    pub flags: u32,
    strings: Vec<String>,
    styles: Vec<Vec<StyleSpan>>,
}

/// Old index -> new index, produced by [`StringPool::compact`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRemap {
    map: Vec<Option<u32>>,
}

impl IndexRemap {
    pub fn get(&self, old: u32) -> Option<u32> {
        self.map.get(old as usize).copied().flatten()
    }

    pub fn removed(&self) -> usize {
        self.map.iter().filter(|slot| slot.is_none()).count()
    }
}

impl StringPool {
    pub fn new(flags: u32) -> Self {
        StringPool {
            flags,
            strings: Vec::new(),
            styles: Vec::new(),
        }
    }

    pub fn utf8() -> Self {
        StringPool::new(UTF8_FLAG)
    }

    pub fn is_utf8(&self) -> bool {
        (self.flags & UTF8_FLAG) != 0
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn get(&self, idx: u32) -> Option<&str> {
        self.strings.get(idx as usize).map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.strings.iter().map(|s| s.as_str())
    }

    pub fn style_count(&self) -> usize {
        self.styles.len()
    }

    pub fn style(&self, idx: u32) -> Option<&[StyleSpan]> {
        self.styles.get(idx as usize).map(|s| s.as_slice())
    }

    pub fn is_styled(&self, idx: u32) -> bool {
        (idx as usize) < self.styles.len()
    }

    /// Append a string without deduplication.
    pub fn push(&mut self, value: impl Into<String>) -> u32 {
        let idx = self.strings.len() as u32;
        self.strings.push(value.into());
        idx
    }

    /// Append a styled string. Styled strings must precede every unstyled one.
    pub fn push_styled(&mut self, value: impl Into<String>, spans: Vec<StyleSpan>) -> ChunkResult<u32> {
        if self.strings.len() != self.styles.len() {
            fail!("Styled string appended after {} unstyled strings", self.strings.len() - self.styles.len());
        }
        let idx = self.push(value);
        self.styles.push(spans);
        Ok(idx)
    }

    /// Rewrite a slot in place; indices are unaffected.
    pub fn set(&mut self, idx: u32, value: impl Into<String>) -> ChunkResult<()> {
        match self.strings.get_mut(idx as usize) {
            Some(slot) => {
                *slot = value.into();
                Ok(())
            }
            None => Err(err!("String pool index {} out of range ({})", idx, self.strings.len())),
        }
    }

    pub fn index_of(&self, value: &str) -> Option<u32> {
        self.strings.iter().position(|s| s == value).map(|idx| idx as u32)
    }

    /// Drop every string whose `keep` slot is false and renumber the survivors in order.
    ///
    /// Span names of surviving styles are kept alive regardless of `keep`, and
    /// rewritten through the returned remap in the same step.
    pub fn compact(&mut self, keep: &[bool]) -> IndexRemap {
        let mut keep: Vec<bool> = (0..self.strings.len())
            .map(|idx| keep.get(idx).copied().unwrap_or(true))
            .collect();
        for (idx, spans) in self.styles.iter().enumerate() {
            if keep[idx] {
                for span in spans {
                    if let Some(slot) = keep.get_mut(span.name as usize) {
                        *slot = true;
                    }
                }
            }
        }

        let mut map = Vec::with_capacity(self.strings.len());
        let mut next = 0u32;
        for alive in &keep {
            if *alive {
                map.push(Some(next));
                next += 1;
            } else {
                map.push(None);
            }
        }
        let remap = IndexRemap { map };

        let strings = std::mem::take(&mut self.strings);
        self.strings = strings
            .into_iter()
            .zip(keep.iter())
            .filter_map(|(s, alive)| alive.then_some(s))
            .collect();

        let styles = std::mem::take(&mut self.styles);
        self.styles = styles
            .into_iter()
            .zip(keep.iter())
            .filter_map(|(spans, alive)| alive.then_some(spans))
            .map(|spans| {
                spans
                    .into_iter()
                    .map(|span| StyleSpan {
                        name: remap.get(span.name).unwrap_or(span.name),
                        ..span
                    })
                    .collect()
            })
            .collect();
        remap
    }

    pub fn decode(reader: &mut BinaryReader<'_>, header: &ChunkHeader) -> ChunkResult<Self> {
        if header.chunk_type != RES_STRING_POOL_TYPE {
            fail!("Expected string pool chunk, found 0x{:04x}", header.chunk_type);
        }
        if header.header_size < POOL_HEADER_SIZE {
            fail!("String pool header too small ({})", header.header_size);
        }
        reader.seek(header.start + 8)?;
        let string_count = reader.read_u32()? as usize;
        let style_count = reader.read_u32()? as usize;
        let flags = reader.read_u32()?;
        let strings_start = reader.read_u32()? as usize;
        let styles_start = reader.read_u32()? as usize;

        if style_count > string_count {
            fail!("String pool declares {} styles for {} strings", style_count, string_count);
        }
        let index_bytes = (string_count + style_count)
            .checked_mul(4)
            .ok_or_else(|| ChunkError::new("String pool index size overflow"))?;
        if header.header_size as usize + index_bytes > header.chunk_size as usize {
            fail!("String pool index arrays exceed chunk ({} entries)", string_count + style_count);
        }

        reader.seek(header.body_start())?;
        let mut string_offsets = Vec::with_capacity(string_count);
        for _ in 0..string_count {
            string_offsets.push(reader.read_u32()? as usize);
        }
        let mut style_offsets = Vec::with_capacity(style_count);
        for _ in 0..style_count {
            style_offsets.push(reader.read_u32()? as usize);
        }

        let chunk_end = header.end();
        let strings_base = header.start + strings_start;
        let strings_limit = if styles_start != 0 {
            header.start + styles_start
        } else {
            chunk_end
        };
        if string_count > 0 && (strings_start == 0 || strings_limit > chunk_end || strings_base > strings_limit) {
            fail!("String data bounds invalid (start {}, styles {})", strings_start, styles_start);
        }

        let is_utf8 = (flags & UTF8_FLAG) != 0;
        let data = reader.data();
        let mut strings = Vec::with_capacity(string_count);
        for (idx, offset) in string_offsets.into_iter().enumerate() {
            let absolute = strings_base + offset;
            let text = if is_utf8 {
                read_utf8_string(data, absolute, strings_limit)
            } else {
                read_utf16_string(data, absolute, strings_limit)
            }
            .map_err(|e| err!(e, "string {}", idx))?;
            strings.push(text);
        }

        let mut styles = Vec::with_capacity(style_count);
        for (idx, offset) in style_offsets.into_iter().enumerate() {
            let mut cursor = BinaryReader::new(&data[..chunk_end]);
            cursor.seek(header.start + styles_start + offset)?;
            let mut spans = Vec::new();
            loop {
                let name = cursor.read_u32().map_err(|e| err!(e, "style {}", idx))?;
                if name == SPAN_END {
                    break;
                }
                let first_char = cursor.read_u32()?;
                let last_char = cursor.read_u32()?;
                spans.push(StyleSpan {
                    name,
                    first_char,
                    last_char,
                });
            }
            styles.push(spans);
        }

        reader.seek(chunk_end)?;
        Ok(StringPool {
            flags,
            strings,
            styles,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> ChunkResult<()> {
        let chunk_start = begin_chunk(buf, RES_STRING_POOL_TYPE, POOL_HEADER_SIZE);
        write_u32(buf, self.strings.len() as u32);
        write_u32(buf, self.styles.len() as u32);
        write_u32(buf, self.flags);
        let strings_start_slot = buf.len();
        write_u32(buf, 0);
        let styles_start_slot = buf.len();
        write_u32(buf, 0);

        let mut string_data = Vec::new();
        let mut offsets = Vec::with_capacity(self.strings.len());
        for (idx, s) in self.strings.iter().enumerate() {
            offsets.push(string_data.len() as u32);
            if self.is_utf8() {
                write_utf8_string(&mut string_data, s)
            } else {
                write_utf16_string(&mut string_data, s)
            }
            .map_err(|e| err!(e, "string {}", idx))?;
        }
        align_to_four(&mut string_data);

        let mut style_data = Vec::new();
        let mut style_offsets = Vec::with_capacity(self.styles.len());
        for spans in &self.styles {
            style_offsets.push(style_data.len() as u32);
            for span in spans {
                write_u32(&mut style_data, span.name);
                write_u32(&mut style_data, span.first_char);
                write_u32(&mut style_data, span.last_char);
            }
            write_u32(&mut style_data, SPAN_END);
        }
        if !self.styles.is_empty() {
            write_u32(&mut style_data, SPAN_END);
            write_u32(&mut style_data, SPAN_END);
        }

        for offset in offsets {
            write_u32(buf, offset);
        }
        for offset in style_offsets {
            write_u32(buf, offset);
        }
        let strings_start = (buf.len() - chunk_start) as u32;
        buf.extend_from_slice(&string_data);
        let styles_start = if self.styles.is_empty() {
            0
        } else {
            (buf.len() - chunk_start) as u32
        };
        buf.extend_from_slice(&style_data);
        patch_u32(buf, strings_start_slot, strings_start);
        patch_u32(buf, styles_start_slot, styles_start);
        finalize_chunk(buf, chunk_start);
        Ok(())
    }
}

/// Deduplicating front-end used when a pass rebuilds a pool from scratch.
pub struct StringPoolBuilder {
    pool: StringPool,
    indices: HashMap<String, u32>,
}

impl StringPoolBuilder {
    pub fn new(flags: u32) -> Self {
        StringPoolBuilder {
            pool: StringPool::new(flags),
            indices: HashMap::new(),
        }
    }

    pub fn intern(&mut self, value: &str) -> u32 {
        if let Some(&idx) = self.indices.get(value) {
            return idx;
        }
        let idx = self.pool.push(value);
        self.indices.insert(value.to_string(), idx);
        idx
    }

    pub fn finish(self) -> StringPool {
        self.pool
    }
}

fn read_utf8_string(data: &[u8], offset: usize, limit: usize) -> ChunkResult<String> {
    let mut cursor = offset;
    if cursor >= limit {
        fail!("String offset {} exceeds string data bounds", offset);
    }
    // The first length counts UTF-16 units; only the byte length matters here.
    let (_, len_bytes) = read_utf8_length(data, cursor, limit)?;
    cursor += len_bytes;
    let (byte_len, byte_len_size) = read_utf8_length(data, cursor, limit)?;
    cursor += byte_len_size;
    if cursor + byte_len > limit {
        fail!("UTF-8 string of {} bytes exceeds string data bounds", byte_len);
    }
    let slice = &data[cursor..cursor + byte_len];
    let text = std::str::from_utf8(slice).map_err(|e| err!("Invalid UTF-8 in string pool: {}", e))?;
    cursor += byte_len;
    if cursor >= limit || data[cursor] != 0 {
        fail!("Missing UTF-8 terminator");
    }
    Ok(text.to_string())
}

fn read_utf16_string(data: &[u8], offset: usize, limit: usize) -> ChunkResult<String> {
    let mut cursor = offset;
    let (char_count, header_bytes) = read_utf16_length(data, cursor, limit)?;
    cursor += header_bytes;
    let byte_len = char_count * 2;
    if cursor + byte_len > limit {
        fail!("UTF-16 string of {} units exceeds string data bounds", char_count);
    }
    let mut units = Vec::with_capacity(char_count);
    for chunk in data[cursor..cursor + byte_len].chunks_exact(2) {
        units.push(u16::from_le_bytes([chunk[0], chunk[1]]));
    }
    cursor += byte_len;
    if cursor + 2 > limit || u16::from_le_bytes([data[cursor], data[cursor + 1]]) != 0 {
        fail!("Missing UTF-16 terminator");
    }
    String::from_utf16(&units).map_err(|e| err!("Invalid UTF-16 in string pool: {}", e))
}

fn read_utf8_length(data: &[u8], offset: usize, limit: usize) -> ChunkResult<(usize, usize)> {
    if offset >= limit {
        fail!("Invalid UTF-8 length offset {}", offset);
    }
    let first = data[offset];
    if (first & 0x80) == 0 {
        Ok((first as usize, 1))
    } else {
        if offset + 1 >= limit {
            fail!("Truncated UTF-8 length at {}", offset);
        }
        let second = data[offset + 1];
        Ok(((((first & 0x7F) as usize) << 8) | second as usize, 2))
    }
}

fn read_utf16_length(data: &[u8], offset: usize, limit: usize) -> ChunkResult<(usize, usize)> {
    if offset + 2 > limit {
        fail!("Invalid UTF-16 length offset {}", offset);
    }
    let first = u16::from_le_bytes([data[offset], data[offset + 1]]);
    if (first & 0x8000) == 0 {
        Ok((first as usize, 2))
    } else {
        if offset + 4 > limit {
            fail!("Truncated UTF-16 length at {}", offset);
        }
        let second = u16::from_le_bytes([data[offset + 2], data[offset + 3]]);
        Ok(((((first & 0x7FFF) as usize) << 16) | second as usize, 4))
    }
}

fn write_utf8_length(buf: &mut Vec<u8>, len: usize) -> ChunkResult<()> {
    if len > 0x7FFF {
        fail!("UTF-8 pool string length {} exceeds 0x7fff", len);
    }
    if len > 0x7F {
        write_u8(buf, ((len >> 8) as u8) | 0x80);
        write_u8(buf, (len & 0xFF) as u8);
    } else {
        write_u8(buf, len as u8);
    }
    Ok(())
}

fn write_utf8_string(buf: &mut Vec<u8>, text: &str) -> ChunkResult<()> {
    write_utf8_length(buf, text.encode_utf16().count())?;
    write_utf8_length(buf, text.len())?;
    buf.extend_from_slice(text.as_bytes());
    write_u8(buf, 0);
    Ok(())
}

fn write_utf16_string(buf: &mut Vec<u8>, text: &str) -> ChunkResult<()> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let len = units.len();
    if len > 0x7FFF_FFFF {
        fail!("UTF-16 pool string length {} too large", len);
    }
    if len < 0x8000 {
        write_u16(buf, len as u16);
    } else {
        write_u16(buf, 0x8000 | ((len >> 16) as u16 & 0x7FFF));
        write_u16(buf, (len & 0xFFFF) as u16);
    }
    for unit in units {
        write_u16(buf, unit);
    }
    write_u16(buf, 0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reencode(pool: &StringPool) -> (Vec<u8>, StringPool) {
        let mut bytes = Vec::new();
        pool.encode(&mut bytes).unwrap();
        let mut reader = BinaryReader::new(&bytes);
        let header = reader.read_chunk_header().unwrap();
        let decoded = StringPool::decode(&mut reader, &header).unwrap();
        (bytes, decoded)
    }

    #[test]
    fn styled_utf16_pool_survives_reencoding() {
        let mut pool = StringPool::new(0);
        pool.push_styled("Hello bold world", vec![StyleSpan { name: 1, first_char: 6, last_char: 9 }])
            .unwrap();
        pool.push("b");
        pool.push("Grüße, \u{1F600}");
        let (bytes, decoded) = reencode(&pool);
        assert_eq!(decoded, pool);
        let mut again = Vec::new();
        decoded.encode(&mut again).unwrap();
        assert_eq!(bytes, again);
    }

    #[test]
    fn long_utf8_strings_use_two_byte_lengths() {
        let mut pool = StringPool::utf8();
        let long = "x".repeat(300);
        pool.push(long.clone());
        let (_, decoded) = reencode(&pool);
        assert_eq!(decoded.get(0), Some(long.as_str()));
    }

    #[test]
    fn compaction_keeps_span_names_and_renumbers() {
        let mut pool = StringPool::utf8();
        pool.push_styled("styled", vec![StyleSpan { name: 3, first_char: 0, last_char: 2 }])
            .unwrap();
        pool.push("drop me");
        pool.push("keep me");
        pool.push("i");
        let remap = pool.compact(&[true, false, true, false]);
        assert_eq!(remap.get(0), Some(0));
        assert_eq!(remap.get(1), None);
        assert_eq!(remap.get(2), Some(1));
        assert_eq!(remap.get(3), Some(2));
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.style(0).unwrap()[0].name, 2);
        assert_eq!(pool.get(2), Some("i"));
        assert_eq!(remap.removed(), 1);
    }

    #[test]
    fn truncated_pool_is_rejected() {
        let mut pool = StringPool::utf8();
        pool.push("abc");
        let mut bytes = Vec::new();
        pool.encode(&mut bytes).unwrap();
        // Claim a second string whose offset array slot does not exist.
        patch_u32(&mut bytes, 8, 40);
        let mut reader = BinaryReader::new(&bytes);
        let header = reader.read_chunk_header().unwrap();
        assert!(StringPool::decode(&mut reader, &header).is_err());
    }
}
