use std::fmt;

use crate::android::chunk::BinaryReader;
use crate::android::error::ChunkResult;

/// Offset of `language[2]` inside `ResTable_config` (after `size` and `imsi`).
const LANGUAGE_OFFSET: usize = 8;
const COUNTRY_OFFSET: usize = 10;
const MIN_CONFIG_SIZE: usize = 12;

/// A `ResTable_config` block kept as raw bytes (size prefix included), so that
/// fields this crate never interprets survive re-encoding untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResConfig {
    raw: Vec<u8>,
}

/// Language and optional region of a configuration, e.g. `fr` or `zh-CN`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Locale {
    pub language: String,
    pub region: Option<String>,
}

impl ResConfig {
    /// The default (all-zero) configuration of the given size.
    pub fn default_config() -> Self {
        let mut raw = vec![0u8; 64];
        raw[..4].copy_from_slice(&64u32.to_le_bytes());
        ResConfig { raw }
    }

    /// A configuration carrying only a locale.
    pub fn with_locale(language: &str, region: Option<&str>) -> Self {
        let mut config = ResConfig::default_config();
        config.raw[LANGUAGE_OFFSET..LANGUAGE_OFFSET + 2].copy_from_slice(&pack_code(language, b'a'));
        if let Some(region) = region {
            config.raw[COUNTRY_OFFSET..COUNTRY_OFFSET + 2].copy_from_slice(&pack_code(region, b'0'));
        }
        config
    }

    pub fn read(reader: &mut BinaryReader<'_>) -> ChunkResult<Self> {
        let start = reader.position();
        let size = reader.read_u32()? as usize;
        if size < 4 {
            fail!("Configuration size {} too small", size);
        }
        reader.seek(start)?;
        let raw = reader.read_bytes(size)?.to_vec();
        Ok(ResConfig { raw })
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.raw);
    }

    pub fn size(&self) -> usize {
        self.raw.len()
    }

    pub fn is_default(&self) -> bool {
        self.raw[4..].iter().all(|b| *b == 0)
    }

    pub fn locale(&self) -> Option<Locale> {
        if self.raw.len() < MIN_CONFIG_SIZE {
            return None;
        }
        let language = unpack_code(
            [self.raw[LANGUAGE_OFFSET], self.raw[LANGUAGE_OFFSET + 1]],
            b'a',
        )?;
        let region = unpack_code(
            [self.raw[COUNTRY_OFFSET], self.raw[COUNTRY_OFFSET + 1]],
            b'0',
        );
        Some(Locale { language, region })
    }
}

impl Locale {
    /// Parse `fr`, `zh-rCN`, `zh_CN`, `zh-CN` or the qualifier form `b+sr+Latn+RS`.
    pub fn parse(item: &str) -> Option<Locale> {
        let item = item.trim();
        if let Some(tags) = item.strip_prefix("b+") {
            return Locale::parse_bcp47(tags);
        }
        let (language, region) = match item.split_once(['-', '_']) {
            Some((language, region)) => (language, Some(region)),
            None => (item, None),
        };
        if language.is_empty() || !language.chars().all(|c| c.is_ascii_alphabetic()) {
            return None;
        }
        let region = region.map(|region| match region.strip_prefix('r') {
            Some(rest) if rest.len() >= 2 => rest,
            _ => region,
        });
        Some(Locale {
            language: language.to_ascii_lowercase(),
            region: region.map(str::to_ascii_uppercase),
        })
    }

    /// Script and variant subtags are skipped; the config carries language and region only.
    fn parse_bcp47(tags: &str) -> Option<Locale> {
        let mut tags = tags.split('+');
        let language = tags.next().filter(|l| {
            (2..=3).contains(&l.len()) && l.chars().all(|c| c.is_ascii_alphabetic())
        })?;
        let region = tags.find(|tag| match tag.len() {
            2 => tag.chars().all(|c| c.is_ascii_alphabetic()),
            3 => tag.chars().all(|c| c.is_ascii_digit()),
            _ => false,
        });
        Some(Locale {
            language: language.to_ascii_lowercase(),
            region: region.map(str::to_ascii_uppercase),
        })
    }

    /// Whether a whitelist item selects this locale; an item without a region selects every region.
    pub fn matches(&self, item: &str) -> bool {
        let Some(wanted) = Locale::parse(item) else {
            return false;
        };
        if !wanted.language.eq_ignore_ascii_case(&self.language) {
            return false;
        }
        match wanted.region {
            None => true,
            Some(region) => self
                .region
                .as_deref()
                .is_some_and(|own| own.eq_ignore_ascii_case(&region)),
        }
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.region {
            Some(region) => write!(f, "{}-{}", self.language, region),
            None => write!(f, "{}", self.language),
        }
    }
}

/// Decode a two-byte language/region code, including the packed three-letter form.
fn unpack_code(bytes: [u8; 2], base: u8) -> Option<String> {
    if bytes == [0, 0] {
        return None;
    }
    if bytes[0] & 0x80 != 0 {
        let first = bytes[1] & 0x1f;
        let second = ((bytes[1] & 0xe0) >> 5) | ((bytes[0] & 0x03) << 3);
        let third = (bytes[0] & 0x7c) >> 2;
        let code: String = [first, second, third]
            .iter()
            .map(|c| (base + c) as char)
            .collect();
        return Some(code);
    }
    Some(
        bytes
            .iter()
            .filter(|b| **b != 0)
            .map(|b| *b as char)
            .collect(),
    )
}

fn pack_code(code: &str, base: u8) -> [u8; 2] {
    let bytes = code.as_bytes();
    match bytes.len() {
        3 => {
            let first = bytes[0].wrapping_sub(base) & 0x1f;
            let second = bytes[1].wrapping_sub(base) & 0x1f;
            let third = bytes[2].wrapping_sub(base) & 0x1f;
            [
                0x80 | (third << 2) | (second >> 3),
                ((second & 0x07) << 5) | first,
            ]
        }
        2 => [bytes[0], bytes[1]],
        1 => [bytes[0], 0],
        _ => [0, 0],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_letter_locale() {
        let config = ResConfig::with_locale("fr", Some("CA"));
        let locale = config.locale().unwrap();
        assert_eq!(locale.to_string(), "fr-CA");
        assert!(locale.matches("fr"));
        assert!(locale.matches("fr-rCA"));
        assert!(locale.matches("fr_CA"));
        assert!(!locale.matches("fr-FR"));
        assert!(!locale.matches("en"));
    }

    #[test]
    fn parses_whitelist_items() {
        let locale = Locale::parse("zh-rCN").unwrap();
        assert_eq!(locale.language, "zh");
        assert_eq!(locale.region.as_deref(), Some("CN"));
        assert!(Locale::parse("").is_none());
    }

    #[test]
    fn parses_bcp47_qualifiers() {
        let serbian = Locale::parse("b+sr+Latn").unwrap();
        assert_eq!(serbian.language, "sr");
        assert_eq!(serbian.region, None);

        let regional = Locale::parse("b+sr+Latn+rs").unwrap();
        assert_eq!(regional.region.as_deref(), Some("RS"));
        assert_eq!(Locale::parse("b+es+419").unwrap().region.as_deref(), Some("419"));
        assert!(Locale::parse("b+").is_none());

        let config = ResConfig::with_locale("sr", Some("RS"));
        let locale = config.locale().unwrap();
        assert!(locale.matches("b+sr+Latn"));
        assert!(locale.matches("b+sr+Latn+RS"));
        assert!(!locale.matches("b+sr+Latn+ME"));
    }

    #[test]
    fn packed_three_letter_language() {
        let config = ResConfig::with_locale("fil", None);
        assert_eq!(config.locale().unwrap().language, "fil");
    }

    #[test]
    fn default_config_has_no_locale() {
        let config = ResConfig::default_config();
        assert!(config.is_default());
        assert!(config.locale().is_none());
    }
}
