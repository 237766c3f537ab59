//! Patching words into a little-endian program image

use crate::instruction::Instruction;
use log::info;
use std::fmt;
use std::str::FromStr;

/// Words to write at a word address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub address: u16,
    pub words: Vec<u16>,
}

fn parse_address(text: &str) -> Result<u16, String> {
    if text.len() != 4 {
        return Err(format!("Address should be 4 hex digits: {text}"));
    }
    u16::from_str_radix(text, 16).map_err(|_| format!("Address is not hex: {text}"))
}

impl FromStr for Segment {
    type Err = String;

    /// `AAAA:DDDD...` where `AAAA` is a word address and each `DDDD` a word
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, data) = s
            .split_once(':')
            .ok_or_else(|| format!("Segment should look like AAAA:DDDD, got {s}"))?;
        let address = parse_address(address)?;
        if data.is_empty() || data.len() % 4 != 0 {
            return Err(format!("Segment data should be whole 16-bit words: {data}"));
        }
        let words = (0..data.len() / 4)
            .map(|i| {
                let chunk = data
                    .get(i * 4..i * 4 + 4)
                    .ok_or_else(|| format!("Segment data is not hex: {data}"))?;
                u16::from_str_radix(chunk, 16).map_err(|_| format!("Segment data is not hex: {chunk}"))
            })
            .collect::<Result<Vec<u16>, String>>()?;
        Ok(Segment { address, words })
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:", self.address)?;
        for word in &self.words {
            write!(f, "{word:04x}")?;
        }
        Ok(())
    }
}

impl Segment {
    /// Assemble `text` for placement at `address`; labels resolve relative to it
    pub fn from_assembly(address: u16, text: &str) -> Result<Self, String> {
        let words = Instruction::assemble_at(text, address)?;
        if words.is_empty() {
            return Err(format!("Nothing to patch at {address:04x}"));
        }
        Ok(Segment { address, words })
    }

    /// Parse `AAAA:statements`, as given on the command line
    pub fn parse_assembly(s: &str) -> Result<Self, String> {
        let (address, text) = s
            .split_once(':')
            .ok_or_else(|| format!("Assembly patch should look like AAAA:code, got {s}"))?;
        Self::from_assembly(parse_address(address)?, text)
    }
}

/// Write each segment into `image` at byte offset `address * 2`
pub fn apply_segments(image: &mut [u8], segments: &[Segment]) -> Result<(), String> {
    for segment in segments {
        let start = segment.address as usize * 2;
        let end = start + segment.words.len() * 2;
        if end > image.len() {
            return Err(format!(
                "Segment {:04x} ({} words) runs past the end of the {}-byte image",
                segment.address,
                segment.words.len(),
                image.len()
            ));
        }
        for (i, word) in segment.words.iter().enumerate() {
            let offset = start + i * 2;
            image[offset..offset + 2].copy_from_slice(&word.to_le_bytes());
        }
        info!("Patched {}", segment);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_parse_segment() {
        let segment: Segment = "0010:00150006abcd".parse().unwrap();
        assert_eq!(segment.address, 0x10);
        assert_eq!(segment.words, vec![0x15, 0x06, 0xabcd]);
        assert_eq!(segment.to_string(), "0010:00150006abcd");

        for bad in ["10:0015", "0010", "0010:015", "0010:", "00g0:0015", "0010:zzzz"] {
            assert!(bad.parse::<Segment>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_apply_segments() {
        let mut image = vec![0u8; 8];
        let segments = vec![
            "0001:1234".parse().unwrap(),
            "0003:0015".parse().unwrap(),
        ];
        apply_segments(&mut image, &segments).unwrap();
        assert_eq!(image, vec![0, 0, 0x34, 0x12, 0, 0, 0x15, 0]);

        // The last word fits exactly, one more does not
        let past: Segment = "0003:00150015".parse().unwrap();
        assert!(apply_segments(&mut image, &[past]).is_err());
    }

    #[test]
    fn test_assembly_segment() {
        let segment = Segment::parse_assembly("0100:set r7 1; loop: jmp loop").unwrap();
        assert_eq!(segment.address, 0x100);
        assert_eq!(segment.words, vec![1, 32775, 1, 6, 0x103]);

        assert!(Segment::parse_assembly("0100:").is_err());
        assert!(Segment::parse_assembly("0100:bogus").is_err());
    }
}
