//! Wildcard "array of bytes" signature parsing and formatting: a
//! space-separated sequence of two-hex-digit bytes or a `??`/`**` wildcard
//! token, case-insensitive on input, always uppercase on output.

use crate::error::{Error, Result};

/// One token of an AOB signature: either a concrete byte or a wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AobToken {
    Byte(u8),
    Wildcard,
}

/// Parses an AOB string like `"48 8B ?? 00 45"` into tokens. Whitespace is
/// stripped entirely before parsing, so its placement doesn't matter: `"4
/// 8"` is one byte (`0x48`), and a wildcard may be glued to adjacent hex
/// (`"??41"`). Wildcards may be written `??` or `**`. Rejects an odd total
/// nibble count and anything that isn't valid hex or a wildcard.
pub fn parse_aob(pattern: &str) -> Result<Vec<AobToken>> {
    let cleaned: String = pattern.chars().filter(|c| !c.is_whitespace()).collect();

    if cleaned.is_empty() {
        return Err(Error::ParseError("empty AOB pattern".to_string()));
    }
    if cleaned.len() % 2 != 0 {
        return Err(Error::ParseError(format!("odd total nibble count in `{}`", pattern)));
    }

    let cleaned_bytes = cleaned.as_bytes();
    let mut tokens = Vec::with_capacity(cleaned_bytes.len() / 2);
    for chunk in cleaned_bytes.chunks(2) {
        let token_str = std::str::from_utf8(chunk).unwrap();
        if token_str == "??" || token_str == "**" {
            tokens.push(AobToken::Wildcard);
            continue;
        }

        let byte = u8::from_str_radix(token_str, 16)
            .map_err(|_| Error::ParseError(format!("invalid hex token `{}`", token_str)))?;
        tokens.push(AobToken::Byte(byte));
    }

    Ok(tokens)
}

/// Renders tokens back into the canonical space-separated uppercase form.
pub fn format_aob(tokens: &[AobToken]) -> String {
    tokens
        .iter()
        .map(|t| match t {
            AobToken::Byte(b) => format!("{:02X}", b),
            AobToken::Wildcard => "??".to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Builds an AOB pattern from raw bytes and a parallel "keep this byte
/// literal" mask, as produced by `disasm::Disassembler::wildcard_aob`.
pub fn mask_to_tokens(bytes: &[u8], keep: &[bool]) -> Vec<AobToken> {
    bytes
        .iter()
        .zip(keep.iter())
        .map(|(&b, &k)| if k { AobToken::Byte(b) } else { AobToken::Wildcard })
        .collect()
}

/// True if `haystack` at `offset` matches every concrete byte in `pattern`,
/// ignoring wildcard positions.
pub fn matches_at(pattern: &[AobToken], haystack: &[u8], offset: usize) -> bool {
    if offset + pattern.len() > haystack.len() {
        return false;
    }
    pattern.iter().enumerate().all(|(i, token)| match token {
        AobToken::Wildcard => true,
        AobToken::Byte(b) => haystack[offset + i] == *b,
    })
}

/// Scans `haystack` for every offset at which `pattern` matches.
pub fn find_all(pattern: &[AobToken], haystack: &[u8]) -> Vec<usize> {
    if pattern.is_empty() || pattern.len() > haystack.len() {
        return Vec::new();
    }
    (0..=haystack.len() - pattern.len())
        .filter(|&offset| matches_at(pattern, haystack, offset))
        .collect()
}

/// Inverse of `mask_to_tokens`: splits tokens into a concrete byte pattern
/// (wildcard positions filled with `0x00`) and a parallel "keep literal"
/// mask, the shape `Scanner`'s byte-array matching wants.
pub fn tokens_to_pattern_and_mask(tokens: &[AobToken]) -> (Vec<u8>, Vec<bool>) {
    let pattern = tokens
        .iter()
        .map(|t| match t {
            AobToken::Byte(b) => *b,
            AobToken::Wildcard => 0,
        })
        .collect();
    let mask = tokens.iter().map(|t| matches!(t, AobToken::Byte(_))).collect();
    (pattern, mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_literal_and_wildcard_tokens() {
        let tokens = parse_aob("48 8B ?? 00 45").unwrap();
        assert_eq!(
            tokens,
            vec![
                AobToken::Byte(0x48),
                AobToken::Byte(0x8B),
                AobToken::Wildcard,
                AobToken::Byte(0x00),
                AobToken::Byte(0x45),
            ]
        );
    }

    #[test]
    fn accepts_star_wildcard_and_lowercase_hex() {
        let tokens = parse_aob("ff ** 0a").unwrap();
        assert_eq!(tokens, vec![AobToken::Byte(0xFF), AobToken::Wildcard, AobToken::Byte(0x0A)]);
    }

    #[test]
    fn rejects_odd_nibble_count() {
        assert!(parse_aob("4 8B").is_err());
    }

    #[test]
    fn whitespace_placement_is_irrelevant_to_nibble_pairing() {
        let tokens = parse_aob("4 8").unwrap();
        assert_eq!(tokens, vec![AobToken::Byte(0x48)]);
    }

    #[test]
    fn wildcard_can_be_glued_to_adjacent_hex() {
        let tokens = parse_aob("??41").unwrap();
        assert_eq!(tokens, vec![AobToken::Wildcard, AobToken::Byte(0x41)]);
    }

    #[test]
    fn tokens_to_pattern_and_mask_round_trips_mask_to_tokens() {
        let tokens = parse_aob("48 ?? 45").unwrap();
        let (pattern, mask) = tokens_to_pattern_and_mask(&tokens);
        assert_eq!(pattern, vec![0x48, 0x00, 0x45]);
        assert_eq!(mask, vec![true, false, true]);
        assert_eq!(mask_to_tokens(&pattern, &mask), tokens);
    }

    #[test]
    fn rejects_empty_pattern() {
        assert!(parse_aob("   ").is_err());
    }

    #[test]
    fn format_round_trips_through_uppercase() {
        let tokens = parse_aob("ff ?? 0a").unwrap();
        assert_eq!(format_aob(&tokens), "FF ?? 0A");
    }

    #[test]
    fn find_all_respects_wildcards() {
        let pattern = parse_aob("AA ?? CC").unwrap();
        let haystack = [0x11, 0xAA, 0xBB, 0xCC, 0x22, 0xAA, 0xFF, 0xCC];
        assert_eq!(find_all(&pattern, &haystack), vec![1, 5]);
    }
}
