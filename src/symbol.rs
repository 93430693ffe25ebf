// =============================================================================
// C1 — Symbol Normalizer
// =============================================================================
//
// Pure functions, no I/O. Turns whatever shape of symbol a broker or client
// hands us into the canonical `InstrumentKey` used everywhere downstream.
// =============================================================================

use crate::errors::TradingError;
use crate::types::{InstrumentKey, Segment};

/// Normalize a raw `"SEGMENT:token"` or `"SEGMENT|token"` string into a
/// canonical `InstrumentKey`. Index names (e.g. `NIFTY 50`) are title-cased
/// under `NSE_INDEX` since upstream feeds are inconsistent about their case.
pub fn normalize(raw: &str) -> Result<InstrumentKey, TradingError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(TradingError::InvalidSymbol(raw.to_string()));
    }

    let (seg_str, token) = raw
        .split_once(['|', ':'])
        .ok_or_else(|| TradingError::InvalidSymbol(raw.to_string()))?;

    let segment: Segment = seg_str.trim().to_uppercase().parse()?;
    let token = token.trim();
    if token.is_empty() {
        return Err(TradingError::InvalidSymbol(raw.to_string()));
    }

    let token = if segment == Segment::NseIndex {
        title_case(token)
    } else {
        token.to_string()
    };

    Ok(InstrumentKey::new(segment, token))
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_eq_colon_form() {
        let key = normalize("NSE_EQ:11536").unwrap();
        assert_eq!(key.segment, Segment::NseEq);
        assert_eq!(key.token, "11536");
        assert_eq!(key.canonical(), "NSE_EQ|11536");
    }

    #[test]
    fn normalizes_pipe_form_case_insensitive_segment() {
        let key = normalize("nse_fo|48756").unwrap();
        assert_eq!(key.segment, Segment::NseFo);
        assert_eq!(key.token, "48756");
    }

    #[test]
    fn title_cases_index_names() {
        let key = normalize("NSE_INDEX|NIFTY 50").unwrap();
        assert_eq!(key.token, "Nifty 50");
    }

    #[test]
    fn rejects_unknown_segment() {
        assert!(normalize("XYZ|123").is_err());
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(normalize("").is_err());
        assert!(normalize("NSE_EQ").is_err());
        assert!(normalize("NSE_EQ|").is_err());
    }
}
