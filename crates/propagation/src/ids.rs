use std::fmt;
use std::str::FromStr;

/// An identifier for a trace, shared by every span in the tree.
///
/// Serialized as 32 lowercase hex digits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct TraceId(pub u128);

impl TraceId {
    /// Create a random `TraceId`.
    pub fn random() -> Self {
        TraceId(rand::random())
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for TraceId {
    type Err = ParseTraceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseTraceIdError);
        }
        u128::from_str_radix(s, 16)
            .map(TraceId)
            .map_err(|_| ParseTraceIdError)
    }
}

/// The error returned when a string is not exactly 32 hex digits.
#[derive(Debug, thiserror::Error)]
#[error("trace ids are exactly 32 hex digits")]
pub struct ParseTraceIdError;

/// An identifier for a span within a trace.
///
/// `SpanId(0)` means "unknown" and only ever comes from parsing an
/// incoming header; generated ids are nonzero.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct SpanId(pub u64);

impl SpanId {
    /// Create a random nonzero `SpanId`.
    pub fn random() -> Self {
        loop {
            let id = rand::random::<u64>();
            if id != 0 {
                return SpanId(id);
            }
        }
    }

    /// Whether this id carries no parent information.
    pub fn is_unknown(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Span ids travel as decimal inside the header.
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_display_is_32_hex_digits() {
        assert_eq!(TraceId(0).to_string(), "00000000000000000000000000000000");
        assert_eq!(
            TraceId(0x0123456789abcdef0123456789abcdef).to_string(),
            "0123456789abcdef0123456789abcdef"
        );
    }

    #[test]
    fn trace_id_parses_case_insensitively() {
        let lower: TraceId = "0123456789abcdef0123456789abcdef".parse().unwrap();
        let upper: TraceId = "0123456789ABCDEF0123456789ABCDEF".parse().unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower.0, 0x0123456789abcdef0123456789abcdef);
    }

    #[test]
    fn trace_id_rejects_bad_input() {
        assert!("".parse::<TraceId>().is_err());
        assert!("0123".parse::<TraceId>().is_err());
        assert!("g123456789abcdef0123456789abcdef".parse::<TraceId>().is_err());
        assert!("0123456789abcdef0123456789abcdef0".parse::<TraceId>().is_err());
        // `from_str_radix` would happily take a sign here.
        assert!("+123456789abcdef0123456789abcdef".parse::<TraceId>().is_err());
    }

    #[test]
    fn random_trace_ids_do_not_collide() {
        assert_ne!(TraceId::random(), TraceId::random());
    }

    #[test]
    fn random_span_ids_are_nonzero_and_distinct() {
        let a = SpanId::random();
        let b = SpanId::random();
        assert!(!a.is_unknown());
        assert!(!b.is_unknown());
        assert_ne!(a, b);
    }

    #[test]
    fn span_id_displays_as_decimal() {
        assert_eq!(SpanId(42).to_string(), "42");
        assert_eq!(SpanId(u64::MAX).to_string(), "18446744073709551615");
    }
}
