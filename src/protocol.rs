//! StatsD wire-format parsing.
//!
//! Decodes UDP datagram payloads into typed [`Sample`] values. A datagram
//! carries newline-separated lines of the form
//! `<bucket>:<value>|<kind>[|@<rate>]`; parsing is total — malformed lines
//! are logged and skipped, and no input bytes can cause a panic.

use bytes::Bytes;
use memchr::memchr;
use thiserror::Error;
use tracing::warn;

/// Largest UDP payload the listener will accept, in bytes.
pub const MAX_DATAGRAM_SIZE: usize = 784;

/// Errors that can occur while parsing a single line.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing ':' value separator")]
    MissingValueSeparator,

    #[error("missing '|' kind separator")]
    MissingKindSeparator,

    #[error("empty bucket name")]
    EmptyBucket,

    #[error("unknown kind token {token:?}")]
    UnknownKind { token: String },

    #[error("invalid {kind} value {text:?}")]
    InvalidValue { kind: SampleKind, text: String },

    #[error("trailing segment is not a sample rate")]
    UnexpectedTrailer,
}

/// The four StatsD metric kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Counter,
    Gauge,
    Timer,
    Set,
}

impl SampleKind {
    /// Returns the kind name for logging.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Timer => "timer",
            Self::Set => "set",
        }
    }
}

impl std::fmt::Display for SampleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sample value, discriminated by metric kind.
///
/// Counter, gauge, and timer readings are signed 64-bit integers; set
/// members are arbitrary bytes whose cardinality is what matters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleValue {
    Counter(i64),
    Gauge(i64),
    Timer(i64),
    Set(Bytes),
}

impl SampleValue {
    /// Returns the kind this value belongs to.
    pub fn kind(&self) -> SampleKind {
        match self {
            Self::Counter(_) => SampleKind::Counter,
            Self::Gauge(_) => SampleKind::Gauge,
            Self::Timer(_) => SampleKind::Timer,
            Self::Set(_) => SampleKind::Set,
        }
    }
}

/// One parsed metric sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Metric name; becomes part of the published key path.
    pub bucket: Bytes,
    /// The reading, tagged by kind.
    pub value: SampleValue,
    /// Emitter-declared downsampling factor in (0, 1]. Defaults to 1.0.
    pub sample_rate: f32,
}

/// Parse one datagram payload into samples.
///
/// Splits on newlines, skips empty lines, and logs + drops lines that fail
/// to parse. One bad line does not affect the others; in-datagram order is
/// preserved in the output.
pub fn parse_packet(data: &Bytes) -> Vec<Sample> {
    let mut samples = Vec::new();
    let mut rest = data.clone();

    while !rest.is_empty() {
        let line = match memchr(b'\n', &rest) {
            Some(i) => {
                let line = rest.slice(..i);
                rest = rest.slice(i + 1..);
                line
            }
            None => std::mem::take(&mut rest),
        };

        if line.is_empty() {
            continue;
        }
        match parse_line(&line) {
            Ok(sample) => samples.push(sample),
            Err(e) => warn!(
                error = %e,
                line = %String::from_utf8_lossy(&line),
                "dropping unparsable line",
            ),
        }
    }

    samples
}

/// Parse a single `<bucket>:<value>|<kind>[|@<rate>]` line.
pub fn parse_line(line: &Bytes) -> Result<Sample, ParseError> {
    let colon = memchr(b':', line).ok_or(ParseError::MissingValueSeparator)?;
    if colon == 0 {
        return Err(ParseError::EmptyBucket);
    }

    let value_start = colon + 1;
    let pipe = memchr(b'|', &line[value_start..])
        .ok_or(ParseError::MissingKindSeparator)?
        + value_start;

    let kind_start = pipe + 1;
    let (kind_end, sample_rate) = match memchr(b'|', &line[kind_start..]) {
        None => (line.len(), 1.0),
        Some(i) => {
            let trailer = kind_start + i;
            if line.get(trailer + 1) != Some(&b'@') {
                return Err(ParseError::UnexpectedTrailer);
            }
            (trailer, parse_sample_rate(&line[trailer + 2..]))
        }
    };

    let bucket = line.slice(..colon);
    let value_bytes = line.slice(value_start..pipe);

    let value = match &line[kind_start..kind_end] {
        b"c" => SampleValue::Counter(parse_int(&value_bytes, SampleKind::Counter)?),
        b"g" => SampleValue::Gauge(parse_int(&value_bytes, SampleKind::Gauge)?),
        b"ms" => SampleValue::Timer(parse_int(&value_bytes, SampleKind::Timer)?),
        b"s" => SampleValue::Set(value_bytes),
        token => {
            return Err(ParseError::UnknownKind {
                token: String::from_utf8_lossy(token).into_owned(),
            })
        }
    };

    Ok(Sample {
        bucket,
        value,
        sample_rate,
    })
}

/// Parse a base-10 signed integer value (`-?[0-9]+`).
///
/// Stricter than `i64::from_str`: a leading `+` is rejected, so gauge delta
/// syntax never parses as a plain value.
fn parse_int(bytes: &[u8], kind: SampleKind) -> Result<i64, ParseError> {
    let digits = match bytes {
        [b'-', rest @ ..] => rest,
        rest => rest,
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(invalid_value(kind, bytes));
    }

    // all-ASCII checked above, so from_utf8 cannot fail; parse still can
    // (overflow past 64 bits).
    std::str::from_utf8(bytes)
        .map_err(|_| invalid_value(kind, bytes))?
        .parse::<i64>()
        .map_err(|_| invalid_value(kind, bytes))
}

fn invalid_value(kind: SampleKind, bytes: &[u8]) -> ParseError {
    ParseError::InvalidValue {
        kind,
        text: String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Parse the `@<rate>` payload. Unparseable or meaningless rates (zero,
/// negative, non-finite) fall back to 1.0 so counter scaling stays defined.
fn parse_sample_rate(bytes: &[u8]) -> f32 {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<f32>().ok())
        .filter(|r| r.is_finite() && *r > 0.0)
        .unwrap_or(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn line(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_parse_counter() {
        let sample = parse_line(&line("gorets:1|c")).expect("parses");
        assert_eq!(sample.bucket, "gorets");
        assert_eq!(sample.value, SampleValue::Counter(1));
        assert_eq!(sample.sample_rate, 1.0);
    }

    #[test]
    fn test_parse_counter_with_sample_rate() {
        let sample = parse_line(&line("gorets:1|c|@0.1")).expect("parses");
        assert_eq!(sample.value, SampleValue::Counter(1));
        assert_eq!(sample.sample_rate, 0.1);
    }

    #[test]
    fn test_parse_gauge() {
        let sample = parse_line(&line("glork:320|g")).expect("parses");
        assert_eq!(sample.value, SampleValue::Gauge(320));
    }

    #[test]
    fn test_parse_timer() {
        let sample = parse_line(&line("glork:42|ms")).expect("parses");
        assert_eq!(sample.value, SampleValue::Timer(42));
    }

    #[test]
    fn test_parse_set() {
        let sample = parse_line(&line("uniq:user-42|s")).expect("parses");
        assert_eq!(sample.value, SampleValue::Set(Bytes::from_static(b"user-42")));
    }

    #[test]
    fn test_parse_negative_value() {
        let sample = parse_line(&line("temp:-17|g")).expect("parses");
        assert_eq!(sample.value, SampleValue::Gauge(-17));
    }

    #[test]
    fn test_bucket_ends_at_first_colon() {
        // A set value may itself contain ':'.
        let sample = parse_line(&line("uniq:host:8125|s")).expect("parses");
        assert_eq!(sample.bucket, "uniq");
        assert_eq!(sample.value, SampleValue::Set(Bytes::from_static(b"host:8125")));
    }

    #[test]
    fn test_reject_missing_separators() {
        assert_eq!(
            parse_line(&line("no separators")).unwrap_err(),
            ParseError::MissingValueSeparator,
        );
        assert_eq!(
            parse_line(&line("gorets:1")).unwrap_err(),
            ParseError::MissingKindSeparator,
        );
    }

    #[test]
    fn test_reject_empty_bucket() {
        assert_eq!(parse_line(&line(":1|c")).unwrap_err(), ParseError::EmptyBucket);
    }

    #[test]
    fn test_reject_unknown_kind() {
        assert_eq!(
            parse_line(&line("gorets:1|h")).unwrap_err(),
            ParseError::UnknownKind {
                token: "h".to_string()
            },
        );
        assert!(parse_line(&line("gorets:1|")).is_err());
    }

    #[test]
    fn test_reject_non_numeric_value() {
        assert!(matches!(
            parse_line(&line("gorets:abc|c")).unwrap_err(),
            ParseError::InvalidValue { .. },
        ));
        // Floats were never valid for this wire format.
        assert!(parse_line(&line("glork:3.5|ms")).is_err());
        // Overflow past i64 is rejected, not wrapped.
        assert!(parse_line(&line("gorets:99999999999999999999|c")).is_err());
    }

    #[test]
    fn test_reject_gauge_delta_syntax() {
        assert!(parse_line(&line("glork:+5|g")).is_err());
    }

    #[test]
    fn test_reject_trailing_garbage() {
        assert_eq!(
            parse_line(&line("gorets:1|c|0.1")).unwrap_err(),
            ParseError::UnexpectedTrailer,
        );
    }

    #[test]
    fn test_unparseable_rate_defaults_to_one() {
        let sample = parse_line(&line("gorets:1|c|@banana")).expect("parses");
        assert_eq!(sample.sample_rate, 1.0);

        let sample = parse_line(&line("gorets:1|c|@0")).expect("parses");
        assert_eq!(sample.sample_rate, 1.0);

        let sample = parse_line(&line("gorets:1|c|@-0.5")).expect("parses");
        assert_eq!(sample.sample_rate, 1.0);
    }

    #[test]
    fn test_parse_packet_splits_lines() {
        let samples = parse_packet(&line("gorets:1|c\nglork:320|g\n"));
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].bucket, "gorets");
        assert_eq!(samples[1].bucket, "glork");
    }

    #[test]
    fn test_parse_packet_skips_bad_lines() {
        let samples = parse_packet(&line("good:1|c\nbad line\nalso:2|c\n"));
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].bucket, "good");
        assert_eq!(samples[1].bucket, "also");
    }

    #[test]
    fn test_parse_packet_skips_empty_lines() {
        let samples = parse_packet(&line("\n\ngorets:1|c\n\n"));
        assert_eq!(samples.len(), 1);
    }

    #[test]
    fn test_parse_packet_empty_input() {
        assert!(parse_packet(&Bytes::new()).is_empty());
    }

    #[quickcheck]
    fn parse_packet_is_total(data: Vec<u8>) -> bool {
        // No input bytes may panic the parser.
        let _ = parse_packet(&Bytes::from(data));
        true
    }

    #[quickcheck]
    fn parse_line_roundtrips_counter_values(value: i64, bucket_seed: u8) -> bool {
        let bucket = format!("bucket{bucket_seed}");
        let input = line(&format!("{bucket}:{value}|c"));
        match parse_line(&input) {
            Ok(sample) => {
                sample.bucket == bucket.as_bytes() && sample.value == SampleValue::Counter(value)
            }
            Err(_) => false,
        }
    }
}
