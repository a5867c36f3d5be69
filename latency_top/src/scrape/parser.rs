//! Strict parser for the latency subset of the Prometheus text format
//!
//! Only lines whose metric name begins with one of the recognized prefixes
//! followed by `_` are considered. Every such line must have the shape
//!
//! ```text
//! <name>{<label>="<value>",...} <integer> <integer>
//! ```
//!
//! and anything else is an error. The endpoint is a trusted, versioned
//! source so a deviation from the format is surfaced rather than skipped.
//! <https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md>

use rustc_hash::FxHashMap;

/// Latency families scraped when no prefixes are configured.
pub const DEFAULT_PREFIXES: [&str; 3] = [
    "log_append_latency",
    "log_group_commit_latency",
    "log_sync_latency",
];

/// Label identifying the reporting instance. It is high-cardinality and is
/// never carried into a [`Sample`].
pub const DROPPED_LABEL: &str = "exported_instance";

/// Label name to label value mapping of a single sample
pub type Labels = FxHashMap<String, String>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors that can occur while parsing a snapshot
pub enum Error {
    /// A line passed the prefix filter but is not `name{labels} value timestamp`
    #[error("Malformed metric line {line} ({reason}): {text}")]
    MalformedLine {
        /// 1-based line number in the snapshot text
        line: usize,
        /// The offending line
        text: String,
        /// What part of the grammar failed
        reason: &'static str,
    },
    /// A label segment is not `name="value"`
    #[error("Invalid label on line {line}: {label}")]
    InvalidLabel {
        /// 1-based line number in the snapshot text
        line: usize,
        /// The offending label segment
        label: String,
    },
    /// The same label name appears twice on one line
    #[error("Duplicate label {name} on line {line}")]
    DuplicateLabel {
        /// 1-based line number in the snapshot text
        line: usize,
        /// The repeated label name
        name: String,
    },
    /// A line carries a timestamp different from the first accepted line
    #[error("Timestamp {found} on line {line} differs from snapshot timestamp {expected}")]
    TimestampMismatch {
        /// 1-based line number in the snapshot text
        line: usize,
        /// Timestamp of the first accepted line
        expected: i64,
        /// Timestamp found on this line
        found: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One accepted metric line
pub struct Sample {
    /// The metric name, for instance `log_sync_latency_sum`
    pub metric_name: String,
    /// The labels of the line, without [`DROPPED_LABEL`]
    pub labels: Labels,
    /// The sample value
    pub value: i64,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// The accepted samples of one scrape, in line order
pub struct Snapshot {
    samples: Vec<Sample>,
    timestamp: Option<i64>,
}

impl Snapshot {
    /// The samples of this snapshot
    #[must_use]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// The timestamp shared by every sample, `None` if the snapshot is empty
    #[must_use]
    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no line was accepted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

enum LineError {
    Malformed(&'static str),
    Label(String),
    Duplicate(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Parser for the recognized latency families
pub struct Parser {
    // stored with the trailing underscore
    prefixes: Vec<String>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIXES)
    }
}

impl Parser {
    /// Create a parser accepting metric names that start with one of
    /// `prefixes` immediately followed by `_`
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let prefixes = prefixes
            .into_iter()
            .map(|p| format!("{}_", p.as_ref()))
            .collect();
        Self { prefixes }
    }

    /// Whether `line` is a metric line of a recognized family
    #[must_use]
    pub fn accepts(&self, line: &str) -> bool {
        !line.starts_with('#') && self.prefixes.iter().any(|p| line.starts_with(p.as_str()))
    }

    /// Parse a complete scrape response into a [`Snapshot`]
    ///
    /// # Errors
    ///
    /// Returns an error on the first accepted line that violates the line
    /// grammar, the label grammar, or carries a timestamp different from the
    /// first accepted line.
    pub fn parse_text(&self, text: &str) -> Result<Snapshot, Error> {
        let mut snapshot = Snapshot::default();

        // `\r` is not a line terminator and fails the line grammar
        for (idx, line) in text.split('\n').enumerate() {
            if !self.accepts(line) {
                continue;
            }
            let line_number = idx + 1;

            let sample = parse_metric_line(line).map_err(|e| match e {
                LineError::Malformed(reason) => Error::MalformedLine {
                    line: line_number,
                    text: line.to_string(),
                    reason,
                },
                LineError::Label(label) => Error::InvalidLabel {
                    line: line_number,
                    label,
                },
                LineError::Duplicate(name) => Error::DuplicateLabel {
                    line: line_number,
                    name,
                },
            })?;

            match snapshot.timestamp {
                None => snapshot.timestamp = Some(sample.timestamp),
                Some(expected) if expected != sample.timestamp => {
                    return Err(Error::TimestampMismatch {
                        line: line_number,
                        expected,
                        found: sample.timestamp,
                    });
                }
                Some(_) => {}
            }

            snapshot.samples.push(sample);
        }

        Ok(snapshot)
    }
}

/// Parse `text` with the default latency prefixes
///
/// # Errors
///
/// See [`Parser::parse_text`].
pub fn parse_snapshot(text: &str) -> Result<Snapshot, Error> {
    Parser::default().parse_text(text)
}

fn parse_metric_line(line: &str) -> Result<Sample, LineError> {
    let (name, rest) = line
        .split_once('{')
        .ok_or(LineError::Malformed("missing label set"))?;
    if !is_identifier(name) {
        return Err(LineError::Malformed("invalid metric name"));
    }

    let (labels_str, rest) = rest
        .split_once('}')
        .ok_or(LineError::Malformed("unclosed label set"))?;
    if labels_str.is_empty() {
        return Err(LineError::Malformed("empty label set"));
    }

    let rest = rest
        .strip_prefix(' ')
        .ok_or(LineError::Malformed("missing value"))?;
    let (value, timestamp) = rest
        .split_once(' ')
        .ok_or(LineError::Malformed("missing timestamp"))?;
    let value = parse_integer(value).ok_or(LineError::Malformed("invalid value"))?;
    let timestamp = parse_integer(timestamp).ok_or(LineError::Malformed("invalid timestamp"))?;

    Ok(Sample {
        metric_name: name.to_string(),
        labels: parse_labels(labels_str)?,
        value,
        timestamp,
    })
}

fn parse_labels(labels_str: &str) -> Result<Labels, LineError> {
    let mut labels = Labels::default();

    for label in labels_str.split(',') {
        let (name, value) = label
            .split_once('=')
            .ok_or_else(|| LineError::Label(label.to_string()))?;
        if !is_identifier(name) {
            return Err(LineError::Label(label.to_string()));
        }

        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .filter(|v| !v.is_empty() && !v.contains('"'))
            .ok_or_else(|| LineError::Label(label.to_string()))?;

        if name == DROPPED_LABEL {
            continue;
        }
        if labels.insert(name.to_string(), value.to_string()).is_some() {
            return Err(LineError::Duplicate(name.to_string()));
        }
    }

    Ok(labels)
}

/// `[a-zA-Z_]+`
fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphabetic() || b == b'_')
}

/// `-?[0-9]+`, rejecting anything out of `i64` range
fn parse_integer(s: &str) -> Option<i64> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
