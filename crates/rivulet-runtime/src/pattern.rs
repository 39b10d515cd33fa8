//! MQTT-style topic patterns.
//!
//! A pattern is a `/`-separated topic where a level may be `+` (exactly one
//! non-empty level) and the final level may be `#` (zero or more further
//! levels). `a/#` therefore matches `a`, `a/b` and `a/b/c`.

use std::fmt;

const LEVEL_SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// Error returned when a subscription pattern cannot be compiled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("invalid topic pattern: empty pattern")]
    Empty,
    #[error("invalid topic pattern '{pattern}': '#' must be the last level")]
    MultiLevelNotLast { pattern: String },
    #[error("invalid topic pattern '{pattern}': wildcard '{wildcard}' must occupy a whole level")]
    PartialLevelWildcard { pattern: String, wildcard: char },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Exact(String),
    Single,
}

/// A compiled wildcard topic pattern.
///
/// Matching is pure and allocation-free, so one pattern can be shared
/// across threads and reused for any number of topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    source: String,
    levels: Vec<Level>,
    trailing_multi: bool,
}

impl TopicPattern {
    /// Compile `pattern`, rejecting empty patterns and misplaced wildcards.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        let raw: Vec<&str> = pattern.split(LEVEL_SEPARATOR).collect();
        let last = raw.len() - 1;
        let mut levels = Vec::with_capacity(raw.len());
        let mut trailing_multi = false;

        for (i, level) in raw.iter().enumerate() {
            match *level {
                MULTI_LEVEL if i == last => trailing_multi = true,
                MULTI_LEVEL => {
                    return Err(PatternError::MultiLevelNotLast {
                        pattern: pattern.to_string(),
                    })
                }
                SINGLE_LEVEL => levels.push(Level::Single),
                other => {
                    if other.contains('#') {
                        // a '#' glued to text is rejected the same way whether or not it is last
                        return Err(if i == last {
                            PatternError::PartialLevelWildcard {
                                pattern: pattern.to_string(),
                                wildcard: '#',
                            }
                        } else {
                            PatternError::MultiLevelNotLast {
                                pattern: pattern.to_string(),
                            }
                        });
                    }
                    if other.contains('+') {
                        return Err(PatternError::PartialLevelWildcard {
                            pattern: pattern.to_string(),
                            wildcard: '+',
                        });
                    }
                    levels.push(Level::Exact(other.to_string()));
                }
            }
        }

        Ok(Self {
            source: pattern.to_string(),
            levels,
            trailing_multi,
        })
    }

    /// Whether `topic` contains wildcard tokens and must be compiled.
    pub fn is_wildcard(topic: &str) -> bool {
        topic.contains(['+', '#'])
    }

    /// The pattern text this matcher was compiled from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match a concrete topic against the whole pattern.
    pub fn matches(&self, topic: &str) -> bool {
        let mut parts = topic.split(LEVEL_SEPARATOR);

        for level in &self.levels {
            let Some(part) = parts.next() else {
                return false;
            };
            match level {
                Level::Exact(expected) => {
                    if part != expected {
                        return false;
                    }
                }
                Level::Single => {
                    if part.is_empty() {
                        return false;
                    }
                }
            }
        }

        if self.trailing_multi {
            // '#' alone matches every topic; 'a/#' matches 'a' itself
            true
        } else {
            parts.next().is_none()
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
