//! Dotted event-name patterns.
//!
//! Subscriptions filter events by patterns like `task.*` or
//! `subtask.unblocked`. A `*` matches exactly one dotted segment; the lone
//! pattern `*` matches every event. There is no multi-segment wildcard —
//! event names in this system are at most three segments deep, and keeping
//! the grammar flat keeps matching allocation-free.

use crate::error::{BusError, BusResult};

/// A compiled subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPattern {
    raw: String,
    segments: Vec<Segment>,
    match_all: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

impl EventPattern {
    /// Compile a pattern, rejecting empty patterns and empty segments.
    pub fn parse(pattern: &str) -> BusResult<Self> {
        if pattern.is_empty() {
            return Err(BusError::InvalidPattern("empty pattern".into()));
        }
        if pattern == "*" {
            return Ok(Self {
                raw: pattern.to_string(),
                segments: Vec::new(),
                match_all: true,
            });
        }

        let segments = pattern
            .split('.')
            .map(|seg| {
                if seg.is_empty() {
                    Err(BusError::InvalidPattern(format!(
                        "empty segment in pattern: {pattern}"
                    )))
                } else if seg == "*" {
                    Ok(Segment::Wildcard)
                } else if seg.contains('*') {
                    Err(BusError::InvalidPattern(format!(
                        "wildcard must stand alone in a segment: {pattern}"
                    )))
                } else {
                    Ok(Segment::Literal(seg.to_string()))
                }
            })
            .collect::<BusResult<Vec<_>>>()?;

        Ok(Self {
            raw: pattern.to_string(),
            segments,
            match_all: false,
        })
    }

    /// Test an event name against this pattern.
    pub fn matches(&self, event_type: &str) -> bool {
        if self.match_all {
            return true;
        }

        let mut parts = event_type.split('.');
        for segment in &self.segments {
            match (parts.next(), segment) {
                (Some(_), Segment::Wildcard) => {}
                (Some(part), Segment::Literal(lit)) if part == lit => {}
                _ => return false,
            }
        }
        parts.next().is_none()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// A set of patterns; an event passes if any pattern matches.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<EventPattern>,
}

impl PatternSet {
    pub fn parse_all<I, S>(patterns: I) -> BusResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| EventPattern::parse(p.as_ref()))
            .collect::<BusResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, event_type: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(event_type))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
