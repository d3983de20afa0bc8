//! Closed-interval sets of host indices, rendered as "0-3 7 9-10" on the wire.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::errors::ConfigError;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IntervalSet {
    intervals: Vec<(u32, u32)>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_elements(mut elements: Vec<u32>) -> Self {
        elements.sort_unstable();
        elements.dedup();
        let mut intervals: Vec<(u32, u32)> = Vec::new();
        for e in elements {
            match intervals.last_mut() {
                Some(last) if last.1 + 1 == e => last.1 = e,
                _ => intervals.push((e, e)),
            }
        }
        IntervalSet { intervals }
    }

    pub fn insert(&mut self, element: u32) {
        let mut elements: Vec<u32> = self.iter().collect();
        elements.push(element);
        *self = IntervalSet::from_elements(elements);
    }

    pub fn size(&self) -> u32 {
        self.intervals.iter().map(|(a, b)| b - a + 1).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn contains(&self, element: u32) -> bool {
        self.intervals.iter().any(|&(a, b)| a <= element && element <= b)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.intervals.iter().flat_map(|&(a, b)| a..=b)
    }

    /// n-th element in ascending order.
    pub fn nth(&self, index: u32) -> Option<u32> {
        self.iter().nth(index as usize)
    }
}

impl fmt::Display for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for &(a, b) in &self.intervals {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            if a == b {
                write!(f, "{}", a)?;
            } else {
                write!(f, "{}-{}", a, b)?;
            }
        }
        Ok(())
    }
}

impl FromStr for IntervalSet {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut elements = Vec::new();
        for part in s.split_whitespace() {
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u32 = lo
                        .parse()
                        .map_err(|_| ConfigError::schema(format!("bad interval '{}'", part)))?;
                    let hi: u32 = hi
                        .parse()
                        .map_err(|_| ConfigError::schema(format!("bad interval '{}'", part)))?;
                    if hi < lo {
                        return Err(ConfigError::schema(format!("bad interval '{}'", part)));
                    }
                    elements.extend(lo..=hi);
                }
                None => {
                    let e: u32 = part
                        .parse()
                        .map_err(|_| ConfigError::schema(format!("bad interval '{}'", part)))?;
                    elements.push(e);
                }
            }
        }
        Ok(IntervalSet::from_elements(elements))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_merged_intervals() {
        let set = IntervalSet::from_elements(vec![3, 1, 0, 2, 7, 9, 10]);
        assert_eq!(set.to_string(), "0-3 7 9-10");
        assert_eq!(set.size(), 7);
        assert!(set.contains(9));
        assert!(!set.contains(8));
    }

    #[test]
    fn parses_hyphenated_strings() {
        let set: IntervalSet = "0-1 5".parse().unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 1, 5]);
        assert_eq!(set.nth(2), Some(5));
        assert!("5-2".parse::<IntervalSet>().is_err());
        assert!("x".parse::<IntervalSet>().is_err());
    }

    #[test]
    fn empty_set_round_trip() {
        let set: IntervalSet = "".parse().unwrap();
        assert!(set.is_empty());
        assert_eq!(set.to_string(), "");
    }
}
