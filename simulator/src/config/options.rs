//! Parsers for the stringly-typed workload and checkpoint option grammars.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::errors::ConfigError;

/// Inter-arrival rewriting of submission times, applied before or after the
/// copy step. `shuffle` alone keeps the original times but reassigns them by
/// a random permutation.
#[derive(Clone, Debug, PartialEq)]
pub struct SubmissionTimeSpec {
    pub distribution: Option<SubmissionDistribution>,
    pub shuffle: bool,
    pub seed: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SubmissionDistribution {
    /// Fixed inter-arrival; zero means "all at zero".
    Fixed(f64),
    /// Inter-arrival drawn from Exponential(1/mean).
    Exponential(f64),
    /// Inter-arrival drawn from Uniform(low, high).
    Uniform(f64, f64),
}

impl FromStr for SubmissionTimeSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |detail: &str| ConfigError::option("--submission-time", format!("'{}': {}", s, detail));
        let tokens: Vec<&str> = s.split(':').collect();

        if tokens[0] == "shuffle" {
            let seed = match tokens.len() {
                1 => None,
                2 => Some(parse_seed(tokens[1], || bad("bad seed"))?),
                _ => return Err(bad("too many fields after 'shuffle'")),
            };
            return Ok(SubmissionTimeSpec {
                distribution: None,
                shuffle: true,
                seed,
            });
        }

        let (distribution, rest) = if tokens.len() >= 2 && (tokens[1] == "fixed" || tokens[1] == "exp") {
            let value: f64 = tokens[0].parse().map_err(|_| bad("bad value"))?;
            let dist = if tokens[1] == "fixed" {
                SubmissionDistribution::Fixed(value)
            } else {
                if value <= 0. {
                    return Err(bad("the exponential mean must be positive"));
                }
                SubmissionDistribution::Exponential(value)
            };
            (dist, &tokens[2..])
        } else if tokens.len() >= 3 && tokens[2] == "unif" {
            let low: f64 = tokens[0].parse().map_err(|_| bad("bad lower bound"))?;
            let high: f64 = tokens[1].parse().map_err(|_| bad("bad upper bound"))?;
            if high < low {
                return Err(bad("the uniform upper bound is below the lower one"));
            }
            (SubmissionDistribution::Uniform(low, high), &tokens[3..])
        } else {
            return Err(bad("expected 'v:fixed', 'v:exp', 'lo:hi:unif' or 'shuffle'"));
        };

        let (shuffle, seed) = parse_suffix(rest, || bad("bad trailing fields"))?;
        Ok(SubmissionTimeSpec {
            distribution: Some(distribution),
            shuffle,
            seed,
        })
    }
}

/// Copy multiplication: `k` clones of the post-step-1 job set with an
/// optional submission-time adjustment.
#[derive(Clone, Debug, PartialEq)]
pub struct CopySpec {
    pub copies: u32,
    pub adjustment: Option<CopyAdjustment>,
    pub seed: Option<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CopyAdjustment {
    pub op: CopyOp,
    pub distribution: CopyDistribution,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyOp {
    Set,
    Add,
    Sub,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CopyDistribution {
    Fixed(f64),
    Exponential(f64),
    Uniform { low: f64, high: f64, scope: DrawScope },
}

/// How often a uniform jitter sample is redrawn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawScope {
    Single,
    EachCopy,
    All,
}

impl FromStr for CopySpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |detail: &str| ConfigError::option("--copy", format!("'{}': {}", s, detail));
        let tokens: Vec<&str> = s.split(':').collect();

        let copies: u32 = tokens[0].parse().map_err(|_| bad("bad copy count"))?;
        if copies == 0 {
            return Err(bad("the copy count must be at least 1"));
        }
        if tokens.len() == 1 {
            return Ok(CopySpec {
                copies,
                adjustment: None,
                seed: None,
            });
        }

        let op = match tokens.get(1) {
            Some(&"=") => CopyOp::Set,
            Some(&"+") => CopyOp::Add,
            Some(&"-") => CopyOp::Sub,
            _ => return Err(bad("expected '=', '+' or '-' after the copy count")),
        };
        let value1: f64 = tokens
            .get(2)
            .ok_or_else(|| bad("missing value"))?
            .parse()
            .map_err(|_| bad("bad value"))?;

        match tokens.get(3) {
            Some(&"fixed") => {
                if tokens.len() > 4 {
                    return Err(bad("nothing may follow 'fixed'"));
                }
                Ok(CopySpec {
                    copies,
                    adjustment: Some(CopyAdjustment {
                        op,
                        distribution: CopyDistribution::Fixed(value1),
                    }),
                    seed: None,
                })
            }
            Some(&"exp") => {
                if op != CopyOp::Set {
                    return Err(bad("'exp' requires the '=' operator"));
                }
                if value1 <= 0. {
                    return Err(bad("the exponential mean must be positive"));
                }
                let seed = match tokens.len() {
                    4 => None,
                    5 => Some(parse_seed(tokens[4], || bad("bad seed"))?),
                    _ => return Err(bad("too many fields after 'exp'")),
                };
                Ok(CopySpec {
                    copies,
                    adjustment: Some(CopyAdjustment {
                        op,
                        distribution: CopyDistribution::Exponential(value1),
                    }),
                    seed,
                })
            }
            Some(value2) => {
                let high: f64 = value2.parse().map_err(|_| bad("bad upper bound"))?;
                if tokens.get(4) != Some(&"unif") {
                    return Err(bad("expected 'unif' after the two bounds"));
                }
                let scope = match tokens.get(5) {
                    Some(&"single") => DrawScope::Single,
                    Some(&"each-copy") => DrawScope::EachCopy,
                    Some(&"all") => DrawScope::All,
                    _ => return Err(bad("expected 'single', 'each-copy' or 'all'")),
                };
                let seed = match tokens.len() {
                    6 => None,
                    7 => Some(parse_seed(tokens[6], || bad("bad seed"))?),
                    _ => return Err(bad("too many fields after the draw scope")),
                };
                Ok(CopySpec {
                    copies,
                    adjustment: Some(CopyAdjustment {
                        op,
                        distribution: CopyDistribution::Uniform {
                            low: value1,
                            high,
                            scope,
                        },
                    }),
                    seed,
                })
            }
            None => Err(bad("missing distribution kind")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointTimeBase {
    Real,
    Simulated,
}

/// `(real|simulated):D-HH:MM:SS[:keep]` simulator-level checkpoint interval.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatsimCheckpointSpec {
    pub time_base: CheckpointTimeBase,
    pub total_seconds: u64,
    pub keep: u32,
}

impl FromStr for BatsimCheckpointSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || {
            ConfigError::option(
                "--checkpoint-batsim-interval",
                format!("'{}' is not a valid \"(real|simulated):D-HH:MM:SS[:keep]\" string", s),
            )
        };
        let tokens: Vec<&str> = s.split(':').collect();
        if tokens.len() != 4 && tokens.len() != 5 {
            return Err(bad());
        }
        let time_base = match tokens[0] {
            "real" => CheckpointTimeBase::Real,
            "simulated" => CheckpointTimeBase::Simulated,
            _ => return Err(bad()),
        };
        let (days, hours) = tokens[1].split_once('-').ok_or_else(bad)?;
        let days: u64 = days.parse().map_err(|_| bad())?;
        let hours: u64 = hours.parse().map_err(|_| bad())?;
        let minutes: u64 = tokens[2].parse().map_err(|_| bad())?;
        let seconds: u64 = tokens[3].parse().map_err(|_| bad())?;
        let keep = match tokens.get(4) {
            Some(k) => k.parse().map_err(|_| bad())?,
            None => 1,
        };
        Ok(BatsimCheckpointSpec {
            time_base,
            total_seconds: seconds + minutes * 60 + hours * 3600 + days * 24 * 3600,
            keep: keep.max(1),
        })
    }
}

/// Scans `ord:{+|-}secs` segments out of the `--reservations-start` string.
/// Segments that do not match are skipped and scanning resumes after them.
pub fn parse_reservation_starts(s: &str) -> BTreeMap<u32, f64> {
    let mut starts = BTreeMap::new();
    for segment in s.split(',') {
        let segment = segment.trim();
        let Some((order, shift)) = segment.split_once(':') else {
            continue;
        };
        let Ok(order) = order.trim().parse::<u32>() else {
            continue;
        };
        let shift = shift.trim();
        let (sign, magnitude) = if let Some(rest) = shift.strip_prefix('+') {
            (1., rest)
        } else if let Some(rest) = shift.strip_prefix('-') {
            (-1., rest)
        } else {
            continue;
        };
        let Ok(seconds) = magnitude.trim().parse::<f64>() else {
            continue;
        };
        starts.insert(order, sign * seconds);
    }
    starts
}

fn parse_suffix(
    rest: &[&str],
    bad: impl Fn() -> ConfigError,
) -> Result<(bool, Option<u64>), ConfigError> {
    match rest {
        [] => Ok((false, None)),
        ["s"] => Ok((true, None)),
        ["s", seed] => Ok((true, Some(parse_seed(seed, &bad)?))),
        [seed] => Ok((false, Some(parse_seed(seed, &bad)?))),
        _ => Err(bad()),
    }
}

fn parse_seed(token: &str, bad: impl Fn() -> ConfigError) -> Result<u64, ConfigError> {
    token.parse().map_err(|_| bad())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_time_grammar() {
        assert_eq!(
            "200.0:exp:s".parse::<SubmissionTimeSpec>().unwrap(),
            SubmissionTimeSpec {
                distribution: Some(SubmissionDistribution::Exponential(200.)),
                shuffle: true,
                seed: None,
            }
        );
        assert_eq!(
            "0:200.0:unif:20".parse::<SubmissionTimeSpec>().unwrap(),
            SubmissionTimeSpec {
                distribution: Some(SubmissionDistribution::Uniform(0., 200.)),
                shuffle: false,
                seed: Some(20),
            }
        );
        assert_eq!(
            "shuffle:42".parse::<SubmissionTimeSpec>().unwrap(),
            SubmissionTimeSpec {
                distribution: None,
                shuffle: true,
                seed: Some(42),
            }
        );
        assert_eq!(
            "100.0:fixed".parse::<SubmissionTimeSpec>().unwrap(),
            SubmissionTimeSpec {
                distribution: Some(SubmissionDistribution::Fixed(100.)),
                shuffle: false,
                seed: None,
            }
        );
        assert!("abc:fixed".parse::<SubmissionTimeSpec>().is_err());
        assert!("10:20:unif:nope".parse::<SubmissionTimeSpec>().is_err());
    }

    #[test]
    fn copy_grammar() {
        assert_eq!(
            "2".parse::<CopySpec>().unwrap(),
            CopySpec { copies: 2, adjustment: None, seed: None }
        );
        assert_eq!(
            "2:+:3:fixed".parse::<CopySpec>().unwrap(),
            CopySpec {
                copies: 2,
                adjustment: Some(CopyAdjustment {
                    op: CopyOp::Add,
                    distribution: CopyDistribution::Fixed(3.),
                }),
                seed: None,
            }
        );
        assert_eq!(
            "3:+:5:10:unif:all:20".parse::<CopySpec>().unwrap(),
            CopySpec {
                copies: 3,
                adjustment: Some(CopyAdjustment {
                    op: CopyOp::Add,
                    distribution: CopyDistribution::Uniform {
                        low: 5.,
                        high: 10.,
                        scope: DrawScope::All,
                    },
                }),
                seed: Some(20),
            }
        );
    }

    #[test]
    fn copy_exp_requires_set_operator() {
        assert!("2:=:100:exp".parse::<CopySpec>().is_ok());
        assert!("2:+:100:exp".parse::<CopySpec>().is_err());
    }

    #[test]
    fn checkpoint_interval_grammar() {
        let spec: BatsimCheckpointSpec = "simulated:0-00:00:30".parse().unwrap();
        assert_eq!(spec.time_base, CheckpointTimeBase::Simulated);
        assert_eq!(spec.total_seconds, 30);
        assert_eq!(spec.keep, 1);

        let spec: BatsimCheckpointSpec = "real:1-02:03:04:5".parse().unwrap();
        assert_eq!(spec.time_base, CheckpointTimeBase::Real);
        assert_eq!(spec.total_seconds, 24 * 3600 + 2 * 3600 + 3 * 60 + 4);
        assert_eq!(spec.keep, 5);

        assert!("sometimes:0-0:0:1".parse::<BatsimCheckpointSpec>().is_err());
        assert!("real:00:00:30".parse::<BatsimCheckpointSpec>().is_err());
    }

    #[test]
    fn reservation_starts_skip_malformed_segments() {
        let starts = parse_reservation_starts("0:+5 , nonsense, 1:-2000");
        assert_eq!(starts.get(&0), Some(&5.));
        assert_eq!(starts.get(&1), Some(&-2000.));
        assert_eq!(starts.len(), 2);
        assert!(parse_reservation_starts("garbage").is_empty());
    }
}
