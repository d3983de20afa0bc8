use std::cell::{Cell, RefCell};

use serde_json::{json, Value};

use crate::errors::ConfigError;

/// One execution primitive. Composite kinds reference other profiles of the
/// same workload by name.
#[derive(Clone, Debug, PartialEq)]
pub enum ProfileData {
    Delay {
        delay: f64,
        /// Original delay before checkpoint augmentation rewrote the visible one.
        real_delay: Option<f64>,
    },
    ParallelHomogeneous {
        cpu: f64,
        com: f64,
        real_cpu: Option<f64>,
    },
    ParallelHeterogeneous {
        cpu: Vec<f64>,
        /// Flattened n*n matrix, row-major.
        com: Vec<f64>,
    },
    Sequence {
        repeat: u32,
        children: Vec<String>,
    },
    Smpi {
        trace_files: Vec<String>,
    },
}

impl ProfileData {
    pub fn from_json(name: &str, value: &Value) -> Result<Self, ConfigError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ConfigError::schema(format!("profile '{}' is not an object", name)))?;
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ConfigError::schema(format!("profile '{}' has no 'type' field", name)))?;

        let number = |field: &str| -> Result<f64, ConfigError> {
            obj.get(field).and_then(Value::as_f64).ok_or_else(|| {
                ConfigError::schema(format!(
                    "profile '{}' has no numeric '{}' field",
                    name, field
                ))
            })
        };
        let opt_number = |field: &str| obj.get(field).and_then(Value::as_f64);

        match kind {
            "delay" => Ok(ProfileData::Delay {
                delay: number("delay")?,
                real_delay: opt_number("real_delay").or_else(|| opt_number("original_delay")),
            }),
            "parallel_homogeneous" => Ok(ProfileData::ParallelHomogeneous {
                cpu: number("cpu")?,
                com: opt_number("com").unwrap_or(0.),
                real_cpu: opt_number("real_cpu").or_else(|| opt_number("original_cpu")),
            }),
            "parallel" => {
                let cpu = number_array(name, obj.get("cpu"), "cpu")?;
                let com = number_array(name, obj.get("com"), "com")?;
                if com.len() != cpu.len() * cpu.len() {
                    return Err(ConfigError::schema(format!(
                        "profile '{}': 'com' must be a {n}x{n} matrix (got {} values)",
                        name,
                        com.len(),
                        n = cpu.len()
                    )));
                }
                Ok(ProfileData::ParallelHeterogeneous { cpu, com })
            }
            "composed" | "sequence" => {
                let seq = obj
                    .get("seq")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        ConfigError::schema(format!("profile '{}' has no 'seq' array", name))
                    })?
                    .iter()
                    .map(|v| {
                        v.as_str().map(str::to_string).ok_or_else(|| {
                            ConfigError::schema(format!(
                                "profile '{}': 'seq' entries must be strings",
                                name
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let repeat = obj.get("repeat").and_then(Value::as_u64).unwrap_or(1) as u32;
                Ok(ProfileData::Sequence {
                    repeat,
                    children: seq,
                })
            }
            "smpi" => {
                let trace_files = match obj.get("trace_files") {
                    Some(v) => number_free_string_array(name, v)?,
                    None => match obj.get("trace").and_then(Value::as_str) {
                        Some(t) => vec![t.to_string()],
                        None => {
                            return Err(ConfigError::schema(format!(
                                "profile '{}' has neither 'trace_files' nor 'trace'",
                                name
                            )))
                        }
                    },
                };
                Ok(ProfileData::Smpi { trace_files })
            }
            other => Err(ConfigError::schema(format!(
                "profile '{}' has an unknown type '{}'",
                name, other
            ))),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ProfileData::Delay { .. } => "delay",
            ProfileData::ParallelHomogeneous { .. } => "parallel_homogeneous",
            ProfileData::ParallelHeterogeneous { .. } => "parallel",
            ProfileData::Sequence { .. } => "composed",
            ProfileData::Smpi { .. } => "smpi",
        }
    }

    pub fn is_parallel(&self) -> bool {
        matches!(
            self,
            ProfileData::ParallelHomogeneous { .. } | ProfileData::ParallelHeterogeneous { .. }
        )
    }

    /// Raw work expressed in seconds on one host of the given speed.
    pub fn raw_work_seconds(&self, host_speed: f64) -> Option<f64> {
        match self {
            ProfileData::Delay { delay, .. } => Some(*delay),
            ProfileData::ParallelHomogeneous { cpu, .. } => Some(cpu / host_speed),
            _ => None,
        }
    }
}

fn number_array(name: &str, value: Option<&Value>, field: &str) -> Result<Vec<f64>, ConfigError> {
    value
        .and_then(Value::as_array)
        .ok_or_else(|| ConfigError::schema(format!("profile '{}' has no '{}' array", name, field)))?
        .iter()
        .map(|v| {
            v.as_f64().ok_or_else(|| {
                ConfigError::schema(format!(
                    "profile '{}': '{}' entries must be numbers",
                    name, field
                ))
            })
        })
        .collect()
}

fn number_free_string_array(name: &str, value: &Value) -> Result<Vec<String>, ConfigError> {
    value
        .as_array()
        .ok_or_else(|| ConfigError::schema(format!("profile '{}': 'trace_files' must be an array", name)))?
        .iter()
        .map(|v| {
            v.as_str().map(str::to_string).ok_or_else(|| {
                ConfigError::schema(format!("profile '{}': trace file names must be strings", name))
            })
        })
        .collect()
}

/// An interned profile. The registry hands out `Rc<Profile>` handles; the
/// reference count tracks how many jobs and sequence children keep it alive.
#[derive(Debug)]
pub struct Profile {
    pub name: String,
    pub workload: String,
    pub data: RefCell<ProfileData>,
    pub json: RefCell<Value>,
    references: Cell<u32>,
}

impl Profile {
    pub fn new(workload: &str, name: &str, json: Value) -> Result<Profile, ConfigError> {
        let data = ProfileData::from_json(name, &json)?;
        Ok(Profile {
            name: name.to_string(),
            workload: workload.to_string(),
            data: RefCell::new(data),
            json: RefCell::new(json),
            references: Cell::new(0),
        })
    }

    pub fn references(&self) -> u32 {
        self.references.get()
    }

    pub fn acquire(&self) {
        self.references.set(self.references.get() + 1);
    }

    pub fn release(&self) {
        let refs = self.references.get();
        if refs > 0 {
            self.references.set(refs - 1);
        }
    }

    /// Rewrites the visible work and keeps the JSON description in sync.
    /// `original` is preserved into the `original_*` field the first time.
    pub fn rewrite_work(&self, new_work: f64, original: Option<f64>) {
        let mut data = self.data.borrow_mut();
        let mut json = self.json.borrow_mut();
        match &mut *data {
            ProfileData::Delay { delay, real_delay } => {
                *delay = new_work;
                json["delay"] = json!(new_work);
                if let Some(orig) = original {
                    *real_delay = Some(orig);
                    json["original_delay"] = json!(orig);
                }
            }
            ProfileData::ParallelHomogeneous { cpu, real_cpu, .. } => {
                *cpu = new_work;
                json["cpu"] = json!(new_work);
                if let Some(orig) = original {
                    *real_cpu = Some(orig);
                    json["original_cpu"] = json!(orig);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_every_kind() {
        let d = ProfileData::from_json("d", &json!({"type": "delay", "delay": 10.0})).unwrap();
        assert_eq!(d, ProfileData::Delay { delay: 10., real_delay: None });

        let p = ProfileData::from_json(
            "p",
            &json!({"type": "parallel_homogeneous", "cpu": 1e9, "com": 4.0}),
        )
        .unwrap();
        assert!(p.is_parallel());
        assert_eq!(p.raw_work_seconds(1e8), Some(10.));

        let h = ProfileData::from_json(
            "h",
            &json!({"type": "parallel", "cpu": [1.0, 2.0], "com": [0.0, 1.0, 1.0, 0.0]}),
        )
        .unwrap();
        assert!(matches!(h, ProfileData::ParallelHeterogeneous { .. }));

        let s = ProfileData::from_json(
            "s",
            &json!({"type": "composed", "repeat": 2, "seq": ["a", "b"]}),
        )
        .unwrap();
        assert_eq!(
            s,
            ProfileData::Sequence { repeat: 2, children: vec!["a".into(), "b".into()] }
        );

        let m = ProfileData::from_json("m", &json!({"type": "smpi", "trace": "t.txt"})).unwrap();
        assert_eq!(m, ProfileData::Smpi { trace_files: vec!["t.txt".into()] });
    }

    #[test]
    fn rejects_unknown_kind_and_missing_fields() {
        assert!(ProfileData::from_json("x", &json!({"type": "mystery"})).is_err());
        assert!(ProfileData::from_json("x", &json!({"type": "delay"})).is_err());
        assert!(ProfileData::from_json("x", &json!({"delay": 3.0})).is_err());
    }

    #[test]
    fn rejects_non_square_com_matrix() {
        let result = ProfileData::from_json(
            "h",
            &json!({"type": "parallel", "cpu": [1.0, 2.0], "com": [0.0, 1.0]}),
        );
        assert!(result.is_err());
    }

    #[test]
    fn rewrite_preserves_original_work() {
        let profile = Profile::new("w0", "d", json!({"type": "delay", "delay": 10.0})).unwrap();
        profile.rewrite_work(13.0, Some(10.0));
        assert_eq!(
            *profile.data.borrow(),
            ProfileData::Delay { delay: 13., real_delay: Some(10.) }
        );
        assert_eq!(profile.json.borrow()["original_delay"], json!(10.0));
    }
}
