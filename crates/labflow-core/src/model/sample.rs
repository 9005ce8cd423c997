//! Sample bookkeeping records carried on actions.
//!
//! Samples are validated when they are constructed or deserialized: an
//! unsupported `sample_type` or a structurally malformed list is rejected
//! immediately rather than coerced.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{OrchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleType {
    Liquid,
    Solid,
    Gas,
    Assembly,
}

impl SampleType {
    fn prefix(self) -> &'static str {
        match self {
            SampleType::Liquid => "liquid",
            SampleType::Solid => "solid",
            SampleType::Gas => "gas",
            SampleType::Assembly => "assembly",
        }
    }
}

/// What an action did to a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    Preserved,
    Created,
    Incorporated,
    Recovered,
    Destroyed,
}

/// Whether a sample may pass material to, or take it from, another sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleInheritance {
    AllowBoth,
    GiveOnly,
    ReceiveOnly,
    BlockBoth,
}

/// Direction of a sample relative to an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleIo {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub sample_type: SampleType,
    pub machine: String,
    pub sample_no: u64,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub volume_ml: Option<f64>,
    #[serde(default)]
    pub parts: Vec<Sample>,
    #[serde(default)]
    pub status: Vec<SampleStatus>,
    #[serde(default)]
    pub inheritance: Option<SampleInheritance>,
}

impl Sample {
    pub fn new(sample_type: SampleType, machine: impl Into<String>, sample_no: u64) -> Self {
        Self {
            sample_type,
            machine: machine.into(),
            sample_no,
            label: None,
            volume_ml: None,
            parts: Vec::new(),
            status: Vec::new(),
            inheritance: None,
        }
    }

    /// Build an assembly from its parts, validating each.
    pub fn assembly(machine: impl Into<String>, sample_no: u64, parts: Vec<Sample>) -> Result<Self> {
        let mut sample = Self::new(SampleType::Assembly, machine, sample_no);
        sample.parts = parts;
        sample.validate()?;
        Ok(sample)
    }

    /// Stable identifier across machines: `machine__type__number`.
    pub fn global_label(&self) -> String {
        format!(
            "{}__{}__{}",
            self.machine,
            self.sample_type.prefix(),
            self.sample_no
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.machine.trim().is_empty() {
            return Err(OrchError::Validation(format!(
                "{} sample {} has no machine name",
                self.sample_type.prefix(),
                self.sample_no
            )));
        }
        if let Some(v) = self.volume_ml {
            if !v.is_finite() || v < 0.0 {
                return Err(OrchError::Validation(format!(
                    "sample {} has invalid volume {v}",
                    self.global_label()
                )));
            }
        }
        match self.sample_type {
            SampleType::Assembly => {
                if self.parts.is_empty() {
                    return Err(OrchError::Validation(format!(
                        "assembly {} has no parts",
                        self.global_label()
                    )));
                }
                for part in &self.parts {
                    if part.sample_type == SampleType::Assembly {
                        return Err(OrchError::Validation(format!(
                            "assembly {} cannot contain another assembly",
                            self.global_label()
                        )));
                    }
                    part.validate()?;
                }
            }
            _ => {
                if !self.parts.is_empty() {
                    return Err(OrchError::Validation(format!(
                        "only assemblies have parts, {} has {}",
                        self.global_label(),
                        self.parts.len()
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.global_label())
    }
}

/// Parse and validate a JSON sample list.
pub fn parse_sample_list(value: &Value) -> Result<Vec<Sample>> {
    let Value::Array(items) = value else {
        return Err(OrchError::Validation(format!(
            "sample list must be an array, got {value}"
        )));
    };
    let mut samples = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let sample: Sample = serde_json::from_value(item.clone())
            .map_err(|e| OrchError::Validation(format!("sample {i}: {e}")))?;
        sample.validate()?;
        samples.push(sample);
    }
    Ok(samples)
}

/// `deserialize_with` hook that validates every sample in a list.
pub(crate) fn deserialize_samples<'de, D>(d: D) -> std::result::Result<Vec<Sample>, D::Error>
where
    D: Deserializer<'de>,
{
    let samples: Vec<Sample> = Vec::deserialize(d)?;
    for s in &samples {
        s.validate().map_err(serde::de::Error::custom)?;
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn global_label_format() {
        let s = Sample::new(SampleType::Liquid, "hte-01", 42);
        assert_eq!(s.global_label(), "hte-01__liquid__42");
    }

    #[test]
    fn unsupported_sample_type_is_rejected() {
        let err = parse_sample_list(&json!([
            {"sample_type": "plasma", "machine": "m", "sample_no": 1}
        ]))
        .unwrap_err();
        assert!(matches!(err, OrchError::Validation(_)));
    }

    #[test]
    fn non_array_list_is_rejected() {
        assert!(parse_sample_list(&json!({"sample_type": "solid"})).is_err());
    }

    #[test]
    fn assembly_requires_parts() {
        assert!(Sample::assembly("m", 1, vec![]).is_err());
        let parts = vec![
            Sample::new(SampleType::Solid, "m", 1),
            Sample::new(SampleType::Liquid, "m", 2),
        ];
        let a = Sample::assembly("m", 3, parts).unwrap();
        assert_eq!(a.parts.len(), 2);
    }

    #[test]
    fn parts_on_plain_sample_are_rejected() {
        let mut s = Sample::new(SampleType::Solid, "m", 1);
        s.parts.push(Sample::new(SampleType::Gas, "m", 2));
        assert!(s.validate().is_err());
    }

    #[test]
    fn negative_volume_is_rejected() {
        let mut s = Sample::new(SampleType::Liquid, "m", 1);
        s.volume_ml = Some(-1.0);
        assert!(s.validate().is_err());
    }

    #[test]
    fn action_deserialization_validates_samples() {
        let bad = json!({
            "server": "pstat",
            "operation": "run",
            "samples_in": [{"sample_type": "assembly", "machine": "m", "sample_no": 1}]
        });
        assert!(serde_json::from_value::<crate::model::Action>(bad).is_err());
    }
}
