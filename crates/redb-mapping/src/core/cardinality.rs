//! Rule cardinality inference and validation.
//!
//! All functions here are pure: they look only at item counts and
//! transformation type names, never at storage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MappingError, Result};

/// Structural shape of a rule's source-to-target relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
    /// No source items, one or more target items.
    Generator,
    /// One or more source items, no target items.
    Sink,
}

impl Cardinality {
    pub const ALL: [Cardinality; 6] = [
        Cardinality::OneToOne,
        Cardinality::OneToMany,
        Cardinality::ManyToOne,
        Cardinality::ManyToMany,
        Cardinality::Generator,
        Cardinality::Sink,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Cardinality::OneToOne => "one-to-one",
            Cardinality::OneToMany => "one-to-many",
            Cardinality::ManyToOne => "many-to-one",
            Cardinality::ManyToMany => "many-to-many",
            Cardinality::Generator => "generator",
            Cardinality::Sink => "sink",
        }
    }

    /// Derive the cardinality from item counts. `None` when both are empty.
    pub fn infer(source_count: usize, target_count: usize) -> Option<Cardinality> {
        match (source_count, target_count) {
            (0, 0) => None,
            (0, _) => Some(Cardinality::Generator),
            (_, 0) => Some(Cardinality::Sink),
            (1, 1) => Some(Cardinality::OneToOne),
            (1, _) => Some(Cardinality::OneToMany),
            (_, 1) => Some(Cardinality::ManyToOne),
            _ => Some(Cardinality::ManyToMany),
        }
    }

    /// Human-readable count constraint for error messages.
    fn expectation(&self) -> &'static str {
        match self {
            Cardinality::OneToOne => "exactly 1 source and exactly 1 target item",
            Cardinality::OneToMany => "exactly 1 source and more than 1 target item",
            Cardinality::ManyToOne => "more than 1 source and exactly 1 target item",
            Cardinality::ManyToMany => "more than 1 source and more than 1 target item",
            Cardinality::Generator => "no source items and at least 1 target item",
            Cardinality::Sink => "at least 1 source item and no target items",
        }
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cardinality {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self> {
        Cardinality::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                MappingError::invalid(format!(
                    "unknown cardinality '{}': expected one of {}",
                    s,
                    Cardinality::ALL.map(|c| c.as_str()).join(", ")
                ))
            })
    }
}

/// Label of the inferred cardinality, `"invalid"` when both sides are empty.
pub fn infer_cardinality(source_count: usize, target_count: usize) -> &'static str {
    Cardinality::infer(source_count, target_count)
        .map(|c| c.as_str())
        .unwrap_or("invalid")
}

/// Check that a claimed cardinality label agrees with the actual item counts.
pub fn validate_cardinality(
    label: &str,
    source_count: usize,
    target_count: usize,
) -> Result<Cardinality> {
    let claimed: Cardinality = label.parse()?;
    let actual = Cardinality::infer(source_count, target_count);

    if actual != Some(claimed) {
        return Err(MappingError::invalid(format!(
            "cardinality '{}' requires {}, got {} source and {} target items",
            claimed,
            claimed.expectation(),
            source_count,
            target_count
        )));
    }

    Ok(claimed)
}

/// Declared type of a named transformation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransformationType {
    Generator,
    Sink,
    NullReturning,
    Passthrough,
    Aggregation,
    Merge,
    Split,
    Fanout,
    /// Any type not known to this engine.
    Other(String),
}

impl TransformationType {
    pub fn as_str(&self) -> &str {
        match self {
            TransformationType::Generator => "generator",
            TransformationType::Sink => "sink",
            TransformationType::NullReturning => "null_returning",
            TransformationType::Passthrough => "passthrough",
            TransformationType::Aggregation => "aggregation",
            TransformationType::Merge => "merge",
            TransformationType::Split => "split",
            TransformationType::Fanout => "fanout",
            TransformationType::Other(name) => name,
        }
    }

    /// Cardinalities this type may be used with. `None` means unrestricted.
    pub fn supported_cardinalities(&self) -> Option<&'static [Cardinality]> {
        use Cardinality::*;
        match self {
            TransformationType::Generator => Some(&[Generator]),
            TransformationType::Sink => Some(&[Sink]),
            TransformationType::Passthrough => Some(&[OneToOne, OneToMany]),
            TransformationType::Aggregation | TransformationType::Merge => Some(&[ManyToOne]),
            TransformationType::Split => Some(&[OneToMany]),
            TransformationType::Fanout => Some(&[OneToMany, ManyToMany]),
            TransformationType::NullReturning | TransformationType::Other(_) => None,
        }
    }
}

impl From<&str> for TransformationType {
    fn from(s: &str) -> Self {
        match s {
            "generator" => TransformationType::Generator,
            "sink" => TransformationType::Sink,
            "null_returning" => TransformationType::NullReturning,
            "passthrough" => TransformationType::Passthrough,
            "aggregation" => TransformationType::Aggregation,
            "merge" => TransformationType::Merge,
            "split" => TransformationType::Split,
            "fanout" => TransformationType::Fanout,
            other => TransformationType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for TransformationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TransformationType {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TransformationType {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Ok(TransformationType::from(s.as_str()))
    }
}

/// Check a transformation type against the compatibility table.
///
/// Types absent from the table are accepted with any cardinality.
pub fn validate_transformation_cardinality(
    transformation_type: &str,
    cardinality: Cardinality,
) -> Result<()> {
    let ty = TransformationType::from(transformation_type);
    let Some(supported) = ty.supported_cardinalities() else {
        return Ok(());
    };

    if supported.contains(&cardinality) {
        return Ok(());
    }

    Err(MappingError::invalid(format!(
        "transformation type '{}' does not support cardinality '{}' (supported: {})",
        ty,
        cardinality,
        supported
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_cardinality_labels() {
        assert_eq!(infer_cardinality(0, 3), "generator");
        assert_eq!(infer_cardinality(3, 0), "sink");
        assert_eq!(infer_cardinality(1, 1), "one-to-one");
        assert_eq!(infer_cardinality(1, 3), "one-to-many");
        assert_eq!(infer_cardinality(3, 1), "many-to-one");
        assert_eq!(infer_cardinality(3, 3), "many-to-many");
        assert_eq!(infer_cardinality(0, 0), "invalid");
    }

    #[test]
    fn test_validate_cardinality() {
        assert!(validate_cardinality("one-to-one", 1, 2).is_err());
        assert_eq!(
            validate_cardinality("many-to-one", 2, 1).unwrap(),
            Cardinality::ManyToOne
        );
        assert!(validate_cardinality("generator", 0, 1).is_ok());
        assert!(validate_cardinality("generator", 1, 1).is_err());
        assert!(validate_cardinality("sink", 2, 0).is_ok());
    }

    #[test]
    fn test_validate_cardinality_message_names_counts() {
        let err = validate_cardinality("one-to-one", 1, 2).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("one-to-one"));
        assert!(msg.contains("1 source and 2 target"));
    }

    #[test]
    fn test_validate_cardinality_unknown_label() {
        let err = validate_cardinality("several-to-few", 1, 1).unwrap_err();
        assert!(err.to_string().contains("unknown cardinality"));
    }

    #[test]
    fn test_transformation_cardinality_table() {
        assert!(validate_transformation_cardinality("generator", Cardinality::Generator).is_ok());
        assert!(validate_transformation_cardinality("generator", Cardinality::Sink).is_err());
        assert!(validate_transformation_cardinality("sink", Cardinality::Sink).is_ok());
        assert!(validate_transformation_cardinality("passthrough", Cardinality::OneToMany).is_ok());
        assert!(validate_transformation_cardinality("passthrough", Cardinality::ManyToOne).is_err());
        assert!(validate_transformation_cardinality("aggregation", Cardinality::ManyToOne).is_ok());
        assert!(validate_transformation_cardinality("merge", Cardinality::OneToOne).is_err());
        assert!(validate_transformation_cardinality("split", Cardinality::OneToMany).is_ok());
        assert!(validate_transformation_cardinality("fanout", Cardinality::ManyToMany).is_ok());
        assert!(validate_transformation_cardinality("fanout", Cardinality::OneToOne).is_err());
    }

    #[test]
    fn test_unregistered_transformation_type_accepts_anything() {
        for c in Cardinality::ALL {
            assert!(validate_transformation_cardinality("custom_hash", c).is_ok());
        }
    }

    #[test]
    fn test_transformation_error_lists_supported() {
        let err =
            validate_transformation_cardinality("generator", Cardinality::Sink).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("'generator'"));
        assert!(msg.contains("'sink'"));
        assert!(msg.contains("supported: generator"));
    }

    #[test]
    fn test_empty_sides_force_generator_or_sink() {
        for n in 1..5 {
            assert_eq!(Cardinality::infer(0, n), Some(Cardinality::Generator));
            assert_eq!(Cardinality::infer(n, 0), Some(Cardinality::Sink));
        }
    }

    #[test]
    fn test_cardinality_serde() {
        let json = serde_json::to_string(&Cardinality::ManyToOne).unwrap();
        assert_eq!(json, "\"many-to-one\"");
        assert_eq!("one-to-many".parse::<Cardinality>().unwrap(), Cardinality::OneToMany);
    }
}
