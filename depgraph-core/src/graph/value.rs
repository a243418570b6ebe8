//! Value Identifiers
//!
//! Names for the things flowing through a dependency graph: the targets
//! functions are applied to, the functions themselves, and the values they
//! produce and consume.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies the object a function is applied to (a trade, a curve, a portfolio node).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetSpecification(String);

impl TargetSpecification {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TargetSpecification {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TargetSpecification {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for TargetSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier of a compiled calculation function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(String);

impl FunctionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FunctionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for FunctionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully resolved value: what it is, which target it belongs to, and the
/// properties that distinguish it from other values of the same name.
///
/// Equality is structural, so the same specification built in two cycles
/// compares equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueSpecification {
    name: String,
    target: TargetSpecification,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    properties: BTreeMap<String, String>,
}

impl ValueSpecification {
    pub fn new(name: impl Into<String>, target: impl Into<TargetSpecification>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Add a property, e.g. the currency or curve the value was computed with.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &TargetSpecification {
        &self.target
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

impl fmt::Display for ValueSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.target)?;
        if !self.properties.is_empty() {
            f.write_str("{")?;
            for (i, (key, value)) in self.properties.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{key}={value}")?;
            }
            f.write_str("}")?;
        }
        Ok(())
    }
}

/// What the outside world asked for. A terminal output maps each
/// requirement to the specification that satisfies it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueRequirement {
    name: String,
    target: TargetSpecification,
}

impl ValueRequirement {
    pub fn new(name: impl Into<String>, target: impl Into<TargetSpecification>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &TargetSpecification {
        &self.target
    }

    /// Whether `spec` could satisfy this requirement.
    pub fn is_satisfied_by(&self, spec: &ValueSpecification) -> bool {
        self.name == spec.name() && &self.target == spec.target()
    }
}

impl fmt::Display for ValueRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specifications_compare_structurally() {
        let a = ValueSpecification::new("PV", "SWAP-1").with_property("Currency", "USD");
        let b = ValueSpecification::new("PV", "SWAP-1").with_property("Currency", "USD");
        let c = ValueSpecification::new("PV", "SWAP-1").with_property("Currency", "EUR");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.property("Currency"), Some("USD"));
    }

    #[test]
    fn display_includes_properties() {
        let spec = ValueSpecification::new("Delta", "OPT-7")
            .with_property("Currency", "USD")
            .with_property("Curve", "SOFR");
        assert_eq!(spec.to_string(), "Delta[OPT-7]{Currency=USD,Curve=SOFR}");
        assert_eq!(ValueSpecification::new("PV", "X").to_string(), "PV[X]");
    }

    #[test]
    fn requirement_matches_name_and_target() {
        let requirement = ValueRequirement::new("PV", "SWAP-1");
        assert!(requirement.is_satisfied_by(
            &ValueSpecification::new("PV", "SWAP-1").with_property("Currency", "USD")
        ));
        assert!(!requirement.is_satisfied_by(&ValueSpecification::new("PV", "SWAP-2")));
    }
}
