// datamodel.rs — Data-class repository
//
// Maps a data type name to its ordered, typed properties. The compiler only
// reads it: shuffle keys are resolved here by property name.
//
// Preconditions: none.
// Postconditions: property order is declaration order; class names are unique.
// Failure modes: malformed JSON or duplicate class names → `DataModelError`.
// Side effects: none.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::DataType;

/// Primitive type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Boolean,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Decimal,
    Text,
    Date,
    DateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: PropertyType,
}

impl Property {
    pub fn new(name: impl Into<String>, ty: PropertyType) -> Self {
        Property {
            name: name.into(),
            ty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataClass {
    pub name: String,
    pub properties: Vec<Property>,
}

impl DataClass {
    pub fn new(name: impl Into<String>) -> Self {
        DataClass {
            name: name.into(),
            properties: Vec::new(),
        }
    }

    pub fn with(mut self, name: &str, ty: PropertyType) -> Self {
        self.properties.push(Property::new(name, ty));
        self
    }

    /// Property named exactly `name`.
    pub fn find_property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Error)]
pub enum DataModelError {
    #[error("data class `{0}` is defined more than once")]
    Duplicate(String),
    #[error("invalid data class manifest: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read-only lookup of data classes by type name.
#[derive(Debug, Clone, Default)]
pub struct DataClassRegistry {
    classes: BTreeMap<String, DataClass>,
}

impl DataClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: DataClass) -> Result<(), DataModelError> {
        if self.classes.contains_key(&class.name) {
            return Err(DataModelError::Duplicate(class.name));
        }
        self.classes.insert(class.name.clone(), class);
        Ok(())
    }

    /// Class describing `ty`, if known.
    pub fn load(&self, ty: &DataType) -> Option<&DataClass> {
        self.classes.get(ty.as_str())
    }

    /// Parse a JSON array of data classes.
    pub fn from_json(source: &str) -> Result<Self, DataModelError> {
        let classes: Vec<DataClass> = serde_json::from_str(source)?;
        Self::from_classes(classes)
    }

    pub fn from_classes(classes: Vec<DataClass>) -> Result<Self, DataModelError> {
        let mut registry = Self::new();
        for class in classes {
            registry.register(class)?;
        }
        Ok(registry)
    }

    /// Deterministic JSON form, sorted by class name, for provenance hashing.
    pub fn canonical_json(&self) -> String {
        let classes: Vec<&DataClass> = self.classes.values().collect();
        serde_json::to_string(&classes).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_json_keeps_property_order() {
        let reg = DataClassRegistry::from_json(
            r#"[{"name":"Sales","properties":[
                {"name":"store","type":"text"},
                {"name":"amount","type":"long"},
                {"name":"sold_at","type":"date_time"}]}]"#,
        )
        .unwrap();
        let sales = reg.load(&DataType::new("Sales")).unwrap();
        let names: Vec<_> = sales.properties.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["store", "amount", "sold_at"]);
        assert_eq!(sales.find_property("sold_at").unwrap().ty, PropertyType::DateTime);
        assert!(sales.find_property("Store").is_none());
    }

    #[test]
    fn duplicate_class_is_rejected() {
        let err = DataClassRegistry::from_classes(vec![DataClass::new("A"), DataClass::new("A")])
            .unwrap_err();
        assert!(matches!(err, DataModelError::Duplicate(name) if name == "A"));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            DataClassRegistry::from_json("[{\"name\":1}]"),
            Err(DataModelError::Json(_))
        ));
    }

    #[test]
    fn canonical_json_is_order_independent() {
        let a = DataClassRegistry::from_classes(vec![
            DataClass::new("B").with("x", PropertyType::Int),
            DataClass::new("A"),
        ])
        .unwrap();
        let b = DataClassRegistry::from_classes(vec![
            DataClass::new("A"),
            DataClass::new("B").with("x", PropertyType::Int),
        ])
        .unwrap();
        assert_eq!(a.canonical_json(), b.canonical_json());
        assert!(a.canonical_json().starts_with(r#"[{"name":"A""#));
    }
}
