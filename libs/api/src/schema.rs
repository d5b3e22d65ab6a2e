//! Structural schemas and their compatibility merge.
//!
//! A structural schema describes the shape of a kind's objects: nested
//! objects with named properties, arrays, and scalar leaves. Two schemas are
//! compatible when every field they both declare has the same type; the
//! merge is then the union of their fields. A field declared with different
//! types is a conflict and is never resolved by picking one side.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StructuralSchema {
    Object {
        #[serde(default)]
        properties: BTreeMap<String, StructuralSchema>,
    },
    Array {
        items: Box<StructuralSchema>,
    },
    String,
    Integer,
    Number,
    Boolean,
    /// Arbitrary JSON; compatible with anything.
    Any,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("incompatible types at {path}: {left} vs {right}")]
pub struct SchemaConflict {
    /// Dotted path of the field, `.` for the root.
    pub path: String,
    pub left: &'static str,
    pub right: &'static str,
}

impl StructuralSchema {
    pub fn object<I, K>(properties: I) -> Self
    where
        I: IntoIterator<Item = (K, StructuralSchema)>,
        K: Into<String>,
    {
        StructuralSchema::Object {
            properties: properties.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn array(items: StructuralSchema) -> Self {
        StructuralSchema::Array {
            items: Box::new(items),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            StructuralSchema::Object { .. } => "object",
            StructuralSchema::Array { .. } => "array",
            StructuralSchema::String => "string",
            StructuralSchema::Integer => "integer",
            StructuralSchema::Number => "number",
            StructuralSchema::Boolean => "boolean",
            StructuralSchema::Any => "any",
        }
    }

    /// Union of two compatible schemas.
    pub fn merge(&self, other: &StructuralSchema) -> Result<StructuralSchema, SchemaConflict> {
        merge_at(".", self, other)
    }

    /// Merge a non-empty sequence of schemas left to right.
    pub fn merge_all<'a, I>(schemas: I) -> Result<Option<StructuralSchema>, SchemaConflict>
    where
        I: IntoIterator<Item = &'a StructuralSchema>,
    {
        let mut merged: Option<StructuralSchema> = None;
        for schema in schemas {
            merged = Some(match merged {
                None => schema.clone(),
                Some(acc) => acc.merge(schema)?,
            });
        }
        Ok(merged)
    }
}

fn merge_at(
    path: &str,
    left: &StructuralSchema,
    right: &StructuralSchema,
) -> Result<StructuralSchema, SchemaConflict> {
    use StructuralSchema::*;

    match (left, right) {
        (Any, _) | (_, Any) => Ok(Any),
        (Object { properties: l }, Object { properties: r }) => {
            let mut properties = l.clone();
            for (name, schema) in r {
                let merged = match l.get(name) {
                    Some(existing) => merge_at(&child_path(path, name), existing, schema)?,
                    None => schema.clone(),
                };
                properties.insert(name.clone(), merged);
            }
            Ok(Object { properties })
        }
        (Array { items: l }, Array { items: r }) => Ok(Array {
            items: Box::new(merge_at(&format!("{path}[]"), l, r)?),
        }),
        (l, r) if l == r => Ok(l.clone()),
        (l, r) => Err(SchemaConflict {
            path: path.to_string(),
            left: l.type_name(),
            right: r.type_name(),
        }),
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "." {
        format!(".{name}")
    } else {
        format!("{parent}.{name}")
    }
}
