// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Data-format schemas: the ordered list of `(field, wire type, rank)`
//! triples controlling how a decoded record is projected into the consumer's
//! buffers. Each decoder defines its own field universe and the rank each
//! field must be read at; the consumer may replace the schema between
//! acquisitions with a JSON array of `{"name", "type", "dim"}` descriptors.

use serde_derive::Deserialize;
use serde_derive::Serialize;

use crate::prelude::*;

/// Wire types a schema may project into. `LONG DOUBLE` (spelled with a space)
/// is accepted for compatibility and stored at `f64` precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    #[serde(rename = "CHAR")]
    Char,
    #[serde(rename = "BOOL")]
    Bool,
    #[serde(rename = "SIZE_T")]
    SizeT,
    #[serde(rename = "PTRDIFF_T")]
    PtrdiffT,
    #[serde(rename = "FLOAT")]
    Float,
    #[serde(rename = "DOUBLE")]
    Double,
    #[serde(rename = "LONG DOUBLE")]
    LongDouble,
}

/// A decoder's field universe. Implementations are plain field enums with the
/// uppercase names used in the JSON descriptors.
pub trait FormatField: Copy + Eq + Sized + Send + 'static {
    fn parse(name: &str) -> Option<Self>;
    fn name(self) -> &'static str;
    /// Mandated rank, 0 = scalar, 1 = array, 2 = matrix.
    fn rank(self) -> u8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaEntry<F> {
    pub field: F,
    pub ty: WireType,
    pub rank: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema<F> {
    entries: Vec<SchemaEntry<F>>,
}

#[derive(Serialize, Deserialize)]
struct RawEntry {
    name: String,
    #[serde(rename = "type")]
    ty: WireType,
    #[serde(skip_serializing_if = "Option::is_none")]
    dim: Option<u8>,
}

impl<F: FormatField> Schema<F> {
    /// Build a schema from `(field, type)` pairs; ranks are the mandated
    /// ones. Used for the per-decoder defaults.
    pub fn of(entries: &[(F, WireType)]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|&(field, ty)| SchemaEntry {
                    field,
                    ty,
                    rank: field.rank(),
                })
                .collect(),
        }
    }

    pub fn entries(&self) -> &[SchemaEntry<F>] {
        &self.entries
    }

    pub fn parse(json: &str) -> Result<Self> {
        let raw: Vec<RawEntry> = serde_json::from_str(json)
            .map_err(|err| Error::InvalidArgument(format!("invalid data format: {err}")))?;
        let mut entries = Vec::with_capacity(raw.len());
        for item in raw {
            let field = F::parse(&item.name)
                .ok_or_else(|| Error::InvalidArgument(format!("unsupported name: {}", item.name)))?;
            let rank = field.rank();
            if let Some(dim) = item.dim {
                if dim != rank {
                    return Err(Error::InvalidArgument(format!(
                        "field {} requires dim {rank}, got {dim}",
                        item.name
                    )));
                }
            }
            entries.push(SchemaEntry {
                field,
                ty: item.ty,
                rank,
            });
        }
        Ok(Self { entries })
    }

    pub fn to_json(&self) -> String {
        let raw: Vec<RawEntry> = self
            .entries
            .iter()
            .map(|entry| RawEntry {
                name: entry.field.name().to_owned(),
                ty: entry.ty,
                dim: Some(entry.rank),
            })
            .collect();
        serde_json::to_string(&raw).expect("schema serialization cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TestField {
        Timestamp,
        Waveform,
    }

    impl FormatField for TestField {
        fn parse(name: &str) -> Option<Self> {
            match name {
                "TIMESTAMP" => Some(Self::Timestamp),
                "WAVEFORM" => Some(Self::Waveform),
                _ => None,
            }
        }

        fn name(self) -> &'static str {
            match self {
                Self::Timestamp => "TIMESTAMP",
                Self::Waveform => "WAVEFORM",
            }
        }

        fn rank(self) -> u8 {
            match self {
                Self::Timestamp => 0,
                Self::Waveform => 2,
            }
        }
    }

    #[test]
    fn test_parse_and_roundtrip() {
        let json = r#"[
            {"name":"TIMESTAMP","type":"U64"},
            {"name":"WAVEFORM","type":"U16","dim":2}
        ]"#;
        let schema: Schema<TestField> = Schema::parse(json).unwrap();
        assert_eq!(schema.entries().len(), 2);
        assert_eq!(schema.entries()[0].field, TestField::Timestamp);
        assert_eq!(schema.entries()[0].rank, 0);
        assert_eq!(schema.entries()[1].ty, WireType::U16);

        let reparsed: Schema<TestField> = Schema::parse(&schema.to_json()).unwrap();
        assert_eq!(reparsed, schema);
    }

    #[test]
    fn test_unknown_name_rejected() {
        let err =
            Schema::<TestField>::parse(r#"[{"name":"NOPE","type":"U8"}]"#).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_wrong_dim_rejected() {
        let err = Schema::<TestField>::parse(r#"[{"name":"TIMESTAMP","type":"U64","dim":1}]"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_long_double_spelling() {
        let schema: Schema<TestField> =
            Schema::parse(r#"[{"name":"TIMESTAMP","type":"LONG DOUBLE"}]"#).unwrap();
        assert_eq!(schema.entries()[0].ty, WireType::LongDouble);
    }

    #[test]
    fn test_default_schema_uses_mandated_ranks() {
        let schema = Schema::of(&[
            (TestField::Timestamp, WireType::U64),
            (TestField::Waveform, WireType::U16),
        ]);
        assert_eq!(schema.entries()[0].rank, 0);
        assert_eq!(schema.entries()[1].rank, 2);
    }
}
