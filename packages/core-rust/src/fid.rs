//! Feature-id mapping: external string ids ↔ primary-key column values.
//!
//! Every mapper obeys the round-trip law `decode(encode(pk)) == pk` over its
//! key domain, and `is_valid` rejects anything `decode` would reject, so a
//! crafted id never reaches SQL generation.

use std::fmt;
use std::sync::Arc;

use crate::error::{MappingError, UnsupportedMapping};
use crate::value::Value;

// ---------------------------------------------------------------------------
// KeyType / KeyGeneration
// ---------------------------------------------------------------------------

/// Domain of a single key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// Signed 64-bit integer, canonical decimal form.
    Integer,
    /// Non-empty text.
    Text,
    /// Hyphenated lower-case UUID text.
    Uuid,
}

impl KeyType {
    /// Parses one id component. Non-canonical spellings (`"+5"`, `"05"`,
    /// upper-case UUIDs) are rejected so that encoding the result gives back
    /// the same text.
    fn parse(self, part: &str) -> Option<Value> {
        match self {
            KeyType::Integer => {
                let n: i64 = part.parse().ok()?;
                (n.to_string() == part).then_some(Value::Int(n))
            }
            KeyType::Text => (!part.is_empty()).then(|| Value::String(part.to_string())),
            KeyType::Uuid => {
                let id = uuid::Uuid::parse_str(part).ok()?;
                (id.hyphenated().to_string() == part).then(|| Value::String(part.to_string()))
            }
        }
    }

    fn format(self, value: &Value) -> Result<String, MappingError> {
        let unencodable = |reason: &str| MappingError::Unencodable {
            value: value.to_string(),
            reason: reason.to_string(),
        };
        match (self, value) {
            (KeyType::Integer, Value::Int(n)) => Ok(n.to_string()),
            (KeyType::Text, Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            (KeyType::Text, Value::Int(n)) => Ok(n.to_string()),
            (KeyType::Uuid, Value::String(s)) => self
                .parse(s)
                .map(|_| s.clone())
                .ok_or_else(|| unencodable("not a canonical uuid")),
            (KeyType::Integer, _) => Err(unencodable("expected an integer key")),
            (KeyType::Text, _) => Err(unencodable("expected a non-empty text key")),
            (KeyType::Uuid, _) => Err(unencodable("expected a uuid key")),
        }
    }
}

/// How new primary keys come into existence on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyGeneration {
    /// The database assigns the key (serial/identity column, row id).
    Database,
    /// Keys come from the named sequence.
    Sequence(String),
    /// Keys are ordinary attributes supplied by the caller.
    Assigned,
    /// The table has no key at all.
    None,
}

fn check_arity(expected: usize, key: &[Value]) -> Result<(), MappingError> {
    if key.len() == expected {
        Ok(())
    } else {
        Err(MappingError::Arity {
            expected,
            actual: key.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// FidMapper
// ---------------------------------------------------------------------------

/// Converts between primary-key values of one table and external feature ids.
///
/// Used as `Arc<dyn FidMapper>` inside a [`FeatureType`](crate::FeatureType).
pub trait FidMapper: Send + Sync + fmt::Debug {
    /// Short name of the strategy, used in logs and errors.
    fn kind(&self) -> &'static str;

    /// Key columns in order. Empty when the table has no usable key.
    fn column_names(&self) -> &[String];

    /// Formats key values as a feature id. Never invents keys.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError`] if the values do not fit the key domain.
    fn encode(&self, key: &[Value]) -> Result<String, MappingError>;

    /// Parses a feature id back into key values.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Malformed`] for ids outside the key domain.
    fn decode(&self, fid: &str) -> Result<Vec<Value>, MappingError>;

    fn is_valid(&self, fid: &str) -> bool {
        self.decode(fid).is_ok()
    }

    fn key_generation(&self) -> KeyGeneration;

    /// `false` if decoded keys may point at a different row in another session.
    fn is_durable(&self) -> bool {
        true
    }

    /// Like [`decode`](Self::decode), for callers that need identity stable
    /// across sessions.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Unsupported`] for non-durable strategies.
    fn decode_durable(&self, fid: &str) -> Result<Vec<Value>, MappingError> {
        if self.is_durable() {
            self.decode(fid)
        } else {
            Err(UnsupportedMapping {
                mapper: self.kind(),
                reason: format!("'{fid}' may be reused by the database"),
            }
            .into())
        }
    }
}

// ---------------------------------------------------------------------------
// AutoIncrementFidMapper
// ---------------------------------------------------------------------------

/// Single key column whose values the database assigns.
#[derive(Debug, Clone)]
pub struct AutoIncrementFidMapper {
    columns: Vec<String>,
    key_type: KeyType,
}

impl AutoIncrementFidMapper {
    #[must_use]
    pub fn new(column: impl Into<String>, key_type: KeyType) -> Self {
        Self {
            columns: vec![column.into()],
            key_type,
        }
    }

    /// Serial integer column.
    #[must_use]
    pub fn integer(column: impl Into<String>) -> Self {
        Self::new(column, KeyType::Integer)
    }
}

impl FidMapper for AutoIncrementFidMapper {
    fn kind(&self) -> &'static str {
        "auto-increment"
    }

    fn column_names(&self) -> &[String] {
        &self.columns
    }

    fn encode(&self, key: &[Value]) -> Result<String, MappingError> {
        check_arity(1, key)?;
        self.key_type.format(&key[0])
    }

    fn decode(&self, fid: &str) -> Result<Vec<Value>, MappingError> {
        self.key_type
            .parse(fid)
            .map(|v| vec![v])
            .ok_or_else(|| MappingError::malformed(fid, format!("not a {:?} key", self.key_type)))
    }

    fn key_generation(&self) -> KeyGeneration {
        KeyGeneration::Database
    }
}

// ---------------------------------------------------------------------------
// SequenceFidMapper
// ---------------------------------------------------------------------------

/// Single integer key column fed by a named sequence.
///
/// The mapper only formats and parses; fetching the next value is the
/// store's job (see [`Dialect::next_sequence_value`](crate::Dialect::next_sequence_value)).
#[derive(Debug, Clone)]
pub struct SequenceFidMapper {
    columns: Vec<String>,
    sequence: String,
}

impl SequenceFidMapper {
    #[must_use]
    pub fn new(column: impl Into<String>, sequence: impl Into<String>) -> Self {
        Self {
            columns: vec![column.into()],
            sequence: sequence.into(),
        }
    }

    #[must_use]
    pub fn sequence(&self) -> &str {
        &self.sequence
    }
}

impl FidMapper for SequenceFidMapper {
    fn kind(&self) -> &'static str {
        "sequence"
    }

    fn column_names(&self) -> &[String] {
        &self.columns
    }

    fn encode(&self, key: &[Value]) -> Result<String, MappingError> {
        check_arity(1, key)?;
        KeyType::Integer.format(&key[0])
    }

    fn decode(&self, fid: &str) -> Result<Vec<Value>, MappingError> {
        KeyType::Integer
            .parse(fid)
            .map(|v| vec![v])
            .ok_or_else(|| MappingError::malformed(fid, "not an integer key"))
    }

    fn key_generation(&self) -> KeyGeneration {
        KeyGeneration::Sequence(self.sequence.clone())
    }
}

// ---------------------------------------------------------------------------
// CompositeFidMapper
// ---------------------------------------------------------------------------

/// Several caller-assigned key columns joined with `.`.
#[derive(Debug, Clone)]
pub struct CompositeFidMapper {
    columns: Vec<String>,
    key_types: Vec<KeyType>,
}

impl CompositeFidMapper {
    #[must_use]
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = (S, KeyType)>) -> Self {
        let (columns, key_types) = columns.into_iter().map(|(c, t)| (c.into(), t)).unzip();
        Self { columns, key_types }
    }
}

impl FidMapper for CompositeFidMapper {
    fn kind(&self) -> &'static str {
        "composite"
    }

    fn column_names(&self) -> &[String] {
        &self.columns
    }

    fn encode(&self, key: &[Value]) -> Result<String, MappingError> {
        check_arity(self.key_types.len(), key)?;
        let mut parts = Vec::with_capacity(key.len());
        for (key_type, value) in self.key_types.iter().zip(key) {
            let part = key_type.format(value)?;
            if part.contains('.') {
                return Err(MappingError::Unencodable {
                    value: part,
                    reason: "composite key parts cannot contain '.'".to_string(),
                });
            }
            parts.push(part);
        }
        Ok(parts.join("."))
    }

    fn decode(&self, fid: &str) -> Result<Vec<Value>, MappingError> {
        let parts: Vec<&str> = fid.split('.').collect();
        if parts.len() != self.key_types.len() {
            return Err(MappingError::malformed(
                fid,
                format!("expected {} '.'-separated parts", self.key_types.len()),
            ));
        }
        self.key_types
            .iter()
            .zip(parts)
            .map(|(key_type, part)| {
                key_type
                    .parse(part)
                    .ok_or_else(|| MappingError::malformed(fid, format!("bad part '{part}'")))
            })
            .collect()
    }

    fn key_generation(&self) -> KeyGeneration {
        KeyGeneration::Assigned
    }
}

// ---------------------------------------------------------------------------
// TypedFidMapper
// ---------------------------------------------------------------------------

/// Prefixes ids of an inner mapper with `"<type name>."`.
#[derive(Debug, Clone)]
pub struct TypedFidMapper {
    type_name: String,
    prefix: String,
    inner: Arc<dyn FidMapper>,
}

impl TypedFidMapper {
    #[must_use]
    pub fn new(type_name: impl Into<String>, inner: Arc<dyn FidMapper>) -> Self {
        let type_name = type_name.into();
        let prefix = format!("{type_name}.");
        Self {
            type_name,
            prefix,
            inner,
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[must_use]
    pub fn inner(&self) -> &Arc<dyn FidMapper> {
        &self.inner
    }
}

impl FidMapper for TypedFidMapper {
    fn kind(&self) -> &'static str {
        "typed"
    }

    fn column_names(&self) -> &[String] {
        self.inner.column_names()
    }

    fn encode(&self, key: &[Value]) -> Result<String, MappingError> {
        Ok(format!("{}{}", self.prefix, self.inner.encode(key)?))
    }

    fn decode(&self, fid: &str) -> Result<Vec<Value>, MappingError> {
        let suffix = fid
            .strip_prefix(&self.prefix)
            .ok_or_else(|| MappingError::malformed(fid, format!("missing '{}' prefix", self.prefix)))?;
        self.inner.decode(suffix).map_err(|err| match err {
            MappingError::Malformed { reason, .. } => MappingError::malformed(fid, reason),
            other => other,
        })
    }

    fn key_generation(&self) -> KeyGeneration {
        self.inner.key_generation()
    }

    fn is_durable(&self) -> bool {
        self.inner.is_durable()
    }

    fn decode_durable(&self, fid: &str) -> Result<Vec<Value>, MappingError> {
        if self.inner.is_durable() {
            self.decode(fid)
        } else {
            Err(UnsupportedMapping {
                mapper: self.inner.kind(),
                reason: format!("'{fid}' may be reused by the database"),
            }
            .into())
        }
    }
}

// ---------------------------------------------------------------------------
// OidFidMapper
// ---------------------------------------------------------------------------

/// Uses the database's internal row identity pseudo-column.
///
/// Row ids can be reused after compaction, so decoded values are advisory.
#[derive(Debug, Clone)]
pub struct OidFidMapper {
    columns: Vec<String>,
}

impl OidFidMapper {
    #[must_use]
    pub fn new(pseudo_column: impl Into<String>) -> Self {
        Self {
            columns: vec![pseudo_column.into()],
        }
    }
}

impl Default for OidFidMapper {
    fn default() -> Self {
        Self::new("oid")
    }
}

impl FidMapper for OidFidMapper {
    fn kind(&self) -> &'static str {
        "oid"
    }

    fn column_names(&self) -> &[String] {
        &self.columns
    }

    fn encode(&self, key: &[Value]) -> Result<String, MappingError> {
        check_arity(1, key)?;
        KeyType::Integer.format(&key[0])
    }

    fn decode(&self, fid: &str) -> Result<Vec<Value>, MappingError> {
        KeyType::Integer
            .parse(fid)
            .map(|v| vec![v])
            .ok_or_else(|| MappingError::malformed(fid, "not a row id"))
    }

    fn key_generation(&self) -> KeyGeneration {
        KeyGeneration::Database
    }

    fn is_durable(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// NullFidMapper
// ---------------------------------------------------------------------------

/// For tables without a primary key: ids are random and never decode.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullFidMapper;

impl FidMapper for NullFidMapper {
    fn kind(&self) -> &'static str {
        "null"
    }

    fn column_names(&self) -> &[String] {
        &[]
    }

    fn encode(&self, _key: &[Value]) -> Result<String, MappingError> {
        Ok(format!("fid-{}", uuid::Uuid::new_v4()))
    }

    fn decode(&self, fid: &str) -> Result<Vec<Value>, MappingError> {
        Err(MappingError::malformed(fid, "table has no primary key"))
    }

    fn key_generation(&self) -> KeyGeneration {
        KeyGeneration::None
    }

    fn is_durable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn typed_road() -> TypedFidMapper {
        TypedFidMapper::new("road", Arc::new(AutoIncrementFidMapper::integer("fid")))
    }

    #[test]
    fn integer_ids_reject_non_canonical_text() {
        let m = AutoIncrementFidMapper::integer("fid");
        assert_eq!(m.decode("42").unwrap(), vec![Value::Int(42)]);
        for bad in ["_5", "+5", "05", "", "1 OR 1=1", "4.2"] {
            assert!(!m.is_valid(bad), "{bad} should be invalid");
        }
    }

    #[test]
    fn typed_mapper_checks_prefix_and_inner_domain() {
        let m = typed_road();
        assert_eq!(m.encode(&[Value::Int(7)]).unwrap(), "road.7");
        assert_eq!(m.decode("road.7").unwrap(), vec![Value::Int(7)]);
        assert!(!m.is_valid("river.7"));
        assert!(!m.is_valid("road._5"));
        assert!(!m.is_valid("_5"));
        assert!(matches!(m.decode("road.x"), Err(MappingError::Malformed { fid, .. }) if fid == "road.x"));
    }

    #[test]
    fn uuid_keys() {
        let m = AutoIncrementFidMapper::new("id", KeyType::Uuid);
        let id = "67e55044-10b1-426f-9247-bb680e5fe0c8";
        assert!(m.is_valid(id));
        assert!(!m.is_valid("67E55044-10B1-426F-9247-BB680E5FE0C8"));
        assert!(!m.is_valid("not-a-uuid"));
    }

    #[test]
    fn composite_rejects_dotted_text_parts() {
        let m = CompositeFidMapper::new([("region", KeyType::Text), ("seq", KeyType::Integer)]);
        assert_eq!(m.encode(&["eu".into(), Value::Int(3)]).unwrap(), "eu.3");
        assert!(matches!(
            m.encode(&["e.u".into(), Value::Int(3)]),
            Err(MappingError::Unencodable { .. })
        ));
        assert!(matches!(m.encode(&[Value::Int(3)]), Err(MappingError::Arity { expected: 2, actual: 1 })));
        assert!(!m.is_valid("eu"));
        assert!(!m.is_valid("eu.3.4"));
    }

    #[test]
    fn sequence_mapper_reports_its_sequence() {
        let m = SequenceFidMapper::new("gid", "road_gid_seq");
        assert_eq!(m.key_generation(), KeyGeneration::Sequence("road_gid_seq".into()));
        assert_eq!(m.encode(&[Value::Int(9)]).unwrap(), "9");
    }

    #[test]
    fn oid_is_not_durable() {
        let m = OidFidMapper::default();
        assert_eq!(m.decode("12").unwrap(), vec![Value::Int(12)]);
        assert!(matches!(m.decode_durable("12"), Err(MappingError::Unsupported(_))));
        let typed = TypedFidMapper::new("road", Arc::new(OidFidMapper::default()));
        assert!(matches!(typed.decode_durable("road.12"), Err(MappingError::Unsupported(_))));
    }

    #[test]
    fn null_mapper_never_decodes() {
        let m = NullFidMapper;
        let a = m.encode(&[]).unwrap();
        let b = m.encode(&[]).unwrap();
        assert_ne!(a, b);
        assert!(!m.is_valid(&a));
        assert!(m.column_names().is_empty());
    }

    proptest! {
        #[test]
        fn integer_round_trip(n in any::<i64>()) {
            let m = typed_road();
            let fid = m.encode(&[Value::Int(n)]).unwrap();
            prop_assert_eq!(m.decode(&fid).unwrap(), vec![Value::Int(n)]);
        }

        #[test]
        fn composite_round_trip(region in "[a-z][a-z0-9_-]{0,8}", seq in any::<i64>()) {
            let m = CompositeFidMapper::new([("region", KeyType::Text), ("seq", KeyType::Integer)]);
            let key = vec![Value::String(region), Value::Int(seq)];
            let fid = m.encode(&key).unwrap();
            prop_assert_eq!(m.decode(&fid).unwrap(), key);
        }

        #[test]
        fn underscore_prefixed_ids_are_rejected(n in any::<u32>()) {
            let fid = format!("_{n}");
            prop_assert!(!typed_road().is_valid(&fid));
            prop_assert!(!AutoIncrementFidMapper::integer("fid").is_valid(&fid));
        }
    }
}
