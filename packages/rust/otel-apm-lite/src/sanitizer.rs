//! Bounded, failure-proof conversion of captured values into JSON.
//!
//! Captured values are first lifted into a [`Variable`], a closed set of
//! shapes (scalars, sequences, mappings, typed records, opaque objects and
//! unserializable handles). The [`Sanitizer`] then walks that tree with a depth
//! limit and a string length limit and produces a `serde_json::Value`.
//!
//! Sanitizing never fails. Depth overflow truncates silently: collections become
//! empty and objects collapse to a `{"__type": ...}` marker. Anything that cannot be
//! represented in JSON is replaced with a `"[<type>]"` placeholder.
//!
//! ```
//! use otel_apm_lite::sanitizer::{Sanitizer, Variable};
//! use serde_json::json;
//!
//! let sanitizer = Sanitizer::new(3, 8);
//! let value = Variable::from(vec!["short", "much longer text"]);
//! assert_eq!(sanitizer.sanitize(&value), json!(["short", "much lon..."]));
//! ```

use crate::constants::defaults;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, HashMap};

/// Suffix appended to truncated strings.
pub const ELLIPSIS: &str = "...";

/// Key carrying the type name of records and objects.
pub const TYPE_KEY: &str = "__type";

/// Named variables captured at a breakpoint, in capture order.
pub type Variables = IndexMap<String, Variable>;

/// A scalar leaf value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
}

/// A captured value, classified once at the capture boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Variable {
    Scalar(Scalar),
    Sequence(Vec<Variable>),
    Mapping(Vec<(String, Variable)>),
    /// A data record / model instance with an identifier.
    Record {
        type_name: String,
        id: Option<Scalar>,
        attributes: Vec<(String, Variable)>,
    },
    /// Any other object, described by its public fields.
    Object {
        type_name: String,
        fields: Vec<(String, Variable)>,
    },
    /// A value that cannot be serialized, such as a file or socket handle.
    Unserializable { type_name: String },
}

/// Types backed by a persistent record, exposing an identifier and an attribute map.
pub trait Model {
    fn model_name(&self) -> String;

    fn model_key(&self) -> Option<Scalar>;

    fn attribute_map(&self) -> Vec<(String, Variable)>;
}

impl Variable {
    /// Captures any `Serialize` value. Values whose serialization fails become
    /// an unserializable placeholder carrying the Rust type name.
    pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(json) => Variable::from(json),
            Err(e) => {
                tracing::debug!(error = %e, type_name = std::any::type_name::<T>(), "Value failed to serialize");
                Variable::opaque::<T>()
            }
        }
    }

    /// Captures a model through its attribute map.
    pub fn model<M: Model + ?Sized>(model: &M) -> Self {
        Variable::Record {
            type_name: model.model_name(),
            id: model.model_key(),
            attributes: model.attribute_map(),
        }
    }

    /// An object described only by its type name and the given public fields.
    pub fn object<K, V>(type_name: impl Into<String>, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Variable>,
    {
        Variable::Object {
            type_name: type_name.into(),
            fields: fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// A value that is never inspected: only its type name is kept.
    pub fn opaque<T: ?Sized>() -> Self {
        Variable::Unserializable {
            type_name: std::any::type_name::<T>().to_string(),
        }
    }
}

impl From<Value> for Variable {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Variable::Scalar(Scalar::Null),
            Value::Bool(b) => Variable::Scalar(Scalar::Bool(b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Variable::Scalar(Scalar::Int(i))
                } else if let Some(u) = n.as_u64() {
                    Variable::Scalar(Scalar::UInt(u))
                } else {
                    Variable::Scalar(Scalar::Float(n.as_f64().unwrap_or(f64::NAN)))
                }
            }
            Value::String(s) => Variable::Scalar(Scalar::String(s)),
            Value::Array(items) => Variable::Sequence(items.into_iter().map(Variable::from).collect()),
            Value::Object(map) => {
                Variable::Mapping(map.into_iter().map(|(k, v)| (k, Variable::from(v))).collect())
            }
        }
    }
}

impl From<Scalar> for Variable {
    fn from(value: Scalar) -> Self {
        Variable::Scalar(value)
    }
}

impl From<&str> for Variable {
    fn from(value: &str) -> Self {
        Variable::Scalar(Scalar::String(value.to_string()))
    }
}

impl From<String> for Variable {
    fn from(value: String) -> Self {
        Variable::Scalar(Scalar::String(value))
    }
}

impl From<&String> for Variable {
    fn from(value: &String) -> Self {
        Variable::Scalar(Scalar::String(value.clone()))
    }
}

impl From<bool> for Variable {
    fn from(value: bool) -> Self {
        Variable::Scalar(Scalar::Bool(value))
    }
}

macro_rules! impl_from_int {
    ($variant:ident, $target:ty; $($t:ty),*) => {
        $(
            impl From<$t> for Variable {
                fn from(value: $t) -> Self {
                    Variable::Scalar(Scalar::$variant(value as $target))
                }
            }
        )*
    };
}

impl_from_int!(Int, i64; i8, i16, i32, i64, isize);
impl_from_int!(UInt, u64; u8, u16, u32, u64, usize);

impl From<f32> for Variable {
    fn from(value: f32) -> Self {
        Variable::Scalar(Scalar::Float(value.into()))
    }
}

impl From<f64> for Variable {
    fn from(value: f64) -> Self {
        Variable::Scalar(Scalar::Float(value))
    }
}

impl<T: Into<Variable>> From<Option<T>> for Variable {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => Variable::Scalar(Scalar::Null),
        }
    }
}

impl<T: Into<Variable>> From<Vec<T>> for Variable {
    fn from(value: Vec<T>) -> Self {
        Variable::Sequence(value.into_iter().map(Into::into).collect())
    }
}

impl<K: Into<String>, V: Into<Variable>> From<HashMap<K, V>> for Variable {
    fn from(value: HashMap<K, V>) -> Self {
        let mut entries: Vec<(String, Variable)> =
            value.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Variable::Mapping(entries)
    }
}

impl<K: Into<String>, V: Into<Variable>> From<BTreeMap<K, V>> for Variable {
    fn from(value: BTreeMap<K, V>) -> Self {
        Variable::Mapping(value.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Builds a [`Variables`] map.
///
/// ```
/// use otel_apm_lite::variables;
///
/// let order_id = 42;
/// let vars = variables! { "order_id" => order_id, "note" => "gift" };
/// assert_eq!(vars.len(), 2);
/// ```
#[macro_export]
macro_rules! variables {
    () => {
        $crate::sanitizer::Variables::new()
    };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut vars = $crate::sanitizer::Variables::new();
        $(
            vars.insert(
                ::std::string::String::from($name),
                $crate::sanitizer::Variable::from($value),
            );
        )+
        vars
    }};
}

/// Depth- and length-bounded JSON converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sanitizer {
    max_depth: usize,
    max_length: usize,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(defaults::MAX_DEPTH, defaults::MAX_STRING_LENGTH)
    }
}

impl Sanitizer {
    pub fn new(max_depth: usize, max_length: usize) -> Self {
        Self {
            max_depth,
            max_length,
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Sanitizes a value starting at depth zero.
    pub fn sanitize(&self, value: &Variable) -> Value {
        self.sanitize_at(value, 0)
    }

    /// Sanitizes every named variable, each starting at depth zero.
    pub fn sanitize_variables(&self, variables: &Variables) -> Map<String, Value> {
        variables
            .iter()
            .map(|(name, value)| (name.clone(), self.sanitize(value)))
            .collect()
    }

    /// Sanitizes a value found at `depth`.
    pub fn sanitize_at(&self, value: &Variable, depth: usize) -> Value {
        let exhausted = depth >= self.max_depth;
        match value {
            Variable::Scalar(scalar) => self.scalar(scalar),
            Variable::Sequence(_) if exhausted => Value::Array(Vec::new()),
            Variable::Sequence(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.sanitize_at(item, depth + 1))
                    .collect(),
            ),
            Variable::Mapping(_) if exhausted => Value::Object(Map::new()),
            Variable::Mapping(entries) => Value::Object(self.entries(entries, depth + 1)),
            Variable::Record { type_name, .. } | Variable::Object { type_name, .. } if exhausted => {
                type_marker(type_name)
            }
            Variable::Record {
                type_name,
                id,
                attributes,
            } => {
                let mut map = Map::new();
                map.insert(TYPE_KEY.to_string(), Value::String(type_name.clone()));
                map.insert(
                    "id".to_string(),
                    id.as_ref().map(|id| self.scalar(id)).unwrap_or(Value::Null),
                );
                map.insert(
                    "attributes".to_string(),
                    Value::Object(self.entries(attributes, depth + 1)),
                );
                Value::Object(map)
            }
            Variable::Object { type_name, fields } => {
                let mut map = Map::new();
                map.insert(TYPE_KEY.to_string(), Value::String(type_name.clone()));
                map.insert(
                    "properties".to_string(),
                    Value::Object(self.entries(fields, depth + 1)),
                );
                Value::Object(map)
            }
            Variable::Unserializable { type_name } => placeholder(type_name),
        }
    }

    fn entries(&self, entries: &[(String, Variable)], depth: usize) -> Map<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.clone(), self.sanitize_at(v, depth)))
            .collect()
    }

    fn scalar(&self, scalar: &Scalar) -> Value {
        match scalar {
            Scalar::Null => Value::Null,
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Int(i) => Value::Number((*i).into()),
            Scalar::UInt(u) => Value::Number((*u).into()),
            Scalar::Float(f) => match Number::from_f64(*f) {
                Some(n) => Value::Number(n),
                None => placeholder("f64"),
            },
            Scalar::String(s) => Value::String(self.truncate(s)),
        }
    }

    /// Truncates to `max_length` characters plus [`ELLIPSIS`]; shorter strings are unchanged.
    pub fn truncate(&self, value: &str) -> String {
        match value.char_indices().nth(self.max_length) {
            Some((cut, _)) => format!("{}{}", &value[..cut], ELLIPSIS),
            None => value.to_string(),
        }
    }
}

fn type_marker(type_name: &str) -> Value {
    let mut map = Map::new();
    map.insert(TYPE_KEY.to_string(), Value::String(type_name.to_string()));
    Value::Object(map)
}

fn placeholder(type_name: &str) -> Value {
    Value::String(format!("[{}]", type_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct User {
        id: i64,
        email: String,
    }

    impl Model for User {
        fn model_name(&self) -> String {
            "App\\Models\\User".to_string()
        }

        fn model_key(&self) -> Option<Scalar> {
            Some(Scalar::Int(self.id))
        }

        fn attribute_map(&self) -> Vec<(String, Variable)> {
            vec![("email".to_string(), Variable::from(&self.email))]
        }
    }

    fn nested(levels: usize) -> Variable {
        let mut value = Variable::from("leaf");
        for _ in 0..levels {
            value = Variable::Mapping(vec![("child".to_string(), value)]);
        }
        value
    }

    #[test]
    fn test_scalars_pass_through() {
        let s = Sanitizer::default();
        assert_eq!(s.sanitize(&Variable::from(5)), json!(5));
        assert_eq!(s.sanitize(&Variable::from(u64::MAX)), json!(u64::MAX));
        assert_eq!(s.sanitize(&Variable::from(1.5)), json!(1.5));
        assert_eq!(s.sanitize(&Variable::from(true)), json!(true));
        assert_eq!(s.sanitize(&Variable::from(None::<i32>)), Value::Null);
    }

    #[test]
    fn test_string_truncation() {
        let s = Sanitizer::new(3, 10);
        let long = "a".repeat(25);
        let out = s.sanitize(&Variable::from(long.as_str()));
        assert_eq!(out, json!(format!("{}...", "a".repeat(10))));

        let exact = "b".repeat(10);
        assert_eq!(s.sanitize(&Variable::from(exact.as_str())), json!(exact));
        assert_eq!(s.sanitize(&Variable::from("short")), json!("short"));
    }

    #[test]
    fn test_truncation_counts_characters() {
        let s = Sanitizer::new(3, 2);
        assert_eq!(s.truncate("héllo"), "hé...");
        assert_eq!(s.truncate("日本"), "日本");
    }

    #[test]
    fn test_depth_limit_empties_collections() {
        let s = Sanitizer::new(3, 100);
        let out = s.sanitize(&nested(5));
        assert_eq!(out, json!({"child": {"child": {"child": {}}}}));

        let seq = Variable::from(vec![vec![vec![vec![1]]]]);
        assert_eq!(s.sanitize(&seq), json!([[[[]]]]));
    }

    #[test]
    fn test_sanitize_at_max_depth_returns_empty() {
        let s = Sanitizer::new(3, 100);
        assert_eq!(s.sanitize_at(&nested(2), 3), json!({}));
        assert_eq!(s.sanitize_at(&Variable::from(vec![1, 2]), 3), json!([]));
        assert_eq!(
            s.sanitize_at(&Variable::object("Thing", [("a", 1)]), 3),
            json!({"__type": "Thing"})
        );
    }

    #[test]
    fn test_deep_structures_never_fail() {
        let s = Sanitizer::default();
        let out = s.sanitize(&nested(500));
        assert!(out.is_object());
    }

    #[test]
    fn test_model_record() {
        let s = Sanitizer::default();
        let user = User {
            id: 7,
            email: "a@example.com".to_string(),
        };
        assert_eq!(
            s.sanitize(&Variable::model(&user)),
            json!({
                "__type": "App\\Models\\User",
                "id": 7,
                "attributes": {"email": "a@example.com"}
            })
        );
    }

    #[test]
    fn test_object_fields() {
        let s = Sanitizer::default();
        let obj = Variable::object("Cart", [("items", Variable::from(vec![1, 2])), ("total", Variable::from(9.5))]);
        assert_eq!(
            s.sanitize(&obj),
            json!({"__type": "Cart", "properties": {"items": [1, 2], "total": 9.5}})
        );
    }

    #[test]
    fn test_unserializable_values_become_placeholders() {
        let s = Sanitizer::default();
        let handle = Variable::opaque::<std::fs::File>();
        assert_eq!(s.sanitize(&handle), json!("[std::fs::File]"));

        assert_eq!(s.sanitize(&Variable::from(f64::NAN)), json!("[f64]"));

        // Non-string map keys fail JSON serialization.
        let bad: HashMap<(i32, i32), i32> = HashMap::from([((1, 2), 3)]);
        let captured = Variable::serialize(&bad);
        assert!(matches!(captured, Variable::Unserializable { .. }));
        assert!(s.sanitize(&captured).as_str().unwrap().starts_with('['));
    }

    #[test]
    fn test_serialize_struct() {
        #[derive(Serialize)]
        struct Order {
            id: u32,
            lines: Vec<&'static str>,
        }

        let s = Sanitizer::default();
        let order = Order {
            id: 3,
            lines: vec!["a", "b"],
        };
        assert_eq!(
            s.sanitize(&Variable::serialize(&order)),
            json!({"id": 3, "lines": ["a", "b"]})
        );
    }

    #[test]
    fn test_sanitize_variables_macro() {
        let s = Sanitizer::default();
        let vars = crate::variables! {
            "count" => 2,
            "name" => "widget",
        };
        let out = s.sanitize_variables(&vars);
        assert_eq!(Value::Object(out), json!({"count": 2, "name": "widget"}));
    }
}
