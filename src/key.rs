//! Argument binding and call keys.
//!
//! A task factory declares its parameters once, as a [`Signature`]. Every call
//! supplies an [`Args`] list of positional and keyword values, which is bound
//! against the signature with defaults applied. The resulting [`Arguments`]
//! are both what the user's runner factory receives and what the [`CallKey`]
//! is computed from, so `f(1, 2)`, `f(a = 1, b = 2)` and `f(1)` with `b`
//! defaulting to `2` all address the same cache entry.

use std::collections::BTreeMap;
use std::fmt::{Debug, Display};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BindError, CheckpointError};

/// Canonical serialized form of a call's bound arguments.
///
/// The encoding is compact JSON with object keys sorted at every nesting
/// level, which makes it independent of the order in which arguments were
/// passed.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallKey(String);

impl CallKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl Display for CallKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for CallKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CallKey({})", self.0)
    }
}

impl AsRef<str> for CallKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
struct Param {
    name: String,
    default: Option<Value>,
}

/// The parameter list of a task factory, normalized once at construction.
#[derive(Debug, Clone, Default)]
pub struct Signature {
    params: Vec<Param>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a required parameter.
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(Param {
            name: name.into(),
            default: None,
        });
        self
    }

    /// Appends a parameter which falls back to `default` when not supplied.
    pub fn param_default<T>(
        mut self,
        name: impl Into<String>,
        default: T,
    ) -> Result<Self, BindError>
    where
        T: Serialize,
    {
        self.params.push(Param {
            name: name.into(),
            default: Some(to_json(default)?),
        });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Matches `args` against the parameters and applies defaults.
    pub fn bind(&self, args: Args) -> Result<Arguments, BindError> {
        let Args {
            positional,
            keywords,
            error,
        } = args;

        if let Some(err) = error {
            return Err(err);
        }

        if positional.len() > self.params.len() {
            return Err(BindError::TooManyPositional {
                expected: self.params.len(),
                given: positional.len(),
            });
        }

        let mut bound = BTreeMap::new();

        for (param, value) in self.params.iter().zip(positional) {
            bound.insert(param.name.clone(), value);
        }

        for (name, value) in keywords {
            if !self.params.iter().any(|param| param.name == name) {
                return Err(BindError::UnknownKeyword(name));
            }
            if bound.contains_key(&name) {
                return Err(BindError::MultipleValues(name));
            }
            bound.insert(name, value);
        }

        for param in &self.params {
            if bound.contains_key(&param.name) {
                continue;
            }
            match &param.default {
                Some(default) => {
                    bound.insert(param.name.clone(), default.clone());
                }
                None => return Err(BindError::Missing(param.name.clone())),
            }
        }

        Ok(Arguments(bound))
    }
}

/// Positional and keyword values of a single call.
///
/// Values are converted to JSON eagerly; a value which fails to serialize is
/// reported when the call is bound. JSON has no encoding for infinities and
/// NaN, so floats which are not finite are rejected.
#[derive(Debug, Default)]
pub struct Args {
    positional: Vec<Value>,
    keywords: Vec<(String, Value)>,
    error: Option<BindError>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional value.
    pub fn arg<T>(mut self, value: T) -> Self
    where
        T: Serialize,
    {
        match to_json(value) {
            Ok(value) => self.positional.push(value),
            Err(err) => {
                self.error.get_or_insert(err);
            }
        }
        self
    }

    /// Adds a keyword value.
    pub fn kwarg<T>(mut self, name: impl Into<String>, value: T) -> Self
    where
        T: Serialize,
    {
        match to_json(value) {
            Ok(value) => self.keywords.push((name.into(), value)),
            Err(err) => {
                self.error.get_or_insert(err);
            }
        }
        self
    }
}

/// Builds [`Args`] from positional values.
///
/// ```rust
/// let args = checkpoint::args![1, "two", 3.0];
/// ```
#[macro_export]
macro_rules! args {
    () => {
        $crate::Args::new()
    };
    ($($value:expr),+ $(,)?) => {
        $crate::Args::new()$(.arg($value))+
    };
}

/// Arguments bound against a [`Signature`], defaults included.
#[derive(Debug, Clone, PartialEq)]
pub struct Arguments(BTreeMap<String, Value>);

impl Arguments {
    /// Deserializes a single argument.
    pub fn get<T>(&self, name: &str) -> Result<T, CheckpointError>
    where
        T: DeserializeOwned,
    {
        let value = self.0.get(name).cloned().ok_or_else(|| {
            let err: serde_json::Error =
                serde::de::Error::custom(format!("no parameter named '{name}'"));
            CheckpointError::Serialization(name.to_string(), err)
        })?;
        serde_json::from_value(value)
            .map_err(|err| CheckpointError::Serialization(name.to_string(), err))
    }

    /// Deserializes all arguments at once into a struct whose fields are
    /// named after the parameters.
    pub fn parse<T>(&self) -> Result<T, CheckpointError>
    where
        T: DeserializeOwned,
    {
        let value = Value::Object(self.0.clone().into_iter().collect());
        serde_json::from_value(value)
            .map_err(|err| CheckpointError::Serialization("*".to_string(), err))
    }

    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Canonical key of these arguments.
    pub fn to_key(&self) -> CallKey {
        let value = Value::Object(
            self.0
                .iter()
                .map(|(name, value)| (name.clone(), canonical(value)))
                .collect(),
        );
        CallKey(value.to_string())
    }
}

// serde_json writes every non-finite float as `null`, which would make e.g.
// `inf` and `-inf` share a key. The check runs on a CBOR value, which keeps them.
fn to_json<T>(value: T) -> Result<Value, BindError>
where
    T: Serialize,
{
    if let Ok(value) = ciborium::Value::serialized(&value)
        && !is_finite(&value)
    {
        return Err(BindError::NonFinite);
    }
    Ok(serde_json::to_value(value)?)
}

fn is_finite(value: &ciborium::Value) -> bool {
    use ciborium::Value as Cbor;

    match value {
        Cbor::Float(float) => float.is_finite(),
        Cbor::Array(items) => items.iter().all(is_finite),
        Cbor::Map(entries) => entries.iter().all(|(k, v)| is_finite(k) && is_finite(v)),
        Cbor::Tag(_, inner) => is_finite(inner),
        _ => true,
    }
}

// Objects are rebuilt from sorted entries so the key stays canonical even when
// serde_json's `preserve_order` feature is enabled somewhere in the build.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(name, value)| (name.clone(), canonical(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}
