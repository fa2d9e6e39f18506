//! Purpose: Compile and evaluate `bibserve search --where` expressions against record JSON.
//! Exports: `SearchFilter`, `compile_filters`, `matches_all`.
//! Role: Thin `jaq-core` adapter so record filtering never shells out to `jq`.
//! Invariants: Expressions that fail to parse or compile are usage errors.
//! Invariants: Runtime evaluation failures mean "no match"; non-boolean outputs are usage errors.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use jaq_core::load::{Arena, File, Loader};
use jaq_core::ops::Math;
use jaq_core::{Compiler, Ctx, Error as EvalError, Native, RcIter};
use serde_json::Value;

use bibserve::core::error::{Error, ErrorKind};

#[derive(Clone)]
pub struct SearchFilter {
    expr: String,
    program: jaq_core::Filter<Native<FilterValue>>,
}

impl fmt::Debug for SearchFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchFilter")
            .field("expr", &self.expr)
            .finish()
    }
}

impl SearchFilter {
    /// True when the expression yields `true` for at least one output.
    /// Runtime failures (absent fields, type mismatches) mean "no match";
    /// a non-boolean output is a caller mistake and surfaces as usage.
    pub fn matches(&self, input: &Value) -> Result<bool, Error> {
        let no_inputs = RcIter::new(core::iter::empty::<Result<FilterValue, String>>());
        let outputs = self
            .program
            .run((Ctx::new([], &no_inputs), FilterValue::from(input)));

        let mut matched = false;
        for output in outputs {
            match output {
                Ok(FilterValue::Bool(flag)) => matched = matched || flag,
                Ok(other) => {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message("--where must evaluate to true or false")
                        .with_hint(format!(
                            "`{}` produced the non-boolean value {other}.",
                            self.expr
                        )));
                }
                Err(_) => return Ok(false),
            }
        }
        Ok(matched)
    }
}

pub fn compile_filters(exprs: &[String]) -> Result<Vec<SearchFilter>, Error> {
    exprs.iter().map(|expr| compile_filter(expr)).collect()
}

pub fn matches_all(filters: &[SearchFilter], input: &Value) -> Result<bool, Error> {
    for filter in filters {
        if !filter.matches(input)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn compile_filter(expr: &str) -> Result<SearchFilter, Error> {
    let arena = Arena::default();
    let loader = Loader::new(std::iter::empty());
    let modules = loader
        .load(&arena, File { code: expr, path: () })
        .map_err(|errs| bad_expression(expr, errs))?;
    let program = Compiler::default()
        .with_funs(jaq_std::base_funs::<FilterValue>())
        .compile(modules)
        .map_err(|errs| bad_expression(expr, errs))?;
    Ok(SearchFilter {
        expr: expr.to_string(),
        program,
    })
}

fn bad_expression<E: fmt::Debug>(expr: &str, err: E) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message("could not compile --where expression")
        .with_hint(format!(
            "`{expr}` did not compile: {err:?}\nExample: --where '.doctype == \"rfc\"'"
        ))
}

/// Owned JSON value in the shape the jq engine evaluates over. Relaton
/// numbers fit in f64, so a lossless integer type is not needed here.
#[derive(Clone, Debug)]
pub enum FilterValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<FilterValue>),
    Map(BTreeMap<String, FilterValue>),
}

impl FilterValue {
    fn type_order(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Number(_) => 2,
            Self::Text(_) => 3,
            Self::List(_) => 4,
            Self::Map(_) => 5,
        }
    }

    fn number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(flag) => Value::Bool(*flag),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Text(s) => Value::String(s.clone()),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }

    /// First output of a replacement iterator, defaulting to null when the
    /// replacement produces nothing. Shared by the `map_*` path updates.
    fn replace_with<'a, I>(mut outputs: I) -> jaq_core::ValX<'a, Self>
    where
        I: Iterator<Item = jaq_core::ValX<'a, Self>>,
    {
        match outputs.next() {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => Err(err),
            None => Ok(Self::Null),
        }
    }
}

impl From<&Value> for FilterValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(*flag),
            Value::Number(n) => Self::Number(n.as_f64().unwrap_or(0.0)),
            Value::String(s) => Self::Text(s.clone()),
            Value::Array(items) => Self::List(items.iter().map(Self::from).collect()),
            Value::Object(entries) => Self::Map(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), Self::from(value)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.to_json()) {
            Ok(encoded) => f.write_str(&encoded),
            Err(_) => f.write_str("null"),
        }
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<isize> for FilterValue {
    fn from(value: isize) -> Self {
        Self::Number(value as f64)
    }
}

impl From<f64> for FilterValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl FromIterator<Self> for FilterValue {
    fn from_iter<T: IntoIterator<Item = Self>>(iter: T) -> Self {
        Self::List(iter.into_iter().collect())
    }
}

impl PartialEq for FilterValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FilterValue {}

impl PartialOrd for FilterValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// jq's total order: null < bool < number < string < array < object, with
// NaN handled through total_cmp inside the number class.
impl Ord for FilterValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::List(a), Self::List(b)) => a.cmp(b),
            (Self::Map(a), Self::Map(b)) => a.cmp(b),
            (a, b) => a.type_order().cmp(&b.type_order()),
        }
    }
}

impl std::ops::Add for FilterValue {
    type Output = Result<Self, EvalError<Self>>;

    fn add(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            (Self::Number(a), Self::Number(b)) => Ok(Self::Number(a + b)),
            (Self::Text(a), Self::Text(b)) => Ok(Self::Text(format!("{a}{b}"))),
            (Self::List(mut a), Self::List(b)) => {
                a.extend(b);
                Ok(Self::List(a))
            }
            (l, r) => Err(EvalError::math(l, Math::Add, r)),
        }
    }
}

macro_rules! numeric_op {
    ($trait:ident, $method:ident, $op:tt, $math:ident) => {
        impl std::ops::$trait for FilterValue {
            type Output = Result<Self, EvalError<Self>>;

            fn $method(self, rhs: Self) -> Self::Output {
                match (self, rhs) {
                    (Self::Number(a), Self::Number(b)) => Ok(Self::Number(a $op b)),
                    (l, r) => Err(EvalError::math(l, Math::$math, r)),
                }
            }
        }
    };
}

numeric_op!(Sub, sub, -, Sub);
numeric_op!(Mul, mul, *, Mul);
numeric_op!(Div, div, /, Div);
numeric_op!(Rem, rem, %, Rem);

impl std::ops::Neg for FilterValue {
    type Output = Result<Self, EvalError<Self>>;

    fn neg(self) -> Self::Output {
        match self {
            Self::Number(n) => Ok(Self::Number(-n)),
            other => Err(EvalError::typ(other, "number")),
        }
    }
}

fn integer_of(value: &FilterValue) -> Result<isize, EvalError<FilterValue>> {
    match value {
        FilterValue::Number(n) if n.is_finite() && n.fract() == 0.0 => Ok(*n as isize),
        other => Err(EvalError::typ(other.clone(), "integer")),
    }
}

impl jaq_core::ValT for FilterValue {
    fn from_num(literal: &str) -> Result<Self, EvalError<Self>> {
        literal
            .parse::<f64>()
            .map(Self::Number)
            .map_err(EvalError::str)
    }

    fn from_map<I: IntoIterator<Item = (Self, Self)>>(iter: I) -> Result<Self, EvalError<Self>> {
        let mut entries = BTreeMap::new();
        for (key, value) in iter {
            match key {
                Self::Text(key) => {
                    entries.insert(key, value);
                }
                other => return Err(EvalError::typ(other, "string")),
            }
        }
        Ok(Self::Map(entries))
    }

    fn values(self) -> Box<dyn Iterator<Item = Result<Self, EvalError<Self>>>> {
        match self {
            Self::List(items) => Box::new(items.into_iter().map(Ok)),
            Self::Map(entries) => Box::new(entries.into_values().map(Ok)),
            other => Box::new(std::iter::once(Err(EvalError::typ(other, "iterable")))),
        }
    }

    fn index(self, index: &Self) -> Result<Self, EvalError<Self>> {
        match (self, index) {
            (Self::Map(mut entries), Self::Text(key)) => entries
                .remove(key)
                .ok_or_else(|| EvalError::index(Self::Map(entries), Self::Text(key.clone()))),
            (Self::List(items), Self::Number(position)) => {
                if !position.is_finite() || position.fract() != 0.0 {
                    return Err(EvalError::typ(Self::Number(*position), "integer"));
                }
                let len = items.len() as isize;
                let mut at = *position as isize;
                if at < 0 {
                    at += len;
                }
                usize::try_from(at)
                    .ok()
                    .and_then(|at| items.get(at).cloned())
                    .ok_or_else(|| EvalError::index(Self::List(items), Self::Number(*position)))
            }
            (l, r) => Err(EvalError::index(l, r.clone())),
        }
    }

    fn range(self, range: jaq_core::val::Range<&Self>) -> Result<Self, EvalError<Self>> {
        let Self::List(items) = self else {
            return Err(EvalError::typ(self, "array"));
        };
        let len = items.len() as isize;
        let start = range.start.map(integer_of).transpose()?.unwrap_or(0);
        let end = range.end.map(integer_of).transpose()?.unwrap_or(len);
        let clamp = |at: isize| {
            let at = if at < 0 { len + at } else { at };
            at.clamp(0, len) as usize
        };
        let (start, end) = (clamp(start), clamp(end));
        let slice = if end >= start {
            items[start..end].to_vec()
        } else {
            Vec::new()
        };
        Ok(Self::List(slice))
    }

    fn map_values<'a, I: Iterator<Item = jaq_core::ValX<'a, Self>>>(
        self,
        opt: jaq_core::path::Opt,
        f: impl Fn(Self) -> I,
    ) -> jaq_core::ValX<'a, Self> {
        match self {
            Self::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(Self::replace_with(f(item))?);
                }
                Ok(Self::List(out))
            }
            Self::Map(entries) => {
                let mut out = BTreeMap::new();
                for (key, value) in entries {
                    out.insert(key, Self::replace_with(f(value))?);
                }
                Ok(Self::Map(out))
            }
            other => match opt {
                jaq_core::path::Opt::Optional => Ok(other),
                jaq_core::path::Opt::Essential => Err(EvalError::typ(other, "iterable").into()),
            },
        }
    }

    fn map_index<'a, I: Iterator<Item = jaq_core::ValX<'a, Self>>>(
        self,
        index: &Self,
        opt: jaq_core::path::Opt,
        f: impl Fn(Self) -> I,
    ) -> jaq_core::ValX<'a, Self> {
        match self {
            Self::Map(mut entries) => {
                let Some(key) = index.text() else {
                    return Err(EvalError::typ(index.clone(), "string").into());
                };
                match entries.remove(key) {
                    Some(value) => {
                        let replacement = Self::replace_with(f(value))?;
                        entries.insert(key.to_string(), replacement);
                        Ok(Self::Map(entries))
                    }
                    None => match opt {
                        jaq_core::path::Opt::Optional => Ok(Self::Map(entries)),
                        jaq_core::path::Opt::Essential => {
                            Err(EvalError::index(Self::Map(entries), index.clone()).into())
                        }
                    },
                }
            }
            other => match opt {
                jaq_core::path::Opt::Optional => Ok(other),
                jaq_core::path::Opt::Essential => {
                    Err(EvalError::index(other, index.clone()).into())
                }
            },
        }
    }

    fn map_range<'a, I: Iterator<Item = jaq_core::ValX<'a, Self>>>(
        self,
        range: jaq_core::val::Range<&Self>,
        opt: jaq_core::path::Opt,
        f: impl Fn(Self) -> I,
    ) -> jaq_core::ValX<'a, Self> {
        match self {
            Self::List(items) => {
                let slice = Self::List(items).range(range)?;
                Self::replace_with(f(slice))
            }
            other => match opt {
                jaq_core::path::Opt::Optional => Ok(other),
                jaq_core::path::Opt::Essential => Err(EvalError::typ(other, "array").into()),
            },
        }
    }

    fn as_bool(&self) -> bool {
        !matches!(self, Self::Null | Self::Bool(false))
    }

    fn as_str(&self) -> Option<&str> {
        self.text()
    }
}

impl jaq_std::ValT for FilterValue {
    fn into_seq<S: FromIterator<Self>>(self) -> Result<S, Self> {
        match self {
            Self::List(items) => Ok(items.into_iter().collect()),
            other => Err(other),
        }
    }

    fn as_isize(&self) -> Option<isize> {
        let num = self.number()?;
        if !num.is_finite() || num.fract() != 0.0 {
            return None;
        }
        let cast = num as isize;
        ((cast as f64).to_bits() == num.to_bits()).then_some(cast)
    }

    fn as_f64(&self) -> Result<f64, EvalError<Self>> {
        self.number()
            .ok_or_else(|| EvalError::typ(self.clone(), "number"))
    }
}

#[cfg(test)]
mod tests {
    use super::{compile_filters, matches_all};
    use serde_json::json;

    fn record() -> serde_json::Value {
        json!({
            "docid": [
                {"id": "RFC.9110", "type": "IETF", "primary": true},
                {"id": "10.17487/RFC9110", "type": "DOI"}
            ],
            "doctype": "rfc",
            "keyword": ["transport", "http"],
            "date": [{"type": "published", "value": "2022-06"}]
        })
    }

    #[test]
    fn filter_matches_simple_equality() {
        let filters = compile_filters(&[r#".doctype == "rfc""#.to_string()]).unwrap();
        assert!(matches_all(&filters, &record()).unwrap());
    }

    #[test]
    fn filter_conjunction_spans_expressions() {
        let filters = compile_filters(&[
            r#".docid[0].id == "RFC.9110""#.to_string(),
            r#".doctype == "rfc""#.to_string(),
        ])
        .unwrap();
        assert!(matches_all(&filters, &record()).unwrap());

        let filters = compile_filters(&[
            r#".docid[0].id == "RFC.9110""#.to_string(),
            r#".doctype == "standard""#.to_string(),
        ])
        .unwrap();
        assert!(!matches_all(&filters, &record()).unwrap());
    }

    #[test]
    fn filter_runtime_error_is_false() {
        let filters = compile_filters(&[r#".relation.missing == 1"#.to_string()]).unwrap();
        assert!(!matches_all(&filters, &record()).unwrap());
    }

    #[test]
    fn filter_non_boolean_output_is_usage_error() {
        let filters = compile_filters(&[r#".docid"#.to_string()]).unwrap();
        assert!(matches_all(&filters, &record()).is_err());
    }

    #[test]
    fn filter_any_true_across_multiple_outputs() {
        let filters = compile_filters(&[r#".keyword[]? == "http""#.to_string()]).unwrap();
        assert!(matches_all(&filters, &record()).unwrap());
    }

    #[test]
    fn filter_rejects_malformed_expression() {
        assert!(compile_filters(&[r#".doctype =="#.to_string()]).is_err());
    }
}
