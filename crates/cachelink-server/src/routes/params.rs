//! Request parameters gathered from the path, the body and the query string.
//!
//! A lookup tries each alias in turn; for one alias the path wins over the
//! body, which wins over the query. Empty, `false`, `0` and `null` values
//! count as absent. Repeated query keys (`k=a&k=b` or `k[]=a&k[]=b`) form a
//! list.

use axum::{
    body::Bytes,
    extract::{FromRequest, FromRequestParts, RawPathParams, Request},
    http::header::CONTENT_TYPE,
};
use serde_json::{Map, Value};

use crate::error::ApiError;

#[derive(Debug, Clone, Default)]
pub struct Params {
    path: Vec<(String, String)>,
    body: Map<String, Value>,
    query: Vec<(String, String)>,
}

impl Params {
    pub fn new(
        path: Vec<(String, String)>,
        body: Map<String, Value>,
        query: Vec<(String, String)>,
    ) -> Self {
        Self { path, body, query }
    }

    /// First present value among `aliases`.
    pub fn value(&self, aliases: &[&str]) -> Option<Value> {
        aliases.iter().find_map(|name| self.lookup(name))
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some((_, v)) = self.path.iter().find(|(k, v)| k == name && !v.is_empty()) {
            return Some(Value::String(v.clone()));
        }
        if let Some(v) = self.body.get(name).filter(|v| is_present(v)) {
            return Some(v.clone());
        }
        let list_name = format!("{name}[]");
        let mut values: Vec<Value> = self
            .query
            .iter()
            .filter(|(k, _)| k == name || *k == list_name)
            .map(|(_, v)| Value::String(v.clone()))
            .collect();
        let value = match values.len() {
            0 => return None,
            1 => values.remove(0),
            _ => Value::Array(values),
        };
        is_present(&value).then_some(value)
    }

    /// Like [`Params::value`] for one name, but falsy body values such as
    /// `0` or `false` are kept. Used for payloads.
    pub fn payload(&self, name: &str) -> Option<Value> {
        match self.body.get(name) {
            Some(v) if !v.is_null() && self.path.iter().all(|(k, _)| k != name) => Some(v.clone()),
            _ => self.lookup(name),
        }
    }

    pub fn text(&self, aliases: &[&str]) -> Option<String> {
        self.value(aliases).and_then(|v| scalar_text(&v))
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        match self.value(&[name])? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// A switch such as `local` or `background`. `"false"` and `"0"` are off.
    pub fn flag(&self, name: &str) -> bool {
        match self.value(&[name]) {
            Some(Value::String(s)) => !matches!(s.trim(), "false" | "0"),
            Some(_) => true,
            None => false,
        }
    }

    /// A key or list of keys with empty entries dropped.
    pub fn list(&self, aliases: &[&str]) -> Vec<String> {
        let items: Vec<String> = match self.value(aliases) {
            Some(Value::Array(items)) => items.iter().filter_map(scalar_text).collect(),
            Some(v) => scalar_text(&v).into_iter().collect(),
            None => Vec::new(),
        };
        items.into_iter().filter(|k| !k.is_empty()).collect()
    }

    /// Keys under `key`, `keys` or `k`.
    pub fn keys(&self) -> Vec<String> {
        self.list(&["key", "keys", "k"])
    }

    /// TTL in milliseconds from `millis`, else `seconds`, else `minutes`.
    pub fn ttl_millis(&self) -> u64 {
        let millis = [("millis", 1.0), ("seconds", 1_000.0), ("minutes", 60_000.0)]
            .iter()
            .filter_map(|(name, scale)| self.number(name).map(|n| n * scale))
            .find(|n| n.is_finite() && *n > 0.0)
            .unwrap_or(0.0);
        millis.floor() as u64
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::Array(_) | Value::Object(_) => true,
        Value::Bool(true) => true,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_pairs(input: &[u8]) -> Vec<(String, String)> {
    url::form_urlencoded::parse(input)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

impl<S> FromRequest<S> for Params
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let (mut parts, body) = req.into_parts();

        // Routes without path segments carry no parameters.
        let path: Vec<(String, String)> = RawPathParams::from_request_parts(&mut parts, state)
            .await
            .map(|params| {
                params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        let query = parts
            .uri
            .query()
            .map(|q| parse_pairs(q.as_bytes()))
            .unwrap_or_default();
        let is_form = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

        let bytes = Bytes::from_request(Request::from_parts(parts, body), state).await?;
        let body = if bytes.iter().all(u8::is_ascii_whitespace) {
            Map::new()
        } else if is_form {
            form_to_map(parse_pairs(&bytes))
        } else {
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Object(map)) => map,
                Ok(_) => Map::new(),
                Err(e) => return Err(ApiError::BadRequest(format!("invalid JSON body: {e}"))),
            }
        };

        Ok(Params::new(path, body, query))
    }
}

fn form_to_map(pairs: Vec<(String, String)>) -> Map<String, Value> {
    let mut map = Map::new();
    for (key, value) in pairs {
        let key = key.strip_suffix("[]").map(str::to_string).unwrap_or(key);
        match map.get_mut(&key) {
            Some(Value::Array(items)) => items.push(Value::String(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
            None => {
                map.insert(key, Value::String(value));
            }
        }
    }
    map
}
