//! Field codecs — one typed decoder per request surface.
//!
//! An operation input is composed from four independently-decoded surfaces:
//! query string, path shape, headers, and body. Each decoder produces a typed
//! value by bridging the surface's flat name/value pairs through a
//! `serde_json::Value` object; the body surface decodes JSON directly.
//! Encoders mirror the decoders so outputs round-trip.

use bytes::Bytes;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ServiceError;
use crate::http::Headers;
use crate::path::PathShape;

/// Message used when a required body surface receives no bytes.
pub const MISSING_BODY: &str = "Input body expected; none found.";

const QUERY_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

// ── decoders ──────────────────────────────────────────────────────────────

/// Decodes the query string (`k=v&k2=v2`, percent-encoded) into `T`.
///
/// `+` decodes as a space. Repeated keys become arrays. An absent query
/// string decodes as an empty object.
pub fn decode_query<T: DeserializeOwned>(query: Option<&str>) -> Result<T, ServiceError> {
    let pairs = match query {
        Some(q) if !q.is_empty() => parse_query_pairs(q)?,
        _ => Vec::new(),
    };
    decode_flat(&pairs, "query")
}

/// Decodes the matched path-variable shape into `T`.
pub fn decode_path<T: DeserializeOwned>(shape: &PathShape) -> Result<T, ServiceError> {
    let pairs: Vec<(String, String)> = shape
        .iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
    decode_flat(&pairs, "path")
}

/// Decodes the header multi-map into `T`.
///
/// Names are lowercased so struct fields match case-insensitively; repeated
/// headers become arrays in insertion order.
pub fn decode_headers<T: DeserializeOwned>(headers: &Headers) -> Result<T, ServiceError> {
    let pairs: Vec<(String, String)> = headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.to_owned()))
        .collect();
    decode_flat(&pairs, "headers")
}

/// Decodes collected body bytes as JSON into `T`.
///
/// # Errors
///
/// An empty body fails with *validation*: the framework distinguishes "no
/// payload at all" from "malformed payload".
pub fn decode_body<T: DeserializeOwned>(bytes: &Bytes) -> Result<T, ServiceError> {
    if bytes.is_empty() {
        return Err(ServiceError::validation(MISSING_BODY));
    }
    serde_json::from_slice(bytes).map_err(|e| ServiceError::decoding(format!("body: {e}")))
}

/// Like [`decode_body`] but maps an empty body to `None`.
pub fn decode_body_optional<T: DeserializeOwned>(
    bytes: &Bytes,
) -> Result<Option<T>, ServiceError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    decode_body(bytes).map(Some)
}

// ── encoders ──────────────────────────────────────────────────────────────

/// Encodes an output value as a JSON body.
pub fn encode_body<T: Serialize>(value: &T) -> Result<Bytes, ServiceError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| ServiceError::internal(format!("output body encoding failed: {e}")))
}

/// Encodes a flat value as response headers.
///
/// Scalars become single entries; arrays of scalars become repeated entries.
/// Nested objects cannot be represented and fail as *internal*.
pub fn encode_headers<T: Serialize>(value: &T) -> Result<Headers, ServiceError> {
    let pairs = value_to_flat(value, "headers")?;
    Ok(pairs.into_iter().collect())
}

/// Encodes a flat value as a percent-encoded query string.
pub fn encode_query<T: Serialize>(value: &T) -> Result<String, ServiceError> {
    let pairs = value_to_flat(value, "query")?;
    Ok(pairs
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, QUERY_ENCODE),
                utf8_percent_encode(v, QUERY_ENCODE)
            )
        })
        .collect::<Vec<_>>()
        .join("&"))
}

/// Encodes a flat value as a path shape.
pub fn encode_path<T: Serialize>(value: &T) -> Result<PathShape, ServiceError> {
    let pairs = value_to_flat(value, "path")?;
    let mut shape = PathShape::new();
    for (k, v) in pairs {
        shape.insert(k, v);
    }
    Ok(shape)
}

// ── the flat-map bridge ───────────────────────────────────────────────────

fn parse_query_pairs(query: &str) -> Result<Vec<(String, String)>, ServiceError> {
    let mut pairs = Vec::new();
    for item in query.split('&') {
        if item.is_empty() {
            continue;
        }
        let mut halves = item.splitn(2, '=');
        let key = halves.next().unwrap_or("");
        let value = halves.next().unwrap_or("");
        pairs.push((decode_component(key)?, decode_component(value)?));
    }
    Ok(pairs)
}

fn decode_component(raw: &str) -> Result<String, ServiceError> {
    let plus_decoded = raw.replace('+', " ");
    percent_decode_str(&plus_decoded)
        .decode_utf8()
        .map(|cow| cow.into_owned())
        .map_err(|e| ServiceError::decoding(format!("query: invalid percent-encoding: {e}")))
}

/// Builds the `Value::Object` for a flat surface.
///
/// With `coerce` set, values parseable as JSON booleans or numbers become
/// typed scalars; otherwise every value stays a string.
fn flat_to_value(pairs: &[(String, String)], coerce: bool) -> Value {
    let mut map = Map::new();
    for (key, raw) in pairs {
        let val = if coerce {
            coerce_scalar(raw)
        } else {
            Value::String(raw.clone())
        };
        match map.get_mut(key) {
            None => {
                map.insert(key.clone(), val);
            }
            Some(Value::Array(arr)) => arr.push(val),
            Some(existing) => {
                let prev = existing.take();
                *existing = Value::Array(vec![prev, val]);
            }
        }
    }
    Value::Object(map)
}

fn coerce_scalar(raw: &str) -> Value {
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => match raw.parse::<i64>() {
            Ok(n) => Value::Number(n.into()),
            Err(_) => match raw.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
                Some(n) => Value::Number(n),
                None => Value::String(raw.to_owned()),
            },
        },
    }
}

/// Decodes the flat pairs into `T`, preferring string values and retrying
/// with scalar coercion so numeric and boolean fields also map.
fn decode_flat<T: DeserializeOwned>(
    pairs: &[(String, String)],
    surface: &str,
) -> Result<T, ServiceError> {
    match serde_json::from_value(flat_to_value(pairs, false)) {
        Ok(v) => Ok(v),
        Err(first_err) => serde_json::from_value(flat_to_value(pairs, true))
            .map_err(|_| ServiceError::decoding(format!("{surface}: {first_err}"))),
    }
}

fn value_to_flat<T: Serialize>(
    value: &T,
    surface: &str,
) -> Result<Vec<(String, String)>, ServiceError> {
    let value = serde_json::to_value(value)
        .map_err(|e| ServiceError::internal(format!("output {surface} encoding failed: {e}")))?;
    let Value::Object(map) = value else {
        return Err(ServiceError::internal(format!(
            "output {surface} encoding requires an object at the top level"
        )));
    };

    let mut pairs = Vec::new();
    for (key, val) in map {
        match val {
            Value::Null => {}
            Value::Array(items) => {
                for item in items {
                    pairs.push((key.clone(), scalar_to_string(&key, item, surface)?));
                }
            }
            other => pairs.push((key.clone(), scalar_to_string(&key, other, surface)?)),
        }
    }
    Ok(pairs)
}

fn scalar_to_string(key: &str, value: Value, surface: &str) -> Result<String, ServiceError> {
    match value {
        Value::String(s) => Ok(s),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(ServiceError::internal(format!(
            "output {surface} field {key:?} is not a flat value"
        ))),
    }
}
