//! Per-item transformers.

use serde_json::{Map, Value};

use crate::error::ImportError;
use crate::pipeline::{Context, Transformer};

// ─────────────────────────────────────────────────────────────────────────────
// ProhibitedAttributesTransformer
// ─────────────────────────────────────────────────────────────────────────────

/// Strips source-side identifiers, rendered HTML and remote URLs, recursively.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProhibitedAttributesTransformer;

fn is_prohibited(key: &str) -> bool {
    key == "id"
        || key == "cached_markdown_version"
        || key.ends_with("_id")
        || key.ends_with("_ids")
        || key.ends_with("_html")
        || key.contains("attributes")
        || (key.starts_with("remote_")
            && (key.ends_with("_url") || key.ends_with("_urls") || key.ends_with("_request_header")))
}

fn strip_prohibited(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| !is_prohibited(key))
                .map(|(key, value)| (key, strip_prohibited(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_prohibited).collect()),
        other => other,
    }
}

impl Transformer for ProhibitedAttributesTransformer {
    fn transform(&self, _ctx: &Context, item: Value) -> Result<Option<Value>, ImportError> {
        Ok(Some(strip_prohibited(item)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SliceKeysTransformer
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps only the listed top-level keys. Missing keys come out as `null`.
#[derive(Debug, Clone)]
pub struct SliceKeysTransformer {
    keys: &'static [&'static str],
}

impl SliceKeysTransformer {
    pub fn new(keys: &'static [&'static str]) -> Self {
        Self { keys }
    }
}

impl Transformer for SliceKeysTransformer {
    fn transform(&self, _ctx: &Context, item: Value) -> Result<Option<Value>, ImportError> {
        let Value::Object(mut map) = item else {
            return Ok(None);
        };

        let sliced: Map<String, Value> = self
            .keys
            .iter()
            .map(|key| (key.to_string(), map.remove(*key).unwrap_or(Value::Null)))
            .collect();

        Ok(Some(Value::Object(sliced)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemberAttributesTransformer
// ─────────────────────────────────────────────────────────────────────────────

const VALID_ACCESS_LEVELS: [u64; 6] = [5, 10, 20, 30, 40, 50];

/// Flattens a membership into `{username, access_level, expires_at}`.
///
/// Memberships without a username or with an unknown access level are
/// dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemberAttributesTransformer;

impl Transformer for MemberAttributesTransformer {
    fn transform(&self, _ctx: &Context, item: Value) -> Result<Option<Value>, ImportError> {
        let username = item
            .get("username")
            .or_else(|| item.pointer("/user/username"))
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty());

        let access_level = item
            .get("access_level")
            .and_then(|level| level.as_u64().or_else(|| level.get("integer_value")?.as_u64()))
            .filter(|level| VALID_ACCESS_LEVELS.contains(level));

        let (Some(username), Some(access_level)) = (username, access_level) else {
            return Ok(None);
        };

        Ok(Some(serde_json::json!({
            "username": username,
            "access_level": access_level,
            "expires_at": item.get("expires_at").cloned().unwrap_or(Value::Null),
        })))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EntityAttributesTransformer
// ─────────────────────────────────────────────────────────────────────────────

/// Renames the entity resource to its destination path.
#[derive(Debug, Clone)]
pub struct EntityAttributesTransformer {
    keys: &'static [&'static str],
}

impl EntityAttributesTransformer {
    pub fn new(keys: &'static [&'static str]) -> Self {
        Self { keys }
    }
}

impl Transformer for EntityAttributesTransformer {
    fn transform(&self, ctx: &Context, item: Value) -> Result<Option<Value>, ImportError> {
        let Some(Value::Object(mut map)) = SliceKeysTransformer::new(self.keys).transform(ctx, item)?
        else {
            return Ok(None);
        };

        map.insert("path".into(), Value::String(ctx.entity.destination_name.clone()));
        map.insert(
            "full_path".into(),
            Value::String(ctx.entity.destination_full_path()),
        );
        if map.get("name").map_or(true, Value::is_null) {
            map.insert("name".into(), Value::String(ctx.entity.destination_name.clone()));
        }

        Ok(Some(Value::Object(map)))
    }
}
