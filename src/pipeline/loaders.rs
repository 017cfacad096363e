//! Loaders writing to the destination.

use futures_util::future::BoxFuture;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::info;

use crate::error::ImportError;
use crate::pipeline::{Context, Loader};
use crate::repository::GitCredentials;
use crate::storage::records;

/// Upserts each item as an imported record keyed by one of its fields.
#[derive(Debug, Clone)]
pub struct RecordLoader {
    key_field: &'static str,
}

impl RecordLoader {
    pub fn new(key_field: &'static str) -> Self {
        Self { key_field }
    }

    fn source_key(&self, item: &Value) -> Result<String, ImportError> {
        match item.get(self.key_field) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(ImportError::Validation(format!(
                "{} can't be blank",
                self.key_field
            ))),
        }
    }
}

impl Loader for RecordLoader {
    fn load<'a>(&'a self, ctx: &'a Context, item: Value) -> BoxFuture<'a, Result<(), ImportError>> {
        Box::pin(async move {
            let key = self.source_key(&item)?;
            records::upsert_record(&ctx.db, ctx.entity.id, &ctx.tracker.relation, &key, &item)
                .await?;
            Ok(())
        })
    }
}

/// Adds the source access token to a clone URL as basic-auth credentials.
pub fn with_source_credentials(ctx: &Context, raw_url: &str) -> Result<url::Url, ImportError> {
    let mut url = url::Url::parse(raw_url)
        .map_err(|_| ImportError::UrlBlocked("URI is invalid".to_string()))?;

    url.set_username("oauth2")
        .and_then(|_| url.set_password(Some(ctx.source.access_token().expose_secret())))
        .map_err(|_| ImportError::UrlBlocked("URI cannot carry credentials".to_string()))?;

    Ok(url)
}

/// Mirrors the repository at `raw_url` into `destination`.
///
/// The URL is checked against the URL policy after credentials are added.
/// The fetch itself gets the URL without userinfo plus separate credentials.
pub async fn mirror_repository(
    ctx: &Context,
    raw_url: &str,
    destination: &str,
) -> Result<(), ImportError> {
    let url = with_source_credentials(ctx, raw_url)?;
    let mut url = ctx.url_blocker.validate(url.as_str())?;

    let token = ctx.source.access_token().expose_secret().to_string();
    let credentials = GitCredentials::new(url.username(), SecretString::from(token));
    url.set_username("")
        .and_then(|_| url.set_password(None))
        .map_err(|_| ImportError::UrlBlocked("URI cannot carry credentials".to_string()))?;

    ctx.repositories.ensure_repository(destination).await?;
    ctx.repositories
        .fetch_as_mirror(destination, &url, Some(&credentials))
        .await?;

    info!(
        entity_id = ctx.entity.id,
        tracker_id = ctx.tracker.id,
        "[PIPELINE] Mirrored repository into {}",
        destination
    );
    Ok(())
}
