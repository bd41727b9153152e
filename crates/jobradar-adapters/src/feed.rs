use anyhow::Context;
use async_trait::async_trait;
use jobradar_core::{Cursor, SourceError};
use jobradar_storage::FetchRequest;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::info;

use crate::{classify_response, AdapterContext, SourceAdapter};

/// Where each posting field lives inside one feed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedFields {
    pub title: String,
    pub company: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub post_date: Option<String>,
}

impl Default for FeedFields {
    fn default() -> Self {
        Self {
            title: "title".to_string(),
            company: Some("company".to_string()),
            location: Some("location".to_string()),
            url: Some("url".to_string()),
            description: Some("description".to_string()),
            post_date: Some("post_date".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSpec {
    pub url: String,
    /// JSON pointer to the item array; empty means the document itself.
    #[serde(default)]
    pub items_pointer: String,
    #[serde(default)]
    pub fields: FeedFields,
    /// Item keys copied verbatim into `source_meta`.
    #[serde(default)]
    pub meta_keys: Vec<String>,
    /// Leading items to drop, e.g. a legal notice at index 0.
    #[serde(default)]
    pub skip: usize,
    #[serde(default)]
    pub remote: Option<bool>,
    /// Query parameter that receives the incremental lower bound.
    #[serde(default)]
    pub since_param: Option<String>,
}

/// Generic JSON API adapter with conditional-request support.
#[derive(Debug, Clone)]
pub struct JsonFeedAdapter {
    source_id: String,
    spec: FeedSpec,
}

impl JsonFeedAdapter {
    pub fn new(source_id: impl Into<String>, spec: FeedSpec) -> Self {
        Self {
            source_id: source_id.into(),
            spec,
        }
    }

    pub fn spec(&self) -> &FeedSpec {
        &self.spec
    }
}

pub fn remotive_feed() -> JsonFeedAdapter {
    JsonFeedAdapter::new(
        "remotive",
        FeedSpec {
            url: "https://remotive.com/api/remote-jobs".to_string(),
            items_pointer: "/jobs".to_string(),
            fields: FeedFields {
                title: "title".to_string(),
                company: Some("company_name".to_string()),
                location: Some("candidate_required_location".to_string()),
                url: Some("url".to_string()),
                description: Some("description".to_string()),
                post_date: Some("publication_date".to_string()),
            },
            meta_keys: vec!["category".to_string(), "job_type".to_string(), "id".to_string()],
            skip: 0,
            remote: Some(true),
            since_param: None,
        },
    )
}

pub fn remoteok_feed() -> JsonFeedAdapter {
    JsonFeedAdapter::new(
        "remoteok",
        FeedSpec {
            url: "https://remoteok.com/api".to_string(),
            items_pointer: String::new(),
            fields: FeedFields {
                title: "position".to_string(),
                company: Some("company".to_string()),
                location: Some("location".to_string()),
                url: Some("url".to_string()),
                description: Some("description".to_string()),
                post_date: Some("date".to_string()),
            },
            meta_keys: vec!["id".to_string(), "tags".to_string(), "salary_min".to_string(), "salary_max".to_string()],
            skip: 1,
            remote: Some(true),
            since_param: None,
        },
    )
}

/// Project feed items onto the raw posting shape. Items missing a title are
/// still emitted so the caller can count them as parse failures.
pub fn map_feed_items(
    spec: &FeedSpec,
    source_id: &str,
    doc: &JsonValue,
) -> Result<Vec<JsonValue>, SourceError> {
    let items = doc
        .pointer(&spec.items_pointer)
        .and_then(JsonValue::as_array)
        .ok_or_else(|| {
            SourceError::unclassified(format!(
                "feed for {source_id} has no item array at {:?}",
                spec.items_pointer
            ))
        })?;

    let lookup = |item: &JsonValue, key: &Option<String>| -> JsonValue {
        key.as_deref()
            .and_then(|k| item.get(k))
            .cloned()
            .unwrap_or(JsonValue::Null)
    };

    Ok(items
        .iter()
        .skip(spec.skip)
        .map(|item| {
            let mut record = JsonMap::new();
            record.insert("title".into(), item.get(&spec.fields.title).cloned().unwrap_or(JsonValue::Null));
            record.insert("company".into(), lookup(item, &spec.fields.company));
            record.insert("location".into(), lookup(item, &spec.fields.location));
            record.insert("url".into(), lookup(item, &spec.fields.url));
            record.insert("description".into(), lookup(item, &spec.fields.description));
            record.insert("post_date".into(), lookup(item, &spec.fields.post_date));
            record.insert("source".into(), JsonValue::String(source_id.to_string()));
            record.insert("remote".into(), JsonValue::Bool(spec.remote.unwrap_or(false)));

            let meta: JsonMap<String, JsonValue> = spec
                .meta_keys
                .iter()
                .filter_map(|key| item.get(key).map(|v| (key.clone(), v.clone())))
                .collect();
            if !meta.is_empty() {
                record.insert("source_meta".into(), JsonValue::Object(meta));
            }
            JsonValue::Object(record)
        })
        .collect())
}

#[async_trait]
impl SourceAdapter for JsonFeedAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext,
        mut cursor: Option<&mut Cursor>,
    ) -> Result<Vec<JsonValue>, SourceError> {
        let cached = cursor
            .as_deref()
            .and_then(|c| c.http_cache.get(&self.spec.url))
            .cloned();

        let mut request = FetchRequest::get(&self.spec.url).cache(cached);
        if let Some(param) = &self.spec.since_param {
            request = request.param(param, ctx.since.to_rfc3339());
        }

        let response = ctx.fetch(request).await?;
        if response.is_not_modified() {
            info!(source_id = %self.source_id, url = %self.spec.url, "feed not modified");
            return Ok(Vec::new());
        }
        classify_response(&response)?;

        let doc: JsonValue = serde_json::from_slice(&response.body)
            .with_context(|| format!("decoding feed {}", self.spec.url))?;
        let items = map_feed_items(&self.spec, &self.source_id, &doc)?;

        if let Some(cursor) = cursor.as_deref_mut() {
            if response.cache.is_empty() {
                cursor.http_cache.remove(&self.spec.url);
            } else {
                cursor
                    .http_cache
                    .insert(self.spec.url.clone(), response.cache.clone());
            }
        }
        Ok(items)
    }
}
