use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use jobradar_core::{Cursor, SourceError};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{AdapterContext, BlockingAdapter, BlockingPool, SourceAdapter};

/// Replays postings from a JSON file: either an array or `{"postings": [...]}`.
/// Reads happen on the blocking pool, so fixture sources share its width limit.
#[derive(Debug)]
pub struct FixtureAdapter {
    path: PathBuf,
    inner: BlockingAdapter,
}

impl FixtureAdapter {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>, pool: BlockingPool) -> Self {
        let source_id = source_id.into();
        let path = path.into();
        let inner = {
            let source_id = source_id.clone();
            let path = path.clone();
            BlockingAdapter::new(source_id.clone(), pool, move |_| read_fixture(&source_id, &path))
                .without_cursor()
        };
        Self { path, inner }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source_id(&self) -> &str {
        self.inner.source_id()
    }

    fn accepts_cursor(&self) -> bool {
        false
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext,
        _cursor: Option<&mut Cursor>,
    ) -> Result<Vec<JsonValue>, SourceError> {
        self.inner.fetch(ctx, None).await
    }
}

/// Load a fixture file and stamp `source_id` onto records that lack one.
pub fn read_fixture(source_id: &str, path: &Path) -> Result<Vec<JsonValue>, SourceError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(SourceError::BadConfig(format!(
                "fixture {} does not exist",
                path.display()
            )));
        }
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("reading {}", path.display()))
                .into())
        }
    };
    let doc: JsonValue =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let items = match doc {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut map) => match map.remove("postings") {
            Some(JsonValue::Array(items)) => items,
            _ => {
                return Err(SourceError::BadConfig(format!(
                    "{} has no postings array",
                    path.display()
                )))
            }
        },
        _ => {
            return Err(SourceError::BadConfig(format!(
                "{} is not a postings document",
                path.display()
            )))
        }
    };

    let items: Vec<JsonValue> = items
        .into_iter()
        .map(|mut item| {
            if let JsonValue::Object(map) = &mut item {
                map.entry("source")
                    .or_insert_with(|| JsonValue::String(source_id.to_string()));
            }
            item
        })
        .collect();
    debug!(source_id = %source_id, count = items.len(), "loaded fixture postings");
    Ok(items)
}
