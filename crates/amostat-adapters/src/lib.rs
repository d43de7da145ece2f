//! Typed amoCRM API over the transport, plus webhook payload decoding.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use amostat_core::{CustomFieldValue, Deal, OwnerEntity, OwnerKind, StageIds};
use amostat_storage::{
    CrmTransport, Method, Paginator, Payload, TransportError, DEFAULT_PAGE_INTERVAL,
    DEFAULT_PAGE_SIZE,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "amostat-adapters";

pub const SALES_PIPELINE_NAME: &str = "Продажа";
pub const SUCCESS_STAGE_NAME: &str = "Закрыто. Оплата получена";
pub const WEBHOOK_EVENTS: [&str; 3] = ["restore_lead", "add_lead", "status_lead"];
/// Upstream limit on entities per batch PATCH.
pub const PATCH_BATCH_LIMIT: usize = 250;
pub const LEADS_COLLECTION: &str = "leads";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{path} returned no content")]
    NotFound { path: String },
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),
    #[error("unexpected response shape from {path}: {message}")]
    UnexpectedShape { path: String, message: String },
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ApiError::NotFound { .. } => true,
            ApiError::Transport(err) => err.is_not_found(),
            _ => false,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transport(err) if err.is_transient())
    }
}

/// One element of a batch PATCH body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityPatch {
    pub id: i64,
    pub custom_fields_values: Vec<CustomFieldValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Numeric,
    Text,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Numeric => "numeric",
            FieldType::Text => "text",
        }
    }
}

/// Select option shape consumed by the settings widget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOption {
    pub value: String,
    pub label: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomFieldCatalog {
    pub company_numeric_fields: Vec<FieldOption>,
    pub company_string_fields: Vec<FieldOption>,
    pub contact_numeric_fields: Vec<FieldOption>,
    pub contact_string_fields: Vec<FieldOption>,
    pub lead_fields: Vec<FieldOption>,
}

#[derive(Debug, Clone, Deserialize)]
struct PipelineList {
    #[serde(rename = "_embedded")]
    embedded: PipelineListEmbedded,
}

#[derive(Debug, Clone, Deserialize)]
struct PipelineListEmbedded {
    #[serde(default)]
    pipelines: Vec<Pipeline>,
}

#[derive(Debug, Clone, Deserialize)]
struct Pipeline {
    id: i64,
    name: String,
    #[serde(rename = "_embedded", default)]
    embedded: PipelineEmbedded,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PipelineEmbedded {
    #[serde(default)]
    statuses: Vec<PipelineStage>,
}

#[derive(Debug, Clone, Deserialize)]
struct PipelineStage {
    id: i64,
    name: String,
    #[serde(default = "default_editable")]
    is_editable: bool,
}

fn default_editable() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct CustomFieldDefinition {
    id: i64,
    name: String,
    #[serde(rename = "type")]
    field_type: String,
}

fn decode<T: DeserializeOwned>(path: &str, value: JsonValue) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|err| ApiError::UnexpectedShape {
        path: path.to_string(),
        message: err.to_string(),
    })
}

#[derive(Clone)]
pub struct CrmApi {
    transport: Arc<dyn CrmTransport>,
    page_size: u32,
    page_interval: Duration,
}

impl CrmApi {
    pub fn new(transport: Arc<dyn CrmTransport>) -> Self {
        Self {
            transport,
            page_size: DEFAULT_PAGE_SIZE,
            page_interval: DEFAULT_PAGE_INTERVAL,
        }
    }

    pub fn with_paging(mut self, page_size: u32, page_interval: Duration) -> Self {
        self.page_size = page_size;
        self.page_interval = page_interval;
        self
    }

    async fn get_detail(&self, path: &str, with: &str) -> Result<JsonValue, ApiError> {
        let body = self
            .transport
            .request(Method::Get, path, Payload::query([("with", with)]))
            .await?;
        if body.is_null() {
            return Err(ApiError::NotFound {
                path: path.to_string(),
            });
        }
        Ok(body)
    }

    /// Contact or company with its linked leads (and, for contacts, companies).
    pub async fn get_owner(&self, kind: OwnerKind, id: i64) -> Result<OwnerEntity, ApiError> {
        let path = format!("api/v4/{}/{id}", kind.collection());
        let body = self.get_detail(&path, "leads").await?;
        decode(&path, body)
    }

    pub async fn get_deal(&self, id: i64) -> Result<Deal, ApiError> {
        let path = format!("api/v4/leads/{id}");
        let body = self.get_detail(&path, "contacts").await?;
        decode(&path, body)
    }

    /// Full detail of every deal linked to the owner, in link order.
    ///
    /// Deals whose payload does not decode are dropped, so they count as not classified.
    pub async fn deals_for(&self, owner: &OwnerEntity) -> Result<Vec<Deal>, ApiError> {
        let mut deals = Vec::new();
        for lead_id in owner.lead_ids() {
            match self.get_deal(lead_id).await {
                Ok(deal) => deals.push(deal),
                Err(ApiError::UnexpectedShape { path, message }) => {
                    warn!(%path, %message, "skipping malformed deal");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(deals)
    }

    pub fn owners(&self, kind: OwnerKind) -> OwnerPages {
        let paginator = Paginator::new(
            self.transport.clone(),
            kind.collection(),
            format!("api/v4/{}", kind.collection()),
            vec![("with".into(), "leads".into())],
            self.page_size,
        )
        .with_page_interval(self.page_interval);
        OwnerPages { kind, paginator }
    }

    pub async fn patch_many(&self, collection: &str, entries: &[EntityPatch]) -> Result<(), ApiError> {
        let path = format!("api/v4/{collection}");
        for chunk in entries.chunks(PATCH_BATCH_LIMIT) {
            let body = serde_json::to_value(chunk).map_err(|err| ApiError::UnexpectedShape {
                path: path.clone(),
                message: err.to_string(),
            })?;
            info!(collection, entities = chunk.len(), "patching custom fields");
            self.transport
                .request(Method::Patch, &path, Payload::Json(body))
                .await?;
        }
        Ok(())
    }

    /// Fill in whichever pipeline/stage ids are still unknown.
    pub async fn discover_stage_ids(&self, current: &StageIds) -> Result<StageIds, ApiError> {
        let mut found = current.clone();

        let listing = if found.pipeline_id.is_none() || found.inactive_stage_ids.is_none() {
            let path = "api/v4/leads/pipelines";
            let body = self.transport.request(Method::Get, path, Payload::None).await?;
            Some(decode::<PipelineList>(path, body)?)
        } else {
            None
        };

        if found.pipeline_id.is_none() {
            found.pipeline_id = listing
                .iter()
                .flat_map(|l| l.embedded.pipelines.iter())
                .find(|p| p.name == SALES_PIPELINE_NAME)
                .map(|p| p.id);
        }

        if let (None, Some(pipeline_id)) = (found.success_stage_id, found.pipeline_id) {
            let path = format!("api/v4/leads/pipelines/{pipeline_id}");
            let body = self.transport.request(Method::Get, &path, Payload::None).await?;
            let pipeline: Pipeline = decode(&path, body)?;
            found.success_stage_id = pipeline
                .embedded
                .statuses
                .iter()
                .find(|s| s.name == SUCCESS_STAGE_NAME)
                .map(|s| s.id);
        }

        if found.inactive_stage_ids.is_none() {
            if let Some(listing) = &listing {
                let mut seen = BTreeSet::new();
                let mut inactive = Vec::new();
                for stage in listing
                    .embedded
                    .pipelines
                    .iter()
                    .flat_map(|p| p.embedded.statuses.iter())
                {
                    if !stage.is_editable && seen.insert(stage.id) {
                        inactive.push(stage.id);
                    }
                }
                found.inactive_stage_ids = Some(inactive);
            }
        }

        debug!(?found, "stage discovery finished");
        Ok(found)
    }

    /// Registers the deal-change webhook unless one already targets `destination`.
    pub async fn install_webhook(&self, destination: &str) -> Result<bool, ApiError> {
        let path = "api/v4/webhooks";
        let existing = self
            .transport
            .request(
                Method::Get,
                path,
                Payload::query([("filter[destination]", destination)]),
            )
            .await?;
        let already = existing
            .get("_embedded")
            .and_then(|e| e.get("webhooks"))
            .and_then(|w| w.as_array())
            .is_some_and(|hooks| {
                hooks
                    .iter()
                    .any(|h| h.get("destination").and_then(|d| d.as_str()) == Some(destination))
            });
        if already {
            return Ok(false);
        }

        let body = serde_json::json!({
            "destination": destination,
            "settings": WEBHOOK_EVENTS,
        });
        self.transport
            .request(Method::Post, path, Payload::Json(body))
            .await?;
        info!(destination, "webhook installed");
        Ok(true)
    }

    pub async fn delete_webhook(&self, destination: &str) -> Result<(), ApiError> {
        self.transport
            .request(
                Method::Delete,
                "api/v4/webhooks",
                Payload::Json(serde_json::json!({ "destination": destination })),
            )
            .await?;
        info!(destination, "webhook removed");
        Ok(())
    }

    pub async fn custom_fields(
        &self,
        collection: &str,
        field_type: FieldType,
    ) -> Result<Vec<FieldOption>, ApiError> {
        let path = format!("api/v4/{collection}/custom_fields");
        let mut pages = Paginator::new(
            self.transport.clone(),
            "custom_fields",
            path.clone(),
            Vec::new(),
            self.page_size,
        )
        .with_page_interval(Duration::ZERO);

        let mut options = Vec::new();
        while let Some(items) = pages.next_page().await? {
            for item in items {
                let field: CustomFieldDefinition = decode(&path, item)?;
                if field.field_type == field_type.as_str() {
                    options.push(FieldOption {
                        value: field.id.to_string(),
                        label: field.name,
                    });
                }
            }
        }
        Ok(options)
    }

    pub async fn custom_field_catalog(&self) -> Result<CustomFieldCatalog, ApiError> {
        Ok(CustomFieldCatalog {
            company_numeric_fields: self.custom_fields("companies", FieldType::Numeric).await?,
            company_string_fields: self.custom_fields("companies", FieldType::Text).await?,
            contact_numeric_fields: self.custom_fields("contacts", FieldType::Numeric).await?,
            contact_string_fields: self.custom_fields("contacts", FieldType::Text).await?,
            lead_fields: self.custom_fields(LEADS_COLLECTION, FieldType::Numeric).await?,
        })
    }
}

/// Owners of one kind, one page at a time.
pub struct OwnerPages {
    kind: OwnerKind,
    paginator: Paginator,
}

impl OwnerPages {
    /// Next page of owners; items that fail to decode are logged and dropped.
    pub async fn next_page(&mut self) -> Result<Option<Vec<OwnerEntity>>, ApiError> {
        let Some(items) = self.paginator.next_page().await? else {
            return Ok(None);
        };
        let path = format!("api/v4/{}", self.kind.collection());
        let mut owners = Vec::with_capacity(items.len());
        for item in items {
            match decode::<OwnerEntity>(&path, item) {
                Ok(owner) => owners.push(owner),
                Err(err) => warn!(kind = self.kind.as_str(), error = %err, "skipping malformed owner"),
            }
        }
        Ok(Some(owners))
    }
}

fn split_form_key(key: &str) -> Option<Vec<String>> {
    let (head, mut rest) = match key.find('[') {
        Some(idx) => (&key[..idx], &key[idx..]),
        None => (key, ""),
    };
    if head.is_empty() {
        return None;
    }
    let mut segments = vec![head.to_string()];
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        segments.push(inner[..close].to_string());
        rest = &inner[close + 1..];
    }
    Some(segments)
}

fn insert_nested(
    target: &mut Map<String, JsonValue>,
    segments: &[String],
    value: String,
) -> Result<(), ApiError> {
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| ApiError::MalformedPayload("empty key".into()))?;
    let mut node = target;
    for segment in parents {
        let entry = node
            .entry(segment.clone())
            .or_insert_with(|| JsonValue::Object(Map::new()));
        node = entry.as_object_mut().ok_or_else(|| {
            ApiError::MalformedPayload(format!("key `{segment}` is both a value and a mapping"))
        })?;
    }
    node.insert(last.clone(), JsonValue::String(value));
    Ok(())
}

/// Mappings keyed only by indices become arrays ordered by index.
fn normalize_indexed(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let all_indexed =
                !map.is_empty() && map.keys().all(|k| k.parse::<usize>().is_ok());
            if all_indexed {
                let mut items: Vec<(usize, JsonValue)> = map
                    .into_iter()
                    .filter_map(|(k, v)| k.parse::<usize>().ok().map(|i| (i, normalize_indexed(v))))
                    .collect();
                items.sort_by_key(|(i, _)| *i);
                JsonValue::Array(items.into_iter().map(|(_, v)| v).collect())
            } else {
                JsonValue::Object(
                    map.into_iter()
                        .map(|(k, v)| (k, normalize_indexed(v)))
                        .collect(),
                )
            }
        }
        other => other,
    }
}

/// Decode a form-encoded webhook body (`leads[status][0][id]=1`) into nested JSON.
pub fn parse_form_payload(body: &str) -> Result<JsonValue, ApiError> {
    let mut root = Map::new();
    for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
        let segments = split_form_key(&key)
            .ok_or_else(|| ApiError::MalformedPayload(format!("unparseable key `{key}`")))?;
        insert_nested(&mut root, &segments, value.into_owned())?;
    }
    if root.is_empty() {
        return Err(ApiError::MalformedPayload("empty body".into()));
    }
    Ok(normalize_indexed(JsonValue::Object(root)))
}

/// Id of the first deal in the first event group under `leads`.
pub fn lead_id_from_hook(payload: &JsonValue) -> Result<i64, ApiError> {
    let id = payload
        .get("leads")
        .and_then(|l| l.as_object())
        .and_then(|groups| groups.values().next())
        .and_then(|group| group.as_array())
        .and_then(|items| items.first())
        .and_then(|item| item.get("id"))
        .ok_or_else(|| ApiError::MalformedPayload("no leads[..][0][id] entry".into()))?;
    match id {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| ApiError::MalformedPayload(format!("lead id `{id}` is not an integer")))
}
