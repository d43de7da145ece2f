//! Entity-evaluation engine: field batching, rule application, webhook and bulk runs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use amostat_adapters::{lead_id_from_hook, ApiError, CrmApi, EntityPatch, LEADS_COLLECTION};
use amostat_core::{
    aggregate, find_custom_field, last_full_payment, stringify_scalar, CustomFieldValue,
    OwnerEntity, OwnerKind, OwnerSetting, PipelineConfig, StatusSetting,
};
use amostat_storage::{
    AmoTransport, GrantType, HttpClientConfig, OAuthConfig, DEFAULT_PAGE_SIZE,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

mod store;

pub use store::{
    open_settings_store, FileSettingsStore, PgSettingsStore, SettingsStore, StoreTokenSink,
};

pub const CRATE_NAME: &str = "amostat-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub base_url: Option<String>,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub auth_code: Option<String>,
    pub app_host: Option<String>,
    pub settings_file: PathBuf,
    pub scheduler_enabled: bool,
    pub contact_check_cron: String,
    pub company_check_cron: String,
    pub http_timeout_secs: u64,
    pub page_interval_secs: u64,
    pub lead_paid_field: Option<i64>,
    pub company_last_payment_field: Option<i64>,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let base_url = env_opt("AMO_BASE_URL")
            .or_else(|| env_opt("AMO_ACCOUNT").map(|account| format!("https://{account}.amocrm.ru")));
        Self {
            database_url: env_opt("DATABASE_URL"),
            base_url,
            client_id: env_opt("AMO_CLIENT_ID").unwrap_or_default(),
            client_secret: env_opt("AMO_CLIENT_SECRET").unwrap_or_default(),
            redirect_uri: env_opt("AMO_REDIRECT_URI").unwrap_or_default(),
            auth_code: env_opt("AMO_AUTH_CODE"),
            app_host: env_opt("APP_HOST"),
            settings_file: env_opt("AMOSTAT_SETTINGS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./amostat-settings.yaml")),
            scheduler_enabled: std::env::var("AMOSTAT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            contact_check_cron: env_opt("AMOSTAT_CONTACT_CHECK_CRON")
                .unwrap_or_else(|| "0 0 2 * * *".to_string()),
            company_check_cron: env_opt("AMOSTAT_COMPANY_CHECK_CRON")
                .unwrap_or_else(|| "0 0 4 * * *".to_string()),
            http_timeout_secs: env_opt("AMOSTAT_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            page_interval_secs: env_opt("AMOSTAT_PAGE_INTERVAL_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            lead_paid_field: env_opt("AMOSTAT_LEAD_PAID_FIELD").and_then(|v| v.parse().ok()),
            company_last_payment_field: env_opt("AMOSTAT_COMPANY_LAST_PAYMENT_FIELD")
                .and_then(|v| v.parse().ok()),
        }
    }

    pub fn webhook_destination(&self) -> Option<String> {
        self.app_host
            .as_ref()
            .map(|host| format!("{}/settings/handle-hook", host.trim_end_matches('/')))
    }

    pub fn payment_fields(&self) -> Option<PaymentFields> {
        Some(PaymentFields {
            lead_paid_field: self.lead_paid_field?,
            company_last_payment_field: self.company_last_payment_field?,
        })
    }

    fn oauth(&self) -> OAuthConfig {
        OAuthConfig {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            redirect_uri: self.redirect_uri.clone(),
            auth_code: self.auth_code.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
    #[error("no {0} settings have been saved")]
    MissingSettings(OwnerKind),
    #[error("sales pipeline stages could not be discovered")]
    PipelineNotDiscovered,
    #[error("flushing field updates failed: {0}")]
    Flush(#[source] ApiError),
}

/// Pending custom-field writes for one run, keyed by collection then entity id.
#[derive(Debug, Default)]
pub struct FieldBatcher {
    pending: BTreeMap<&'static str, BTreeMap<i64, EntityPatch>>,
}

impl FieldBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.values().all(BTreeMap::is_empty)
    }

    /// Queued entities of one collection, ordered by id.
    pub fn pending(&self, collection: &str) -> Vec<&EntityPatch> {
        self.pending
            .get(collection)
            .map(|entities| entities.values().collect())
            .unwrap_or_default()
    }

    fn take(&mut self, collection: &str) -> Vec<EntityPatch> {
        self.pending
            .remove(collection)
            .map(|entities| entities.into_values().collect())
            .unwrap_or_default()
    }

    fn queue(&mut self, collection: &'static str, entity_id: i64, field_id: i64, value: JsonValue) {
        let entity = self
            .pending
            .entry(collection)
            .or_default()
            .entry(entity_id)
            .or_insert_with(|| EntityPatch {
                id: entity_id,
                custom_fields_values: Vec::new(),
            });
        let field = CustomFieldValue::single(field_id, value);
        match entity
            .custom_fields_values
            .iter_mut()
            .find(|f| f.field_id == field_id)
        {
            Some(existing) => *existing = field,
            None => entity.custom_fields_values.push(field),
        }
    }

    /// Queues `value` unless the snapshot already holds the same value. Returns whether it queued.
    pub fn write_if_different(
        &mut self,
        kind: OwnerKind,
        entity_id: i64,
        field_id: i64,
        value: impl Into<JsonValue>,
        snapshot: Option<&[CustomFieldValue]>,
    ) -> bool {
        let value = value.into();
        if let Some(field) = find_custom_field(snapshot, field_id) {
            let current = field.first_value().and_then(stringify_scalar);
            match (current, stringify_scalar(&value)) {
                (Some(current), Some(new)) if current == new => return false,
                (Some(_), Some(_)) => {}
                _ => warn!(
                    kind = kind.as_str(),
                    entity_id,
                    field_id,
                    "field value type mismatch while diffing, queueing write"
                ),
            }
        }
        self.queue(kind.collection(), entity_id, field_id, value);
        true
    }

    pub fn queue_lead_updates(&mut self, deal_ids: &[i64], lead_field_id: i64, value: impl Into<JsonValue>) {
        let value = value.into();
        for &deal_id in deal_ids {
            self.queue(LEADS_COLLECTION, deal_id, lead_field_id, value.clone());
        }
    }

    /// One batch PATCH per owner collection with pending writes. Returns entities written.
    pub async fn flush_entity_updates(&mut self, api: &CrmApi) -> Result<usize, ApiError> {
        let collections: Vec<&'static str> = self
            .pending
            .keys()
            .copied()
            .filter(|c| *c != LEADS_COLLECTION)
            .collect();
        let mut written = 0;
        for collection in collections {
            let entries = self.take(collection);
            if entries.is_empty() {
                continue;
            }
            api.patch_many(collection, &entries).await?;
            written += entries.len();
        }
        Ok(written)
    }

    pub async fn flush_lead_updates(
        &mut self,
        api: &CrmApi,
        active_deal_ids: &[i64],
        lead_field_id: i64,
        value: impl Into<JsonValue>,
    ) -> Result<usize, ApiError> {
        self.queue_lead_updates(active_deal_ids, lead_field_id, value);
        self.flush_queued_leads(api).await
    }

    pub async fn flush_queued_leads(&mut self, api: &CrmApi) -> Result<usize, ApiError> {
        let entries = self.take(LEADS_COLLECTION);
        if entries.is_empty() {
            return Ok(0);
        }
        api.patch_many(LEADS_COLLECTION, &entries).await?;
        Ok(entries.len())
    }
}

/// Every rule is evaluated in configured order; each match queues its status.
pub fn apply_rules(
    kind: OwnerKind,
    owner_id: i64,
    sum: i64,
    count: i64,
    snapshot: Option<&[CustomFieldValue]>,
    rules: &[StatusSetting],
    batcher: &mut FieldBatcher,
) {
    for rule in rules {
        let value = rule.comparison_value(sum, count);
        if rule.matches(value) {
            debug!(owner_id, field_id = rule.field_id, status = %rule.status, value, "rule matched");
            batcher.write_if_different(kind, owner_id, rule.field_id, rule.status.clone(), snapshot);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentFields {
    pub lead_paid_field: i64,
    pub company_last_payment_field: i64,
}

/// Everything needed to evaluate owners of one kind.
#[derive(Debug, Clone)]
pub struct OwnerProfile {
    pub kind: OwnerKind,
    pub setting: OwnerSetting,
    pub rules: Vec<StatusSetting>,
    pub payment_fields: Option<PaymentFields>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnerOutcome {
    pub owner_id: i64,
    pub sum: i64,
    pub count: i64,
    pub active_deals: usize,
}

/// Fetches the owner's deals and queues every resulting write; nothing is sent.
pub async fn evaluate_owner(
    api: &CrmApi,
    profile: &OwnerProfile,
    config: &PipelineConfig,
    owner: &OwnerEntity,
    batcher: &mut FieldBatcher,
    now: DateTime<Utc>,
) -> Result<OwnerOutcome, ApiError> {
    let deals = api.deals_for(owner).await?;
    let totals = aggregate(&deals, config, profile.setting.months, now);
    let snapshot = owner.snapshot();
    let kind = profile.kind;

    apply_rules(
        kind,
        owner.id,
        totals.sum(),
        totals.count(),
        snapshot,
        &profile.rules,
        batcher,
    );

    let scalar = kind.aggregate_scalar(&totals);
    batcher.write_if_different(kind, owner.id, profile.setting.owner_field_id, scalar, snapshot);
    batcher.queue_lead_updates(&totals.active_deal_ids, profile.setting.lead_field_id, scalar);

    if let Some(fields) = profile.payment_fields {
        if let Some(amount) = last_full_payment(&deals, fields.lead_paid_field) {
            batcher.write_if_different(
                kind,
                owner.id,
                fields.company_last_payment_field,
                amount,
                snapshot,
            );
        }
    }

    Ok(OwnerOutcome {
        owner_id: owner.id,
        sum: totals.sum(),
        count: totals.count(),
        active_deals: totals.active_deal_ids.len(),
    })
}

/// Loads stage ids, discovers whatever is unset and persists the result.
pub async fn ensure_pipeline_config(
    api: &CrmApi,
    store: &dyn SettingsStore,
) -> Result<PipelineConfig, SyncError> {
    let stored = store.stage_ids().await?;
    let ids = if stored.is_complete() {
        stored
    } else {
        let found = api.discover_stage_ids(&stored).await?;
        if found != stored {
            store.save_stage_ids(&found).await?;
            info!(?found, "stage ids discovered");
        }
        found
    };
    ids.resolve().ok_or(SyncError::PipelineNotDiscovered)
}

/// Process-wide pipeline configuration, filled at most once.
#[derive(Debug, Default)]
pub struct PipelineConfigCache {
    cell: OnceCell<PipelineConfig>,
}

impl PipelineConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_discover(
        &self,
        api: &CrmApi,
        store: &dyn SettingsStore,
    ) -> Result<PipelineConfig, SyncError> {
        self.cell
            .get_or_try_init(|| ensure_pipeline_config(api, store))
            .await
            .cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStage {
    Received,
    ResolvingDeal,
    ResolvingContact,
    ResolvingCompany,
    EvaluatingContact,
    EvaluatingCompany,
    Flushing,
    Done,
}

impl HookStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookStage::Received => "received",
            HookStage::ResolvingDeal => "resolving_deal",
            HookStage::ResolvingContact => "resolving_contact",
            HookStage::ResolvingCompany => "resolving_company",
            HookStage::EvaluatingContact => "evaluating_contact",
            HookStage::EvaluatingCompany => "evaluating_company",
            HookStage::Flushing => "flushing",
            HookStage::Done => "done",
        }
    }
}

fn enter(stage: HookStage) -> HookStage {
    info!(stage = stage.as_str(), "hook stage");
    stage
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "kind", rename_all = "snake_case")]
pub enum RunKind {
    Hook,
    Bulk(OwnerKind),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub owners_evaluated: usize,
    pub owners_skipped: usize,
    pub entities_written: usize,
    pub leads_written: usize,
}

impl RunResult {
    fn start(kind: RunKind) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            kind,
            started_at: now,
            finished_at: now,
            owners_evaluated: 0,
            owners_skipped: 0,
            entities_written: 0,
            leads_written: 0,
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }
}

pub struct Engine {
    api: CrmApi,
    store: Arc<dyn SettingsStore>,
    pipeline: Arc<PipelineConfigCache>,
    payment_fields: Option<PaymentFields>,
}

impl Engine {
    pub fn new(api: CrmApi, store: Arc<dyn SettingsStore>) -> Self {
        Self {
            api,
            store,
            pipeline: Arc::new(PipelineConfigCache::new()),
            payment_fields: None,
        }
    }

    pub fn with_payment_fields(mut self, fields: Option<PaymentFields>) -> Self {
        self.payment_fields = fields;
        self
    }

    pub fn api(&self) -> &CrmApi {
        &self.api
    }

    pub fn store(&self) -> Arc<dyn SettingsStore> {
        self.store.clone()
    }

    pub async fn pipeline_config(&self) -> Result<PipelineConfig, SyncError> {
        self.pipeline
            .get_or_discover(&self.api, self.store.as_ref())
            .await
    }

    async fn profile(&self, kind: OwnerKind, bulk: bool) -> Result<OwnerProfile, SyncError> {
        let setting = self
            .store
            .owner_setting(kind)
            .await?
            .ok_or(SyncError::MissingSettings(kind))?;
        let rules = self.store.status_settings_for(kind).await?;
        let payment_fields = match kind {
            OwnerKind::Company if bulk => self.payment_fields,
            _ => None,
        };
        Ok(OwnerProfile {
            kind,
            setting,
            rules,
            payment_fields,
        })
    }

    async fn flush(&self, batcher: &mut FieldBatcher, result: &mut RunResult) -> Result<(), SyncError> {
        result.entities_written = batcher
            .flush_entity_updates(&self.api)
            .await
            .map_err(SyncError::Flush)?;
        result.leads_written = batcher
            .flush_queued_leads(&self.api)
            .await
            .map_err(SyncError::Flush)?;
        Ok(())
    }

    /// Recomputes the main contact and its first company for the deal named in a webhook.
    pub async fn handle_event(&self, payload: &JsonValue) -> Result<RunResult, SyncError> {
        let result = RunResult::start(RunKind::Hook);
        let span = info_span!("hook_run", run_id = %result.run_id);
        self.run_hook(payload, result).instrument(span).await
    }

    async fn run_hook(&self, payload: &JsonValue, mut result: RunResult) -> Result<RunResult, SyncError> {
        enter(HookStage::Received);

        enter(HookStage::ResolvingDeal);
        let lead_id = lead_id_from_hook(payload)?;
        let deal = self.api.get_deal(lead_id).await?;

        enter(HookStage::ResolvingContact);
        let Some(contact_id) = deal.main_contact_id() else {
            info!(lead_id, "deal has no main contact, nothing to update");
            enter(HookStage::Done);
            return Ok(result.finish());
        };
        let contact = self.api.get_owner(OwnerKind::Contact, contact_id).await?;

        let company = match contact.first_company_id() {
            Some(company_id) => {
                enter(HookStage::ResolvingCompany);
                match self.api.get_owner(OwnerKind::Company, company_id).await {
                    Ok(company) => Some(company),
                    Err(err) if err.is_not_found() => {
                        warn!(company_id, error = %err, "linked company not found, skipping it");
                        None
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            None => None,
        };

        let config = self.pipeline_config().await?;
        let now = Utc::now();
        let mut batcher = FieldBatcher::new();

        enter(HookStage::EvaluatingContact);
        let profile = self.profile(OwnerKind::Contact, false).await?;
        evaluate_owner(&self.api, &profile, &config, &contact, &mut batcher, now).await?;
        result.owners_evaluated += 1;

        if let Some(company) = &company {
            enter(HookStage::EvaluatingCompany);
            let profile = self.profile(OwnerKind::Company, false).await?;
            evaluate_owner(&self.api, &profile, &config, company, &mut batcher, now).await?;
            result.owners_evaluated += 1;
        }

        enter(HookStage::Flushing);
        self.flush(&mut batcher, &mut result).await?;

        enter(HookStage::Done);
        Ok(result.finish())
    }

    /// Sweeps every owner of `kind`, then flushes once. The running flag is always cleared.
    pub async fn run_bulk_check(&self, kind: OwnerKind) -> Result<RunResult, SyncError> {
        let result = RunResult::start(RunKind::Bulk(kind));
        let span = info_span!("bulk_check", run_id = %result.run_id, kind = kind.as_str());
        async {
            if let Err(err) = self.store.set_check_running(kind, true).await {
                return Err(SyncError::Store(err));
            }
            let outcome = self.sweep(kind, result).await;
            if let Err(err) = self.store.set_check_running(kind, false).await {
                warn!(error = %err, "failed to clear check running flag");
            }
            match &outcome {
                Ok(r) => info!(
                    evaluated = r.owners_evaluated,
                    skipped = r.owners_skipped,
                    entities = r.entities_written,
                    leads = r.leads_written,
                    "bulk check finished"
                ),
                Err(err) => warn!(error = %err, "bulk check failed"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn sweep(&self, kind: OwnerKind, mut result: RunResult) -> Result<RunResult, SyncError> {
        let config = self.pipeline_config().await?;
        let profile = self.profile(kind, true).await?;
        let now = Utc::now();
        let mut batcher = FieldBatcher::new();
        let mut pages = self.api.owners(kind);

        loop {
            let owners = match pages.next_page().await {
                Ok(Some(owners)) => owners,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "page fetch failed, ending sweep early");
                    break;
                }
            };
            for owner in &owners {
                let mut retried = false;
                loop {
                    match evaluate_owner(&self.api, &profile, &config, owner, &mut batcher, now).await {
                        Ok(_) => {
                            result.owners_evaluated += 1;
                            break;
                        }
                        Err(err) if err.is_transient() && !retried => {
                            warn!(owner_id = owner.id, error = %err, "transient failure, retrying owner");
                            retried = true;
                        }
                        Err(err) => {
                            warn!(owner_id = owner.id, error = %err, "owner evaluation failed, skipping");
                            result.owners_skipped += 1;
                            break;
                        }
                    }
                }
            }
        }

        self.flush(&mut batcher, &mut result).await?;
        Ok(result.finish())
    }
}

/// Store, authenticated transport and engine wired from one config.
pub struct SyncContext {
    pub config: SyncConfig,
    pub store: Arc<dyn SettingsStore>,
    pub transport: Arc<AmoTransport>,
    pub engine: Arc<Engine>,
}

impl SyncContext {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store = open_settings_store(&config).await?;
        let base_url = config
            .base_url
            .clone()
            .context("AMO_BASE_URL or AMO_ACCOUNT must be set")?;
        let tokens = store.tokens().await?;
        let transport = AmoTransport::new(
            base_url,
            config.oauth(),
            tokens,
            HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                ..Default::default()
            },
        )?
        .with_token_sink(Arc::new(StoreTokenSink::new(store.clone())));
        let transport = Arc::new(transport);

        let api = CrmApi::new(transport.clone())
            .with_paging(DEFAULT_PAGE_SIZE, Duration::from_secs(config.page_interval_secs));
        let engine = Engine::new(api, store.clone()).with_payment_fields(config.payment_fields());

        Ok(Self {
            config,
            store,
            transport,
            engine: Arc::new(engine),
        })
    }

    pub async fn from_env() -> Result<Self> {
        Self::from_config(SyncConfig::from_env()).await
    }

    /// Exchanges an authorization code, discovers stage ids and registers the webhook.
    pub async fn install(&self, auth_code: &str) -> Result<bool> {
        self.transport
            .authorize(GrantType::AuthorizationCode, auth_code)
            .await
            .context("exchanging authorization code")?;
        self.engine.pipeline_config().await?;
        match self.config.webhook_destination() {
            Some(destination) => Ok(self.engine.api().install_webhook(&destination).await?),
            None => {
                warn!("APP_HOST is not set, webhook not installed");
                Ok(false)
            }
        }
    }

    pub async fn uninstall(&self) -> Result<()> {
        let destination = self
            .config
            .webhook_destination()
            .context("APP_HOST must be set to remove the webhook")?;
        self.engine.api().delete_webhook(&destination).await?;
        Ok(())
    }
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    engine: Arc<Engine>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for (kind, cron) in [
        (OwnerKind::Contact, &config.contact_check_cron),
        (OwnerKind::Company, &config.company_check_cron),
    ] {
        let engine = engine.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let engine = engine.clone();
            Box::pin(async move {
                info!(kind = kind.as_str(), "scheduled bulk check triggered");
                if let Err(err) = engine.run_bulk_check(kind).await {
                    warn!(kind = kind.as_str(), error = %err, "scheduled bulk check failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

pub async fn run_migrations(config: &SyncConfig) -> Result<()> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to run migrations")?;
    let pool = sqlx::PgPool::connect(database_url)
        .await
        .context("connecting to database")?;
    PgSettingsStore::new(pool).migrate().await
}

pub async fn run_bulk_check_from_env(kind: OwnerKind) -> Result<RunResult> {
    let ctx = SyncContext::from_env().await?;
    Ok(ctx.engine.run_bulk_check(kind).await?)
}
