//! Persistence for status settings, owner settings, stage ids, tokens and check flags.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use amostat_core::{DependencyType, OwnerKind, OwnerSetting, StageIds, StatusSetting};
use amostat_storage::{TokenPair, TokenSink};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::SyncConfig;

#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// All rules in configured order.
    async fn status_settings(&self) -> Result<Vec<StatusSetting>>;

    async fn status_settings_for(&self, kind: OwnerKind) -> Result<Vec<StatusSetting>> {
        Ok(self
            .status_settings()
            .await?
            .into_iter()
            .filter(|s| s.entity_type == kind)
            .collect())
    }

    /// Replaces every rule; returns the stored rows with their ids.
    async fn replace_status_settings(&self, settings: Vec<StatusSetting>) -> Result<Vec<StatusSetting>>;

    async fn owner_setting(&self, kind: OwnerKind) -> Result<Option<OwnerSetting>>;
    async fn save_owner_setting(&self, kind: OwnerKind, setting: &OwnerSetting) -> Result<()>;

    async fn stage_ids(&self) -> Result<StageIds>;
    async fn save_stage_ids(&self, ids: &StageIds) -> Result<()>;

    async fn tokens(&self) -> Result<Option<TokenPair>>;
    async fn save_tokens(&self, tokens: &TokenPair) -> Result<()>;

    async fn check_running(&self, kind: OwnerKind) -> Result<bool>;
    async fn set_check_running(&self, kind: OwnerKind, running: bool) -> Result<()>;
}

/// Hands refreshed OAuth tokens from the transport to the settings store.
pub struct StoreTokenSink {
    store: Arc<dyn SettingsStore>,
}

impl StoreTokenSink {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TokenSink for StoreTokenSink {
    async fn store_tokens(&self, tokens: &TokenPair) -> Result<()> {
        self.store.save_tokens(tokens).await
    }
}

/// Postgres when `DATABASE_URL` is reachable, the YAML file otherwise.
pub async fn open_settings_store(config: &SyncConfig) -> Result<Arc<dyn SettingsStore>> {
    if let Some(database_url) = &config.database_url {
        match PgPool::connect(database_url).await {
            Ok(pool) => {
                let store = PgSettingsStore::new(pool);
                store.migrate().await?;
                return Ok(Arc::new(store));
            }
            Err(err) => warn!(error = %err, "database unavailable, using settings file"),
        }
    }
    info!(path = %config.settings_file.display(), "using file settings store");
    Ok(Arc::new(FileSettingsStore::new(&config.settings_file)))
}

fn dependency_to_db(dependency: DependencyType) -> &'static str {
    match dependency {
        DependencyType::Quantity => "quantity",
        DependencyType::Sum => "sum",
    }
}

fn dependency_from_db(raw: &str) -> Result<DependencyType> {
    match raw {
        "quantity" => Ok(DependencyType::Quantity),
        "sum" => Ok(DependencyType::Sum),
        other => bail!("unknown dependency type `{other}`"),
    }
}

#[derive(Clone)]
pub struct PgSettingsStore {
    pool: PgPool,
}

impl PgSettingsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running settings migrations")
    }
}

#[async_trait]
impl SettingsStore for PgSettingsStore {
    async fn status_settings(&self) -> Result<Vec<StatusSetting>> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, dependency_type, entity_type, field_id, from_amount, to_amount
              FROM status_settings
             ORDER BY position, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let dependency: String = row.try_get("dependency_type")?;
            let entity: String = row.try_get("entity_type")?;
            out.push(StatusSetting {
                id: Some(row.try_get("id")?),
                status: row.try_get("status")?,
                dependency_type: dependency_from_db(&dependency)?,
                entity_type: entity.parse()?,
                field_id: row.try_get("field_id")?,
                from_amount: row.try_get("from_amount")?,
                to_amount: row.try_get("to_amount")?,
            });
        }
        Ok(out)
    }

    async fn replace_status_settings(&self, settings: Vec<StatusSetting>) -> Result<Vec<StatusSetting>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM status_settings")
            .execute(&mut *tx)
            .await?;

        let mut saved = Vec::with_capacity(settings.len());
        for (position, mut setting) in settings.into_iter().enumerate() {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO status_settings
                    (position, status, dependency_type, entity_type, field_id, from_amount, to_amount)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING id
                "#,
            )
            .bind(i32::try_from(position)?)
            .bind(&setting.status)
            .bind(dependency_to_db(setting.dependency_type))
            .bind(setting.entity_type.as_str())
            .bind(setting.field_id)
            .bind(setting.from_amount)
            .bind(setting.to_amount)
            .fetch_one(&mut *tx)
            .await?;
            setting.id = Some(id);
            saved.push(setting);
        }
        tx.commit().await?;
        Ok(saved)
    }

    async fn owner_setting(&self, kind: OwnerKind) -> Result<Option<OwnerSetting>> {
        let row = sqlx::query(
            "SELECT months, lead_field_id, owner_field_id FROM owner_settings WHERE kind = $1",
        )
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<OwnerSetting> {
            let months: i32 = row.try_get("months")?;
            Ok(OwnerSetting {
                months: u32::try_from(months)?,
                lead_field_id: row.try_get("lead_field_id")?,
                owner_field_id: row.try_get("owner_field_id")?,
            })
        })
        .transpose()
    }

    async fn save_owner_setting(&self, kind: OwnerKind, setting: &OwnerSetting) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO owner_settings (kind, months, lead_field_id, owner_field_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (kind) DO UPDATE
               SET months = EXCLUDED.months,
                   lead_field_id = EXCLUDED.lead_field_id,
                   owner_field_id = EXCLUDED.owner_field_id,
                   updated_at = now()
            "#,
        )
        .bind(kind.as_str())
        .bind(i32::try_from(setting.months)?)
        .bind(setting.lead_field_id)
        .bind(setting.owner_field_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stage_ids(&self) -> Result<StageIds> {
        let row = sqlx::query(
            "SELECT pipeline_id, success_stage_id, inactive_stage_ids FROM stage_ids WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(StageIds {
                pipeline_id: row.try_get("pipeline_id")?,
                success_stage_id: row.try_get("success_stage_id")?,
                inactive_stage_ids: row.try_get("inactive_stage_ids")?,
            }),
            None => Ok(StageIds::default()),
        }
    }

    async fn save_stage_ids(&self, ids: &StageIds) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stage_ids (id, pipeline_id, success_stage_id, inactive_stage_ids)
            VALUES (1, $1, $2, $3)
            ON CONFLICT (id) DO UPDATE
               SET pipeline_id = EXCLUDED.pipeline_id,
                   success_stage_id = EXCLUDED.success_stage_id,
                   inactive_stage_ids = EXCLUDED.inactive_stage_ids
            "#,
        )
        .bind(ids.pipeline_id)
        .bind(ids.success_stage_id)
        .bind(ids.inactive_stage_ids.clone())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn tokens(&self) -> Result<Option<TokenPair>> {
        let row = sqlx::query("SELECT access_token, refresh_token FROM integration_tokens WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> Result<TokenPair> {
            Ok(TokenPair {
                access_token: row.try_get("access_token")?,
                refresh_token: row.try_get("refresh_token")?,
            })
        })
        .transpose()
    }

    async fn save_tokens(&self, tokens: &TokenPair) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO integration_tokens (id, access_token, refresh_token)
            VALUES (1, $1, $2)
            ON CONFLICT (id) DO UPDATE
               SET access_token = EXCLUDED.access_token,
                   refresh_token = EXCLUDED.refresh_token,
                   updated_at = now()
            "#,
        )
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn check_running(&self, kind: OwnerKind) -> Result<bool> {
        let running: Option<bool> =
            sqlx::query_scalar("SELECT running FROM check_status WHERE kind = $1")
                .bind(kind.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(running.unwrap_or(false))
    }

    async fn set_check_running(&self, kind: OwnerKind, running: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO check_status (kind, running) VALUES ($1, $2)
            ON CONFLICT (kind) DO UPDATE SET running = EXCLUDED.running, updated_at = now()
            "#,
        )
        .bind(kind.as_str())
        .bind(running)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct CheckFlags {
    #[serde(default)]
    contact: bool,
    #[serde(default)]
    company: bool,
}

impl CheckFlags {
    fn slot(&mut self, kind: OwnerKind) -> &mut bool {
        match kind {
            OwnerKind::Contact => &mut self.contact,
            OwnerKind::Company => &mut self.company,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SettingsDocument {
    #[serde(default)]
    status_settings: Vec<StatusSetting>,
    #[serde(default)]
    contact: Option<OwnerSetting>,
    #[serde(default)]
    company: Option<OwnerSetting>,
    #[serde(default)]
    stage_ids: StageIds,
    #[serde(default)]
    tokens: Option<TokenPair>,
    #[serde(default)]
    checks: CheckFlags,
}

impl SettingsDocument {
    fn owner_slot(&mut self, kind: OwnerKind) -> &mut Option<OwnerSetting> {
        match kind {
            OwnerKind::Contact => &mut self.contact,
            OwnerKind::Company => &mut self.company,
        }
    }
}

/// Single YAML document; every write rewrites the whole file.
pub struct FileSettingsStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSettingsStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<SettingsDocument> {
        match fs::read_to_string(&self.path).await {
            Ok(text) if text.trim().is_empty() => Ok(SettingsDocument::default()),
            Ok(text) => serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", self.path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(SettingsDocument::default()),
            Err(err) => Err(err).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    async fn save(&self, doc: &SettingsDocument) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let text = serde_yaml::to_string(doc)?;
        fs::write(&self.path, text)
            .await
            .with_context(|| format!("writing {}", self.path.display()))
    }

    async fn update<T: Send>(
        &self,
        apply: impl FnOnce(&mut SettingsDocument) -> T + Send,
    ) -> Result<T> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load().await?;
        let out = apply(&mut doc);
        self.save(&doc).await?;
        Ok(out)
    }

    async fn read(&self) -> Result<SettingsDocument> {
        let _guard = self.lock.lock().await;
        self.load().await
    }
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    async fn status_settings(&self) -> Result<Vec<StatusSetting>> {
        Ok(self.read().await?.status_settings)
    }

    async fn replace_status_settings(&self, settings: Vec<StatusSetting>) -> Result<Vec<StatusSetting>> {
        self.update(move |doc| {
            doc.status_settings = settings
                .into_iter()
                .enumerate()
                .map(|(idx, mut s)| {
                    s.id = Some(idx as i64 + 1);
                    s
                })
                .collect();
            doc.status_settings.clone()
        })
        .await
    }

    async fn owner_setting(&self, kind: OwnerKind) -> Result<Option<OwnerSetting>> {
        Ok(self.read().await?.owner_slot(kind).clone())
    }

    async fn save_owner_setting(&self, kind: OwnerKind, setting: &OwnerSetting) -> Result<()> {
        let setting = setting.clone();
        self.update(move |doc| *doc.owner_slot(kind) = Some(setting)).await
    }

    async fn stage_ids(&self) -> Result<StageIds> {
        Ok(self.read().await?.stage_ids)
    }

    async fn save_stage_ids(&self, ids: &StageIds) -> Result<()> {
        let ids = ids.clone();
        self.update(move |doc| doc.stage_ids = ids).await
    }

    async fn tokens(&self) -> Result<Option<TokenPair>> {
        Ok(self.read().await?.tokens)
    }

    async fn save_tokens(&self, tokens: &TokenPair) -> Result<()> {
        let tokens = tokens.clone();
        self.update(move |doc| doc.tokens = Some(tokens)).await
    }

    async fn check_running(&self, kind: OwnerKind) -> Result<bool> {
        Ok(*self.read().await?.checks.slot(kind))
    }

    async fn set_check_running(&self, kind: OwnerKind, running: bool) -> Result<()> {
        self.update(move |doc| *doc.checks.slot(kind) = running).await
    }
}
