//! User-authored report templates built with the visual query builder.
//!
//! Templates are owned by their author; admins may edit any template and
//! public templates are readable by everyone. Deletion only clears
//! `is_active`. The orchestrator sees each template as a definition with id
//! `custom:<uuid>`.

use crate::{
    auth::Principal,
    catalog::{DataSource, FieldCatalog},
    db::{self, PgConn, PgPool},
    definitions::{CacheConfig, QueryBody, QueryDefinition, CUSTOM_PREFIX},
    error::{Result, ServiceError},
    models::CustomReportRow,
    query::{self, QueryLimits, QuerySpec},
    schema::custom_report_templates::dsl,
};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use uuid::Uuid;

const MAX_NAME_LENGTH: usize = 200;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomReport {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: String,
    pub data_source: DataSource,
    pub query: QuerySpec,
    pub is_public: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CustomReport {
    pub fn definition_id(&self) -> String {
        format!("{CUSTOM_PREFIX}{}", self.id)
    }

    fn visible_to(&self, caller: &Principal) -> bool {
        self.is_public || self.owner_id == caller.user_id || caller.is_admin()
    }

    fn editable_by(&self, caller: &Principal) -> bool {
        self.owner_id == caller.user_id || caller.is_admin()
    }
}

impl TryFrom<CustomReportRow> for CustomReport {
    type Error = ServiceError;

    fn try_from(row: CustomReportRow) -> Result<Self> {
        let query = serde_json::from_value(row.query).map_err(|err| {
            ServiceError::Internal(anyhow!("custom report {} has an unreadable query: {err}", row.id))
        })?;
        Ok(Self {
            id: row.id,
            name: row.name,
            description: row.description,
            owner_id: row.owner_id,
            data_source: row.data_source.parse()?,
            query,
            is_public: row.is_public,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<&CustomReport> for CustomReportRow {
    type Error = ServiceError;

    fn try_from(report: &CustomReport) -> Result<Self> {
        Ok(Self {
            id: report.id,
            name: report.name.clone(),
            description: report.description.clone(),
            owner_id: report.owner_id.clone(),
            data_source: report.data_source.as_str().to_string(),
            query: serde_json::to_value(&report.query)
                .map_err(|err| ServiceError::Internal(anyhow::Error::new(err)))?,
            is_public: report.is_public,
            is_active: report.is_active,
            created_at: report.created_at,
            updated_at: report.updated_at,
        })
    }
}

/// Create payload. `dataSource` stays a string so unknown sources surface as
/// `UnsupportedSource` rather than a body rejection.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomReportInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub data_source: String,
    pub query: QuerySpec,
    #[serde(default)]
    pub is_public: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomReportPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub data_source: Option<String>,
    #[serde(default)]
    pub query: Option<QuerySpec>,
    #[serde(default)]
    pub is_public: Option<bool>,
}

#[async_trait]
pub trait CustomReportStore: Send + Sync {
    async fn insert(&self, report: &CustomReport) -> Result<()>;

    /// Active templates only.
    async fn get(&self, id: Uuid) -> Result<Option<CustomReport>>;

    /// Active templates owned by `user_id` or public; every active template
    /// when `user_id` is `None`.
    async fn list(&self, user_id: Option<&str>) -> Result<Vec<CustomReport>>;

    async fn update(&self, report: &CustomReport) -> Result<()>;

    /// Returns false when nothing active matched.
    async fn deactivate(&self, id: Uuid) -> Result<bool>;
}

#[derive(Default)]
pub struct MemoryReportStore {
    reports: RwLock<HashMap<Uuid, CustomReport>>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CustomReportStore for MemoryReportStore {
    async fn insert(&self, report: &CustomReport) -> Result<()> {
        self.reports.write().insert(report.id, report.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<CustomReport>> {
        Ok(self
            .reports
            .read()
            .get(&id)
            .filter(|report| report.is_active)
            .cloned())
    }

    async fn list(&self, user_id: Option<&str>) -> Result<Vec<CustomReport>> {
        let mut reports: Vec<CustomReport> = self
            .reports
            .read()
            .values()
            .filter(|report| report.is_active)
            .filter(|report| {
                user_id.map_or(true, |user| report.is_public || report.owner_id == user)
            })
            .cloned()
            .collect();
        reports.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(reports)
    }

    async fn update(&self, report: &CustomReport) -> Result<()> {
        match self.reports.write().get_mut(&report.id) {
            Some(existing) if existing.is_active => {
                *existing = report.clone();
                Ok(())
            }
            _ => Err(ServiceError::NotFound(format!("custom report {}", report.id))),
        }
    }

    async fn deactivate(&self, id: Uuid) -> Result<bool> {
        match self.reports.write().get_mut(&id) {
            Some(report) if report.is_active => {
                report.is_active = false;
                report.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<PgConn<'_>> {
        Ok(db::checkout(&self.pool).await?)
    }
}

fn db_error(err: diesel::result::Error) -> ServiceError {
    ServiceError::Internal(anyhow::Error::new(err).context("custom_report_templates query failed"))
}

#[async_trait]
impl CustomReportStore for PgReportStore {
    async fn insert(&self, report: &CustomReport) -> Result<()> {
        let row = CustomReportRow::try_from(report)?;
        let mut conn = self.conn().await?;
        diesel::insert_into(dsl::custom_report_templates)
            .values(&row)
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<CustomReport>> {
        let mut conn = self.conn().await?;
        let row: Option<CustomReportRow> = dsl::custom_report_templates
            .filter(dsl::id.eq(id))
            .filter(dsl::is_active.eq(true))
            .select(CustomReportRow::as_select())
            .first(&mut *conn)
            .await
            .optional()
            .map_err(db_error)?;
        row.map(CustomReport::try_from).transpose()
    }

    async fn list(&self, user_id: Option<&str>) -> Result<Vec<CustomReport>> {
        let mut conn = self.conn().await?;
        let mut query = dsl::custom_report_templates
            .filter(dsl::is_active.eq(true))
            .select(CustomReportRow::as_select())
            .into_boxed();
        if let Some(user) = user_id {
            query = query.filter(dsl::is_public.eq(true).or(dsl::owner_id.eq(user.to_string())));
        }
        let rows: Vec<CustomReportRow> = query
            .order(dsl::name.asc())
            .load(&mut *conn)
            .await
            .map_err(db_error)?;
        rows.into_iter().map(CustomReport::try_from).collect()
    }

    async fn update(&self, report: &CustomReport) -> Result<()> {
        let row = CustomReportRow::try_from(report)?;
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            dsl::custom_report_templates
                .filter(dsl::id.eq(report.id))
                .filter(dsl::is_active.eq(true)),
        )
        .set(&row)
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
        if updated == 0 {
            return Err(ServiceError::NotFound(format!("custom report {}", report.id)));
        }
        Ok(())
    }

    async fn deactivate(&self, id: Uuid) -> Result<bool> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            dsl::custom_report_templates
                .filter(dsl::id.eq(id))
                .filter(dsl::is_active.eq(true)),
        )
        .set((dsl::is_active.eq(false), dsl::updated_at.eq(Utc::now())))
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
        Ok(updated > 0)
    }
}

/// Ownership rules and validation over a [`CustomReportStore`].
pub struct CustomReports {
    store: Arc<dyn CustomReportStore>,
    catalog: Arc<FieldCatalog>,
    limits: QueryLimits,
}

fn parse_id(raw: &str) -> Result<Uuid> {
    let raw = raw.strip_prefix(CUSTOM_PREFIX).unwrap_or(raw);
    Uuid::parse_str(raw).map_err(|_| ServiceError::validation(format!("invalid report id '{raw}'")))
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ServiceError::validation("field 'name' must not be empty"));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(ServiceError::validation(format!(
            "field 'name' exceeds {MAX_NAME_LENGTH} characters"
        )));
    }
    Ok(name.to_string())
}

impl CustomReports {
    pub fn new(store: Arc<dyn CustomReportStore>, catalog: Arc<FieldCatalog>, limits: QueryLimits) -> Self {
        Self {
            store,
            catalog,
            limits,
        }
    }

    /// The query must translate for its source before it is stored.
    fn check_query(&self, source: DataSource, spec: &QuerySpec) -> Result<()> {
        query::translate(&self.catalog, source, spec, self.limits).map(|_| ())
    }

    pub async fn create(&self, caller: &Principal, input: CustomReportInput) -> Result<CustomReport> {
        let source: DataSource = input.data_source.parse()?;
        self.check_query(source, &input.query)?;
        let now = Utc::now();
        let report = CustomReport {
            id: Uuid::new_v4(),
            name: validate_name(&input.name)?,
            description: input.description.filter(|text| !text.trim().is_empty()),
            owner_id: caller.user_id.clone(),
            data_source: source,
            query: input.query,
            is_public: input.is_public,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&report).await?;
        Ok(report)
    }

    pub async fn get(&self, caller: &Principal, id: &str) -> Result<CustomReport> {
        let id = parse_id(id)?;
        self.store
            .get(id)
            .await?
            .filter(|report| report.visible_to(caller))
            .ok_or_else(|| ServiceError::NotFound(format!("custom report {id}")))
    }

    pub async fn list(&self, caller: &Principal) -> Result<Vec<CustomReport>> {
        let scope = (!caller.is_admin()).then_some(caller.user_id.as_str());
        self.store.list(scope).await
    }

    pub async fn update(
        &self,
        caller: &Principal,
        id: &str,
        patch: CustomReportPatch,
    ) -> Result<CustomReport> {
        let mut report = self.get(caller, id).await?;
        if !report.editable_by(caller) {
            return Err(ServiceError::Authorization(format!(
                "only the owner may modify custom report {}",
                report.id
            )));
        }

        if let Some(name) = patch.name {
            report.name = validate_name(&name)?;
        }
        if let Some(description) = patch.description {
            report.description = Some(description).filter(|text| !text.trim().is_empty());
        }
        if let Some(source) = patch.data_source {
            report.data_source = source.parse()?;
        }
        if let Some(spec) = patch.query {
            report.query = spec;
        }
        if let Some(is_public) = patch.is_public {
            report.is_public = is_public;
        }
        self.check_query(report.data_source, &report.query)?;
        report.updated_at = Utc::now();

        self.store.update(&report).await?;
        Ok(report)
    }

    pub async fn delete(&self, caller: &Principal, id: &str) -> Result<CustomReport> {
        let report = self.get(caller, id).await?;
        if !report.editable_by(caller) {
            return Err(ServiceError::Authorization(format!(
                "only the owner may delete custom report {}",
                report.id
            )));
        }
        if !self.store.deactivate(report.id).await? {
            return Err(ServiceError::NotFound(format!("custom report {}", report.id)));
        }
        Ok(report)
    }

    /// The template as an executable definition.
    pub async fn definition(&self, caller: &Principal, id: &str) -> Result<QueryDefinition> {
        let report = self.get(caller, id).await?;
        Ok(self.to_definition(&report))
    }

    pub fn to_definition(&self, report: &CustomReport) -> QueryDefinition {
        let field_mapping = query::translate(&self.catalog, report.data_source, &report.query, self.limits)
            .map(|translated| translated.mapping)
            .unwrap_or_default();
        QueryDefinition {
            id: report.definition_id(),
            name: report.name.clone(),
            description: report.description.clone().unwrap_or_default(),
            category: "custom".to_string(),
            data_source: report.data_source,
            parameters: Vec::new(),
            body: QueryBody::Builder {
                spec: report.query.clone(),
            },
            field_mapping,
            cache: CacheConfig::default(),
            requires_auth: true,
            max_results: report.query.limit,
            owner_id: Some(report.owner_id.clone()),
            is_public: report.is_public,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::query::FilterSpec;
    use serde_json::json;

    fn reports() -> CustomReports {
        CustomReports::new(
            Arc::new(MemoryReportStore::new()),
            Arc::new(FieldCatalog::new(None)),
            QueryLimits {
                default_limit: 100,
                max_limit: 1000,
                ldap_size_limit: 1000,
            },
        )
    }

    fn user(id: &str) -> Principal {
        Principal {
            user_id: id.into(),
            role: Role::User,
        }
    }

    fn input(source: &str, public: bool) -> CustomReportInput {
        CustomReportInput {
            name: "Disabled in Sales".into(),
            description: None,
            data_source: source.into(),
            query: QuerySpec {
                select: vec!["username".into(), "department".into()],
                filters: vec![FilterSpec {
                    field: "department".into(),
                    operator: "equals".into(),
                    value: json!("Sales"),
                }],
                ..Default::default()
            },
            is_public: public,
        }
    }

    #[tokio::test]
    async fn owner_rules_and_soft_delete() {
        let reports = reports();
        let alice = user("alice");
        let bob = user("bob");
        let admin = Principal {
            user_id: "root".into(),
            role: Role::Admin,
        };

        let private = reports.create(&alice, input("ad", false)).await.unwrap();
        let id = private.id.to_string();
        assert!(matches!(reports.get(&bob, &id).await, Err(ServiceError::NotFound(_))));
        assert!(reports.get(&admin, &id).await.is_ok());

        let public = reports.create(&alice, input("ad", true)).await.unwrap();
        let public_id = public.id.to_string();
        assert!(reports.get(&bob, &public_id).await.is_ok());
        let err = reports
            .update(&bob, &public_id, CustomReportPatch {
                name: Some("mine now".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Authorization(_)));

        let renamed = reports
            .update(&admin, &public_id, CustomReportPatch {
                name: Some("Renamed".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(renamed.name, "Renamed");
        assert_eq!(renamed.owner_id, "alice");

        assert_eq!(reports.list(&bob).await.unwrap().len(), 1);
        reports.delete(&alice, &public_id).await.unwrap();
        assert!(matches!(
            reports.get(&alice, &public_id).await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(reports.list(&bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_unknown_sources_and_fields() {
        let reports = reports();
        let alice = user("alice");
        let err = reports.create(&alice, input("oracle", false)).await.unwrap_err();
        assert!(matches!(err, ServiceError::UnsupportedSource(_)));

        let mut bad = input("ad", false);
        bad.query.select.push("favouriteColour".into());
        let err = reports.create(&alice, bad).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn templates_become_builder_definitions() {
        let reports = reports();
        let alice = user("alice");
        let report = reports.create(&alice, input("ad", false)).await.unwrap();
        let definition = reports
            .definition(&alice, &format!("custom:{}", report.id))
            .await
            .unwrap();
        assert_eq!(definition.id, format!("custom:{}", report.id));
        assert_eq!(definition.data_source, DataSource::Ad);
        assert!(matches!(definition.body, QueryBody::Builder { .. }));
        let targets: Vec<&str> = definition
            .field_mapping
            .iter()
            .map(|mapping| mapping.target.as_str())
            .collect();
        assert_eq!(targets, vec!["username", "department"]);
    }
}
