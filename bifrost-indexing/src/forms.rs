use async_trait::async_trait;
use bifrost_common::model::{Form, FormField};
use crate::entities::EntityRepo;
use dashmap::DashMap;
use sqlx::{Database, Pool};
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FormRepoError {
    #[error("form not found: {0}")]
    NotFound(Uuid),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Form records (one file maps to one record). Upsert is keyed on `id`;
/// the `fields` array is replaced wholesale rather than merged field by
/// field.
#[async_trait]
pub trait FormRepo: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Form>, FormRepoError>;

    /// Insert or update by primary key `id` (forms carry their own stable
    /// id embedded in the YAML, unlike executables' `(path, symbol)` key).
    async fn upsert(&self, form: Form) -> Result<Form, FormRepoError>;

    async fn delete(&self, id: Uuid) -> Result<(), FormRepoError>;

    /// Active forms referencing `workflow_id` as `workflow_ref` or
    /// `launch_workflow_ref` (deactivation guard's first affected-entity
    /// query, `deactivation.py::find_affected_entities`).
    async fn list_active_referencing_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<Form>, FormRepoError>;

    /// Active forms whose fields reference `workflow_id` as a
    /// `data_provider_id` (the second affected-entity query).
    async fn list_active_referencing_data_provider(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<Form>, FormRepoError>;
}

#[derive(Default)]
pub struct InMemoryFormRepo {
    forms: DashMap<Uuid, Form>,
}

impl InMemoryFormRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FormRepo for InMemoryFormRepo {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Form>, FormRepoError> {
        Ok(self.forms.get(&id).map(|e| e.clone()))
    }

    async fn upsert(&self, form: Form) -> Result<Form, FormRepoError> {
        self.forms.insert(form.id, form.clone());
        Ok(form)
    }

    async fn delete(&self, id: Uuid) -> Result<(), FormRepoError> {
        self.forms.remove(&id);
        Ok(())
    }

    async fn list_active_referencing_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<Form>, FormRepoError> {
        Ok(self
            .forms
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|f| {
                f.is_active
                    && (f.workflow_ref == Some(workflow_id) || f.launch_workflow_ref == Some(workflow_id))
            })
            .collect())
    }

    async fn list_active_referencing_data_provider(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<Form>, FormRepoError> {
        Ok(self
            .forms
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|f| {
                f.is_active
                    && f.fields
                        .iter()
                        .any(|field| field.data_provider_id == Some(workflow_id))
            })
            .collect())
    }
}

#[derive(sqlx::FromRow)]
struct FormRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    workflow_ref: Option<Uuid>,
    launch_workflow_ref: Option<Uuid>,
    fields: serde_json::Value,
    organization_id: Option<Uuid>,
    is_active: bool,
}

impl TryFrom<FormRow> for Form {
    type Error = FormRepoError;

    fn try_from(row: FormRow) -> Result<Self, Self::Error> {
        Ok(Form {
            id: row.id,
            name: row.name,
            description: row.description,
            workflow_ref: row.workflow_ref,
            launch_workflow_ref: row.launch_workflow_ref,
            fields: serde_json::from_value(row.fields).unwrap_or_default(),
            organization_id: row.organization_id,
            is_active: row.is_active,
        })
    }
}

/// `sqlx`-backed `FormRepo`, generic over the backend like
/// `cloud-component-service/src/repo/component.rs`.
pub struct SqlFormRepo<DB: Database> {
    pool: Arc<Pool<DB>>,
}

impl<DB: Database> SqlFormRepo<DB> {
    pub fn new(pool: Arc<Pool<DB>>) -> Self {
        Self { pool }
    }
}

macro_rules! impl_sql_form_repo {
    ($backend:ty, $upsert:literal) => {
        #[async_trait]
        impl FormRepo for SqlFormRepo<$backend> {
            async fn find_by_id(&self, id: Uuid) -> Result<Option<Form>, FormRepoError> {
                let row = sqlx::query_as::<_, FormRow>("SELECT * FROM forms WHERE id = $1")
                    .bind(id)
                    .fetch_optional(self.pool.deref())
                    .await?;
                row.map(Form::try_from).transpose()
            }

            async fn upsert(&self, form: Form) -> Result<Form, FormRepoError> {
                let row = sqlx::query_as::<_, FormRow>($upsert)
                    .bind(form.id)
                    .bind(&form.name)
                    .bind(&form.description)
                    .bind(form.workflow_ref)
                    .bind(form.launch_workflow_ref)
                    .bind(serde_json::to_value(&form.fields).unwrap_or_default())
                    .bind(form.organization_id)
                    .bind(form.is_active)
                    .fetch_one(self.pool.deref())
                    .await?;
                Form::try_from(row)
            }

            async fn delete(&self, id: Uuid) -> Result<(), FormRepoError> {
                sqlx::query("DELETE FROM forms WHERE id = $1")
                    .bind(id)
                    .execute(self.pool.deref())
                    .await?;
                Ok(())
            }

            async fn list_active_referencing_workflow(
                &self,
                workflow_id: Uuid,
            ) -> Result<Vec<Form>, FormRepoError> {
                let rows = sqlx::query_as::<_, FormRow>(
                    "SELECT * FROM forms WHERE is_active = true AND (workflow_ref = $1 OR launch_workflow_ref = $1)",
                )
                .bind(workflow_id)
                .fetch_all(self.pool.deref())
                .await?;
                rows.into_iter().map(Form::try_from).collect()
            }

            async fn list_active_referencing_data_provider(
                &self,
                workflow_id: Uuid,
            ) -> Result<Vec<Form>, FormRepoError> {
                // Fields are stored as a JSON array column; filtering by an
                // embedded `data_provider_id` is done in-process rather than
                // via a JSON-path query, keeping this portable across the
                // Postgres/Sqlite backends this repo supports.
                let rows = sqlx::query_as::<_, FormRow>("SELECT * FROM forms WHERE is_active = true")
                    .fetch_all(self.pool.deref())
                    .await?;
                rows.into_iter()
                    .map(Form::try_from)
                    .collect::<Result<Vec<_>, _>>()
                    .map(|forms| {
                        forms
                            .into_iter()
                            .filter(|f| {
                                f.fields
                                    .iter()
                                    .any(|field| field.data_provider_id == Some(workflow_id))
                            })
                            .collect()
                    })
            }
        }
    };
}

impl_sql_form_repo!(
    sqlx::Postgres,
    r#"
    INSERT INTO forms (id, name, description, workflow_ref, launch_workflow_ref, fields, organization_id, is_active)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ON CONFLICT (id) DO UPDATE SET
        name = $2, description = $3, workflow_ref = $4, launch_workflow_ref = $5, fields = $6, is_active = $8
    RETURNING *
    "#
);

impl_sql_form_repo!(
    sqlx::Sqlite,
    r#"
    INSERT INTO forms (id, name, description, workflow_ref, launch_workflow_ref, fields, organization_id, is_active)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ON CONFLICT (id) DO UPDATE SET
        name = excluded.name, description = excluded.description, workflow_ref = excluded.workflow_ref,
        launch_workflow_ref = excluded.launch_workflow_ref, fields = excluded.fields, is_active = excluded.is_active
    RETURNING *
    "#
);

/// A form parsed from YAML along with cross-references still needing
/// name-based resolution against the entity table (`linked_workflow` and
/// `launch_workflow` may name a workflow by its display name rather than
/// embed its id directly).
pub struct ParsedForm {
    pub form: Form,
    pub content_modified: bool,
    pub linked_workflow_name: Option<String>,
    pub launch_workflow_name: Option<String>,
}

/// Parses a `forms/<uuid>.form.yaml` body into a `Form`, injecting a fresh
/// `id` when the body lacks one and flagging `content_modified=true` so
/// the caller knows to persist the corrected body back to the blob store.
pub fn parse_form_yaml(content: &str) -> Result<ParsedForm, serde_yaml::Error> {
    let mut raw: serde_yaml::Value = serde_yaml::from_str(content)?;
    let mut content_modified = false;

    let id = match raw.get("id").and_then(|v| v.as_str()).and_then(|s| Uuid::parse_str(s).ok()) {
        Some(id) => id,
        None => {
            let id = Uuid::new_v4();
            if let serde_yaml::Value::Mapping(map) = &mut raw {
                map.insert(
                    serde_yaml::Value::String("id".to_string()),
                    serde_yaml::Value::String(id.to_string()),
                );
            }
            content_modified = true;
            id
        }
    };

    let name = raw
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let description = raw.get("description").and_then(|v| v.as_str()).map(str::to_string);

    // `workflow_ref`/`workflow` carry a UUID directly; `linked_workflow`
    // names a workflow by display name and is resolved downstream against
    // the entity table (form.py's `workflow_id`/`workflow`/`linked_workflow`
    // fallback chain).
    let workflow_ref = uuid_field(&raw, "workflow_ref").or_else(|| uuid_field(&raw, "workflow"));
    let linked_workflow_name = if workflow_ref.is_none() {
        raw.get("linked_workflow").and_then(|v| v.as_str()).map(str::to_string)
    } else {
        None
    };

    let launch_workflow_ref = uuid_field(&raw, "launch_workflow_ref");
    let launch_workflow_name = if launch_workflow_ref.is_none() {
        raw.get("launch_workflow").and_then(|v| v.as_str()).map(str::to_string)
    } else {
        None
    };

    let organization_id = uuid_field(&raw, "organization_id");
    let is_active = raw.get("is_active").and_then(|v| v.as_bool()).unwrap_or(true);

    let fields = raw
        .get("fields")
        .and_then(|v| v.as_sequence())
        .map(|seq| {
            seq.iter()
                .enumerate()
                .filter_map(|(position, field)| parse_form_field(field, position as i32))
                .collect()
        })
        .unwrap_or_default();

    Ok(ParsedForm {
        form: Form {
            id,
            name,
            description,
            workflow_ref,
            launch_workflow_ref,
            fields,
            organization_id,
            is_active,
        },
        content_modified,
        linked_workflow_name,
        launch_workflow_name,
    })
}

/// Resolves `linked_workflow`/`launch_workflow` display names to active
/// workflow ids. An unresolvable name is cleared to `None` rather than
/// failing the write — the form is still accepted with a dangling
/// reference that the reindexer repairs later.
pub async fn resolve_form_workflow_refs(parsed: ParsedForm, entities: &dyn EntityRepo) -> Form {
    let ParsedForm { mut form, linked_workflow_name, launch_workflow_name, .. } = parsed;

    if let Some(name) = linked_workflow_name {
        form.workflow_ref = entities
            .find_active_by_name(&name)
            .await
            .ok()
            .and_then(|mut matches| if matches.len() == 1 { matches.pop() } else { None })
            .map(|e| e.id);
    }

    if let Some(name) = launch_workflow_name {
        form.launch_workflow_ref = entities
            .find_active_by_name(&name)
            .await
            .ok()
            .and_then(|mut matches| if matches.len() == 1 { matches.pop() } else { None })
            .map(|e| e.id);
    }

    form
}

fn uuid_field(value: &serde_yaml::Value, key: &str) -> Option<Uuid> {
    value.get(key).and_then(|v| v.as_str()).and_then(|s| Uuid::parse_str(s).ok())
}

fn parse_form_field(value: &serde_yaml::Value, position: i32) -> Option<FormField> {
    let name = value.get("name")?.as_str()?.to_string();
    Some(FormField {
        name,
        label: value.get("label").and_then(|v| v.as_str()).map(str::to_string),
        r#type: value
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("string")
            .to_string(),
        required: value.get("required").and_then(|v| v.as_bool()).unwrap_or(false),
        position,
        data_provider_id: uuid_field(value, "data_provider_id"),
        data_provider_inputs: value
            .get("data_provider_inputs")
            .and_then(|v| serde_yaml::from_value(v.clone()).ok()),
        default_value: value
            .get("default_value")
            .or_else(|| value.get("default"))
            .and_then(|v| serde_yaml::from_value(v.clone()).ok()),
        options: value.get("options").and_then(|v| serde_yaml::from_value(v.clone()).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::InMemoryEntityRepo;

    #[test_r::test(tokio::test)]
    async fn upsert_then_find_round_trips() {
        let repo = InMemoryFormRepo::new();
        let form = Form {
            id: Uuid::new_v4(),
            name: "Greet".to_string(),
            description: None,
            workflow_ref: None,
            launch_workflow_ref: None,
            fields: vec![],
            organization_id: None,
            is_active: true,
        };
        let stored = repo.upsert(form.clone()).await.unwrap();
        assert_eq!(stored.id, form.id);
        assert_eq!(repo.find_by_id(form.id).await.unwrap().unwrap().name, "Greet");
    }

    #[test]
    fn parse_injects_missing_id() {
        let parsed = parse_form_yaml("name: Greet Form\nworkflow_ref: null\n").unwrap();
        assert!(parsed.content_modified);
        assert_eq!(parsed.form.name, "Greet Form");
    }

    #[test]
    fn parse_preserves_existing_id() {
        let id = Uuid::new_v4();
        let yaml = format!("id: {id}\nname: Greet Form\n");
        let parsed = parse_form_yaml(&yaml).unwrap();
        assert!(!parsed.content_modified);
        assert_eq!(parsed.form.id, id);
    }

    #[test]
    fn parse_reads_fields_with_data_provider() {
        let dp_id = Uuid::new_v4();
        let yaml = format!(
            "name: Greet Form\nfields:\n  - name: choice\n    type: string\n    data_provider_id: {dp_id}\n"
        );
        let parsed = parse_form_yaml(&yaml).unwrap();
        assert_eq!(parsed.form.fields.len(), 1);
        assert_eq!(parsed.form.fields[0].data_provider_id, Some(dp_id));
    }

    #[test_r::test(tokio::test)]
    async fn resolve_clears_unmatched_linked_workflow_name() {
        let entities = InMemoryEntityRepo::new();
        let parsed = parse_form_yaml("name: Greet Form\nlinked_workflow: does_not_exist\n").unwrap();
        let form = resolve_form_workflow_refs(parsed, &entities).await;
        assert_eq!(form.workflow_ref, None);
    }
}
