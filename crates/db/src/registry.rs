// crates/db/src/registry.rs
//! Explicit registry of host application tables.
//!
//! Charts point at models by `"app name" + "model name"`; the registry
//! resolves those to concrete tables, columns and belongs-to relations.
//! Field paths use `__` separators (`author__first_name`) so configuration
//! strings from the original system port over unchanged.
//!
//! Storage conventions for temporal columns: `datetime` fields hold unix
//! epoch seconds (INTEGER), `date` fields hold ISO-8601 text.

use std::collections::HashMap;

use serde::Deserialize;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Bool,
    Date,
    DateTime,
}

/// One queryable column of a host table.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub column: String,
    pub kind: FieldKind,
    /// Static (value, label) pairs, when the field has a fixed choice set.
    pub choices: Vec<(String, String)>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            kind,
            choices: Vec::new(),
        }
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn with_choices(mut self, choices: Vec<(String, String)>) -> Self {
        self.choices = choices;
        self
    }
}

/// A belongs-to link: a foreign-key column pointing at another model.
#[derive(Debug, Clone)]
pub struct RelationDef {
    pub name: String,
    pub fk_column: String,
    /// Target model key, `"app.model"`.
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct ModelDef {
    pub app: String,
    pub name: String,
    pub table: String,
    pub pk: String,
    pub fields: Vec<FieldDef>,
    pub relations: Vec<RelationDef>,
}

impl ModelDef {
    pub fn new(
        app: impl Into<String>,
        name: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            app: app.into(),
            name: name.into(),
            table: table.into(),
            pk: "id".to_string(),
            fields: Vec::new(),
            relations: Vec::new(),
        }
    }

    pub fn with_pk(mut self, pk: impl Into<String>) -> Self {
        self.pk = pk.into();
        self
    }

    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_relation(
        mut self,
        name: impl Into<String>,
        fk_column: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.relations.push(RelationDef {
            name: name.into(),
            fk_column: fk_column.into(),
            target: target.into(),
        });
        self
    }

    /// Case-insensitive `"app.model"` key (chart configuration stores the
    /// two parts with arbitrary casing).
    pub fn key(&self) -> String {
        format!("{}.{}", self.app, self.name).to_lowercase()
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }
}

/// What a `__`-path finally lands on.
#[derive(Debug, Clone)]
pub enum PathTarget {
    Field(FieldDef),
    /// The path names a relation itself (e.g. a chart's `user_field_name`
    /// of `author`): filters compare the raw foreign-key column.
    ForeignKey { column: String },
}

/// A resolved field path: the JOINs it needs and the final column.
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    pub joins: Vec<JoinStep>,
    pub alias: String,
    pub target: PathTarget,
}

#[derive(Debug, Clone)]
pub struct JoinStep {
    pub table: String,
    pub alias: String,
    pub on: String,
}

impl ResolvedPath {
    /// `alias.column` reference for use in SQL.
    pub fn column_ref(&self) -> String {
        match &self.target {
            PathTarget::Field(f) => format!("{}.{}", self.alias, f.column),
            PathTarget::ForeignKey { column } => format!("{}.{}", self.alias, column),
        }
    }

    pub fn kind(&self) -> FieldKind {
        match &self.target {
            PathTarget::Field(f) => f.kind,
            PathTarget::ForeignKey { .. } => FieldKind::Integer,
        }
    }

    pub fn field(&self) -> Option<&FieldDef> {
        match &self.target {
            PathTarget::Field(f) => Some(f),
            PathTarget::ForeignKey { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: HashMap<String, ModelDef>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model: ModelDef) -> &mut Self {
        self.models.insert(model.key(), model);
        self
    }

    pub fn get(&self, app: &str, name: &str) -> DbResult<&ModelDef> {
        self.get_key(&format!("{app}.{name}"))
    }

    pub fn get_key(&self, key: &str) -> DbResult<&ModelDef> {
        self.models
            .get(&key.to_lowercase())
            .ok_or_else(|| DbError::UnknownModel {
                name: key.to_string(),
            })
    }

    pub fn contains(&self, app: &str, name: &str) -> bool {
        self.models
            .contains_key(&format!("{app}.{name}").to_lowercase())
    }

    /// Walk a `__`-separated path from `model`, producing the JOIN chain
    /// and the final column. `base_alias` is the alias of the model's own
    /// table in the enclosing query; join aliases derive from the path so
    /// repeated resolutions of the same prefix deduplicate.
    pub fn resolve_path(
        &self,
        model: &ModelDef,
        path: &str,
        base_alias: &str,
    ) -> DbResult<ResolvedPath> {
        let mut joins = Vec::new();
        let mut cur_model = model;
        let mut cur_alias = base_alias.to_string();

        let segments: Vec<&str> = path.split("__").collect();
        for (i, segment) in segments.iter().enumerate() {
            let last = i == segments.len() - 1;
            if last {
                if let Some(field) = cur_model.field(segment) {
                    return Ok(ResolvedPath {
                        joins,
                        alias: cur_alias,
                        target: PathTarget::Field(field.clone()),
                    });
                }
                if let Some(rel) = cur_model.relation(segment) {
                    return Ok(ResolvedPath {
                        joins,
                        alias: cur_alias,
                        target: PathTarget::ForeignKey {
                            column: rel.fk_column.clone(),
                        },
                    });
                }
                return Err(DbError::UnknownField {
                    model: cur_model.key(),
                    name: segment.to_string(),
                });
            }

            let rel = cur_model
                .relation(segment)
                .ok_or_else(|| DbError::UnknownField {
                    model: cur_model.key(),
                    name: segment.to_string(),
                })?;
            let target = self.get_key(&rel.target)?;
            let alias = format!("{cur_alias}_{segment}");
            joins.push(JoinStep {
                table: target.table.clone(),
                alias: alias.clone(),
                on: format!("{alias}.{} = {cur_alias}.{}", target.pk, rel.fk_column),
            });
            cur_model = target;
            cur_alias = alias;
        }

        // Unreachable: split() yields at least one segment.
        Err(DbError::UnknownField {
            model: model.key(),
            name: path.to_string(),
        })
    }

    /// Load a registry from a TOML document (the CLI's `--registry` file).
    pub fn from_toml_str(s: &str) -> DbResult<Self> {
        let config: RegistryConfig = toml::from_str(s)?;
        let mut registry = Self::new();
        for (key, model) in config.models {
            let (app, name) = key
                .split_once('.')
                .ok_or_else(|| DbError::UnknownModel { name: key.clone() })?;
            let mut def = ModelDef::new(app, name, model.table).with_pk(model.pk);
            for f in model.fields {
                let column = f.column.unwrap_or_else(|| f.name.clone());
                def = def.with_field(
                    FieldDef::new(f.name, f.kind)
                        .with_column(column)
                        .with_choices(f.choices),
                );
            }
            for r in model.relations {
                def = def.with_relation(r.name, r.fk_column, r.target);
            }
            registry.register(def);
        }
        Ok(registry)
    }
}

#[derive(Debug, Deserialize)]
struct RegistryConfig {
    #[serde(default)]
    models: HashMap<String, ModelConfig>,
}

#[derive(Debug, Deserialize)]
struct ModelConfig {
    table: String,
    #[serde(default = "default_pk")]
    pk: String,
    #[serde(default)]
    fields: Vec<FieldConfig>,
    #[serde(default)]
    relations: Vec<RelationConfig>,
}

fn default_pk() -> String {
    "id".to_string()
}

#[derive(Debug, Deserialize)]
struct FieldConfig {
    name: String,
    kind: FieldKind,
    #[serde(default)]
    column: Option<String>,
    #[serde(default)]
    choices: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct RelationConfig {
    name: String,
    fk_column: String,
    target: String,
}
