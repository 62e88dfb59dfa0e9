// crates/db/tests/common/mod.rs
//! Shared fixtures: an in-memory database with two host tables (`users`
//! and `kids`) registered the way a consuming application would.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use chrono_tz::America::Chicago;
use chrono_tz::Tz;
use dashstats_db::{Database, FieldDef, FieldKind, ModelDef, ModelRegistry};

pub fn registry() -> ModelRegistry {
    let mut registry = ModelRegistry::new();
    registry.register(
        ModelDef::new("auth", "User", "users")
            .with_field(FieldDef::new("first_name", FieldKind::Text))
            .with_field(FieldDef::new("last_name", FieldKind::Text))
            .with_field(FieldDef::new("is_active", FieldKind::Bool))
            .with_field(FieldDef::new("date_joined", FieldKind::DateTime)),
    );
    registry.register(
        ModelDef::new("demo", "Kid", "kids")
            .with_field(FieldDef::new("name", FieldKind::Text))
            .with_field(FieldDef::new("happy", FieldKind::Bool))
            .with_field(FieldDef::new("age", FieldKind::Integer))
            .with_field(FieldDef::new("height", FieldKind::Integer))
            .with_field(FieldDef::new("birthday", FieldKind::Date))
            .with_field(FieldDef::new("appeared", FieldKind::DateTime))
            .with_relation("author", "author_id", "auth.user"),
    );
    registry
}

async fn create_host_tables(db: &Database) {
    sqlx::query(
        "CREATE TABLE users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            first_name TEXT NOT NULL DEFAULT '',
            last_name TEXT NOT NULL DEFAULT '',
            is_active INTEGER NOT NULL DEFAULT 1,
            date_joined INTEGER NOT NULL
        )",
    )
    .execute(db.pool())
    .await
    .unwrap();
    sqlx::query(
        "CREATE TABLE kids (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT,
            happy INTEGER,
            age INTEGER,
            height INTEGER,
            birthday TEXT,
            appeared INTEGER NOT NULL,
            author_id INTEGER REFERENCES users(id)
        )",
    )
    .execute(db.pool())
    .await
    .unwrap();
}

/// In-memory database bucketing in America/Chicago, with host tables.
pub async fn test_db() -> Database {
    test_db_in(Chicago).await
}

pub async fn test_db_in(tz: Tz) -> Database {
    let db = Database::new_in_memory(registry(), tz).await.unwrap();
    create_host_tables(&db).await;
    db
}

/// A Chicago wall-clock instant, as the UTC value callers pass around.
pub fn chicago(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Chicago
        .with_ymd_and_hms(y, mo, d, h, mi, 0)
        .unwrap()
        .with_timezone(&Utc)
}

use chrono::TimeZone;

pub async fn add_user(db: &Database, first_name: &str, date_joined: DateTime<Utc>) -> i64 {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO users (first_name, date_joined) VALUES (?1, ?2) RETURNING id",
    )
    .bind(first_name)
    .bind(date_joined.timestamp())
    .fetch_one(db.pool())
    .await
    .unwrap();
    row.0
}

/// Row builder for the `kids` table.
pub struct KidRow {
    pub name: Option<String>,
    pub happy: Option<bool>,
    pub age: Option<i64>,
    pub height: Option<i64>,
    pub birthday: Option<String>,
    pub appeared: DateTime<Utc>,
    pub author_id: Option<i64>,
}

impl KidRow {
    pub fn at(appeared: DateTime<Utc>) -> Self {
        Self {
            name: None,
            happy: None,
            age: None,
            height: None,
            birthday: None,
            appeared,
            author_id: None,
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn happy(mut self, happy: bool) -> Self {
        self.happy = Some(happy);
        self
    }

    pub fn age(mut self, age: i64) -> Self {
        self.age = Some(age);
        self
    }

    pub fn height(mut self, height: i64) -> Self {
        self.height = Some(height);
        self
    }

    pub fn birthday(mut self, iso_date: &str) -> Self {
        self.birthday = Some(iso_date.to_string());
        self
    }

    pub fn author(mut self, author_id: i64) -> Self {
        self.author_id = Some(author_id);
        self
    }

    pub async fn insert(self, db: &Database) -> i64 {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO kids (name, happy, age, height, birthday, appeared, author_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) RETURNING id",
        )
        .bind(&self.name)
        .bind(self.happy)
        .bind(self.age)
        .bind(self.height)
        .bind(&self.birthday)
        .bind(self.appeared.timestamp())
        .bind(self.author_id)
        .fetch_one(db.pool())
        .await
        .unwrap();
        row.0
    }
}
