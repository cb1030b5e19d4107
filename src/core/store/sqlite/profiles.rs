use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::rows::{PROFILE_COLUMNS, collect, first, profile_from_row};
use super::{SqlResultExt, SqliteStore};
use crate::core::error::{Error, Result, ResultExt};
use crate::core::model::{Page, Profile};
use crate::core::store::codec::{encode_map, encode_ts};
use crate::core::store::{NewProfile, ProfileRepo};

#[async_trait]
impl ProfileRepo for SqliteStore {
    async fn create_profile(&self, new: NewProfile) -> Result<Profile> {
        let id = Uuid::new_v4();
        let now = encode_ts(&Utc::now());
        let config = encode_map(Some(&new.config))?;
        self.with_tx(move |conn| {
            conn.execute(
                "INSERT INTO profiles (id, key, runner_type, config, default_timeout_minutes, requires_approval, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    id.to_string(),
                    new.key,
                    new.runner_type.as_str(),
                    config,
                    new.default_timeout_minutes,
                    new.requires_approval,
                    now
                ],
            )
            .sql()?;
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM profiles WHERE id = ?1", PROFILE_COLUMNS))
                .sql()?;
            first(&mut stmt, params![id.to_string()], profile_from_row)?
                .ok_or_else(|| Error::not_found("profile", id))
        })
        .await
        .op_context("create", "profile", Some(id.to_string()))
    }

    async fn get_profile(&self, id: Uuid) -> Result<Profile> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM profiles WHERE id = ?1", PROFILE_COLUMNS))
                .sql()?;
            first(&mut stmt, params![id.to_string()], profile_from_row)?
                .ok_or_else(|| Error::not_found("profile", id))
        })
        .await
        .op_context("get", "profile", Some(id.to_string()))
    }

    async fn get_profile_by_key(&self, key: &str) -> Result<Option<Profile>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM profiles WHERE key = ?1", PROFILE_COLUMNS))
                .sql()?;
            first(&mut stmt, params![key], profile_from_row)
        })
        .await
        .op_context("get", "profile", Some(key.to_string()))
    }

    async fn update_profile(&self, profile: &Profile) -> Result<Profile> {
        let id = profile.id;
        let config = encode_map(Some(&profile.config))?;
        let now = encode_ts(&Utc::now());
        let profile = profile.clone();
        self.with_tx(move |conn| {
            let active: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM runs WHERE profile_id = ?1
                     AND status IN ('pending', 'running', 'awaiting_approval')",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .sql()?;
            if active > 0 {
                return Err(Error::conflict(format!(
                    "profile {} is referenced by an active run",
                    profile.key
                )));
            }
            let changed = conn
                .execute(
                    "UPDATE profiles SET key = ?2, runner_type = ?3, config = ?4,
                     default_timeout_minutes = ?5, requires_approval = ?6, updated_at = ?7
                     WHERE id = ?1",
                    params![
                        id.to_string(),
                        profile.key,
                        profile.runner_type.as_str(),
                        config,
                        profile.default_timeout_minutes,
                        profile.requires_approval,
                        now
                    ],
                )
                .sql()?;
            if changed == 0 {
                return Err(Error::not_found("profile", id));
            }
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM profiles WHERE id = ?1", PROFILE_COLUMNS))
                .sql()?;
            first(&mut stmt, params![id.to_string()], profile_from_row)?
                .ok_or_else(|| Error::not_found("profile", id))
        })
        .await
        .op_context("update", "profile", Some(id.to_string()))
    }

    async fn list_profiles(&self, page: Page) -> Result<Vec<Profile>> {
        let (limit, offset) = page.resolve()?;
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM profiles ORDER BY key ASC LIMIT ?1 OFFSET ?2",
                    PROFILE_COLUMNS
                ))
                .sql()?;
            collect(&mut stmt, params![limit, offset], profile_from_row)
        })
        .await
        .op_context("list", "profile", None)
    }
}
