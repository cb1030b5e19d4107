use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::rows::{PROFILE_COLUMNS, profile_from_row};
use super::{PgResultExt, PgStore};
use crate::core::error::{Error, Result, ResultExt};
use crate::core::model::{Page, Profile};
use crate::core::store::codec::map_value;
use crate::core::store::{NewProfile, ProfileRepo};

#[async_trait]
impl ProfileRepo for PgStore {
    async fn create_profile(&self, new: NewProfile) -> Result<Profile> {
        let id = Uuid::new_v4();
        let row = sqlx::query(&format!(
            "INSERT INTO profiles (id, key, runner_type, config, default_timeout_minutes, requires_approval, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7) RETURNING {}",
            PROFILE_COLUMNS
        ))
        .bind(id)
        .bind(&new.key)
        .bind(new.runner_type.as_str())
        .bind(map_value(Some(&new.config)))
        .bind(new.default_timeout_minutes)
        .bind(new.requires_approval)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .pg()
        .op_context("create", "profile", Some(new.key.clone()))?;
        profile_from_row(&row)
    }

    async fn get_profile(&self, id: Uuid) -> Result<Profile> {
        let row = sqlx::query(&format!("SELECT {} FROM profiles WHERE id = $1", PROFILE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .pg()
            .op_context("get", "profile", Some(id.to_string()))?;
        match row {
            Some(row) => profile_from_row(&row),
            None => Err(Error::not_found("profile", id)),
        }
    }

    async fn get_profile_by_key(&self, key: &str) -> Result<Option<Profile>> {
        let row = sqlx::query(&format!("SELECT {} FROM profiles WHERE key = $1", PROFILE_COLUMNS))
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .pg()
            .op_context("get", "profile", Some(key.to_string()))?;
        row.as_ref().map(profile_from_row).transpose()
    }

    async fn update_profile(&self, profile: &Profile) -> Result<Profile> {
        let id = profile.id;
        let res: Result<Profile> = async {
            let mut tx = self.pool.begin().await.pg()?;
            let active: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM runs WHERE profile_id = $1
                 AND status IN ('pending', 'running', 'awaiting_approval')",
            )
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .pg()?;
            if active > 0 {
                return Err(Error::conflict(format!(
                    "profile {} is referenced by an active run",
                    profile.key
                )));
            }
            let row = sqlx::query(&format!(
                "UPDATE profiles SET key = $2, runner_type = $3, config = $4, default_timeout_minutes = $5,
                 requires_approval = $6, updated_at = $7 WHERE id = $1 RETURNING {}",
                PROFILE_COLUMNS
            ))
            .bind(id)
            .bind(&profile.key)
            .bind(profile.runner_type.as_str())
            .bind(map_value(Some(&profile.config)))
            .bind(profile.default_timeout_minutes)
            .bind(profile.requires_approval)
            .bind(Utc::now())
            .fetch_optional(&mut *tx)
            .await
            .pg()?
            .ok_or_else(|| Error::not_found("profile", id))?;
            let updated = profile_from_row(&row)?;
            tx.commit().await.pg()?;
            Ok(updated)
        }
        .await;
        res.op_context("update", "profile", Some(id.to_string()))
    }

    async fn list_profiles(&self, page: Page) -> Result<Vec<Profile>> {
        let (limit, offset) = page.resolve()?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM profiles ORDER BY key ASC LIMIT $1 OFFSET $2",
            PROFILE_COLUMNS
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .pg()
        .op_context("list", "profile", None)?;
        rows.iter().map(profile_from_row).collect()
    }
}
