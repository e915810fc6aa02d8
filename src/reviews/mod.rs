use serde::Serialize;
use sqlx::SqlitePool;

use crate::catalog::Catalog;
use crate::error::PlatformError;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ReviewRow {
    pub review_id: i64,
    pub author: String,
    pub game_name: String,
    pub version: i64,
    pub content: String,
    pub score: i64,
    pub created_at: chrono::NaiveDateTime,
}

fn validate_score(score: i64) -> Result<(), PlatformError> {
    if !(1..=5).contains(&score) {
        return Err(PlatformError::Validation("score must be an integer between 1 and 5".into()));
    }
    Ok(())
}

/// Append/edit/delete reviews, gated on a prior successful download of the
/// reviewed `(game_name, version)`. Every mutation compensates the catalog's
/// aggregate score via `apply_score_delta` so the two stores never drift.
pub struct ReviewStore {
    pool: SqlitePool,
}

impl ReviewStore {
    pub async fn new(pool: SqlitePool) -> Result<Self, PlatformError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS reviews (
                review_id INTEGER PRIMARY KEY AUTOINCREMENT,
                author TEXT NOT NULL,
                game_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                content TEXT NOT NULL,
                score INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS downloads (
                username TEXT NOT NULL,
                game_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                downloaded_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// Recorded by the package store on every completed `DOWNLOAD_END`.
    pub async fn record_download(&self, username: &str, game_name: &str, version: i64) -> Result<(), PlatformError> {
        sqlx::query("INSERT INTO downloads (username, game_name, version) VALUES (?, ?, ?)")
            .bind(username)
            .bind(game_name)
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn check_eligibility(&self, username: &str, game_name: &str, version: i64) -> Result<(), PlatformError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM downloads WHERE username = ? AND game_name = ? AND version = ? LIMIT 1",
        )
        .bind(username)
        .bind(game_name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        if row.is_none() {
            return Err(PlatformError::Validation(format!(
                "reviewer has not downloaded {game_name} v{version}"
            )));
        }
        Ok(())
    }

    pub async fn add(
        &self,
        catalog: &Catalog,
        author: &str,
        game_name: &str,
        version: i64,
        content: &str,
        score: i64,
    ) -> Result<(), PlatformError> {
        validate_score(score)?;
        self.check_eligibility(author, game_name, version).await?;
        sqlx::query(
            "INSERT INTO reviews (author, game_name, version, content, score) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(author)
        .bind(game_name)
        .bind(version)
        .bind(content)
        .bind(score)
        .execute(&self.pool)
        .await?;
        catalog.apply_score_delta(game_name, score, 1).await
    }

    pub async fn edit(
        &self,
        catalog: &Catalog,
        author: &str,
        game_name: &str,
        version: i64,
        old_content: &str,
        new_content: &str,
        new_score: i64,
    ) -> Result<(i64, i64), PlatformError> {
        validate_score(new_score)?;
        self.check_eligibility(author, game_name, version).await?;
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT review_id, score FROM reviews WHERE author = ? AND game_name = ? AND version = ? AND content = ?",
        )
        .bind(author)
        .bind(game_name)
        .bind(version)
        .bind(old_content)
        .fetch_optional(&self.pool)
        .await?;
        let (review_id, old_score) = row.ok_or_else(|| PlatformError::NotFound("review not found for edit".into()))?;

        sqlx::query("UPDATE reviews SET content = ?, score = ? WHERE review_id = ?")
            .bind(new_content)
            .bind(new_score)
            .bind(review_id)
            .execute(&self.pool)
            .await?;

        let delta = new_score - old_score;
        if delta != 0 {
            catalog.apply_score_delta(game_name, delta, 0).await?;
        }
        Ok((old_score, new_score))
    }

    pub async fn delete(
        &self,
        catalog: &Catalog,
        author: &str,
        game_name: &str,
        version: i64,
        content: &str,
    ) -> Result<i64, PlatformError> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT review_id, score FROM reviews WHERE author = ? AND game_name = ? AND version = ? AND content = ?",
        )
        .bind(author)
        .bind(game_name)
        .bind(version)
        .bind(content)
        .fetch_optional(&self.pool)
        .await?;
        let (review_id, score) = row.ok_or_else(|| PlatformError::NotFound("review not found".into()))?;

        sqlx::query("DELETE FROM reviews WHERE review_id = ?")
            .bind(review_id)
            .execute(&self.pool)
            .await?;
        catalog.apply_score_delta(game_name, -score, -1).await?;
        Ok(score)
    }

    pub async fn list_by_author(&self, author: &str) -> Result<Vec<ReviewRow>, PlatformError> {
        Ok(sqlx::query_as::<_, ReviewRow>("SELECT * FROM reviews WHERE author = ?")
            .bind(author)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn list_by_game(&self, game_name: &str) -> Result<Vec<ReviewRow>, PlatformError> {
        Ok(sqlx::query_as::<_, ReviewRow>("SELECT * FROM reviews WHERE game_name = ?")
            .bind(game_name)
            .fetch_all(&self.pool)
            .await?)
    }
}
