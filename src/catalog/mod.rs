use serde::Serialize;
use sqlx::SqlitePool;

use crate::error::PlatformError;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct GameRow {
    pub author: String,
    pub game_name: String,
    pub version: i64,
    #[serde(rename = "type")]
    pub type_: String,
    pub max_players: i64,
    pub description: String,
    pub score_sum: i64,
    pub review_count: i64,
}

/// Relational index of published packages. Authoritative for "latest
/// version" resolution (used by the room registry and review eligibility)
/// and for the aggregate score maintained by the review store.
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    pub async fn new(pool: SqlitePool) -> Result<Self, PlatformError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS games (
                author TEXT NOT NULL,
                game_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                type TEXT NOT NULL,
                max_players INTEGER NOT NULL,
                description TEXT NOT NULL,
                score_sum INTEGER NOT NULL DEFAULT 0,
                review_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (author, game_name, version, type)
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// Assigns the next version for `(author, game_name, type)`: 0 on first
    /// publication, otherwise one past the current maximum.
    pub async fn next_version(&self, author: &str, game_name: &str, type_: &str) -> Result<i64, PlatformError> {
        let row: (Option<i64>,) = sqlx::query_as(
            "SELECT MAX(version) FROM games WHERE author = ? AND game_name = ? AND type = ?",
        )
        .bind(author)
        .bind(game_name)
        .bind(type_)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0.map(|v| v + 1).unwrap_or(0))
    }

    pub async fn publish(
        &self,
        author: &str,
        game_name: &str,
        version: i64,
        type_: &str,
        max_players: i64,
        description: &str,
    ) -> Result<(), PlatformError> {
        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT version FROM games WHERE author = ? AND game_name = ? AND version = ? AND type = ?",
        )
        .bind(author)
        .bind(game_name)
        .bind(version)
        .bind(type_)
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_some() {
            return Err(PlatformError::Conflict("target version already exists".into()));
        }

        sqlx::query(
            "INSERT INTO games (author, game_name, version, type, max_players, description, score_sum, review_count)
             VALUES (?, ?, ?, ?, ?, ?, 0, 0)",
        )
        .bind(author)
        .bind(game_name)
        .bind(version)
        .bind(type_)
        .bind(max_players)
        .bind(description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_by_author(&self, author: &str) -> Result<Vec<GameRow>, PlatformError> {
        let rows = sqlx::query_as::<_, GameRow>("SELECT * FROM games WHERE author = ?")
            .bind(author)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Resolves the highest published version of `game_name` across all
    /// authors and types; used by room creation and review eligibility.
    pub async fn get_latest(&self, game_name: &str) -> Result<Option<GameRow>, PlatformError> {
        let row = sqlx::query_as::<_, GameRow>(
            "SELECT * FROM games WHERE game_name = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(game_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get(&self, game_name: &str, version: i64) -> Result<Option<GameRow>, PlatformError> {
        let row = sqlx::query_as::<_, GameRow>(
            "SELECT * FROM games WHERE game_name = ? AND version = ?",
        )
        .bind(game_name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Applies a compensating score delta; called by the review store after
    /// every add/edit/delete so aggregate score stays consistent.
    pub async fn apply_score_delta(
        &self,
        game_name: &str,
        score_delta: i64,
        count_delta: i64,
    ) -> Result<(), PlatformError> {
        sqlx::query(
            "UPDATE games SET score_sum = score_sum + ?, review_count = review_count + ? WHERE game_name = ?",
        )
        .bind(score_delta)
        .bind(count_delta)
        .bind(game_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn catalog() -> Catalog {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        Catalog::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn version_assignment_is_monotonic_per_author_game_type() {
        let catalog = catalog().await;
        assert_eq!(catalog.next_version("alice", "G", "CLI").await.unwrap(), 0);
        catalog.publish("alice", "G", 0, "CLI", 2, "d").await.unwrap();
        assert_eq!(catalog.next_version("alice", "G", "CLI").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn republishing_same_version_conflicts() {
        let catalog = catalog().await;
        catalog.publish("alice", "G", 0, "CLI", 2, "d").await.unwrap();
        let err = catalog.publish("alice", "G", 0, "CLI", 2, "d").await.unwrap_err();
        assert_eq!(err.code(), 104);
    }

    #[tokio::test]
    async fn score_delta_accumulates() {
        let catalog = catalog().await;
        catalog.publish("alice", "G", 0, "CLI", 2, "d").await.unwrap();
        catalog.apply_score_delta("G", 5, 1).await.unwrap();
        catalog.apply_score_delta("G", 3, 1).await.unwrap();
        let row = catalog.get("G", 0).await.unwrap().unwrap();
        assert_eq!(row.score_sum, 8);
        assert_eq!(row.review_count, 2);
    }
}
