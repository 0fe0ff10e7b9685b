//! PostgreSQL implementation of ChatRepository.
//!
//! Timestamps are stored as Unix milliseconds (`BIGINT`).

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::domain::chat::{Channel, Message, NewChannel, NewUser, User};
use crate::domain::foundation::{
    ChannelId, DomainError, ErrorCode, MessageId, Timestamp, UserId,
};
use crate::ports::ChatRepository;

const FOREIGN_KEY_VIOLATION: &str = "23503";

/// PostgreSQL implementation of ChatRepository.
#[derive(Clone)]
pub struct PostgresChatRepository {
    pool: PgPool,
}

impl PostgresChatRepository {
    /// Creates a new PostgresChatRepository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn channel_exists(&self, channel_id: ChannelId) -> Result<bool, DomainError> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM channels WHERE id = $1)")
                .bind(channel_id.value())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| db_error("check channel existence", e))?;
        Ok(exists)
    }
}

#[async_trait]
impl ChatRepository for PostgresChatRepository {
    async fn create_message(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        text: &str,
    ) -> Result<Message, DomainError> {
        let row = sqlx::query(
            r#"
            INSERT INTO messages (channel_id, user_id, text, time)
            VALUES ($1, $2, $3, $4)
            RETURNING id, channel_id, user_id, text, time
            "#,
        )
        .bind(channel_id.value())
        .bind(user_id.value())
        .bind(text)
        .bind(Timestamp::now().as_unix_millis())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match foreign_key_target(&e) {
            Some(ForeignKey::Channel) => DomainError::new(
                ErrorCode::ChannelNotFound,
                format!("Channel not found: {}", channel_id),
            ),
            Some(ForeignKey::User) => DomainError::new(
                ErrorCode::UserNotFound,
                format!("User not found: {}", user_id),
            ),
            None => db_error("insert message", e),
        })?;

        row_to_message(row)
    }

    async fn get_messages(&self, channel_id: ChannelId) -> Result<Vec<Message>, DomainError> {
        if !self.channel_exists(channel_id).await? {
            return Err(DomainError::new(
                ErrorCode::ChannelNotFound,
                format!("Channel not found: {}", channel_id),
            ));
        }

        let rows = sqlx::query(
            r#"
            SELECT id, channel_id, user_id, text, time
            FROM messages
            WHERE channel_id = $1
            ORDER BY time ASC, id ASC
            "#,
        )
        .bind(channel_id.value())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("fetch messages", e))?;

        rows.into_iter().map(row_to_message).collect()
    }

    async fn get_channel(&self, channel_id: ChannelId) -> Result<Option<Channel>, DomainError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, color, created, owner_id, password, restricted
            FROM channels
            WHERE id = $1
            "#,
        )
        .bind(channel_id.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("fetch channel", e))?;

        row.map(row_to_channel).transpose()
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>, DomainError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, color, joined, password
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("fetch user", e))?;

        row.map(row_to_user).transpose()
    }

    async fn create_channel(&self, new: NewChannel) -> Result<Channel, DomainError> {
        new.validate()?;
        let owner_id = new.owner_id;

        let row = sqlx::query(
            r#"
            INSERT INTO channels (name, color, created, owner_id, password, restricted)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, name, color, created, owner_id, password, restricted
            "#,
        )
        .bind(&new.name)
        .bind(&new.color)
        .bind(Timestamp::now().as_unix_millis())
        .bind(owner_id.value())
        .bind(&new.password)
        .bind(new.restricted)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match foreign_key_target(&e) {
            Some(_) => DomainError::new(
                ErrorCode::UserNotFound,
                format!("User not found: {}", owner_id),
            ),
            None => db_error("insert channel", e),
        })?;

        row_to_channel(row)
    }

    async fn create_user(&self, new: NewUser) -> Result<User, DomainError> {
        new.validate()?;

        let row = sqlx::query(
            r#"
            INSERT INTO users (name, color, joined, password)
            VALUES ($1, $2, $3, $4)
            RETURNING id, name, color, joined, password
            "#,
        )
        .bind(&new.name)
        .bind(&new.color)
        .bind(Timestamp::now().as_unix_millis())
        .bind(&new.password)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("insert user", e))?;

        row_to_user(row)
    }
}

enum ForeignKey {
    Channel,
    User,
}

/// Identifies which reference a foreign key violation points at.
fn foreign_key_target(err: &sqlx::Error) -> Option<ForeignKey> {
    let db_err = err.as_database_error()?;
    if db_err.code().as_deref() != Some(FOREIGN_KEY_VIOLATION) {
        return None;
    }
    match db_err.constraint() {
        Some(name) if name.contains("channel") => Some(ForeignKey::Channel),
        _ => Some(ForeignKey::User),
    }
}

fn db_error(action: &str, e: sqlx::Error) -> DomainError {
    DomainError::database(format!("Failed to {}: {}", action, e))
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, DomainError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| db_error(&format!("decode column '{}'", name), e))
}

fn row_to_message(row: PgRow) -> Result<Message, DomainError> {
    Ok(Message {
        id: MessageId::new(column(&row, "id")?),
        channel_id: ChannelId::new(column(&row, "channel_id")?),
        user_id: UserId::new(column(&row, "user_id")?),
        text: column(&row, "text")?,
        time: Timestamp::from_unix_millis(column(&row, "time")?),
    })
}

fn row_to_channel(row: PgRow) -> Result<Channel, DomainError> {
    Ok(Channel {
        id: ChannelId::new(column(&row, "id")?),
        name: column(&row, "name")?,
        color: column(&row, "color")?,
        created: Timestamp::from_unix_millis(column(&row, "created")?),
        owner_id: UserId::new(column(&row, "owner_id")?),
        password: column(&row, "password")?,
        restricted: column(&row, "restricted")?,
    })
}

fn row_to_user(row: PgRow) -> Result<User, DomainError> {
    Ok(User {
        id: UserId::new(column(&row, "id")?),
        name: column(&row, "name")?,
        color: column(&row, "color")?,
        joined: Timestamp::from_unix_millis(column(&row, "joined")?),
        password: column(&row, "password")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_database_errors_are_not_foreign_key_violations() {
        assert!(foreign_key_target(&sqlx::Error::RowNotFound).is_none());
    }

    #[test]
    fn db_error_carries_action() {
        let err = db_error("insert message", sqlx::Error::PoolTimedOut);
        assert_eq!(err.code, ErrorCode::DatabaseError);
        assert!(err.message.starts_with("Failed to insert message"));
    }
}
