#![forbid(unsafe_code)]

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use roomcast_domain::{ChatMessage, Membership, MessageId, Room, RoomId, UNKNOWN_USER_NAME, UserId};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;

use super::{
	CREATOR_LEAVE_REJECTED, MessageStore, NOT_A_MEMBER, NewRoom, PRIVATE_JOIN_REJECTED, RoomQuery, SavedMessage,
	StoreError,
};
use crate::util::time::unix_ms_now;

/// SQL-backed store; the backend is picked from the database URL scheme.
#[derive(Debug, Clone)]
pub struct SqlStore {
	backend: Backend,
}

#[derive(Debug, Clone)]
enum Backend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

type SqliteRoomRow = (i64, String, String, i64, i64, i64);
type PgRoomRow = (i64, String, String, i64, bool, i64);
type MessageRow = (i64, String, i64, i64, String, i64);

fn room_from_row(id: i64, name: String, description: String, creator: i64, is_private: bool, created_at: i64) -> anyhow::Result<Room> {
	Ok(Room {
		id: RoomId::new(id)?,
		name,
		description,
		creator_id: UserId::new(creator)?,
		is_private,
		created_at_unix_ms: created_at,
	})
}

fn sqlite_room((id, name, description, creator, is_private, created_at): SqliteRoomRow) -> anyhow::Result<Room> {
	room_from_row(id, name, description, creator, is_private != 0, created_at)
}

fn pg_room((id, name, description, creator, is_private, created_at): PgRoomRow) -> anyhow::Result<Room> {
	room_from_row(id, name, description, creator, is_private, created_at)
}

fn message_from_row((id, content, sender, room, sender_name, created_at): MessageRow) -> anyhow::Result<ChatMessage> {
	Ok(ChatMessage {
		id: MessageId::new(id)?,
		content,
		sender_id: UserId::new(sender)?,
		room_id: RoomId::new(room)?,
		sender_name,
		timestamp_unix_ms: created_at,
	})
}

impl SqlStore {
	/// Connect and run migrations.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			// Every in-memory sqlite connection is its own database; pin the pool to one.
			let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
			let mut opts = SqlitePoolOptions::new();
			if in_memory {
				opts = opts.max_connections(1).idle_timeout(None).max_lifetime(None);
			}
			let pool = opts.connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			Backend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.connect(database_url)
				.await
				.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			Backend::Postgres(pool)
		} else {
			return Err(anyhow!("unsupported database_url (expected sqlite: or postgres:)"));
		};

		info!(backend = backend.name(), "message store connected");
		Ok(Self { backend })
	}

	/// Insert a user row; returns its id.
	#[allow(dead_code)]
	pub async fn create_user(&self, username: &str) -> anyhow::Result<UserId> {
		let now = unix_ms_now();
		let (id,): (i64,) = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as("INSERT INTO users (username, created_at) VALUES (?, ?) RETURNING id")
					.bind(username)
					.bind(now)
					.fetch_one(pool)
					.await
			}
			Backend::Postgres(pool) => {
				sqlx::query_as("INSERT INTO users (username, created_at) VALUES ($1, $2) RETURNING id")
					.bind(username)
					.bind(now)
					.fetch_one(pool)
					.await
			}
		}
		.context("insert user")?;
		Ok(UserId::new(id)?)
	}

	async fn fetch_room(&self, room: RoomId) -> Result<Option<Room>, StoreError> {
		let room = match &self.backend {
			Backend::Sqlite(pool) => {
				let row: Option<SqliteRoomRow> = sqlx::query_as(
					"SELECT id, name, description, creator_id, is_private, created_at FROM rooms WHERE id = ?",
				)
				.bind(room.get())
				.fetch_optional(pool)
				.await
				.context("select room (sqlite)")?;
				row.map(sqlite_room).transpose()?
			}
			Backend::Postgres(pool) => {
				let row: Option<PgRoomRow> = sqlx::query_as(
					"SELECT id, name, description, creator_id, is_private, created_at FROM rooms WHERE id = $1",
				)
				.bind(room.get())
				.fetch_optional(pool)
				.await
				.context("select room (postgres)")?;
				row.map(pg_room).transpose()?
			}
		};
		Ok(room)
	}

	async fn has_membership(&self, room: RoomId, user: UserId) -> Result<bool, StoreError> {
		let (count,): (i64,) = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as("SELECT COUNT(*) FROM room_members WHERE room_id = ? AND user_id = ?")
					.bind(room.get())
					.bind(user.get())
					.fetch_one(pool)
					.await
			}
			Backend::Postgres(pool) => {
				sqlx::query_as("SELECT COUNT(*) FROM room_members WHERE room_id = $1 AND user_id = $2")
					.bind(room.get())
					.bind(user.get())
					.fetch_one(pool)
					.await
			}
		}
		.context("count membership")?;
		Ok(count > 0)
	}

	/// Insert the membership if absent; returns the stored row.
	async fn insert_membership(&self, room: RoomId, user: UserId) -> Result<Membership, StoreError> {
		let now = unix_ms_now();
		let (joined_at,): (i64,) = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO room_members (room_id, user_id, joined_at) VALUES (?, ?, ?) \
					ON CONFLICT (room_id, user_id) DO NOTHING",
				)
				.bind(room.get())
				.bind(user.get())
				.bind(now)
				.execute(pool)
				.await
				.context("insert membership (sqlite)")?;
				sqlx::query_as("SELECT joined_at FROM room_members WHERE room_id = ? AND user_id = ?")
					.bind(room.get())
					.bind(user.get())
					.fetch_one(pool)
					.await
					.context("select membership (sqlite)")?
			}
			Backend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO room_members (room_id, user_id, joined_at) VALUES ($1, $2, $3) \
					ON CONFLICT (room_id, user_id) DO NOTHING",
				)
				.bind(room.get())
				.bind(user.get())
				.bind(now)
				.execute(pool)
				.await
				.context("insert membership (postgres)")?;
				sqlx::query_as("SELECT joined_at FROM room_members WHERE room_id = $1 AND user_id = $2")
					.bind(room.get())
					.bind(user.get())
					.fetch_one(pool)
					.await
					.context("select membership (postgres)")?
			}
		};

		Ok(Membership {
			room_id: room,
			user_id: user,
			joined_at_unix_ms: joined_at,
		})
	}

	async fn admits(&self, room: &Room, user: UserId) -> Result<bool, StoreError> {
		if !room.is_private || room.is_creator(user) {
			return Ok(true);
		}
		self.has_membership(room.id, user).await
	}
}

impl Backend {
	fn name(&self) -> &'static str {
		match self {
			Backend::Sqlite(_) => "sqlite",
			Backend::Postgres(_) => "postgres",
		}
	}
}

#[async_trait]
impl MessageStore for SqlStore {
	async fn is_member(&self, room: RoomId, user: UserId) -> Result<bool, StoreError> {
		let Some(room) = self.fetch_room(room).await? else {
			return Err(StoreError::room_not_found(room));
		};
		self.admits(&room, user).await
	}

	async fn save(&self, content: &str, sender: UserId, room: RoomId) -> Result<SavedMessage, StoreError> {
		let now = unix_ms_now();
		let (id,): (i64,) = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as(
					"INSERT INTO messages (content, sender_id, room_id, created_at) VALUES (?, ?, ?, ?) RETURNING id",
				)
				.bind(content)
				.bind(sender.get())
				.bind(room.get())
				.bind(now)
				.fetch_one(pool)
				.await
			}
			Backend::Postgres(pool) => {
				sqlx::query_as(
					"INSERT INTO messages (content, sender_id, room_id, created_at) VALUES ($1, $2, $3, $4) RETURNING id",
				)
				.bind(content)
				.bind(sender.get())
				.bind(room.get())
				.bind(now)
				.fetch_one(pool)
				.await
			}
		}
		.context("insert message")?;

		Ok(SavedMessage {
			id: MessageId::new(id).map_err(anyhow::Error::from)?,
			timestamp_unix_ms: now,
		})
	}

	async fn history(&self, room: RoomId, limit: i64, offset: i64) -> Result<Vec<ChatMessage>, StoreError> {
		let rows: Vec<MessageRow> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as(
					"SELECT m.id, m.content, m.sender_id, m.room_id, COALESCE(u.username, ?), m.created_at \
					FROM messages m LEFT JOIN users u ON u.id = m.sender_id \
					WHERE m.room_id = ? ORDER BY m.id DESC LIMIT ? OFFSET ?",
				)
				.bind(UNKNOWN_USER_NAME)
				.bind(room.get())
				.bind(limit)
				.bind(offset)
				.fetch_all(pool)
				.await
			}
			Backend::Postgres(pool) => {
				sqlx::query_as(
					"SELECT m.id, m.content, m.sender_id, m.room_id, COALESCE(u.username, $1), m.created_at \
					FROM messages m LEFT JOIN users u ON u.id = m.sender_id \
					WHERE m.room_id = $2 ORDER BY m.id DESC LIMIT $3 OFFSET $4",
				)
				.bind(UNKNOWN_USER_NAME)
				.bind(room.get())
				.bind(limit)
				.bind(offset)
				.fetch_all(pool)
				.await
			}
		}
		.context("select room history")?;

		Ok(rows
			.into_iter()
			.map(message_from_row)
			.collect::<anyhow::Result<Vec<_>>>()?)
	}

	async fn user_name(&self, user: UserId) -> Result<String, StoreError> {
		let row: Option<(String,)> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as("SELECT username FROM users WHERE id = ?")
					.bind(user.get())
					.fetch_optional(pool)
					.await
			}
			Backend::Postgres(pool) => {
				sqlx::query_as("SELECT username FROM users WHERE id = $1")
					.bind(user.get())
					.fetch_optional(pool)
					.await
			}
		}
		.context("select username")?;

		row.map(|(name,)| name)
			.ok_or_else(|| StoreError::NotFound(format!("user {user} not found")))
	}

	async fn create_room(&self, new: NewRoom) -> Result<Room, StoreError> {
		let now = unix_ms_now();
		let id = match &self.backend {
			Backend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin (sqlite)")?;
				let (id,): (i64,) = sqlx::query_as(
					"INSERT INTO rooms (name, description, creator_id, is_private, created_at) \
					VALUES (?, ?, ?, ?, ?) RETURNING id",
				)
				.bind(&new.name)
				.bind(&new.description)
				.bind(new.creator_id.get())
				.bind(new.is_private)
				.bind(now)
				.fetch_one(&mut *tx)
				.await
				.context("insert room (sqlite)")?;
				sqlx::query("INSERT INTO room_members (room_id, user_id, joined_at) VALUES (?, ?, ?)")
					.bind(id)
					.bind(new.creator_id.get())
					.bind(now)
					.execute(&mut *tx)
					.await
					.context("insert creator membership (sqlite)")?;
				tx.commit().await.context("commit (sqlite)")?;
				id
			}
			Backend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin (postgres)")?;
				let (id,): (i64,) = sqlx::query_as(
					"INSERT INTO rooms (name, description, creator_id, is_private, created_at) \
					VALUES ($1, $2, $3, $4, $5) RETURNING id",
				)
				.bind(&new.name)
				.bind(&new.description)
				.bind(new.creator_id.get())
				.bind(new.is_private)
				.bind(now)
				.fetch_one(&mut *tx)
				.await
				.context("insert room (postgres)")?;
				sqlx::query("INSERT INTO room_members (room_id, user_id, joined_at) VALUES ($1, $2, $3)")
					.bind(id)
					.bind(new.creator_id.get())
					.bind(now)
					.execute(&mut *tx)
					.await
					.context("insert creator membership (postgres)")?;
				tx.commit().await.context("commit (postgres)")?;
				id
			}
		};

		Ok(Room {
			id: RoomId::new(id).map_err(anyhow::Error::from)?,
			name: new.name,
			description: new.description,
			creator_id: new.creator_id,
			is_private: new.is_private,
			created_at_unix_ms: now,
		})
	}

	async fn room(&self, room: RoomId) -> Result<Room, StoreError> {
		self.fetch_room(room)
			.await?
			.ok_or_else(|| StoreError::room_not_found(room))
	}

	async fn list_rooms(&self, query: RoomQuery) -> Result<Vec<Room>, StoreError> {
		let rooms = match &self.backend {
			Backend::Sqlite(pool) => {
				let rows: Vec<SqliteRoomRow> = if query.include_private {
					sqlx::query_as(
						"SELECT r.id, r.name, r.description, r.creator_id, r.is_private, r.created_at \
						FROM rooms r LEFT JOIN room_members rm ON rm.room_id = r.id AND rm.user_id = ? \
						WHERE r.is_private = 0 OR r.creator_id = ? OR rm.user_id IS NOT NULL \
						ORDER BY r.created_at DESC, r.id DESC LIMIT ? OFFSET ?",
					)
					.bind(query.user_id.get())
					.bind(query.user_id.get())
					.bind(query.limit)
					.bind(query.offset)
					.fetch_all(pool)
					.await
				} else {
					sqlx::query_as(
						"SELECT id, name, description, creator_id, is_private, created_at FROM rooms \
						WHERE is_private = 0 ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
					)
					.bind(query.limit)
					.bind(query.offset)
					.fetch_all(pool)
					.await
				}
				.context("select rooms (sqlite)")?;
				rows.into_iter().map(sqlite_room).collect::<anyhow::Result<Vec<_>>>()?
			}
			Backend::Postgres(pool) => {
				let rows: Vec<PgRoomRow> = if query.include_private {
					sqlx::query_as(
						"SELECT r.id, r.name, r.description, r.creator_id, r.is_private, r.created_at \
						FROM rooms r LEFT JOIN room_members rm ON rm.room_id = r.id AND rm.user_id = $1 \
						WHERE r.is_private = FALSE OR r.creator_id = $1 OR rm.user_id IS NOT NULL \
						ORDER BY r.created_at DESC, r.id DESC LIMIT $2 OFFSET $3",
					)
					.bind(query.user_id.get())
					.bind(query.limit)
					.bind(query.offset)
					.fetch_all(pool)
					.await
				} else {
					sqlx::query_as(
						"SELECT id, name, description, creator_id, is_private, created_at FROM rooms \
						WHERE is_private = FALSE ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2",
					)
					.bind(query.limit)
					.bind(query.offset)
					.fetch_all(pool)
					.await
				}
				.context("select rooms (postgres)")?;
				rows.into_iter().map(pg_room).collect::<anyhow::Result<Vec<_>>>()?
			}
		};
		Ok(rooms)
	}

	async fn join_room(&self, room: RoomId, user: UserId) -> Result<Membership, StoreError> {
		let Some(target) = self.fetch_room(room).await? else {
			return Err(StoreError::room_not_found(room));
		};
		if !self.admits(&target, user).await? {
			return Err(StoreError::Rejected(PRIVATE_JOIN_REJECTED.to_string()));
		}

		self.insert_membership(room, user).await
	}

	async fn add_member(&self, room: RoomId, user: UserId) -> Result<Membership, StoreError> {
		if self.fetch_room(room).await?.is_none() {
			return Err(StoreError::room_not_found(room));
		}
		self.insert_membership(room, user).await
	}

	async fn leave_room(&self, room: RoomId, user: UserId) -> Result<(), StoreError> {
		let Some(target) = self.fetch_room(room).await? else {
			return Err(StoreError::room_not_found(room));
		};
		if target.is_creator(user) {
			return Err(StoreError::Rejected(CREATOR_LEAVE_REJECTED.to_string()));
		}

		let removed = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query("DELETE FROM room_members WHERE room_id = ? AND user_id = ?")
				.bind(room.get())
				.bind(user.get())
				.execute(pool)
				.await
				.context("delete membership (sqlite)")?
				.rows_affected(),
			Backend::Postgres(pool) => sqlx::query("DELETE FROM room_members WHERE room_id = $1 AND user_id = $2")
				.bind(room.get())
				.bind(user.get())
				.execute(pool)
				.await
				.context("delete membership (postgres)")?
				.rows_affected(),
		};

		if removed == 0 {
			return Err(StoreError::Rejected(NOT_A_MEMBER.to_string()));
		}
		Ok(())
	}
}
