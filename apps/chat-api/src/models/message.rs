use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use utoipa::ToSchema;

use crate::db::schema::messages;

/// A persisted chat message. History is queried separately from live delivery.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, ToSchema)]
#[diesel(table_name = messages)]
pub struct Message {
    #[serde(with = "chat_common::id::i64_string")]
    #[schema(value_type = String)]
    pub id: i64,
    pub room_id: String,
    pub user_id: String,
    pub username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = messages)]
pub struct NewMessage<'a> {
    pub id: i64,
    pub room_id: &'a str,
    pub user_id: &'a str,
    pub username: &'a str,
    pub content: &'a str,
    pub created_at: DateTime<Utc>,
}
