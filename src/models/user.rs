use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;

use super::Id;

/// Owner of bank connections. Authentication lives outside this crate; a user
/// here is just the anchor the sync runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Id,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: impl Into<String>, clock: &dyn Clock) -> Self {
        Self {
            id: Id::new(),
            username: username.into(),
            created_at: clock.now(),
        }
    }

    pub fn with_id(mut self, id: Id) -> Self {
        self.id = id;
        self
    }
}
