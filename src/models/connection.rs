use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::clock::Clock;

use super::Id;

/// Lifecycle of a user's authorization link to one institution.
///
/// `Created -> Pending -> Linked`, with `Error` reachable from any
/// non-terminal state. `Error` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Created,
    Pending,
    Linked,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Created => "CREATED",
            ConnectionStatus::Pending => "PENDING",
            ConnectionStatus::Linked => "LINKED",
            ConnectionStatus::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionStatus::Error)
    }

    pub fn can_transition_to(&self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match (self, next) {
            (current, next) if *current == next => true,
            (Error, _) => false,
            (_, Error) => true,
            (Created, Pending) | (Pending, Linked) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Connection {connection_id} cannot move from {from} to {to}")]
pub struct StatusTransitionError {
    pub connection_id: Id,
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
}

/// A user's authorization link to one institution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankConnection {
    pub id: Id,
    pub user_id: Id,
    pub institution_id: String,
    /// Provider-assigned requisition id; unique per connection.
    pub requisition_id: String,
    /// Correlation reference used while the authorization handshake is in flight.
    pub reference: String,
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BankConnection {
    pub fn new(
        user_id: Id,
        institution_id: impl Into<String>,
        requisition_id: impl Into<String>,
        reference: impl Into<String>,
        clock: &dyn Clock,
    ) -> Self {
        let now = clock.now();
        Self {
            id: Id::new(),
            user_id,
            institution_id: institution_id.into(),
            requisition_id: requisition_id.into(),
            reference: reference.into(),
            status: ConnectionStatus::Created,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: Id) -> Self {
        self.id = id;
        self
    }

    pub fn is_linked(&self) -> bool {
        self.status == ConnectionStatus::Linked
    }

    pub fn transition_to(
        &mut self,
        next: ConnectionStatus,
        clock: &dyn Clock,
    ) -> Result<(), StatusTransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(StatusTransitionError {
                connection_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        if self.status != next {
            self.status = next;
            self.updated_at = clock.now();
        }
        Ok(())
    }

    /// Apply the outcome of the institution's authorization callback.
    pub fn confirm_callback(
        &mut self,
        error: Option<&str>,
        clock: &dyn Clock,
    ) -> Result<(), StatusTransitionError> {
        match error {
            Some(reason) => {
                self.transition_to(ConnectionStatus::Error, clock)?;
                self.last_error = Some(reason.to_string());
                Ok(())
            }
            None => self.transition_to(ConnectionStatus::Linked, clock),
        }
    }
}
