// Traits for dependency injection - the core only knows these interfaces,
// never the internals of the document, party, booking or compliance services.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use super::types::{GuardContext, GuardResult};

/// A named precondition gating entry into a state.
///
/// Implementations must be idempotent and must not mutate engine state.
#[async_trait]
pub trait Guard: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(&self, ctx: &GuardContext) -> GuardResult;
}

/// Document management service
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait DocumentClient: Send + Sync {
    /// Kinds of documents attached to the entity (e.g. `commercial_invoice`)
    async fn document_kinds(&self, entity_id: &str, payload: &Value) -> Result<Vec<String>>;
}

/// Party master data / KYC service
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait PartyDirectory: Send + Sync {
    /// Roles (shipper, consignee, notify) whose party is not verified
    async fn unverified_roles(&self, entity_id: &str, payload: &Value) -> Result<Vec<String>>;
}

/// Carrier booking system
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait BookingClient: Send + Sync {
    async fn booking_exists(&self, booking_ref: &str) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScreeningOutcome {
    Clear,
    Hold { reasons: Vec<String> },
}

/// Export control / denied-party screening service
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait ComplianceClient: Send + Sync {
    async fn screen(&self, entity_id: &str, payload: &Value) -> Result<ScreeningOutcome>;
}
