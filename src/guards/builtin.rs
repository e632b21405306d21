//! Shipping-instruction guards
//!
//! Each guard is a thin adapter over one injected client. The business rules
//! live in the external services; the guards translate answers into codes and
//! remediation hints.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

use super::registry::GuardRegistry;
use super::traits::{BookingClient, ComplianceClient, DocumentClient, Guard, PartyDirectory, ScreeningOutcome};
use super::types::{GuardContext, GuardResult};

pub const HAS_REQUIRED_DOCS: &str = "hasRequiredDocs";
pub const PARTIES_VERIFIED: &str = "partiesVerified";
pub const BOOKING_REF_PRESENT: &str = "bookingRefPresent";
pub const EXPORT_COMPLIANCE_OK: &str = "exportComplianceOk";

/// Domain payload with the transition evidence laid over it.
fn subject_view(ctx: &GuardContext) -> Value {
    match (&ctx.domain_payload, &ctx.evidence) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (k, v) in overlay {
                if !v.is_null() {
                    merged.insert(k.clone(), v.clone());
                }
            }
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (Value::Null, overlay) => overlay.clone(),
        (base, _) => base.clone(),
    }
}

pub struct HasRequiredDocs {
    client: Arc<dyn DocumentClient>,
}

impl HasRequiredDocs {
    pub fn new(client: Arc<dyn DocumentClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Guard for HasRequiredDocs {
    fn name(&self) -> &str {
        HAS_REQUIRED_DOCS
    }

    async fn evaluate(&self, ctx: &GuardContext) -> GuardResult {
        let kinds = match self
            .client
            .document_kinds(&ctx.instance_id, &subject_view(ctx))
            .await
        {
            Ok(kinds) => kinds,
            Err(e) => {
                warn!(instance_id = %ctx.instance_id, error = %e, "Document service lookup failed");
                return GuardResult::fail(
                    HAS_REQUIRED_DOCS,
                    "DOCUMENT_SERVICE_UNAVAILABLE",
                    format!("document service unavailable: {e}"),
                    vec!["retry_transition".to_string()],
                );
            }
        };

        let has = |kind: &str| kinds.iter().any(|k| k == kind);
        if !has("commercial_invoice") {
            return GuardResult::fail(
                HAS_REQUIRED_DOCS,
                "MISSING_INVOICE",
                "commercial invoice has not been uploaded",
                vec!["upload_commercial_invoice".to_string()],
            );
        }
        if !has("packing_list") {
            return GuardResult::fail(
                HAS_REQUIRED_DOCS,
                "MISSING_PACKING_LIST",
                "packing list has not been uploaded",
                vec!["upload_packing_list".to_string()],
            );
        }
        GuardResult::pass(HAS_REQUIRED_DOCS)
    }
}

pub struct PartiesVerified {
    directory: Arc<dyn PartyDirectory>,
}

impl PartiesVerified {
    pub fn new(directory: Arc<dyn PartyDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl Guard for PartiesVerified {
    fn name(&self) -> &str {
        PARTIES_VERIFIED
    }

    async fn evaluate(&self, ctx: &GuardContext) -> GuardResult {
        match self
            .directory
            .unverified_roles(&ctx.instance_id, &subject_view(ctx))
            .await
        {
            Ok(roles) if roles.is_empty() => GuardResult::pass(PARTIES_VERIFIED),
            Ok(roles) => GuardResult::fail(
                PARTIES_VERIFIED,
                "PARTIES_UNVERIFIED",
                format!("unverified parties: {}", roles.join(", ")),
                roles.iter().map(|role| format!("verify_party:{role}")).collect(),
            ),
            Err(e) => GuardResult::fail(
                PARTIES_VERIFIED,
                "PARTY_DIRECTORY_UNAVAILABLE",
                format!("party directory unavailable: {e}"),
                vec!["retry_transition".to_string()],
            ),
        }
    }
}

pub struct BookingRefPresent {
    bookings: Arc<dyn BookingClient>,
}

impl BookingRefPresent {
    pub fn new(bookings: Arc<dyn BookingClient>) -> Self {
        Self { bookings }
    }
}

#[async_trait]
impl Guard for BookingRefPresent {
    fn name(&self) -> &str {
        BOOKING_REF_PRESENT
    }

    async fn evaluate(&self, ctx: &GuardContext) -> GuardResult {
        let booking_ref = ctx
            .lookup("/booking_ref")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty());

        let Some(booking_ref) = booking_ref else {
            return GuardResult::fail(
                BOOKING_REF_PRESENT,
                "MISSING_BOOKING_REF",
                "no booking reference on the shipping instruction",
                vec!["attach_booking_ref".to_string()],
            );
        };

        match self.bookings.booking_exists(booking_ref).await {
            Ok(true) => GuardResult::pass(BOOKING_REF_PRESENT),
            Ok(false) => GuardResult::fail(
                BOOKING_REF_PRESENT,
                "BOOKING_NOT_FOUND",
                format!("carrier has no booking '{booking_ref}'"),
                vec!["correct_booking_ref".to_string()],
            ),
            Err(e) => GuardResult::fail(
                BOOKING_REF_PRESENT,
                "BOOKING_SERVICE_UNAVAILABLE",
                format!("booking lookup failed: {e}"),
                vec!["retry_transition".to_string()],
            ),
        }
    }
}

pub struct ExportComplianceOk {
    compliance: Arc<dyn ComplianceClient>,
}

impl ExportComplianceOk {
    pub fn new(compliance: Arc<dyn ComplianceClient>) -> Self {
        Self { compliance }
    }
}

#[async_trait]
impl Guard for ExportComplianceOk {
    fn name(&self) -> &str {
        EXPORT_COMPLIANCE_OK
    }

    async fn evaluate(&self, ctx: &GuardContext) -> GuardResult {
        match self
            .compliance
            .screen(&ctx.instance_id, &subject_view(ctx))
            .await
        {
            Ok(ScreeningOutcome::Clear) => GuardResult::pass(EXPORT_COMPLIANCE_OK),
            Ok(ScreeningOutcome::Hold { reasons }) => GuardResult::fail(
                EXPORT_COMPLIANCE_OK,
                "EXPORT_COMPLIANCE_HOLD",
                format!("export compliance hold: {}", reasons.join("; ")),
                vec!["request_compliance_review".to_string()],
            ),
            Err(e) => GuardResult::fail(
                EXPORT_COMPLIANCE_OK,
                "SCREENING_UNAVAILABLE",
                format!("screening service unavailable: {e}"),
                vec!["retry_transition".to_string()],
            ),
        }
    }
}

/// Clients backing the four shipping-instruction guards.
#[derive(Clone)]
pub struct GuardClients {
    pub documents: Arc<dyn DocumentClient>,
    pub parties: Arc<dyn PartyDirectory>,
    pub bookings: Arc<dyn BookingClient>,
    pub compliance: Arc<dyn ComplianceClient>,
}

impl GuardClients {
    /// Clients that answer from the instance payload itself.
    pub fn from_payload() -> Self {
        Self {
            documents: Arc::new(PayloadDocuments),
            parties: Arc::new(PayloadParties),
            bookings: Arc::new(KnownBookings::accept_any()),
            compliance: Arc::new(PayloadCompliance),
        }
    }
}

pub async fn register_builtin_guards(registry: &GuardRegistry, clients: GuardClients) {
    registry
        .register(Arc::new(HasRequiredDocs::new(clients.documents)))
        .await;
    registry
        .register(Arc::new(PartiesVerified::new(clients.parties)))
        .await;
    registry
        .register(Arc::new(BookingRefPresent::new(clients.bookings)))
        .await;
    registry
        .register(Arc::new(ExportComplianceOk::new(clients.compliance)))
        .await;
}

/// Reads `documents`: either kind strings or objects with a `kind` field.
pub struct PayloadDocuments;

#[async_trait]
impl DocumentClient for PayloadDocuments {
    async fn document_kinds(&self, _entity_id: &str, payload: &Value) -> Result<Vec<String>> {
        let kinds = payload
            .get("documents")
            .and_then(Value::as_array)
            .map(|docs| {
                docs.iter()
                    .filter_map(|doc| {
                        doc.as_str()
                            .or_else(|| doc.get("kind").and_then(Value::as_str))
                            .map(str::to_string)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(kinds)
    }
}

/// Reads `parties`: `{role: {"verified": bool}}`. Missing flags count as unverified.
pub struct PayloadParties;

#[async_trait]
impl PartyDirectory for PayloadParties {
    async fn unverified_roles(&self, _entity_id: &str, payload: &Value) -> Result<Vec<String>> {
        let Some(parties) = payload.get("parties").and_then(Value::as_object) else {
            return Ok(vec!["shipper".to_string(), "consignee".to_string()]);
        };
        Ok(parties
            .iter()
            .filter(|(_, party)| !party.get("verified").and_then(Value::as_bool).unwrap_or(false))
            .map(|(role, _)| role.clone())
            .collect())
    }
}

/// Booking lookup against a fixed set of references.
pub struct KnownBookings {
    refs: Option<HashSet<String>>,
}

impl KnownBookings {
    pub fn new(refs: impl IntoIterator<Item = String>) -> Self {
        Self {
            refs: Some(refs.into_iter().collect()),
        }
    }

    /// Treat every non-empty reference as known.
    pub fn accept_any() -> Self {
        Self { refs: None }
    }
}

#[async_trait]
impl BookingClient for KnownBookings {
    async fn booking_exists(&self, booking_ref: &str) -> Result<bool> {
        Ok(match &self.refs {
            Some(refs) => refs.contains(booking_ref),
            None => true,
        })
    }
}

/// Reads `compliance_holds`: a list of hold reasons.
pub struct PayloadCompliance;

#[async_trait]
impl ComplianceClient for PayloadCompliance {
    async fn screen(&self, _entity_id: &str, payload: &Value) -> Result<ScreeningOutcome> {
        let reasons: Vec<String> = payload
            .get("compliance_holds")
            .and_then(Value::as_array)
            .map(|holds| {
                holds
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if reasons.is_empty() {
            Ok(ScreeningOutcome::Clear)
        } else {
            Ok(ScreeningOutcome::Hold { reasons })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guards::traits::{MockBookingClient, MockComplianceClient, MockDocumentClient, MockPartyDirectory};
    use serde_json::json;

    fn ctx(payload: Value, evidence: Value) -> GuardContext {
        GuardContext {
            instance_id: "SI-1001".to_string(),
            definition_name: "shipping_instruction".to_string(),
            from_state: "draft".to_string(),
            to_state: "review".to_string(),
            action: "submit_for_review".to_string(),
            actor: "alice".to_string(),
            evidence,
            domain_payload: payload,
        }
    }

    #[tokio::test]
    async fn test_missing_invoice_is_reported_first() {
        let mut docs = MockDocumentClient::new();
        docs.expect_document_kinds()
            .times(1)
            .returning(|_, _| Ok(vec!["packing_list".to_string()]));

        let guard = HasRequiredDocs::new(Arc::new(docs));
        let result = guard.evaluate(&ctx(json!({}), Value::Null)).await;
        assert_eq!(result.code(), Some("MISSING_INVOICE"));
        assert_eq!(
            result.failure().unwrap().remediation_actions,
            ["upload_commercial_invoice"]
        );
    }

    #[tokio::test]
    async fn test_document_service_error_is_a_typed_failure() {
        let mut docs = MockDocumentClient::new();
        docs.expect_document_kinds()
            .returning(|_, _| Err(anyhow::anyhow!("connection refused")));

        let guard = HasRequiredDocs::new(Arc::new(docs));
        let result = guard.evaluate(&ctx(json!({}), Value::Null)).await;
        assert_eq!(result.code(), Some("DOCUMENT_SERVICE_UNAVAILABLE"));
    }

    #[tokio::test]
    async fn test_unverified_parties_produce_one_hint_per_role() {
        let mut directory = MockPartyDirectory::new();
        directory
            .expect_unverified_roles()
            .returning(|_, _| Ok(vec!["consignee".to_string(), "notify".to_string()]));

        let guard = PartiesVerified::new(Arc::new(directory));
        let result = guard.evaluate(&ctx(json!({}), Value::Null)).await;
        assert_eq!(result.code(), Some("PARTIES_UNVERIFIED"));
        assert_eq!(
            result.failure().unwrap().remediation_actions,
            ["verify_party:consignee", "verify_party:notify"]
        );
    }

    #[tokio::test]
    async fn test_booking_ref_checks_presence_then_existence() {
        let mut bookings = MockBookingClient::new();
        bookings
            .expect_booking_exists()
            .times(1)
            .returning(|_| Ok(false));
        let guard = BookingRefPresent::new(Arc::new(bookings));

        let missing = guard.evaluate(&ctx(json!({"booking_ref": "  "}), Value::Null)).await;
        assert_eq!(missing.code(), Some("MISSING_BOOKING_REF"));

        let unknown = guard
            .evaluate(&ctx(json!({}), json!({"booking_ref": "BK-404"})))
            .await;
        assert_eq!(unknown.code(), Some("BOOKING_NOT_FOUND"));
    }

    #[tokio::test]
    async fn test_compliance_hold_and_outage() {
        let mut compliance = MockComplianceClient::new();
        compliance.expect_screen().times(1).returning(|_, _| {
            Ok(ScreeningOutcome::Hold {
                reasons: vec!["dual-use goods".to_string()],
            })
        });
        compliance
            .expect_screen()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("timeout")));

        let guard = ExportComplianceOk::new(Arc::new(compliance));
        let hold = guard.evaluate(&ctx(json!({}), Value::Null)).await;
        assert_eq!(hold.code(), Some("EXPORT_COMPLIANCE_HOLD"));
        let outage = guard.evaluate(&ctx(json!({}), Value::Null)).await;
        assert_eq!(outage.code(), Some("SCREENING_UNAVAILABLE"));
    }

    #[tokio::test]
    async fn test_payload_clients_read_evidence_over_payload() {
        let registry = GuardRegistry::new();
        register_builtin_guards(&registry, GuardClients::from_payload()).await;
        assert_eq!(registry.names().await.len(), 4);

        let docs = registry.get(HAS_REQUIRED_DOCS).await.unwrap();
        let payload = json!({"documents": [{"kind": "commercial_invoice"}]});
        let before = docs.evaluate(&ctx(payload.clone(), Value::Null)).await;
        assert_eq!(before.code(), Some("MISSING_PACKING_LIST"));

        let evidence = json!({"documents": ["commercial_invoice", "packing_list"]});
        assert!(docs.evaluate(&ctx(payload, evidence)).await.passed());

        let parties = registry.get(PARTIES_VERIFIED).await.unwrap();
        let verified = json!({"parties": {"shipper": {"verified": true}, "consignee": {"verified": true}}});
        assert!(parties.evaluate(&ctx(verified, Value::Null)).await.passed());
    }
}
