//! Stripe webhook verification and subscription event handling.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::AuditEntry;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Maximum age of a signed webhook.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("malformed signature header")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("no matching signature")]
    Mismatch,
}

/// Verifies a `t=<unix>,v1=<hex>` signature header against `payload`.
///
/// The signed message is `"<t>.<payload>"`; any `v1` entry may match.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: DateTime<Utc>,
) -> std::result::Result<(), SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }

    if (now.timestamp() - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(SignatureError::Expired);
    }

    for signature in signatures {
        let Ok(expected) = hex::decode(signature) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| SignatureError::Malformed)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }

    Err(SignatureError::Mismatch)
}

/// Builds a signature header for `payload`, as the billing provider would.
pub fn signature_header(
    payload: &[u8],
    secret: &str,
    timestamp: i64,
) -> std::result::Result<String, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Malformed)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(format!(
        "t={timestamp},v1={}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CheckoutSession {
    #[serde(default)]
    metadata: CheckoutMetadata,
    customer: Option<String>,
    subscription: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CheckoutMetadata {
    workspace_id: Option<String>,
    plan_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Subscription {
    id: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEvent {
    CheckoutCompleted {
        workspace_id: String,
        plan_id: String,
        customer_id: Option<String>,
        subscription_id: Option<String>,
    },
    SubscriptionDeleted {
        subscription_id: String,
    },
    SubscriptionUpdated {
        subscription_id: String,
        status: String,
    },
    Ignored(String),
}

pub fn parse_event(payload: &[u8]) -> Result<BillingEvent> {
    let event: RawEvent = serde_json::from_slice(payload)
        .map_err(|e| Error::BadRequest(format!("invalid webhook payload: {e}")))?;
    let object = event.data.object;
    let invalid =
        |e: serde_json::Error| Error::BadRequest(format!("invalid {}: {e}", event.event_type));

    match event.event_type.as_str() {
        "checkout.session.completed" => {
            let session: CheckoutSession = serde_json::from_value(object).map_err(invalid)?;
            let (Some(workspace_id), Some(plan_id)) =
                (session.metadata.workspace_id, session.metadata.plan_id)
            else {
                return Err(Error::BadRequest(
                    "checkout session is missing workspace_id or plan_id metadata".to_string(),
                ));
            };
            Ok(BillingEvent::CheckoutCompleted {
                workspace_id,
                plan_id,
                customer_id: session.customer,
                subscription_id: session.subscription,
            })
        }
        "customer.subscription.deleted" => {
            let subscription: Subscription = serde_json::from_value(object).map_err(invalid)?;
            Ok(BillingEvent::SubscriptionDeleted {
                subscription_id: subscription.id,
            })
        }
        "customer.subscription.updated" => {
            let subscription: Subscription = serde_json::from_value(object).map_err(invalid)?;
            Ok(BillingEvent::SubscriptionUpdated {
                subscription_id: subscription.id,
                status: subscription.status,
            })
        }
        other => Ok(BillingEvent::Ignored(other.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Activated(String),
    Cancelled(String),
    Reactivated(String),
    /// The checkout's plan has fewer seats than the workspace has members.
    /// The plan is left unchanged.
    SeatLimitExceeded(String),
    /// The event was acknowledged without changing anything.
    Unchanged,
}

/// Applies a billing event to the workspace it concerns.
///
/// Events for unknown workspaces or subscriptions are acknowledged as
/// `Unchanged` so the provider does not retry them.
pub fn apply_event(
    store: &dyn Store,
    event: &BillingEvent,
    now: DateTime<Utc>,
) -> Result<WebhookOutcome> {
    match event {
        BillingEvent::CheckoutCompleted {
            workspace_id,
            plan_id,
            customer_id,
            subscription_id,
        } => {
            let result = store.activate_subscription(
                workspace_id,
                plan_id,
                customer_id.as_deref(),
                subscription_id.as_deref(),
            );
            match result {
                Ok(workspace) => {
                    record(store, "subscription.activated", &workspace.id, plan_id);
                    Ok(WebhookOutcome::Activated(workspace.id))
                }
                Err(Error::NotFound) => {
                    tracing::warn!(workspace_id = %workspace_id, "Checkout for unknown workspace");
                    Ok(WebhookOutcome::Unchanged)
                }
                Err(Error::SeatLimitExceeded) => {
                    tracing::warn!(
                        workspace_id = %workspace_id,
                        plan_id = %plan_id,
                        "Checkout plan has fewer seats than current members"
                    );
                    record(store, "subscription.rejected", workspace_id, plan_id);
                    Ok(WebhookOutcome::SeatLimitExceeded(workspace_id.clone()))
                }
                Err(e) => Err(e),
            }
        }
        BillingEvent::SubscriptionDeleted { subscription_id } => {
            let Some(workspace) = store.get_workspace_by_subscription(subscription_id)? else {
                return Ok(WebhookOutcome::Unchanged);
            };
            let workspace = store.cancel_workspace(&workspace.id, now)?;
            record(store, "subscription.cancelled", &workspace.id, subscription_id);
            Ok(WebhookOutcome::Cancelled(workspace.id))
        }
        BillingEvent::SubscriptionUpdated {
            subscription_id,
            status,
        } => {
            let Some(workspace) = store.get_workspace_by_subscription(subscription_id)? else {
                return Ok(WebhookOutcome::Unchanged);
            };
            if status != "active" || !workspace.is_read_only {
                return Ok(WebhookOutcome::Unchanged);
            }
            let workspace = store.reactivate_workspace(&workspace.id)?;
            record(store, "subscription.reactivated", &workspace.id, subscription_id);
            Ok(WebhookOutcome::Reactivated(workspace.id))
        }
        BillingEvent::Ignored(_) => Ok(WebhookOutcome::Unchanged),
    }
}

fn record(store: &dyn Store, action: &str, workspace_id: &str, reference: &str) {
    let entry = AuditEntry::new(action)
        .in_workspace(workspace_id)
        .resource("workspace", workspace_id)
        .details(serde_json::json!({ "reference": reference }));
    if let Err(e) = store.insert_audit_entry(&entry) {
        tracing::warn!("Failed to write audit entry for {action}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::types::User;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    const SECRET: &str = "whsec_test";

    #[test]
    fn test_signature_roundtrip() {
        let payload = br#"{"type":"ping"}"#;
        let now = Utc::now();
        let header = signature_header(payload, SECRET, now.timestamp()).unwrap();

        assert_eq!(verify_signature(payload, &header, SECRET, now), Ok(()));
        assert_eq!(
            verify_signature(payload, &header, "whsec_other", now),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_signature(br#"{"type":"pong"}"#, &header, SECRET, now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_signature_tolerance() {
        let payload = b"{}";
        let now = Utc::now();
        let stale =
            signature_header(payload, SECRET, (now - Duration::seconds(301)).timestamp()).unwrap();
        assert_eq!(
            verify_signature(payload, &stale, SECRET, now),
            Err(SignatureError::Expired)
        );

        let recent =
            signature_header(payload, SECRET, (now - Duration::seconds(299)).timestamp()).unwrap();
        assert_eq!(verify_signature(payload, &recent, SECRET, now), Ok(()));
    }

    #[test]
    fn test_signature_malformed() {
        let now = Utc::now();
        assert_eq!(
            verify_signature(b"{}", "v1=abcd", SECRET, now),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_signature(b"{}", &format!("t={}", now.timestamp()), SECRET, now),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn test_signature_accepts_any_v1_entry() {
        let payload = b"{}";
        let now = Utc::now();
        let good = signature_header(payload, SECRET, now.timestamp()).unwrap();
        let (timestamp, signature) = good.split_once(',').unwrap();
        let header = format!("{timestamp},v1=deadbeef,{signature}");
        assert_eq!(verify_signature(payload, &header, SECRET, now), Ok(()));
    }

    #[test]
    fn test_parse_checkout_event() {
        let payload = json!({
            "type": "checkout.session.completed",
            "data": { "object": {
                "customer": "cus_1",
                "subscription": "sub_1",
                "metadata": { "workspace_id": "ws-1", "plan_id": "haste_i" }
            }}
        });
        let event = parse_event(payload.to_string().as_bytes()).unwrap();
        assert_eq!(
            event,
            BillingEvent::CheckoutCompleted {
                workspace_id: "ws-1".to_string(),
                plan_id: "haste_i".to_string(),
                customer_id: Some("cus_1".to_string()),
                subscription_id: Some("sub_1".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_rejects_checkout_without_metadata() {
        let payload = json!({
            "type": "checkout.session.completed",
            "data": { "object": { "customer": "cus_1" } }
        });
        assert!(matches!(
            parse_event(payload.to_string().as_bytes()),
            Err(Error::BadRequest(_))
        ));
    }

    #[test]
    fn test_parse_unknown_event_is_ignored() {
        let payload = json!({ "type": "invoice.paid", "data": { "object": {} } });
        assert_eq!(
            parse_event(payload.to_string().as_bytes()).unwrap(),
            BillingEvent::Ignored("invoice.paid".to_string())
        );
    }

    #[test]
    fn test_checkout_to_smaller_plan_keeps_current_plan() {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::new(temp.path().join("test.db")).unwrap();
        store.initialize().unwrap();

        let identity = |n: usize| crate::types::OAuthIdentity {
            provider: crate::types::OAuthProvider::GitHub,
            provider_user_id: n.to_string(),
            email: format!("user{n}@example.com"),
            display_name: None,
            avatar_url: None,
        };
        let owner = store
            .provision_user(&User::from_identity(&identity(0), Utc::now()))
            .unwrap();
        let ws_id = owner.workspace.id;
        store
            .activate_subscription(&ws_id, "haste_ii", None, None)
            .unwrap();
        for n in 1..=3 {
            let user = store
                .provision_user(&User::from_identity(&identity(n), Utc::now()))
                .unwrap();
            store
                .add_member(&crate::types::Membership {
                    user_id: user.user.id,
                    workspace_id: ws_id.clone(),
                    role: crate::types::Role::User,
                    joined_at: Utc::now(),
                })
                .unwrap();
        }

        let downgrade = BillingEvent::CheckoutCompleted {
            workspace_id: ws_id.clone(),
            plan_id: "haste_i".to_string(),
            customer_id: None,
            subscription_id: None,
        };
        assert_eq!(
            apply_event(&store, &downgrade, Utc::now()).unwrap(),
            WebhookOutcome::SeatLimitExceeded(ws_id.clone())
        );
        let ws = store.get_workspace(&ws_id).unwrap().unwrap();
        assert_eq!(ws.plan_id, "haste_ii");
        assert!(store.count_members(&ws_id).unwrap() <= 10);
    }

    #[test]
    fn test_apply_subscription_lifecycle() {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::new(temp.path().join("test.db")).unwrap();
        store.initialize().unwrap();

        let user = User::from_identity(
            &crate::types::OAuthIdentity {
                provider: crate::types::OAuthProvider::GitHub,
                provider_user_id: "1".to_string(),
                email: "owner@example.com".to_string(),
                display_name: None,
                avatar_url: None,
            },
            Utc::now(),
        );
        let ws_id = store.provision_user(&user).unwrap().workspace.id;
        let now = Utc::now();

        let checkout = BillingEvent::CheckoutCompleted {
            workspace_id: ws_id.clone(),
            plan_id: "haste_ii".to_string(),
            customer_id: Some("cus_1".to_string()),
            subscription_id: Some("sub_1".to_string()),
        };
        assert_eq!(
            apply_event(&store, &checkout, now).unwrap(),
            WebhookOutcome::Activated(ws_id.clone())
        );

        let deleted = BillingEvent::SubscriptionDeleted {
            subscription_id: "sub_1".to_string(),
        };
        assert_eq!(
            apply_event(&store, &deleted, now).unwrap(),
            WebhookOutcome::Cancelled(ws_id.clone())
        );
        assert!(store.get_workspace(&ws_id).unwrap().unwrap().is_read_only);

        let past_due = BillingEvent::SubscriptionUpdated {
            subscription_id: "sub_1".to_string(),
            status: "past_due".to_string(),
        };
        assert_eq!(
            apply_event(&store, &past_due, now).unwrap(),
            WebhookOutcome::Unchanged
        );

        let active = BillingEvent::SubscriptionUpdated {
            subscription_id: "sub_1".to_string(),
            status: "active".to_string(),
        };
        assert_eq!(
            apply_event(&store, &active, now).unwrap(),
            WebhookOutcome::Reactivated(ws_id.clone())
        );
        assert!(!store.get_workspace(&ws_id).unwrap().unwrap().is_read_only);

        let unknown = BillingEvent::SubscriptionDeleted {
            subscription_id: "sub_missing".to_string(),
        };
        assert_eq!(
            apply_event(&store, &unknown, now).unwrap(),
            WebhookOutcome::Unchanged
        );
        assert_eq!(store.list_audit_entries(&ws_id, 10).unwrap().len(), 3);
    }
}
