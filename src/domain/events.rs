//! Integration Events
//!
//! Versioned wire schemas exchanged through the broker. Every payload is
//! validated here, at the deserialization boundary; anything that fails is a
//! poison message for the consumer that received it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{Transaction, TransactionStatus};

/// Event type tag of the outbox entry written for every new transaction
pub const TRANSACTION_CREATED_V1: &str = "transactions.created.v1";

/// Event type tag of the risk verdict
pub const TRANSACTION_VALIDATED_V1: &str = "transactions.validated.v1";

/// Errors raised while decoding a broker payload
#[derive(Debug, thiserror::Error)]
pub enum EventDecodeError {
    #[error("Empty payload")]
    EmptyPayload,

    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid transactionExternalId: {0}")]
    InvalidTransactionId(String),

    #[error("Invalid verdict status: {0}")]
    UnknownStatus(String),
}

/// A transaction was accepted and is waiting for a risk verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionCreated {
    pub transaction_external_id: Uuid,
    /// A JSON string on the wire, read as a UUID. The API only admits UUID
    /// accounts, so an event with any other account id is a poison message.
    pub source_account_id: Uuid,
    pub target_account_id: Uuid,
    pub transfer_type_id: i32,
    /// Written as a JSON number; read from a number or a numeric string
    #[serde(serialize_with = "rust_decimal::serde::float::serialize")]
    pub value: Decimal,
    /// Absent on some producers; evaluators fall back to their own clock
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl TransactionCreated {
    pub fn decode(payload: &[u8]) -> Result<Self, EventDecodeError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(EventDecodeError::EmptyPayload);
        }
        Ok(serde_json::from_slice(payload)?)
    }
}

impl From<&Transaction> for TransactionCreated {
    fn from(tx: &Transaction) -> Self {
        Self {
            transaction_external_id: tx.external_id(),
            source_account_id: tx.source_account_id(),
            target_account_id: tx.target_account_id(),
            transfer_type_id: tx.transfer_type_id(),
            value: tx.value().value(),
            created_at: Some(tx.created_at()),
        }
    }
}

/// Outcome of a risk evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictStatus {
    Approved,
    Rejected,
}

impl VerdictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictStatus::Approved => "approved",
            VerdictStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerdictStatus {
    type Err = EventDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approved" => Ok(VerdictStatus::Approved),
            "rejected" => Ok(VerdictStatus::Rejected),
            _ => Err(EventDecodeError::UnknownStatus(s.to_string())),
        }
    }
}

impl From<VerdictStatus> for TransactionStatus {
    fn from(status: VerdictStatus) -> Self {
        match status {
            VerdictStatus::Approved => TransactionStatus::Approved,
            VerdictStatus::Rejected => TransactionStatus::Rejected,
        }
    }
}

/// Verdict emitted by the risk evaluator for one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionValidated {
    pub transaction_external_id: Uuid,
    pub status: VerdictStatus,
    pub reason: Option<String>,
    pub evaluated_at: Option<DateTime<Utc>>,
}

/// Loosely typed shape used to report which field made a verdict invalid
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawValidated {
    transaction_external_id: Option<String>,
    status: Option<String>,
    reason: Option<String>,
    evaluated_at: Option<DateTime<Utc>>,
}

impl TransactionValidated {
    pub fn new(
        transaction_external_id: Uuid,
        status: VerdictStatus,
        reason: impl Into<String>,
        evaluated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_external_id,
            status,
            reason: Some(reason.into()),
            evaluated_at: Some(evaluated_at),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, EventDecodeError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(EventDecodeError::EmptyPayload);
        }

        let raw: RawValidated = serde_json::from_slice(payload)?;

        let id = raw
            .transaction_external_id
            .ok_or(EventDecodeError::MissingField("transactionExternalId"))?;
        let transaction_external_id =
            Uuid::parse_str(id.trim()).map_err(|_| EventDecodeError::InvalidTransactionId(id))?;

        let status = raw
            .status
            .ok_or(EventDecodeError::MissingField("status"))?
            .parse()?;

        Ok(Self {
            transaction_external_id,
            status,
            reason: raw.reason,
            evaluated_at: raw.evaluated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Amount;
    use rust_decimal_macros::dec;

    #[test]
    fn test_created_event_wire_names() {
        let tx = Transaction::create(
            Uuid::new_v4(),
            Uuid::new_v4(),
            2,
            Amount::new(dec!(2000)).unwrap(),
            Utc::now(),
        );

        let json = serde_json::to_value(TransactionCreated::from(&tx)).unwrap();

        assert_eq!(json["transactionExternalId"], tx.external_id().to_string());
        assert_eq!(json["sourceAccountId"], tx.source_account_id().to_string());
        assert_eq!(json["transferTypeId"], 2);
        assert!(json["value"].is_number());
        assert!(json["createdAt"].is_string());
    }

    #[test]
    fn test_created_event_accepts_string_value_and_missing_timestamp() {
        let payload = format!(
            r#"{{"transactionExternalId":"{}","sourceAccountId":"{}","targetAccountId":"{}","transferTypeId":1,"value":"600.25"}}"#,
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4()
        );

        let event = TransactionCreated::decode(payload.as_bytes()).unwrap();

        assert_eq!(event.value, dec!(600.25));
        assert!(event.created_at.is_none());
    }

    #[test]
    fn test_created_event_rejects_non_uuid_account() {
        let payload = format!(
            r#"{{"transactionExternalId":"{}","sourceAccountId":"acct-42","targetAccountId":"{}","transferTypeId":1,"value":10}}"#,
            Uuid::new_v4(),
            Uuid::new_v4()
        );

        assert!(matches!(
            TransactionCreated::decode(payload.as_bytes()),
            Err(EventDecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_created_event_rejects_garbage() {
        assert!(matches!(
            TransactionCreated::decode(b"not-a-json"),
            Err(EventDecodeError::Malformed(_))
        ));
        assert!(matches!(
            TransactionCreated::decode(b"  "),
            Err(EventDecodeError::EmptyPayload)
        ));
    }

    #[test]
    fn test_validated_decode_ok() {
        let id = Uuid::new_v4();
        let payload = format!(
            r#"{{"transactionExternalId":"{id}","status":"approved","reason":"ok","evaluatedAt":"2025-11-06T00:00:00Z"}}"#
        );

        let verdict = TransactionValidated::decode(payload.as_bytes()).unwrap();

        assert_eq!(verdict.transaction_external_id, id);
        assert_eq!(verdict.status, VerdictStatus::Approved);
        assert_eq!(verdict.reason.as_deref(), Some("ok"));
    }

    #[test]
    fn test_validated_decode_invalid_id() {
        let payload = br#"{"transactionExternalId":"not-a-guid","status":"approved","reason":"ok"}"#;
        assert!(matches!(
            TransactionValidated::decode(payload),
            Err(EventDecodeError::InvalidTransactionId(_))
        ));
    }

    #[test]
    fn test_validated_decode_unknown_status() {
        let payload = format!(
            r#"{{"transactionExternalId":"{}","status":"unknown","reason":"ok"}}"#,
            Uuid::new_v4()
        );
        assert!(matches!(
            TransactionValidated::decode(payload.as_bytes()),
            Err(EventDecodeError::UnknownStatus(_))
        ));

        // A verdict can never send a transaction back to pending
        let payload = format!(
            r#"{{"transactionExternalId":"{}","status":"pending"}}"#,
            Uuid::new_v4()
        );
        assert!(TransactionValidated::decode(payload.as_bytes()).is_err());
    }

    #[test]
    fn test_validated_encode_shape() {
        let id = Uuid::new_v4();
        let verdict =
            TransactionValidated::new(id, VerdictStatus::Rejected, "daily_cap", Utc::now());

        let json = serde_json::to_value(&verdict).unwrap();

        assert_eq!(json["transactionExternalId"], id.to_string());
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["reason"], "daily_cap");
        assert!(json["evaluatedAt"].is_string());
    }
}
