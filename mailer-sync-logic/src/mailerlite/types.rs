//! Wire payloads of the mailerlite subscriber API.

use crate::types::{canonical_email, FieldView, ManagedField, Subscriber, SubscriberStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberData {
    pub id: String,
    pub email: String,
    pub status: SubscriberStatus,
    #[serde(default)]
    pub fields: BTreeMap<String, Option<String>>,
}

impl From<SubscriberData> for Subscriber {
    fn from(data: SubscriberData) -> Self {
        let mut fields = FieldView::new();
        for field in ManagedField::ALL {
            let value = data
                .fields
                .get(field.mailerlite_field())
                .and_then(|v| v.clone());
            fields.set(field, value);
        }
        Subscriber {
            id: data.id,
            email: canonical_email(&data.email),
            status: data.status,
            fields,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SubscriberEnvelope {
    pub data: SubscriberData,
}

#[derive(Debug, Deserialize)]
pub struct ListMeta {
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListEnvelope {
    pub data: Vec<SubscriberData>,
    #[serde(default)]
    pub meta: Option<ListMeta>,
}

#[derive(Debug, Serialize)]
pub struct BatchRequest {
    pub requests: Vec<BatchSubRequest>,
}

#[derive(Debug, Serialize)]
pub struct BatchSubRequest {
    pub method: String,
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct BatchEnvelope {
    pub total: u32,
    pub successful: u32,
    pub failed: u32,
    pub responses: Vec<BatchSubResponse>,
}

#[derive(Debug, Deserialize)]
pub struct BatchSubResponse {
    pub code: u16,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// Body of a subscriber create. Managed fields ride in the `fields` map.
#[derive(Debug, Serialize)]
pub struct SubscriberUpsertBody {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SubscriberStatus>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Option<String>>,
}

/// Partial subscriber update; `null` clears a field on the mailerlite side.
#[derive(Debug, Serialize)]
pub struct SubscriberPatchBody {
    pub fields: BTreeMap<String, Option<String>>,
}
