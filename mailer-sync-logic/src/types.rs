use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Closed set of fields subject to reconciliation. The email itself is the
/// record key and is never reconciled.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ManagedField {
    FirstName,
    LastName,
    Phone,
    City,
    Country,
}

impl ManagedField {
    pub const ALL: [ManagedField; 5] = [
        ManagedField::FirstName,
        ManagedField::LastName,
        ManagedField::Phone,
        ManagedField::City,
        ManagedField::Country,
    ];

    /// Column name in the local `clients` table.
    pub fn local_column(&self) -> &'static str {
        match self {
            ManagedField::FirstName => "first_name",
            ManagedField::LastName => "last_name",
            ManagedField::Phone => "phone",
            ManagedField::City => "city",
            ManagedField::Country => "country",
        }
    }

    /// Key in the mailerlite subscriber `fields` map.
    pub fn mailerlite_field(&self) -> &'static str {
        match self {
            ManagedField::FirstName => "name",
            ManagedField::LastName => "last_name",
            ManagedField::Phone => "phone",
            ManagedField::City => "city",
            ManagedField::Country => "country",
        }
    }

    pub fn from_local_column(column: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|field| field.local_column() == column)
    }
}

impl fmt::Display for ManagedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.local_column())
    }
}

/// Canonical form all stores key on.
pub fn canonical_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Minimal structural check; anything failing it is logged with
/// `error_type = "validation"` and skipped.
pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.contains(char::is_whitespace)
}

/// Comparison-only normal form: trim, collapse empty to absent, lower-case.
/// Stored values keep their original case.
pub fn normalize(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// One side's managed-field values for a single record. Absent and null
/// are equivalent on read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldView {
    values: BTreeMap<ManagedField, Option<String>>,
}

impl FieldView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (ManagedField, Option<String>)>,
    {
        Self {
            values: pairs.into_iter().collect(),
        }
    }

    pub fn set(&mut self, field: ManagedField, value: Option<String>) {
        self.values.insert(field, value);
    }

    /// Raw stored value, original case preserved.
    pub fn get(&self, field: ManagedField) -> Option<&str> {
        self.values.get(&field).and_then(|v| v.as_deref())
    }

    pub fn raw(&self, field: ManagedField) -> Option<String> {
        self.get(field).map(str::to_owned)
    }

    pub fn normalized(&self, field: ManagedField) -> Option<String> {
        normalize(self.get(field))
    }

    pub fn is_empty(&self) -> bool {
        ManagedField::ALL.iter().all(|f| self.get(*f).is_none())
    }
}

/// Whether a shadow captured both halves of the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Complete,
    Incomplete,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Complete => "complete",
            ValidationStatus::Incomplete => "incomplete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub has_local: bool,
    pub has_mailerlite: bool,
    pub is_complete: bool,
    pub created_at: DateTime<Utc>,
}

/// The last-synced joint snapshot stored in `sync_shadows.snapshot`.
/// `mailerlite = None` marks a placeholder shadow whose remote half could
/// not be obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowSnapshot {
    pub local: FieldView,
    pub mailerlite: Option<FieldView>,
    pub metadata: SnapshotMetadata,
}

impl ShadowSnapshot {
    pub fn new(local: FieldView, mailerlite: Option<FieldView>, has_local: bool) -> Self {
        let has_mailerlite = mailerlite.is_some();
        Self {
            local,
            mailerlite,
            metadata: SnapshotMetadata {
                has_local,
                has_mailerlite,
                is_complete: has_local && has_mailerlite,
                created_at: Utc::now(),
            },
        }
    }

    pub fn validation_status(&self) -> ValidationStatus {
        if self.metadata.is_complete {
            ValidationStatus::Complete
        } else {
            ValidationStatus::Incomplete
        }
    }

    /// An empty baseline for records that were never synced.
    pub fn empty() -> Self {
        Self {
            local: FieldView::new(),
            mailerlite: None,
            metadata: SnapshotMetadata {
                has_local: false,
                has_mailerlite: false,
                is_complete: false,
                created_at: Utc::now(),
            },
        }
    }
}

/// Mailerlite's subscriber status taxonomy. Only `active` subscribers are
/// considered subscribed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberStatus {
    Active,
    Unsubscribed,
    Unconfirmed,
    Bounced,
    Junk,
}

impl SubscriberStatus {
    pub fn subscribed(&self) -> bool {
        matches!(self, SubscriberStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriberStatus::Active => "active",
            SubscriberStatus::Unsubscribed => "unsubscribed",
            SubscriberStatus::Unconfirmed => "unconfirmed",
            SubscriberStatus::Bounced => "bounced",
            SubscriberStatus::Junk => "junk",
        }
    }
}

/// Domain-side view of a mailerlite subscriber, reduced to the managed
/// field set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub id: String,
    pub email: String,
    pub status: SubscriberStatus,
    pub fields: FieldView,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    MailerliteToLocal,
    LocalToMailerlite,
    Both,
}

impl SyncDirection {
    /// Records may flow from mailerlite into the local store.
    pub fn imports(&self) -> bool {
        matches!(
            self,
            SyncDirection::MailerliteToLocal | SyncDirection::Both
        )
    }

    /// Records may flow from the local store into mailerlite.
    pub fn exports(&self) -> bool {
        matches!(
            self,
            SyncDirection::LocalToMailerlite | SyncDirection::Both
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::MailerliteToLocal => "mailerlite_to_local",
            SyncDirection::LocalToMailerlite => "local_to_mailerlite",
            SyncDirection::Both => "both",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAction {
    Create,
    Update,
    Skip,
    FillEmpty,
    Conflict,
}

impl LogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogAction::Create => "create",
            LogAction::Update => "update",
            LogAction::Skip => "skip",
            LogAction::FillEmpty => "fill_empty",
            LogAction::Conflict => "conflict",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDirection {
    LocalToMailerlite,
    MailerliteToLocal,
    Both,
    None,
}

impl LogDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogDirection::LocalToMailerlite => "local_to_mailerlite",
            LogDirection::MailerliteToLocal => "mailerlite_to_local",
            LogDirection::Both => "both",
            LogDirection::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogResult {
    Applied,
    Skipped,
    Conflict,
    Error,
}

impl LogResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogResult::Applied => "applied",
            LogResult::Skipped => "skipped",
            LogResult::Conflict => "conflict",
            LogResult::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn canonical_email_trims_and_lowercases() {
        assert_eq!(canonical_email("  Jan.Smit@Example.COM "), "jan.smit@example.com");
        assert_eq!(canonical_email("x@y.z"), "x@y.z");
    }

    #[test]
    fn email_validation_rejects_garbage() {
        assert!(is_valid_email("jan@example.com"));
        assert!(is_valid_email("jan+tag@sub.example.co"));
        assert!(!is_valid_email("jan"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("jan@"));
        assert!(!is_valid_email("jan@example"));
        assert!(!is_valid_email("jan smit@example.com"));
        assert!(!is_valid_email("jan@.example.com"));
    }

    #[test]
    fn normalize_collapses_empty_and_lowercases() {
        assert_eq!(normalize(None), None);
        assert_eq!(normalize(Some("")), None);
        assert_eq!(normalize(Some("   ")), None);
        assert_eq!(normalize(Some(" Utrecht ")), Some("utrecht".to_string()));
        assert_eq!(normalize(Some("ROTTERDAM")), Some("rotterdam".to_string()));
    }

    #[test]
    fn field_view_treats_null_and_absent_alike() {
        let mut view = FieldView::new();
        view.set(ManagedField::Phone, None);
        assert_eq!(view.get(ManagedField::Phone), None);
        assert_eq!(view.get(ManagedField::City), None);
        assert!(view.is_empty());

        view.set(ManagedField::City, Some("Utrecht".to_string()));
        assert_eq!(view.get(ManagedField::City), Some("Utrecht"));
        assert!(!view.is_empty());
    }

    #[test]
    fn field_view_serializes_with_column_names() {
        let view = FieldView::from_pairs([
            (ManagedField::FirstName, Some("Jan".to_string())),
            (ManagedField::Phone, None),
        ]);
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"first_name": "Jan", "phone": null})
        );
    }

    #[test]
    fn snapshot_metadata_uses_camel_case_keys() {
        let snapshot = ShadowSnapshot::new(FieldView::new(), Some(FieldView::new()), true);
        let json = serde_json::to_value(&snapshot).unwrap();
        let metadata = json.get("metadata").unwrap();
        assert!(metadata.get("hasLocal").is_some());
        assert!(metadata.get("hasMailerlite").is_some());
        assert!(metadata.get("isComplete").is_some());
        assert!(metadata.get("createdAt").is_some());
        assert_eq!(metadata["isComplete"], serde_json::Value::Bool(true));
    }

    #[test]
    fn only_active_subscribers_are_subscribed() {
        assert!(SubscriberStatus::Active.subscribed());
        for status in [
            SubscriberStatus::Unsubscribed,
            SubscriberStatus::Unconfirmed,
            SubscriberStatus::Bounced,
            SubscriberStatus::Junk,
        ] {
            assert!(!status.subscribed());
        }
    }

    #[test]
    fn direction_flags() {
        assert!(SyncDirection::Both.imports() && SyncDirection::Both.exports());
        assert!(SyncDirection::MailerliteToLocal.imports());
        assert!(!SyncDirection::MailerliteToLocal.exports());
        assert!(SyncDirection::LocalToMailerlite.exports());
        assert!(!SyncDirection::LocalToMailerlite.imports());
    }

    #[test]
    fn managed_field_mapping_round_trips() {
        for field in ManagedField::ALL {
            assert_eq!(ManagedField::from_local_column(field.local_column()), Some(field));
        }
        assert_eq!(ManagedField::FirstName.mailerlite_field(), "name");
        assert_eq!(ManagedField::from_local_column("email"), None);
    }
}
