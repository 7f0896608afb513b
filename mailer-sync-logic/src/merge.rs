//! Three-way merge over the managed field set.
//!
//! For every field the kernel compares the normalized current values on
//! both sides against the last-synced shadow and classifies the change.
//! It is deterministic and performs no I/O; callers apply the outcome.

use crate::types::{FieldView, ManagedField};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    Skip,
    ApplyToLocal { value: Option<String> },
    ApplyToMailerlite { value: Option<String> },
    Conflict { local: String, mailerlite: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDecision {
    pub field: ManagedField,
    #[serde(flatten)]
    pub decision: Decision,
}

/// A value to write to one side. `fill_empty` marks the non-empty-over-empty
/// rule so the executor can log the action distinctly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldUpdate {
    pub field: ManagedField,
    pub value: Option<String>,
    pub fill_empty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldConflict {
    pub field: ManagedField,
    pub local: String,
    pub mailerlite: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub decisions: Vec<FieldDecision>,
    pub updates_local: Vec<FieldUpdate>,
    pub updates_mailerlite: Vec<FieldUpdate>,
    pub conflicts: Vec<FieldConflict>,
}

impl MergeOutcome {
    pub fn is_noop(&self) -> bool {
        self.updates_local.is_empty()
            && self.updates_mailerlite.is_empty()
            && self.conflicts.is_empty()
    }
}

/// The decision procedure. Change detection is against the shadow, value
/// comparison is on the normalized form, and applied values are the raw
/// current ones (original case preserved).
pub fn decide(
    local: &FieldView,
    mailerlite: &FieldView,
    shadow_local: &FieldView,
    shadow_mailerlite: &FieldView,
) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();

    for field in ManagedField::ALL {
        let a = local.normalized(field);
        let b = mailerlite.normalized(field);
        let sa = shadow_local.normalized(field);
        let sb = shadow_mailerlite.normalized(field);

        let a_changed = a != sa;
        let b_changed = b != sb;

        let decision = match (a_changed, b_changed) {
            (false, false) => Decision::Skip,
            (true, false) => Decision::ApplyToMailerlite {
                value: local.raw(field),
            },
            (false, true) => Decision::ApplyToLocal {
                value: mailerlite.raw(field),
            },
            (true, true) => {
                if a == b {
                    // both sides converged on the same value
                    Decision::Skip
                } else if a.is_none() {
                    Decision::ApplyToLocal {
                        value: mailerlite.raw(field),
                    }
                } else if b.is_none() {
                    Decision::ApplyToMailerlite {
                        value: local.raw(field),
                    }
                } else {
                    Decision::Conflict {
                        local: local.raw(field).unwrap_or_default(),
                        mailerlite: mailerlite.raw(field).unwrap_or_default(),
                    }
                }
            }
        };

        match &decision {
            Decision::Skip => {}
            Decision::ApplyToLocal { value } => {
                outcome.updates_local.push(FieldUpdate {
                    field,
                    value: value.clone(),
                    fill_empty: a_changed && a.is_none(),
                });
            }
            Decision::ApplyToMailerlite { value } => {
                outcome.updates_mailerlite.push(FieldUpdate {
                    field,
                    value: value.clone(),
                    fill_empty: b_changed && b.is_none(),
                });
            }
            Decision::Conflict { local, mailerlite } => {
                outcome.conflicts.push(FieldConflict {
                    field,
                    local: local.clone(),
                    mailerlite: mailerlite.clone(),
                });
            }
        }

        outcome.decisions.push(FieldDecision { field, decision });
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn view(pairs: &[(ManagedField, Option<&str>)]) -> FieldView {
        FieldView::from_pairs(
            pairs
                .iter()
                .map(|(field, value)| (*field, value.map(str::to_owned))),
        )
    }

    fn decision_for(outcome: &MergeOutcome, field: ManagedField) -> &Decision {
        &outcome
            .decisions
            .iter()
            .find(|d| d.field == field)
            .expect("field decided")
            .decision
    }

    #[test]
    fn unchanged_everywhere_is_skip() {
        let current = view(&[(ManagedField::FirstName, Some("Jan"))]);
        let outcome = decide(&current, &current, &current, &current);
        assert!(outcome.is_noop());
        assert!(outcome
            .decisions
            .iter()
            .all(|d| d.decision == Decision::Skip));
    }

    #[test]
    fn local_change_flows_to_mailerlite() {
        // S1: shadow Jan/Jan, local became Johan, mailerlite still Jan.
        let shadow = view(&[(ManagedField::FirstName, Some("Jan"))]);
        let local = view(&[(ManagedField::FirstName, Some("Johan"))]);
        let outcome = decide(&local, &shadow, &shadow, &shadow);

        assert_eq!(
            outcome.updates_mailerlite,
            vec![FieldUpdate {
                field: ManagedField::FirstName,
                value: Some("Johan".to_string()),
                fill_empty: false,
            }]
        );
        assert!(outcome.updates_local.is_empty());
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn mailerlite_change_flows_to_local() {
        let shadow = view(&[(ManagedField::City, Some("Utrecht"))]);
        let mailerlite = view(&[(ManagedField::City, Some("Zwolle"))]);
        let outcome = decide(&shadow, &mailerlite, &shadow, &shadow);

        assert_eq!(
            outcome.updates_local,
            vec![FieldUpdate {
                field: ManagedField::City,
                value: Some("Zwolle".to_string()),
                fill_empty: false,
            }]
        );
        assert!(outcome.updates_mailerlite.is_empty());
    }

    #[test]
    fn both_converged_to_same_value_is_skip() {
        let shadow = view(&[(ManagedField::LastName, Some("de Vries"))]);
        let current = view(&[(ManagedField::LastName, Some("Bakker"))]);
        let outcome = decide(&current, &current, &shadow, &shadow);
        assert!(outcome.is_noop());
    }

    #[test]
    fn convergence_is_case_insensitive_but_applies_nothing() {
        let shadow = view(&[(ManagedField::City, Some("Utrecht"))]);
        let local = view(&[(ManagedField::City, Some("AMSTERDAM"))]);
        let mailerlite = view(&[(ManagedField::City, Some("amsterdam"))]);
        let outcome = decide(&local, &mailerlite, &shadow, &shadow);
        assert!(outcome.is_noop());
    }

    #[test]
    fn fill_empty_from_mailerlite() {
        // S2: phone empty everywhere except current mailerlite.
        let empty = view(&[(ManagedField::Phone, None)]);
        let mailerlite = view(&[(ManagedField::Phone, Some("+31612345678"))]);
        let outcome = decide(&empty, &mailerlite, &empty, &empty);

        assert_eq!(
            outcome.updates_local,
            vec![FieldUpdate {
                field: ManagedField::Phone,
                value: Some("+31612345678".to_string()),
                fill_empty: false,
            }]
        );
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn fill_empty_beats_conflict_when_both_changed() {
        // Local cleared the field while mailerlite set one: non-empty wins.
        let shadow = view(&[(ManagedField::Phone, Some("+31000000000"))]);
        let local = view(&[(ManagedField::Phone, None)]);
        let mailerlite = view(&[(ManagedField::Phone, Some("+31612345678"))]);
        let outcome = decide(&local, &mailerlite, &shadow, &shadow);

        assert_eq!(
            outcome.updates_local,
            vec![FieldUpdate {
                field: ManagedField::Phone,
                value: Some("+31612345678".to_string()),
                fill_empty: true,
            }]
        );
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn fill_empty_is_symmetric() {
        let shadow = view(&[(ManagedField::Phone, Some("+31000000000"))]);
        let local = view(&[(ManagedField::Phone, Some("+31687654321"))]);
        let mailerlite = view(&[(ManagedField::Phone, None)]);
        let outcome = decide(&local, &mailerlite, &shadow, &shadow);

        assert_eq!(
            outcome.updates_mailerlite,
            vec![FieldUpdate {
                field: ManagedField::Phone,
                value: Some("+31687654321".to_string()),
                fill_empty: true,
            }]
        );
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn divergent_changes_conflict_with_raw_values() {
        // S3: both sides moved away from Utrecht to different cities.
        let shadow = view(&[(ManagedField::City, Some("Utrecht"))]);
        let local = view(&[(ManagedField::City, Some("Amsterdam"))]);
        let mailerlite = view(&[(ManagedField::City, Some("Rotterdam"))]);
        let outcome = decide(&local, &mailerlite, &shadow, &shadow);

        assert_eq!(
            outcome.conflicts,
            vec![FieldConflict {
                field: ManagedField::City,
                local: "Amsterdam".to_string(),
                mailerlite: "Rotterdam".to_string(),
            }]
        );
        assert!(outcome.updates_local.is_empty());
        assert!(outcome.updates_mailerlite.is_empty());
        assert_eq!(
            decision_for(&outcome, ManagedField::City),
            &Decision::Conflict {
                local: "Amsterdam".to_string(),
                mailerlite: "Rotterdam".to_string(),
            }
        );
    }

    #[test]
    fn whitespace_only_edits_do_not_count_as_changes() {
        let shadow = view(&[(ManagedField::FirstName, Some("Jan"))]);
        let local = view(&[(ManagedField::FirstName, Some("  Jan "))]);
        let outcome = decide(&local, &shadow, &shadow, &shadow);
        assert!(outcome.is_noop());
    }

    #[test]
    fn clearing_one_side_propagates() {
        // Only local changed (to empty): the clear flows to mailerlite.
        let shadow = view(&[(ManagedField::Country, Some("NL"))]);
        let local = view(&[(ManagedField::Country, None)]);
        let outcome = decide(&local, &shadow, &shadow, &shadow);

        assert_eq!(
            outcome.updates_mailerlite,
            vec![FieldUpdate {
                field: ManagedField::Country,
                value: None,
                fill_empty: false,
            }]
        );
    }

    #[test]
    fn independent_fields_get_independent_decisions() {
        let shadow = view(&[
            (ManagedField::FirstName, Some("Jan")),
            (ManagedField::City, Some("Utrecht")),
            (ManagedField::Phone, None),
        ]);
        let local = view(&[
            (ManagedField::FirstName, Some("Johan")),
            (ManagedField::City, Some("Amsterdam")),
            (ManagedField::Phone, None),
        ]);
        let mailerlite = view(&[
            (ManagedField::FirstName, Some("Jan")),
            (ManagedField::City, Some("Rotterdam")),
            (ManagedField::Phone, Some("+31612345678")),
        ]);
        let outcome = decide(&local, &mailerlite, &shadow, &shadow);

        assert_eq!(outcome.updates_mailerlite.len(), 1); // first_name
        assert_eq!(outcome.updates_local.len(), 1); // phone fill
        assert_eq!(outcome.conflicts.len(), 1); // city
    }

    #[test]
    fn decide_is_deterministic() {
        let shadow = view(&[(ManagedField::City, Some("Utrecht"))]);
        let local = view(&[(ManagedField::City, Some("Amsterdam"))]);
        let mailerlite = view(&[(ManagedField::City, Some("Rotterdam"))]);

        let first = decide(&local, &mailerlite, &shadow, &shadow);
        let second = decide(&local, &mailerlite, &shadow, &shadow);
        assert_eq!(first, second);
    }

    #[test]
    fn every_managed_field_is_decided() {
        let outcome = decide(
            &FieldView::new(),
            &FieldView::new(),
            &FieldView::new(),
            &FieldView::new(),
        );
        assert_eq!(outcome.decisions.len(), ManagedField::ALL.len());
    }
}
