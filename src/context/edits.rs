//! Declarative changes to the persistent customer record.
//!
//! The engine never mutates [`PersistentContext`] directly; it returns edits and
//! the orchestrator applies them in order before the fenced save.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::models::{BookingStatus, PersistentContext};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EditError {
    #[error("{field} must be YYYY-MM-DD, got '{value}'")]
    InvalidDate { field: &'static str, value: String },
    #[error("{0} requires at least one field")]
    Empty(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PersistentEdit {
    UpdateIdentity {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        phone: Option<String>,
        #[serde(default)]
        email: Option<String>,
    },
    UpdateDependent {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        dob: Option<String>,
        #[serde(default)]
        start_date: Option<String>,
    },
    /// A different dependent: clears the old one together with its CRM and booking links.
    NewDependent {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        dob: Option<String>,
        #[serde(default)]
        start_date: Option<String>,
    },
    LinkCrm {
        #[serde(default)]
        person_id: Option<u64>,
        #[serde(default)]
        deal_id: Option<u64>,
    },
    RecordBooking {
        #[serde(default)]
        activity_id: Option<u64>,
        date: String,
        time: String,
    },
    CancelBooking,
    RequestCallback {
        #[serde(default)]
        preference: Option<String>,
        #[serde(default)]
        date: Option<String>,
        #[serde(default)]
        activity_id: Option<u64>,
    },
}

fn check_date(field: &'static str, value: Option<&String>) -> Result<(), EditError> {
    match value {
        Some(v) if NaiveDate::parse_from_str(v, "%Y-%m-%d").is_err() => Err(EditError::InvalidDate {
            field,
            value: v.clone(),
        }),
        _ => Ok(()),
    }
}

/// Set `slot` to `value` when it differs, recording `field` as changed.
fn assign<T: PartialEq>(
    slot: &mut Option<T>,
    value: Option<T>,
    field: &'static str,
    changed: &mut Vec<&'static str>,
) {
    if let Some(v) = value {
        if slot.as_ref() != Some(&v) {
            *slot = Some(v);
            changed.push(field);
        }
    }
}

/// Clear `slot`, recording `field` as changed when it held something.
fn clear<T>(slot: &mut Option<T>, field: &'static str, changed: &mut Vec<&'static str>) {
    if slot.take().is_some() {
        changed.push(field);
    }
}

impl PersistentEdit {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UpdateIdentity { .. } => "update_identity",
            Self::UpdateDependent { .. } => "update_dependent",
            Self::NewDependent { .. } => "new_dependent",
            Self::LinkCrm { .. } => "link_crm",
            Self::RecordBooking { .. } => "record_booking",
            Self::CancelBooking => "cancel_booking",
            Self::RequestCallback { .. } => "request_callback",
        }
    }

    fn validate(&self) -> Result<(), EditError> {
        match self {
            Self::UpdateIdentity { name, phone, email } => {
                if name.is_none() && phone.is_none() && email.is_none() {
                    return Err(EditError::Empty(self.name()));
                }
                Ok(())
            }
            Self::UpdateDependent {
                name,
                dob,
                start_date,
            } => {
                if name.is_none() && dob.is_none() && start_date.is_none() {
                    return Err(EditError::Empty(self.name()));
                }
                check_date("dependent_dob", dob.as_ref())?;
                check_date("preferred_start_date", start_date.as_ref())
            }
            Self::NewDependent {
                dob, start_date, ..
            } => {
                check_date("dependent_dob", dob.as_ref())?;
                check_date("preferred_start_date", start_date.as_ref())
            }
            Self::LinkCrm { person_id, deal_id } => {
                if person_id.is_none() && deal_id.is_none() {
                    return Err(EditError::Empty(self.name()));
                }
                Ok(())
            }
            Self::RecordBooking { date, .. } => check_date("booking_date", Some(date)),
            Self::CancelBooking => Ok(()),
            Self::RequestCallback { date, .. } => check_date("callback_date", date.as_ref()),
        }
    }

    /// Apply the edit and return the names of the fields that changed.
    ///
    /// Invalid edits leave `ctx` untouched.
    pub fn apply(
        &self,
        ctx: &mut PersistentContext,
        now: DateTime<Utc>,
    ) -> Result<Vec<&'static str>, EditError> {
        self.validate()?;
        let mut changed = Vec::new();
        match self.clone() {
            Self::UpdateIdentity { name, phone, email } => {
                assign(&mut ctx.preferred_name, name, "preferred_name", &mut changed);
                assign(&mut ctx.preferred_phone, phone, "preferred_phone", &mut changed);
                assign(&mut ctx.preferred_email, email, "preferred_email", &mut changed);
            }
            Self::UpdateDependent {
                name,
                dob,
                start_date,
            } => {
                assign(&mut ctx.dependent_name, name, "dependent_name", &mut changed);
                assign(&mut ctx.dependent_dob, dob, "dependent_dob", &mut changed);
                assign(
                    &mut ctx.preferred_start_date,
                    start_date,
                    "preferred_start_date",
                    &mut changed,
                );
            }
            Self::NewDependent {
                name,
                dob,
                start_date,
            } => {
                clear(&mut ctx.dependent_name, "dependent_name", &mut changed);
                clear(&mut ctx.dependent_dob, "dependent_dob", &mut changed);
                clear(&mut ctx.preferred_start_date, "preferred_start_date", &mut changed);
                clear(&mut ctx.crm_person_id, "crm_person_id", &mut changed);
                clear(&mut ctx.crm_deal_id, "crm_deal_id", &mut changed);
                clear(&mut ctx.booking_activity_id, "booking_activity_id", &mut changed);
                clear(&mut ctx.booking_date, "booking_date", &mut changed);
                clear(&mut ctx.booking_time, "booking_time", &mut changed);
                clear(&mut ctx.booking_booked_at, "booking_booked_at", &mut changed);
                clear(&mut ctx.booking_status, "booking_status", &mut changed);
                assign(&mut ctx.dependent_name, name, "dependent_name", &mut changed);
                assign(&mut ctx.dependent_dob, dob, "dependent_dob", &mut changed);
                assign(
                    &mut ctx.preferred_start_date,
                    start_date,
                    "preferred_start_date",
                    &mut changed,
                );
                changed.sort_unstable();
                changed.dedup();
            }
            Self::LinkCrm { person_id, deal_id } => {
                assign(&mut ctx.crm_person_id, person_id, "crm_person_id", &mut changed);
                assign(&mut ctx.crm_deal_id, deal_id, "crm_deal_id", &mut changed);
            }
            Self::RecordBooking {
                activity_id,
                date,
                time,
            } => {
                assign(
                    &mut ctx.booking_activity_id,
                    activity_id,
                    "booking_activity_id",
                    &mut changed,
                );
                assign(&mut ctx.booking_date, Some(date), "booking_date", &mut changed);
                assign(&mut ctx.booking_time, Some(time), "booking_time", &mut changed);
                assign(
                    &mut ctx.booking_status,
                    Some(BookingStatus::Scheduled),
                    "booking_status",
                    &mut changed,
                );
                ctx.booking_booked_at = Some(now);
                changed.push("booking_booked_at");
            }
            Self::CancelBooking => {
                if ctx.booking_status.is_some() || ctx.booking_date.is_some() {
                    assign(
                        &mut ctx.booking_status,
                        Some(BookingStatus::Cancelled),
                        "booking_status",
                        &mut changed,
                    );
                }
            }
            Self::RequestCallback {
                preference,
                date,
                activity_id,
            } => {
                if !ctx.callback_requested {
                    ctx.callback_requested = true;
                    changed.push("callback_requested");
                }
                assign(
                    &mut ctx.callback_preference,
                    preference,
                    "callback_preference",
                    &mut changed,
                );
                assign(&mut ctx.callback_date, date, "callback_date", &mut changed);
                assign(
                    &mut ctx.callback_activity_id,
                    activity_id,
                    "callback_activity_id",
                    &mut changed,
                );
                ctx.callback_requested_at = Some(now);
                changed.push("callback_requested_at");
            }
        }
        Ok(changed)
    }
}
