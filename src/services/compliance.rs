//! Stateless format and consistency checks on regulatory identifiers.
//!
//! Invoked before a preshipment is created or an updated regulatory
//! field is persisted, and again before the entry summary may enter the
//! filing pipeline. Violations are collected, never short-circuited, so
//! the caller can report every problem at once.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::entities::preshipment;
use crate::errors::FieldViolation;

static FILING_DISTRICT_PORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]{4}$").expect("valid regex"));
static ENTRY_FILER_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]{3}$").expect("valid regex"));
static CARRIER_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{4}$").expect("valid regex"));

/// Borrowed view of the regulatory identifier bundle under validation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComplianceFields<'a> {
    pub filing_district_port: Option<&'a str>,
    pub entry_filer_code: Option<&'a str>,
    pub carrier_code: Option<&'a str>,
    pub weekly_entry: bool,
    pub zone_week_ending_date: Option<NaiveDate>,
}

impl<'a> ComplianceFields<'a> {
    pub fn from_model(model: &'a preshipment::Model) -> Self {
        Self {
            filing_district_port: model.filing_district_port.as_deref(),
            entry_filer_code: model.entry_filer_code.as_deref(),
            carrier_code: model.carrier_code.as_deref(),
            weekly_entry: model.weekly_entry,
            zone_week_ending_date: model.zone_week_ending_date,
        }
    }
}

/// Format checks on the fields that are present, plus the weekly-entry
/// consistency rule. Absent fields are not violations here; presence is
/// enforced by [`validate_for_filing`].
pub fn validate(fields: &ComplianceFields<'_>) -> Vec<FieldViolation> {
    let mut violations = Vec::new();

    if let Some(port) = fields.filing_district_port {
        if !FILING_DISTRICT_PORT.is_match(port) {
            violations.push(FieldViolation::new(
                "filing_district_port",
                "must be exactly 4 alphanumeric characters",
            ));
        }
    }

    if let Some(filer) = fields.entry_filer_code {
        if !ENTRY_FILER_CODE.is_match(filer) {
            violations.push(FieldViolation::new(
                "entry_filer_code",
                "must be exactly 3 alphanumeric characters",
            ));
        }
    }

    if let Some(carrier) = fields.carrier_code {
        if !CARRIER_CODE.is_match(carrier) {
            violations.push(FieldViolation::new(
                "carrier_code",
                "must be a 4-letter uppercase SCAC code",
            ));
        }
    }

    if fields.weekly_entry && fields.zone_week_ending_date.is_none() {
        violations.push(FieldViolation::new(
            "zone_week_ending_date",
            "required when weekly_entry is set",
        ));
    }

    violations
}

/// Everything [`validate`] checks, plus presence of the identifiers the
/// filing pipeline requires.
pub fn validate_for_filing(fields: &ComplianceFields<'_>) -> Vec<FieldViolation> {
    let mut violations = validate(fields);

    if fields.filing_district_port.is_none() {
        violations.push(FieldViolation::new(
            "filing_district_port",
            "required before filing",
        ));
    }
    if fields.entry_filer_code.is_none() {
        violations.push(FieldViolation::new(
            "entry_filer_code",
            "required before filing",
        ));
    }
    if fields.carrier_code.is_none() {
        violations.push(FieldViolation::new("carrier_code", "required before filing"));
    }

    violations
}
