//! Check-in input validation.
//!
//! Names are trimmed and must be non-empty; phone numbers keep only their
//! ASCII digits and must have exactly ten of them.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::NewEntry;

static NON_DIGIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^0-9]").expect("non-digit regex should compile"));

const PHONE_DIGITS: usize = 10;
const MAX_NAME_CHARS: usize = 100;

/// Raw check-in body as submitted by the kiosk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInRequest {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub phone_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid check-in: {}", .0.iter().map(|e| e.field).collect::<Vec<_>>().join(", "))]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn fields(&self) -> &[FieldError] {
        &self.0
    }
}

pub fn normalize_phone(raw: &str) -> String {
    NON_DIGIT.replace_all(raw, "").into_owned()
}

/// Validate and normalize a check-in. Reports every bad field, not just the first.
pub fn validate(req: &CheckInRequest) -> Result<NewEntry, ValidationErrors> {
    let mut errors = Vec::new();

    let name = req.full_name.trim();
    if name.is_empty() {
        errors.push(FieldError {
            field: "fullName",
            message: "Please enter your full name".into(),
        });
    } else if name.chars().count() > MAX_NAME_CHARS {
        errors.push(FieldError {
            field: "fullName",
            message: format!("Name must be at most {MAX_NAME_CHARS} characters"),
        });
    }

    let phone = normalize_phone(&req.phone_number);
    if phone.len() != PHONE_DIGITS || !phone.bytes().all(|b| b.is_ascii_digit()) {
        errors.push(FieldError {
            field: "phoneNumber",
            message: "Phone number must be 10 digits".into(),
        });
    }

    if !errors.is_empty() {
        return Err(ValidationErrors(errors));
    }
    Ok(NewEntry {
        patient_name: name.to_string(),
        phone_number: phone,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(name: &str, phone: &str) -> CheckInRequest {
        CheckInRequest {
            full_name: name.into(),
            phone_number: phone.into(),
        }
    }

    #[test]
    fn accepts_and_normalizes() {
        let entry = validate(&req("  Alex Gordon ", "(519) 555-0123")).unwrap();
        assert_eq!(entry.patient_name, "Alex Gordon");
        assert_eq!(entry.phone_number, "5195550123");
    }

    #[test]
    fn rejects_blank_name() {
        let err = validate(&req("   ", "5195550123")).unwrap_err();
        assert_eq!(err.fields().len(), 1);
        assert_eq!(err.fields()[0].field, "fullName");
    }

    #[test]
    fn rejects_wrong_digit_count() {
        for phone in ["519555012", "15195550123", "", "phone"] {
            let err = validate(&req("Alex", phone)).unwrap_err();
            assert_eq!(err.fields()[0].field, "phoneNumber", "phone {phone:?}");
        }
    }

    #[test]
    fn rejects_non_ascii_digits() {
        // Five Arabic-Indic digits are ten UTF-8 bytes.
        let err = validate(&req("Alex", "٥١٩٥٥")).unwrap_err();
        assert_eq!(err.fields()[0].field, "phoneNumber");

        assert_eq!(normalize_phone("٥١٩ 555-0123"), "5550123");
        assert!(validate(&req("Alex", "٥١٩٥٥٥٠١٢٣")).is_err());
    }

    #[test]
    fn reports_all_fields() {
        let err = validate(&req("", "123")).unwrap_err();
        let fields: Vec<_> = err.fields().iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["fullName", "phoneNumber"]);
        assert!(err.to_string().contains("fullName, phoneNumber"));
    }
}
