//! Input checks that run before any external call.

use chrono::NaiveDate;
use crmgate_core::domain::records::is_record_id;
use crmgate_core::ToolError;

pub fn record_id<'a>(name: &str, value: &'a str) -> Result<&'a str, ToolError> {
    let value = value.trim();
    if is_record_id(value) {
        Ok(value)
    } else {
        Err(ToolError::invalid_input(format!("`{name}` must be a 15 or 18 character record ID."))
            .with_detail("field", name))
    }
}

pub fn optional_record_id<'a>(name: &str, value: Option<&'a str>) -> Result<Option<&'a str>, ToolError> {
    match value.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => record_id(name, value).map(Some),
        None => Ok(None),
    }
}

pub fn date(name: &str, value: &str) -> Result<NaiveDate, ToolError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| {
        ToolError::invalid_input(format!("`{name}` must be a date in YYYY-MM-DD format.")).with_detail("field", name)
    })
}

pub fn optional_date(name: &str, value: Option<&str>) -> Result<Option<NaiveDate>, ToolError> {
    value.map(str::trim).filter(|value| !value.is_empty()).map(|value| date(name, value)).transpose()
}

pub fn required_text<'a>(name: &str, value: &'a str) -> Result<&'a str, ToolError> {
    let value = value.trim();
    if value.is_empty() {
        Err(ToolError::invalid_input(format!("`{name}` is required.")).with_detail("field", name))
    } else {
        Ok(value)
    }
}

/// Trims, and treats blank text as absent.
pub fn optional_text(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

pub fn clamp_limit(requested: Option<u32>, default: u32, max: u32) -> u32 {
    requested.unwrap_or(default).clamp(1, max.max(1))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use crmgate_core::ToolErrorCode;

    use super::{clamp_limit, date, optional_date, optional_record_id, optional_text, record_id, required_text};

    #[test]
    fn record_ids_are_checked_before_use() {
        assert_eq!(record_id("account_id", " 001000000000001AAA "), Ok("001000000000001AAA"));
        let error = record_id("account_id", "001' OR Id != '").unwrap_err();
        assert_eq!(error.code, ToolErrorCode::InvalidInput);
        assert_eq!(optional_record_id("owner_id", Some("  ")), Ok(None));
        assert!(optional_record_id("owner_id", Some("bogus")).is_err());
    }

    #[test]
    fn dates_must_be_iso_days() {
        assert_eq!(date("close_date_from", "2026-03-01"), Ok(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()));
        assert!(date("close_date_from", "03/01/2026").is_err());
        assert!(date("close_date_from", "2026-02-30").is_err());
        assert_eq!(optional_date("due_date", None), Ok(None));
    }

    #[test]
    fn blank_text_is_missing() {
        assert!(required_text("subject", "   ").is_err());
        assert_eq!(required_text("subject", " Outage "), Ok("Outage"));
        assert_eq!(optional_text(Some("  ")), None);
    }

    #[test]
    fn limits_are_clamped() {
        assert_eq!(clamp_limit(None, 25, 50), 25);
        assert_eq!(clamp_limit(Some(0), 25, 50), 1);
        assert_eq!(clamp_limit(Some(500), 25, 50), 50);
    }
}
