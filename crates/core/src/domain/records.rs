use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A CRM row with transport metadata already stripped. Relationship fields stay
/// nested (`{"Owner": {"Name": ..}}`).
pub type CrmRecord = Map<String, Value>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("record is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` has unexpected value `{value}`")]
    InvalidField { field: &'static str, value: String },
}

/// Typed view over one CRM object.
pub trait FromCrmRecord: Sized {
    const OBJECT: &'static str;
    const FIELDS: &'static [&'static str];

    fn from_record(record: &CrmRecord) -> Result<Self, NormalizeError>;
}

/// Resolves dotted relationship paths such as `Owner.Name`.
pub fn field<'a>(record: &'a CrmRecord, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = record.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    (!current.is_null()).then_some(current)
}

pub fn text(record: &CrmRecord, path: &str) -> Option<String> {
    match field(record, path)? {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        Value::Bool(value) => Some(value.to_string()),
        _ => None,
    }
}

fn required_text(record: &CrmRecord, path: &'static str) -> Result<String, NormalizeError> {
    text(record, path).ok_or(NormalizeError::MissingField(path))
}

fn date(record: &CrmRecord, path: &'static str) -> Result<Option<NaiveDate>, NormalizeError> {
    let Some(raw) = text(record, path) else {
        return Ok(None);
    };
    let day = raw.get(..10).unwrap_or(&raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| NormalizeError::InvalidField { field: path, value: raw.clone() })
}

fn timestamp(record: &CrmRecord, path: &'static str) -> Result<Option<DateTime<Utc>>, NormalizeError> {
    let Some(raw) = text(record, path) else {
        return Ok(None);
    };
    parse_crm_timestamp(&raw)
        .map(Some)
        .ok_or(NormalizeError::InvalidField { field: path, value: raw })
}

/// Accepts both RFC 3339 and the `+0000` offset form the CRM API emits.
pub fn parse_crm_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .map(|parsed| parsed.with_timezone(&Utc))
        .ok()
}

fn decimal(record: &CrmRecord, path: &'static str) -> Result<Option<Decimal>, NormalizeError> {
    let Some(raw) = text(record, path) else {
        return Ok(None);
    };
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map(Some)
        .map_err(|_| NormalizeError::InvalidField { field: path, value: raw })
}

fn float(record: &CrmRecord, path: &'static str) -> Result<Option<f64>, NormalizeError> {
    match field(record, path) {
        None => Ok(None),
        Some(Value::Number(number)) => Ok(number.as_f64()),
        Some(other) => other
            .as_str()
            .and_then(|raw| raw.parse::<f64>().ok())
            .map(Some)
            .ok_or_else(|| NormalizeError::InvalidField { field: path, value: other.to_string() }),
    }
}

fn boolean(record: &CrmRecord, path: &'static str) -> bool {
    matches!(field(record, path), Some(Value::Bool(true)))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub industry: Option<String>,
    #[serde(rename = "type")]
    pub account_type: Option<String>,
    pub annual_revenue: Option<Decimal>,
    pub billing_city: Option<String>,
    pub billing_state: Option<String>,
    pub owner_name: Option<String>,
    pub description: Option<String>,
}

impl FromCrmRecord for Account {
    const OBJECT: &'static str = "Account";
    const FIELDS: &'static [&'static str] = &[
        "Id",
        "Name",
        "Industry",
        "Type",
        "AnnualRevenue",
        "BillingCity",
        "BillingState",
        "Owner.Name",
        "Description",
    ];

    fn from_record(record: &CrmRecord) -> Result<Self, NormalizeError> {
        Ok(Self {
            id: required_text(record, "Id")?,
            name: required_text(record, "Name")?,
            industry: text(record, "Industry"),
            account_type: text(record, "Type"),
            annual_revenue: decimal(record, "AnnualRevenue")?,
            billing_city: text(record, "BillingCity"),
            billing_state: text(record, "BillingState"),
            owner_name: text(record, "Owner.Name"),
            description: text(record, "Description"),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub title: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Role on an open opportunity, when known.
    pub role: Option<String>,
}

impl FromCrmRecord for Contact {
    const OBJECT: &'static str = "Contact";
    const FIELDS: &'static [&'static str] = &["Id", "Name", "Title", "Email", "Phone"];

    fn from_record(record: &CrmRecord) -> Result<Self, NormalizeError> {
        Ok(Self {
            id: required_text(record, "Id")?,
            name: required_text(record, "Name")?,
            title: text(record, "Title"),
            email: text(record, "Email"),
            phone: text(record, "Phone"),
            role: None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub name: String,
    pub amount: Option<Decimal>,
    pub stage: String,
    pub close_date: NaiveDate,
    pub probability: Option<f64>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub owner_name: Option<String>,
    #[serde(default)]
    pub account_name: Option<String>,
    #[serde(default)]
    pub last_activity_date: Option<NaiveDate>,
    #[serde(default)]
    pub created_date: Option<DateTime<Utc>>,
}

impl FromCrmRecord for Opportunity {
    const OBJECT: &'static str = "Opportunity";
    const FIELDS: &'static [&'static str] = &[
        "Id",
        "Name",
        "Amount",
        "StageName",
        "CloseDate",
        "Probability",
        "OwnerId",
        "Owner.Name",
        "Account.Name",
        "LastActivityDate",
        "CreatedDate",
    ];

    fn from_record(record: &CrmRecord) -> Result<Self, NormalizeError> {
        Ok(Self {
            id: required_text(record, "Id")?,
            name: required_text(record, "Name")?,
            amount: decimal(record, "Amount")?,
            stage: required_text(record, "StageName")?,
            close_date: date(record, "CloseDate")?.ok_or(NormalizeError::MissingField("CloseDate"))?,
            probability: float(record, "Probability")?,
            owner_id: text(record, "OwnerId"),
            owner_name: text(record, "Owner.Name"),
            account_name: text(record, "Account.Name"),
            last_activity_date: date(record, "LastActivityDate")?,
            created_date: timestamp(record, "CreatedDate")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportCase {
    pub id: String,
    pub case_number: String,
    pub subject: String,
    pub description: Option<String>,
    pub status: String,
    pub priority: String,
    #[serde(rename = "type")]
    pub case_type: Option<String>,
    pub created_date: DateTime<Utc>,
    pub owner_name: Option<String>,
    pub account_name: Option<String>,
    #[serde(default)]
    pub recent_comments: Vec<String>,
}

impl FromCrmRecord for SupportCase {
    const OBJECT: &'static str = "Case";
    const FIELDS: &'static [&'static str] = &[
        "Id",
        "CaseNumber",
        "Subject",
        "Description",
        "Status",
        "Priority",
        "Type",
        "CreatedDate",
        "Owner.Name",
        "Account.Name",
    ];

    fn from_record(record: &CrmRecord) -> Result<Self, NormalizeError> {
        Ok(Self {
            id: required_text(record, "Id")?,
            case_number: required_text(record, "CaseNumber")?,
            subject: text(record, "Subject").unwrap_or_default(),
            description: text(record, "Description"),
            status: required_text(record, "Status")?,
            priority: text(record, "Priority").unwrap_or_else(|| "Medium".to_string()),
            case_type: text(record, "Type"),
            created_date: timestamp(record, "CreatedDate")?
                .ok_or(NormalizeError::MissingField("CreatedDate"))?,
            owner_name: text(record, "Owner.Name"),
            account_name: text(record, "Account.Name"),
            recent_comments: Vec::new(),
        })
    }
}

/// Slim case row used for queue aging.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedCase {
    pub id: String,
    pub status: String,
    pub priority: String,
    pub created_date: DateTime<Utc>,
    pub owner_name: Option<String>,
}

impl FromCrmRecord for QueuedCase {
    const OBJECT: &'static str = "Case";
    const FIELDS: &'static [&'static str] = &["Id", "Status", "Priority", "CreatedDate", "Owner.Name"];

    fn from_record(record: &CrmRecord) -> Result<Self, NormalizeError> {
        Ok(Self {
            id: required_text(record, "Id")?,
            status: required_text(record, "Status")?,
            priority: text(record, "Priority").unwrap_or_else(|| "Medium".to_string()),
            created_date: timestamp(record, "CreatedDate")?
                .ok_or(NormalizeError::MissingField("CreatedDate"))?,
            owner_name: text(record, "Owner.Name"),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityKind {
    Task,
    Event,
}

impl ActivityKind {
    pub fn object(&self) -> &'static str {
        match self {
            Self::Task => "Task",
            Self::Event => "Event",
        }
    }

    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            Self::Task => &["Id", "Subject", "ActivityDate", "Status", "Owner.Name"],
            Self::Event => &["Id", "Subject", "ActivityDate", "Owner.Name"],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub subject: String,
    pub date: Option<NaiveDate>,
    pub status: Option<String>,
    pub owner_name: Option<String>,
}

impl Activity {
    pub fn from_record(kind: ActivityKind, record: &CrmRecord) -> Result<Self, NormalizeError> {
        Ok(Self {
            id: required_text(record, "Id")?,
            kind,
            subject: text(record, "Subject").unwrap_or_default(),
            date: date(record, "ActivityDate")?,
            status: match kind {
                ActivityKind::Task => text(record, "Status"),
                ActivityKind::Event => None,
            },
            owner_name: text(record, "Owner.Name"),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub name: String,
    pub company: String,
    pub title: Option<String>,
    pub status: String,
    pub lead_source: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub owner_name: Option<String>,
}

impl FromCrmRecord for Lead {
    const OBJECT: &'static str = "Lead";
    const FIELDS: &'static [&'static str] = &[
        "Id",
        "FirstName",
        "LastName",
        "Company",
        "Title",
        "Email",
        "Phone",
        "Status",
        "LeadSource",
        "Owner.Name",
        "CreatedDate",
    ];

    fn from_record(record: &CrmRecord) -> Result<Self, NormalizeError> {
        let name = [text(record, "FirstName"), text(record, "LastName")]
            .into_iter()
            .flatten()
            .filter(|part| !part.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(Self {
            id: required_text(record, "Id")?,
            name,
            company: text(record, "Company").unwrap_or_default(),
            title: text(record, "Title"),
            status: required_text(record, "Status")?,
            lead_source: text(record, "LeadSource"),
            email: text(record, "Email"),
            phone: text(record, "Phone"),
            owner_name: text(record, "Owner.Name"),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMember {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub profile_name: Option<String>,
}

impl FromCrmRecord for TeamMember {
    const OBJECT: &'static str = "User";
    const FIELDS: &'static [&'static str] = &["Id", "Name", "IsActive", "Profile.Name"];

    fn from_record(record: &CrmRecord) -> Result<Self, NormalizeError> {
        Ok(Self {
            id: required_text(record, "Id")?,
            name: required_text(record, "Name")?,
            is_active: boolean(record, "IsActive"),
            profile_name: text(record, "Profile.Name"),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeArticle {
    pub id: String,
    pub title: String,
    pub summary: Option<String>,
    pub url_name: Option<String>,
    pub last_published: Option<DateTime<Utc>>,
    pub article_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl FromCrmRecord for KnowledgeArticle {
    const OBJECT: &'static str = "KnowledgeArticleVersion";
    const FIELDS: &'static [&'static str] =
        &["Id", "Title", "Summary", "UrlName", "LastPublishedDate", "ArticleType"];

    fn from_record(record: &CrmRecord) -> Result<Self, NormalizeError> {
        Ok(Self {
            id: required_text(record, "Id")?,
            title: required_text(record, "Title")?,
            summary: text(record, "Summary"),
            url_name: text(record, "UrlName"),
            last_published: timestamp(record, "LastPublishedDate")?,
            article_type: text(record, "ArticleType"),
            body: text(record, "ArticleBody").map(|html| strip_html(&html)),
        })
    }
}

/// Drops tags and collapses whitespace. Entities are left as-is.
pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Matches 15- and 18-character CRM record identifiers.
pub fn is_record_id(value: &str) -> bool {
    matches!(value.len(), 15 | 18) && value.chars().all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::{
        field, is_record_id, strip_html, Account, CrmRecord, FromCrmRecord, NormalizeError,
        Opportunity, SupportCase,
    };

    fn record(value: serde_json::Value) -> CrmRecord {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn relationship_paths_resolve_nested_objects() {
        let row = record(json!({ "Owner": { "Name": "Dana Reyes" }, "Account": null }));

        assert_eq!(field(&row, "Owner.Name").and_then(|v| v.as_str()), Some("Dana Reyes"));
        assert!(field(&row, "Account.Name").is_none());
    }

    #[test]
    fn opportunity_normalizes_amount_dates_and_probability() {
        let row = record(json!({
            "Id": "006000000000001AAA",
            "Name": "Acme Renewal",
            "Amount": 250000.0,
            "StageName": "Negotiation/Review",
            "CloseDate": "2026-03-31",
            "Probability": 20,
            "Owner": { "Name": "Dana Reyes" },
            "LastActivityDate": "2026-02-10",
            "CreatedDate": "2025-11-01T09:15:00.000+0000"
        }));

        let opportunity = Opportunity::from_record(&row).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(opportunity.amount, Some(Decimal::from(250_000)));
        assert_eq!(opportunity.close_date, NaiveDate::from_ymd_opt(2026, 3, 31).unwrap_or_default());
        assert_eq!(opportunity.probability, Some(20.0));
        assert_eq!(opportunity.owner_name.as_deref(), Some("Dana Reyes"));
        assert!(opportunity.created_date.is_some());
    }

    #[test]
    fn missing_required_field_is_reported() {
        let row = record(json!({ "Id": "001000000000001AAA" }));
        assert_eq!(Account::from_record(&row), Err(NormalizeError::MissingField("Name")));
    }

    #[test]
    fn malformed_date_is_rejected() {
        let row = record(json!({
            "Id": "500000000000001AAA",
            "CaseNumber": "00001001",
            "Status": "New",
            "CreatedDate": "yesterday"
        }));

        assert!(matches!(
            SupportCase::from_record(&row),
            Err(NormalizeError::InvalidField { field: "CreatedDate", .. })
        ));
    }

    #[test]
    fn html_is_reduced_to_plain_text() {
        assert_eq!(
            strip_html("<p>Reset your <b>password</b></p>\n<ul><li>Step one</li></ul>"),
            "Reset your password Step one"
        );
    }

    #[test]
    fn record_ids_must_be_15_or_18_alphanumerics() {
        assert!(is_record_id("001000000000001"));
        assert!(is_record_id("001000000000001AAA"));
        assert!(!is_record_id("001' OR Name != '"));
        assert!(!is_record_id("0010000"));
    }
}
