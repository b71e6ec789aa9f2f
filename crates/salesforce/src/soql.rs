//! Rendering of typed query specs into SOQL and SOSL text.
//!
//! Field and object names are validated upstream by the query executor. Every
//! value is escaped here, so caller-supplied text never reaches the CRM as
//! query syntax.

use chrono::SecondsFormat;
use crmgate_core::gateway::{CompareOp, Filter, FilterValue, OrderBy, QuerySpec, SearchRequest, SortDirection};

pub fn render_query(spec: &QuerySpec) -> String {
    let mut soql = format!("SELECT {} FROM {}", spec.fields.join(", "), spec.object);
    append_clauses(&mut soql, spec.filter.as_ref(), &spec.order_by, spec.limit);
    soql
}

/// `FIND {term} IN ALL FIELDS RETURNING Object(fields WHERE .. ORDER BY .. LIMIT n)`.
pub fn render_search(request: &SearchRequest) -> String {
    let mut returning = request.fields.join(", ");
    append_clauses(&mut returning, request.filter.as_ref(), &request.order_by, request.limit);
    format!(
        "FIND {{{}}} IN ALL FIELDS RETURNING {}({})",
        escape_search_term(&request.term),
        request.object,
        returning
    )
}

fn append_clauses(target: &mut String, filter: Option<&Filter>, order_by: &[OrderBy], limit: u32) {
    if let Some(filter) = filter {
        target.push_str(" WHERE ");
        target.push_str(&render_filter(filter));
    }
    if !order_by.is_empty() {
        let order: Vec<String> = order_by
            .iter()
            .map(|order| {
                let direction = match order.direction {
                    SortDirection::Asc => "ASC",
                    SortDirection::Desc => "DESC",
                };
                format!("{} {direction}", order.field)
            })
            .collect();
        target.push_str(" ORDER BY ");
        target.push_str(&order.join(", "));
    }
    target.push_str(&format!(" LIMIT {limit}"));
}

pub fn render_filter(filter: &Filter) -> String {
    match filter {
        Filter::Compare { field, op, value } => {
            format!("{field} {} {}", operator(*op), render_value(value))
        }
        Filter::Contains { field, term } => {
            format!("{field} LIKE '%{}%'", escape_like(term))
        }
        Filter::In { field, values } => {
            let quoted: Vec<String> = values.iter().map(|value| quote(value)).collect();
            format!("{field} IN ({})", quoted.join(", "))
        }
        Filter::And(filters) => join(filters, " AND "),
        Filter::Or(filters) => join(filters, " OR "),
    }
}

fn join(filters: &[Filter], separator: &str) -> String {
    let parts: Vec<String> = filters
        .iter()
        .map(|filter| match filter {
            Filter::And(_) | Filter::Or(_) => format!("({})", render_filter(filter)),
            _ => render_filter(filter),
        })
        .collect();
    parts.join(separator)
}

fn operator(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "=",
        CompareOp::Ne => "!=",
        CompareOp::Lt => "<",
        CompareOp::Lte => "<=",
        CompareOp::Gt => ">",
        CompareOp::Gte => ">=",
    }
}

fn render_value(value: &FilterValue) -> String {
    match value {
        FilterValue::Text(text) => quote(text),
        FilterValue::Bool(flag) => flag.to_string(),
        // Date and datetime literals are unquoted in SOQL.
        FilterValue::Date(date) => date.format("%Y-%m-%d").to_string(),
        FilterValue::Timestamp(at) => at.to_rfc3339_opts(SecondsFormat::Secs, true),
        FilterValue::Integer(number) => number.to_string(),
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", escape_literal(value))
}

/// Backslash first, so escapes added for quotes are not doubled.
pub fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn escape_like(value: &str) -> String {
    escape_literal(value).replace('%', "\\%").replace('_', "\\_")
}

const SOSL_RESERVED: &[char] =
    &['?', '&', '|', '!', '{', '}', '[', ']', '(', ')', '^', '~', '*', ':', '\\', '"', '\'', '+', '-'];

pub fn escape_search_term(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.trim().chars() {
        if SOSL_RESERVED.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};
    use crmgate_core::gateway::{CompareOp, Filter, OrderBy, QuerySpec, SearchRequest};

    use super::{escape_literal, escape_search_term, render_filter, render_query, render_search};

    #[test]
    fn query_renders_every_clause_in_order() {
        let spec = QuerySpec::new("Opportunity", &["Id", "Name", "Amount"])
            .filter(Filter::all(vec![
                Filter::eq("IsClosed", false),
                Filter::eq("OwnerId", "005000000000001AAA"),
                Filter::compare(
                    "CloseDate",
                    CompareOp::Gte,
                    NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
                ),
            ]))
            .order_by(OrderBy::asc("CloseDate"))
            .order_by(OrderBy::desc("Amount"))
            .limit(21);

        assert_eq!(
            render_query(&spec),
            "SELECT Id, Name, Amount FROM Opportunity \
             WHERE IsClosed = false AND OwnerId = '005000000000001AAA' AND CloseDate >= 2026-03-01 \
             ORDER BY CloseDate ASC, Amount DESC LIMIT 21"
        );
    }

    #[test]
    fn literals_cannot_break_out_of_quotes() {
        let rendered = render_filter(&Filter::eq("Name", "O'Brien\\' OR Name != '"));
        assert_eq!(rendered, "Name = 'O\\'Brien\\\\\\' OR Name != \\''");
        assert_eq!(escape_literal("a\\'b"), "a\\\\\\'b");
    }

    #[test]
    fn contains_escapes_like_wildcards() {
        assert_eq!(render_filter(&Filter::contains("Name", "50%_off")), "Name LIKE '%50\\%\\_off%'");
    }

    #[test]
    fn nested_compounds_are_parenthesized() {
        let filter = Filter::And(vec![
            Filter::eq("IsConverted", false),
            Filter::Or(vec![Filter::eq("Status", "Open"), Filter::eq("Status", "Working")]),
        ]);
        assert_eq!(render_filter(&filter), "IsConverted = false AND (Status = 'Open' OR Status = 'Working')");
    }

    #[test]
    fn in_list_and_timestamps_render() {
        let filter = Filter::And(vec![
            Filter::is_in("ManagerId", vec!["005A".to_string(), "005B".to_string()]),
            Filter::compare(
                "ActivityDate",
                CompareOp::Gte,
                Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap(),
            ),
        ]);
        assert_eq!(
            render_filter(&filter),
            "ManagerId IN ('005A', '005B') AND ActivityDate >= 2026-02-01T00:00:00Z"
        );
    }

    #[test]
    fn search_wraps_term_and_scopes_returning_clause() {
        let mut request = SearchRequest::new("reset password?", "KnowledgeArticleVersion", &["Id", "Title"]);
        request.filter = Filter::all(vec![Filter::eq("PublishStatus", "Online"), Filter::eq("IsLatestVersion", true)]);
        request.order_by.push(OrderBy::desc("LastPublishedDate"));
        request.limit = 10;

        assert_eq!(
            render_search(&request),
            "FIND {reset password\\?} IN ALL FIELDS RETURNING KnowledgeArticleVersion(Id, Title \
             WHERE PublishStatus = 'Online' AND IsLatestVersion = true \
             ORDER BY LastPublishedDate DESC LIMIT 10)"
        );
    }

    #[test]
    fn search_term_reserved_characters_are_escaped() {
        assert_eq!(escape_search_term(" {Acme} & Co-op "), "\\{Acme\\} \\& Co\\-op");
    }
}
