use serde::Serialize;

use crate::domain::records::Account;
use crate::query::QueryResult;

/// Enough about a match for a person to tell it apart from its siblings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DisambiguationCandidate {
    pub id: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_type: Option<String>,
}

pub trait Disambiguate {
    fn candidate(&self) -> DisambiguationCandidate;
}

impl Disambiguate for Account {
    fn candidate(&self) -> DisambiguationCandidate {
        let location = match (&self.billing_city, &self.billing_state) {
            (Some(city), Some(state)) => Some(format!("{city}, {state}")),
            (Some(place), None) | (None, Some(place)) => Some(place.clone()),
            (None, None) => None,
        };
        DisambiguationCandidate {
            id: self.id.clone(),
            label: self.name.clone(),
            owner: self.owner_name.clone(),
            location,
            record_type: self.account_type.clone(),
        }
    }
}

/// Outcome of a name lookup. An ambiguous lookup carries no selected record.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution<T> {
    NotFound { term: String },
    Single(T),
    Ambiguous {
        candidates: Vec<DisambiguationCandidate>,
        match_count: usize,
        /// Further matches exist beyond the preview.
        more_matches: bool,
    },
}

/// Turns raw matches into one record, a candidate list, or a miss.
#[derive(Clone, Debug)]
pub struct DisambiguationResolver {
    preview_cap: u32,
}

impl Default for DisambiguationResolver {
    fn default() -> Self {
        Self::new(5)
    }
}

impl DisambiguationResolver {
    pub fn new(preview_cap: u32) -> Self {
        Self { preview_cap: preview_cap.max(2) }
    }

    pub fn preview_cap(&self) -> u32 {
        self.preview_cap
    }

    pub fn resolve<T: Disambiguate>(&self, term: &str, matches: QueryResult<T>) -> Resolution<T> {
        let QueryResult { mut records, has_more, .. } = matches;
        match records.len() {
            0 => Resolution::NotFound { term: term.to_string() },
            1 if !has_more => Resolution::Single(records.remove(0)),
            count => {
                let cap = self.preview_cap as usize;
                let candidates: Vec<_> = records.iter().take(cap).map(Disambiguate::candidate).collect();
                Resolution::Ambiguous {
                    match_count: count.min(cap),
                    more_matches: has_more || count > cap,
                    candidates,
                }
            }
        }
    }
}
