use std::collections::HashMap;

use crmgate_core::domain::records::{text, Account, Contact, FromCrmRecord};
use crmgate_core::{
    CallScope, DisambiguationCandidate, Filter, OrderBy, QuerySpec, Resolution, SessionContext, ToolError,
    ToolResponse,
};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{is_skippable, payload, CrmToolService};
use crate::params::{GetAccountParams, GetContactsForAccountParams, SearchAccountsParams};
use crate::validation::{optional_record_id, optional_text, record_id, required_text};

#[derive(Debug, Serialize)]
struct AccountLookup {
    account: Option<Account>,
    match_count: usize,
    matches: Vec<DisambiguationCandidate>,
    more_matches: bool,
}

impl AccountLookup {
    fn single(account: Account) -> Self {
        Self { account: Some(account), match_count: 1, matches: Vec::new(), more_matches: false }
    }
}

#[derive(Debug, Serialize)]
struct AccountList {
    accounts: Vec<Account>,
    total_count: usize,
    has_more: bool,
}

#[derive(Debug, Serialize)]
struct ContactList {
    contacts: Vec<Contact>,
    total_count: usize,
    has_more: bool,
}

impl CrmToolService {
    pub async fn get_account(&self, session: &SessionContext, params: GetAccountParams) -> ToolResponse {
        let run = self.begin("get_account", session);
        let outcome = self.lookup_account(&run.scope, params).await;
        run.finish(outcome)
    }

    async fn lookup_account(&self, scope: &CallScope<'_>, params: GetAccountParams) -> Result<Value, ToolError> {
        if let Some(account_id) = optional_record_id("account_id", params.account_id.as_deref())? {
            let spec = QuerySpec::new(Account::OBJECT, Account::FIELDS)
                .filter(Some(Filter::eq("Id", account_id)))
                .limit(1);
            let result = self.executor.fetch::<Account>(scope, spec).await?;
            let Some(account) = result.records.into_iter().next() else {
                return Err(ToolError::not_found(format!("Account with ID '{account_id}' not found.")));
            };
            return payload(&AccountLookup::single(account));
        }

        let Some(name) = optional_text(params.account_name.as_deref()) else {
            return Err(ToolError::invalid_input("Either account_id or account_name is required."));
        };
        let spec = QuerySpec::new(Account::OBJECT, Account::FIELDS)
            .filter(Some(Filter::contains("Name", name)))
            .order_by(OrderBy::asc("Name"))
            .limit(self.resolver.preview_cap());
        let matches = self.executor.fetch::<Account>(scope, spec).await?;

        // Never pick one of several matches; the caller re-asks with an ID.
        let lookup = match self.resolver.resolve(name, matches) {
            Resolution::Single(account) => AccountLookup::single(account),
            Resolution::Ambiguous { candidates, match_count, more_matches } => {
                AccountLookup { account: None, match_count, matches: candidates, more_matches }
            }
            Resolution::NotFound { term } => {
                return Err(ToolError::not_found(format!("No account found matching '{term}'."))
                    .with_detail("search_term", term))
            }
        };
        payload(&lookup)
    }

    pub async fn search_accounts(&self, session: &SessionContext, params: SearchAccountsParams) -> ToolResponse {
        let run = self.begin("search_accounts", session);
        let outcome = self.find_accounts(&run.scope, params).await;
        run.finish(outcome)
    }

    async fn find_accounts(&self, scope: &CallScope<'_>, params: SearchAccountsParams) -> Result<Value, ToolError> {
        let query = required_text("query", &params.query)?;
        let owner_id = optional_record_id("owner_id", params.owner_id.as_deref())?;

        let mut predicates = vec![Filter::contains("Name", query)];
        if let Some(industry) = optional_text(params.industry.as_deref()) {
            predicates.push(Filter::eq("Industry", industry));
        }
        if let Some(owner_id) = owner_id {
            predicates.push(Filter::eq("OwnerId", owner_id));
        }
        let spec = QuerySpec::new(Account::OBJECT, Account::FIELDS)
            .filter(Filter::all(predicates))
            .order_by(OrderBy::asc("Name"))
            .limit(self.list_limit(params.limit));
        let result = self.executor.fetch::<Account>(scope, spec).await?;

        payload(&AccountList { total_count: result.total_count, has_more: result.has_more, accounts: result.records })
    }

    pub async fn get_contacts_for_account(
        &self,
        session: &SessionContext,
        params: GetContactsForAccountParams,
    ) -> ToolResponse {
        let run = self.begin("get_contacts_for_account", session);
        let outcome = self.account_contacts(&run.scope, params).await;
        run.finish(outcome)
    }

    async fn account_contacts(
        &self,
        scope: &CallScope<'_>,
        params: GetContactsForAccountParams,
    ) -> Result<Value, ToolError> {
        let account_id = record_id("account_id", &params.account_id)?;
        let spec = QuerySpec::new(Contact::OBJECT, Contact::FIELDS)
            .filter(Some(Filter::eq("AccountId", account_id)))
            .order_by(OrderBy::asc("Name"))
            .limit(self.list_limit(params.limit));
        let mut result = self.executor.fetch::<Contact>(scope, spec).await?;

        if !result.records.is_empty() {
            let roles = self.open_deal_roles(scope, &result.records).await?;
            for contact in &mut result.records {
                contact.role = roles.get(&contact.id).cloned();
            }
        }

        payload(&ContactList { total_count: result.total_count, has_more: result.has_more, contacts: result.records })
    }

    /// First role each contact holds on an open opportunity. A failed lookup
    /// leaves every role empty.
    async fn open_deal_roles(
        &self,
        scope: &CallScope<'_>,
        contacts: &[Contact],
    ) -> Result<HashMap<String, String>, ToolError> {
        let contact_ids: Vec<String> = contacts.iter().map(|contact| contact.id.clone()).collect();
        let spec = QuerySpec::new("OpportunityContactRole", &["ContactId", "Role"])
            .filter(Filter::all(vec![
                Filter::is_in("ContactId", contact_ids),
                Filter::eq("Opportunity.IsClosed", false),
            ]))
            .limit(self.executor.max_rows());

        let rows = match self.executor.fetch_raw(scope, spec).await {
            Ok(result) => result.records,
            Err(error) if is_skippable(&error) => {
                debug!(event_name = "tool.contact_roles_skipped", error = %error, "contact roles unavailable");
                return Ok(HashMap::new());
            }
            Err(error) => return Err(error.into()),
        };

        let mut roles = HashMap::new();
        for row in &rows {
            if let (Some(contact_id), Some(role)) = (text(row, "ContactId"), text(row, "Role")) {
                roles.entry(contact_id).or_insert(role);
            }
        }
        Ok(roles)
    }
}
