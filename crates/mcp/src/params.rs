//! Tool input schemas.
//!
//! Limits are optional so the configured defaults apply when an agent leaves
//! them out. Write tools carry `confirmed`; without it they only preview.

use rmcp::schemars;
use serde::Deserialize;

// ============================================================================
// Accounts
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize, schemars::JsonSchema)]
pub struct GetAccountParams {
    #[schemars(description = "Account record ID (15 or 18 characters). Takes precedence over account_name.")]
    #[serde(default)]
    pub account_id: Option<String>,

    #[schemars(description = "Account name or part of it. Several matches return candidates to choose from.")]
    #[serde(default)]
    pub account_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
pub struct SearchAccountsParams {
    #[schemars(description = "Text to match against account names")]
    pub query: String,

    #[schemars(description = "Only accounts in this industry")]
    #[serde(default)]
    pub industry: Option<String>,

    #[schemars(description = "Only accounts owned by this user ID")]
    #[serde(default)]
    pub owner_id: Option<String>,

    #[schemars(description = "Maximum results (1-50, default 25)")]
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
pub struct GetContactsForAccountParams {
    #[schemars(description = "Account record ID")]
    pub account_id: String,

    #[schemars(description = "Maximum results (1-50, default 25)")]
    #[serde(default)]
    pub limit: Option<u32>,
}

// ============================================================================
// Pipeline
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize, schemars::JsonSchema)]
pub struct GetOpportunitiesParams {
    #[schemars(description = "Only deals owned by this user ID")]
    #[serde(default)]
    pub owner_id: Option<String>,

    #[schemars(description = "Only deals on this account ID")]
    #[serde(default)]
    pub account_id: Option<String>,

    #[schemars(description = "Only deals in this stage")]
    #[serde(default)]
    pub stage: Option<String>,

    #[schemars(description = "Close date range start (YYYY-MM-DD)")]
    #[serde(default)]
    pub close_date_from: Option<String>,

    #[schemars(description = "Close date range end (YYYY-MM-DD)")]
    #[serde(default)]
    pub close_date_to: Option<String>,

    #[schemars(description = "Include closed deals")]
    #[serde(default)]
    pub include_closed: bool,

    #[schemars(description = "Maximum results (1-50, default 25)")]
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, schemars::JsonSchema)]
pub struct GetPipelineSummaryParams {
    #[schemars(description = "Scope to one rep's pipeline")]
    #[serde(default)]
    pub owner_id: Option<String>,

    #[schemars(description = "Scope to this manager's active direct reports and break the totals down per owner")]
    #[serde(default)]
    pub manager_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, schemars::JsonSchema)]
pub struct GetDealActivityGapsParams {
    #[schemars(description = "Only deals owned by this user ID")]
    #[serde(default)]
    pub owner_id: Option<String>,

    #[schemars(description = "Days without activity before a deal counts as inactive (default from risk thresholds)")]
    #[serde(default, alias = "inactivity_threshold_days")]
    pub days_threshold: Option<u32>,

    #[schemars(description = "Maximum results (1-50, default 20)")]
    #[serde(default)]
    pub limit: Option<u32>,
}

// ============================================================================
// Support
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize, schemars::JsonSchema)]
pub struct GetCaseParams {
    #[schemars(description = "Case record ID")]
    #[serde(default)]
    pub case_id: Option<String>,

    #[schemars(description = "Case number, e.g. 00001042")]
    #[serde(default)]
    pub case_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
pub struct CreateCaseParams {
    #[schemars(description = "Case subject")]
    pub subject: String,

    #[schemars(description = "Longer description of the issue")]
    #[serde(default)]
    pub description: Option<String>,

    #[schemars(description = "High, Medium, or Low")]
    #[serde(default = "default_case_priority")]
    pub priority: String,

    #[schemars(description = "Case type, e.g. Problem or Question")]
    #[serde(default)]
    pub case_type: Option<String>,

    #[schemars(description = "Related account ID")]
    #[serde(default)]
    pub account_id: Option<String>,

    #[schemars(description = "Related contact ID")]
    #[serde(default)]
    pub contact_id: Option<String>,

    #[schemars(description = "Set to true only after the user approved the preview")]
    #[serde(default)]
    pub confirmed: bool,
}

#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
pub struct UpdateCaseParams {
    #[schemars(description = "Case record ID")]
    pub case_id: String,

    #[schemars(description = "New priority")]
    #[serde(default)]
    pub priority: Option<String>,

    #[schemars(description = "New status")]
    #[serde(default)]
    pub status: Option<String>,

    #[schemars(description = "New case type")]
    #[serde(default)]
    pub case_type: Option<String>,

    #[schemars(description = "Comment to add to the case")]
    #[serde(default)]
    pub comment: Option<String>,

    #[schemars(description = "Set to true only after the user approved the preview")]
    #[serde(default)]
    pub confirmed: bool,
}

#[derive(Debug, Clone, Default, Deserialize, schemars::JsonSchema)]
pub struct GetCaseQueueSummaryParams {
    #[schemars(description = "Only cases owned by this user ID")]
    #[serde(default)]
    pub owner_id: Option<String>,

    #[schemars(description = "Only cases owned by this queue, e.g. 'Tier 1 Support'")]
    #[serde(default)]
    pub queue_name: Option<String>,
}

// ============================================================================
// Activity
// ============================================================================

#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
pub struct GetRecentActivitiesParams {
    #[schemars(description = "Account, contact, or opportunity ID")]
    pub related_to_id: String,

    #[schemars(description = "Look back this many days (1-90, default 30)")]
    #[serde(default)]
    pub days: Option<u32>,

    #[schemars(description = "Maximum results (1-50, default 25)")]
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
pub struct CreateTaskParams {
    #[schemars(description = "Task subject")]
    pub subject: String,

    #[schemars(description = "Task details")]
    #[serde(default)]
    pub description: Option<String>,

    #[schemars(description = "Due date (YYYY-MM-DD)")]
    #[serde(default)]
    pub due_date: Option<String>,

    #[schemars(description = "Account, opportunity, or case the task relates to")]
    #[serde(default)]
    pub related_to_id: Option<String>,

    #[schemars(description = "Contact or lead the task is about")]
    #[serde(default)]
    pub who_id: Option<String>,

    #[schemars(description = "High, Normal, or Low")]
    #[serde(default = "default_task_priority")]
    pub priority: String,

    #[schemars(description = "Set to true only after the user approved the preview")]
    #[serde(default)]
    pub confirmed: bool,
}

// ============================================================================
// Leads
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize, schemars::JsonSchema)]
pub struct GetLeadsParams {
    #[schemars(description = "Only leads owned by this user ID")]
    #[serde(default)]
    pub owner_id: Option<String>,

    #[schemars(description = "Only leads with this status")]
    #[serde(default)]
    pub status: Option<String>,

    #[schemars(description = "Only leads from this source")]
    #[serde(default)]
    pub lead_source: Option<String>,

    #[schemars(description = "Maximum results (1-50, default 25)")]
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
pub struct UpdateLeadStatusParams {
    #[schemars(description = "Lead record ID")]
    pub lead_id: String,

    #[schemars(description = "New lead status")]
    pub status: String,

    #[schemars(description = "Set to true only after the user approved the preview")]
    #[serde(default)]
    pub confirmed: bool,
}

// ============================================================================
// Team
// ============================================================================

#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
pub struct GetTeamMembersParams {
    #[schemars(description = "Manager user ID")]
    pub manager_id: String,
}

// ============================================================================
// Knowledge
// ============================================================================

#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
pub struct SearchArticlesParams {
    #[schemars(description = "Search keywords")]
    pub query: String,

    #[schemars(description = "Maximum results (1-25, default 10)")]
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
pub struct GetArticleParams {
    #[schemars(description = "Knowledge article version ID")]
    pub article_id: String,
}

fn default_case_priority() -> String {
    "Medium".to_string()
}

fn default_task_priority() -> String {
    "Normal".to_string()
}
