//! Tool catalogue
//!
//! The tools are grouped by the CRM area they touch:
//! - Accounts: account lookup, search, and contacts
//! - Pipeline: opportunities, pipeline rollups, and activity gaps
//! - Support: cases and the case queue
//! - Activity: recent activity and task creation
//! - Leads, Team, Knowledge

/// Accounts tools category
pub struct AccountTools;

/// Pipeline tools category
pub struct PipelineTools;

/// Support tools category
pub struct SupportTools;

/// Activity tools category
pub struct ActivityTools;

/// Lead tools category
pub struct LeadTools;

/// Team tools category
pub struct TeamTools;

/// Knowledge tools category
pub struct KnowledgeTools;

/// Tool category trait
pub trait ToolCategory {
    /// Category name
    fn category_name() -> &'static str
    where
        Self: Sized;
    /// List of tool names in this category
    fn tool_names() -> &'static [&'static str]
    where
        Self: Sized;
}

impl ToolCategory for AccountTools {
    fn category_name() -> &'static str {
        "accounts"
    }
    fn tool_names() -> &'static [&'static str] {
        &["get_account", "search_accounts", "get_contacts_for_account"]
    }
}

impl ToolCategory for PipelineTools {
    fn category_name() -> &'static str {
        "pipeline"
    }
    fn tool_names() -> &'static [&'static str] {
        &["get_opportunities", "get_pipeline_summary", "get_deal_activity_gaps"]
    }
}

impl ToolCategory for SupportTools {
    fn category_name() -> &'static str {
        "support"
    }
    fn tool_names() -> &'static [&'static str] {
        &["get_case", "create_case", "update_case", "get_case_queue_summary"]
    }
}

impl ToolCategory for ActivityTools {
    fn category_name() -> &'static str {
        "activity"
    }
    fn tool_names() -> &'static [&'static str] {
        &["get_recent_activities", "create_task"]
    }
}

impl ToolCategory for LeadTools {
    fn category_name() -> &'static str {
        "leads"
    }
    fn tool_names() -> &'static [&'static str] {
        &["get_leads", "update_lead_status"]
    }
}

impl ToolCategory for TeamTools {
    fn category_name() -> &'static str {
        "team"
    }
    fn tool_names() -> &'static [&'static str] {
        &["get_team_members"]
    }
}

impl ToolCategory for KnowledgeTools {
    fn category_name() -> &'static str {
        "knowledge"
    }
    fn tool_names() -> &'static [&'static str] {
        &["search_articles", "get_article"]
    }
}

/// All tool names
pub const ALL_TOOL_NAMES: &[&str] = &[
    "get_account",
    "search_accounts",
    "get_contacts_for_account",
    "get_opportunities",
    "get_pipeline_summary",
    "get_deal_activity_gaps",
    "get_case",
    "create_case",
    "update_case",
    "get_case_queue_summary",
    "get_recent_activities",
    "create_task",
    "get_leads",
    "update_lead_status",
    "get_team_members",
    "search_articles",
    "get_article",
];

/// Tools that mutate CRM data and therefore take a `confirmed` flag.
pub const WRITE_TOOL_NAMES: &[&str] = &["create_case", "update_case", "create_task", "update_lead_status"];

/// Total number of tools
pub const TOTAL_TOOLS: usize = ALL_TOOL_NAMES.len();

pub fn is_known_tool(name: &str) -> bool {
    ALL_TOOL_NAMES.contains(&name)
}

pub fn is_write_tool(name: &str) -> bool {
    WRITE_TOOL_NAMES.contains(&name)
}
