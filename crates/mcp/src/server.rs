//! MCP server surface.
//!
//! One server instance serves one agent connection, so it carries that
//! connection's session. Tool failures are returned as error results carrying
//! the envelope; protocol errors are reserved for transport problems.

use std::sync::Arc;

use crmgate_core::{SessionContext, ToolResponse};
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler};

use crate::params::*;
use crate::service::CrmToolService;

#[derive(Clone)]
pub struct CrmMcpServer {
    service: Arc<CrmToolService>,
    session: SessionContext,
    tool_router: ToolRouter<Self>,
}

impl CrmMcpServer {
    pub fn new(service: Arc<CrmToolService>, session: SessionContext) -> Self {
        Self { service, session, tool_router: Self::tool_router() }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }
}

fn into_result(response: ToolResponse) -> Result<CallToolResult, McpError> {
    let body = vec![Content::text(response.to_json().to_string())];
    if response.is_success() {
        Ok(CallToolResult::success(body))
    } else {
        Ok(CallToolResult::error(body))
    }
}

#[tool_handler]
impl ServerHandler for CrmMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "CRM tools for sales and support work. Read tools return bounded results with has_more. \
                 Write tools (create_case, update_case, create_task, update_lead_status) first return a \
                 preview; repeat the call with confirmed=true only after the user approves it. When a \
                 lookup returns several matches, ask the user which one they mean."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            ..Default::default()
        }
    }
}

// ============================================================================
// Tools
// ============================================================================

#[tool_router]
impl CrmMcpServer {
    #[tool(description = "Look up one account by ID or by name. A name matching several accounts returns candidates instead of guessing.")]
    pub async fn get_account(
        &self,
        Parameters(params): Parameters<GetAccountParams>,
    ) -> Result<CallToolResult, McpError> {
        into_result(self.service.get_account(&self.session, params).await)
    }

    #[tool(description = "Search accounts by name, optionally filtered by industry or owner.")]
    pub async fn search_accounts(
        &self,
        Parameters(params): Parameters<SearchAccountsParams>,
    ) -> Result<CallToolResult, McpError> {
        into_result(self.service.search_accounts(&self.session, params).await)
    }

    #[tool(description = "List an account's contacts with the role each plays on open deals.")]
    pub async fn get_contacts_for_account(
        &self,
        Parameters(params): Parameters<GetContactsForAccountParams>,
    ) -> Result<CallToolResult, McpError> {
        into_result(self.service.get_contacts_for_account(&self.session, params).await)
    }

    #[tool(description = "List opportunities with risk flags. Open deals only unless include_closed is set.")]
    pub async fn get_opportunities(
        &self,
        Parameters(params): Parameters<GetOpportunitiesParams>,
    ) -> Result<CallToolResult, McpError> {
        into_result(self.service.get_opportunities(&self.session, params).await)
    }

    #[tool(description = "Summarize the open pipeline by stage with at-risk deals, for one rep or a manager's team.")]
    pub async fn get_pipeline_summary(
        &self,
        Parameters(params): Parameters<GetPipelineSummaryParams>,
    ) -> Result<CallToolResult, McpError> {
        into_result(self.service.get_pipeline_summary(&self.session, params).await)
    }

    #[tool(description = "Find open deals that need follow-up: overdue, inactive, or closing soon.")]
    pub async fn get_deal_activity_gaps(
        &self,
        Parameters(params): Parameters<GetDealActivityGapsParams>,
    ) -> Result<CallToolResult, McpError> {
        into_result(self.service.get_deal_activity_gaps(&self.session, params).await)
    }

    #[tool(description = "Get a support case by ID or case number, with its latest comments.")]
    pub async fn get_case(&self, Parameters(params): Parameters<GetCaseParams>) -> Result<CallToolResult, McpError> {
        into_result(self.service.get_case(&self.session, params).await)
    }

    #[tool(description = "Create a support case. Returns a preview unless confirmed is true.")]
    pub async fn create_case(
        &self,
        Parameters(params): Parameters<CreateCaseParams>,
    ) -> Result<CallToolResult, McpError> {
        into_result(self.service.create_case(&self.session, params).await)
    }

    #[tool(description = "Change a case's priority, status, or type, or add a comment. Returns a preview unless confirmed is true.")]
    pub async fn update_case(
        &self,
        Parameters(params): Parameters<UpdateCaseParams>,
    ) -> Result<CallToolResult, McpError> {
        into_result(self.service.update_case(&self.session, params).await)
    }

    #[tool(description = "Summarize open cases by status, priority, and age, with SLA compliance.")]
    pub async fn get_case_queue_summary(
        &self,
        Parameters(params): Parameters<GetCaseQueueSummaryParams>,
    ) -> Result<CallToolResult, McpError> {
        into_result(self.service.get_case_queue_summary(&self.session, params).await)
    }

    #[tool(description = "List recent tasks and events for an account, contact, or opportunity.")]
    pub async fn get_recent_activities(
        &self,
        Parameters(params): Parameters<GetRecentActivitiesParams>,
    ) -> Result<CallToolResult, McpError> {
        into_result(self.service.get_recent_activities(&self.session, params).await)
    }

    #[tool(description = "Create a follow-up task. Returns a preview unless confirmed is true.")]
    pub async fn create_task(
        &self,
        Parameters(params): Parameters<CreateTaskParams>,
    ) -> Result<CallToolResult, McpError> {
        into_result(self.service.create_task(&self.session, params).await)
    }

    #[tool(description = "List unconverted leads, newest first.")]
    pub async fn get_leads(&self, Parameters(params): Parameters<GetLeadsParams>) -> Result<CallToolResult, McpError> {
        into_result(self.service.get_leads(&self.session, params).await)
    }

    #[tool(description = "Change a lead's status. Returns a preview unless confirmed is true.")]
    pub async fn update_lead_status(
        &self,
        Parameters(params): Parameters<UpdateLeadStatusParams>,
    ) -> Result<CallToolResult, McpError> {
        into_result(self.service.update_lead_status(&self.session, params).await)
    }

    #[tool(description = "List a manager's active direct reports.")]
    pub async fn get_team_members(
        &self,
        Parameters(params): Parameters<GetTeamMembersParams>,
    ) -> Result<CallToolResult, McpError> {
        into_result(self.service.get_team_members(&self.session, params).await)
    }

    #[tool(description = "Search published knowledge articles.")]
    pub async fn search_articles(
        &self,
        Parameters(params): Parameters<SearchArticlesParams>,
    ) -> Result<CallToolResult, McpError> {
        into_result(self.service.search_articles(&self.session, params).await)
    }

    #[tool(description = "Get the full text of a published knowledge article.")]
    pub async fn get_article(
        &self,
        Parameters(params): Parameters<GetArticleParams>,
    ) -> Result<CallToolResult, McpError> {
        into_result(self.service.get_article(&self.session, params).await)
    }
}
