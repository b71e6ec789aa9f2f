//! Name-based tool invocation over raw JSON arguments.
//!
//! The MCP router uses typed parameters directly; this entry point serves
//! callers that hold a tool name and an argument object, such as replayed
//! agent transcripts.

use crmgate_core::{SessionContext, ToolError, ToolResponse};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::service::CrmToolService;
use crate::tools::{is_known_tool, is_write_tool};

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallRequest {
    pub tool: String,
    #[serde(default)]
    pub params: Value,
    /// Confirmation carried outside the argument object. Only write tools read it.
    #[serde(default)]
    pub confirmed: Option<bool>,
}

impl ToolCallRequest {
    pub fn new(tool: impl Into<String>, params: Value) -> Self {
        Self { tool: tool.into(), params, confirmed: None }
    }

    pub fn confirmed(mut self, confirmed: bool) -> Self {
        self.confirmed = Some(confirmed);
        self
    }
}

pub async fn dispatch(service: &CrmToolService, session: &SessionContext, request: ToolCallRequest) -> ToolResponse {
    match route(service, session, request).await {
        Ok(response) => response,
        Err(error) => ToolResponse::failure(error),
    }
}

async fn route(
    service: &CrmToolService,
    session: &SessionContext,
    request: ToolCallRequest,
) -> Result<ToolResponse, ToolError> {
    let tool = request.tool.trim();
    if !is_known_tool(tool) {
        return Err(ToolError::invalid_input(format!("Unknown tool '{tool}'.")).with_detail("tool", tool));
    }
    let params = arguments(tool, request.params, request.confirmed)?;

    let response = match tool {
        "get_account" => service.get_account(session, parse(tool, params)?).await,
        "search_accounts" => service.search_accounts(session, parse(tool, params)?).await,
        "get_contacts_for_account" => service.get_contacts_for_account(session, parse(tool, params)?).await,
        "get_opportunities" => service.get_opportunities(session, parse(tool, params)?).await,
        "get_pipeline_summary" => service.get_pipeline_summary(session, parse(tool, params)?).await,
        "get_deal_activity_gaps" => service.get_deal_activity_gaps(session, parse(tool, params)?).await,
        "get_case" => service.get_case(session, parse(tool, params)?).await,
        "create_case" => service.create_case(session, parse(tool, params)?).await,
        "update_case" => service.update_case(session, parse(tool, params)?).await,
        "get_case_queue_summary" => service.get_case_queue_summary(session, parse(tool, params)?).await,
        "get_recent_activities" => service.get_recent_activities(session, parse(tool, params)?).await,
        "create_task" => service.create_task(session, parse(tool, params)?).await,
        "get_leads" => service.get_leads(session, parse(tool, params)?).await,
        "update_lead_status" => service.update_lead_status(session, parse(tool, params)?).await,
        "get_team_members" => service.get_team_members(session, parse(tool, params)?).await,
        "search_articles" => service.search_articles(session, parse(tool, params)?).await,
        "get_article" => service.get_article(session, parse(tool, params)?).await,
        _ => return Err(ToolError::invalid_input(format!("Unknown tool '{tool}'."))),
    };
    Ok(response)
}

fn arguments(tool: &str, params: Value, confirmed: Option<bool>) -> Result<Value, ToolError> {
    let mut object = match params {
        Value::Null => Map::new(),
        Value::Object(object) => object,
        _ => return Err(ToolError::invalid_input(format!("Arguments for '{tool}' must be a JSON object."))),
    };
    if let Some(confirmed) = confirmed.filter(|_| is_write_tool(tool)) {
        object.insert("confirmed".to_string(), Value::Bool(confirmed));
    }
    Ok(Value::Object(object))
}

fn parse<T: DeserializeOwned>(tool: &str, params: Value) -> Result<T, ToolError> {
    serde_json::from_value(params).map_err(|error| {
        ToolError::invalid_input(format!("Invalid arguments for '{tool}': {error}")).with_detail("tool", tool)
    })
}
