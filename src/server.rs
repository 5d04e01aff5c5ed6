use anyhow::{bail, Context, Result};
use chrono::Utc;
use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    handler::server::{
        router::{prompt::PromptRouter, tool::ToolRouter},
        wrapper::Parameters,
    },
    model::{
        AnnotateAble, GetPromptRequestParams, GetPromptResult, Implementation,
        ListPromptsResult, ListResourceTemplatesResult, PaginatedRequestParams, PromptMessage,
        PromptMessageRole, ProtocolVersion, RawResourceTemplate, ReadResourceRequestParams,
        ReadResourceResult, ResourceContents, ResourceTemplate, ServerCapabilities, ServerInfo,
    },
    prompt, prompt_handler, prompt_router,
    service::RequestContext,
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::devops::{self, WorkItem, MAX_BATCH_SIZE};
use crate::http::{self, Credentials, HttpRequest, HttpResponse};
use crate::report;
use crate::store::IssueStore;
use crate::teams;

/// URI scheme of the single work-item resource template.
pub const WORK_ITEM_URI_PREFIX: &str = "azure-workitem://";

// ---------------------------------------------------------------------------
// Tool parameter types
// ---------------------------------------------------------------------------

/// Parameters for `getazzureIssuesid`.
#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FetchIssuesParams {
    /// Azure DevOps username.  Falls back to `AZURE_USERNAME`.
    pub username: Option<String>,
    /// Personal access token.  Falls back to `AZURE_PASSWORD`.
    pub pat: Option<String>,
    /// Also write the HTML work-item report (default: true).
    pub render_report: Option<bool>,
}

/// Parameters for `getIssuesDetailsById`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct IssueDetailsParams {
    /// Azure DevOps username.  Falls back to `AZURE_USERNAME`.
    pub username: Option<String>,
    /// Personal access token.  Falls back to `AZURE_PASSWORD`.
    pub pat: Option<String>,
    /// Work item ids to fetch (at most 200).
    pub ids: Vec<i64>,
}

/// Parameters for `api-request`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ApiRequestParams {
    pub url: String,
    /// HTTP method, e.g. `GET` or `POST`.
    pub method: String,
    pub headers: Option<HashMap<String, String>>,
    /// Request body.  Strings are sent verbatim; any other JSON value is
    /// sent as `application/json`.
    pub body: Option<Value>,
}

/// Parameters for `azure-api-get`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct AzureApiGetParams {
    pub url: String,
    pub username: String,
    /// Password or personal access token.
    pub password: String,
    pub headers: Option<HashMap<String, String>>,
}

/// Parameters for `azure-api-get-and-post-teams`.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzureGetAndPostTeamsParams {
    pub url: String,
    /// Falls back to `AZURE_USERNAME`.
    pub username: Option<String>,
    /// Password or personal access token.  Falls back to `AZURE_PASSWORD`.
    pub password: Option<String>,
    /// Incoming-webhook URL that receives the response.
    pub teams_webhook_url: String,
    pub headers: Option<HashMap<String, String>>,
}

/// Arguments for the `get-issues-by-state` prompt.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct IssuesByStateArgs {
    /// Exact work item state, e.g. `Done`.
    pub state: String,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Render an error chain as the text returned to the MCP client.
fn failure(action: &str, err: anyhow::Error) -> String {
    tracing::warn!("{action}: {err:#}");
    format!("{action}: {err:#}")
}

/// Passthrough tools report `Status`/`Response`; a non-2xx status is a failure.
fn passthrough_result(response: HttpResponse) -> Result<String> {
    if !response.is_success() {
        bail!("Request failed\n{}", response.summary());
    }
    Ok(response.summary())
}

/// Titles of the items whose state equals `state` exactly.
fn issues_in_state(items: &[WorkItem], state: &str) -> String {
    let titles: Vec<&str> = items
        .iter()
        .filter(|item| item.state == state)
        .map(|item| item.title.as_str())
        .collect();

    if titles.is_empty() {
        return format!("No issues found with state \"{state}\".");
    }
    format!("Issues with state \"{state}\":\n- {}", titles.join("\n- "))
}

fn parse_work_item_uri(uri: &str) -> Result<i64> {
    let id = uri
        .strip_prefix(WORK_ITEM_URI_PREFIX)
        .with_context(|| format!("Unknown resource URI: {uri}"))?;
    id.parse()
        .with_context(|| format!("Invalid work item id in {uri}"))
}

fn resource_templates() -> Vec<ResourceTemplate> {
    vec![RawResourceTemplate {
        uri_template: format!("{WORK_ITEM_URI_PREFIX}{{id}}"),
        name: "azure-workitem".into(),
        title: Some("Azure DevOps work item".into()),
        description: Some("A single Azure DevOps work item with all of its fields.".into()),
        mime_type: Some("application/json".into()),
        icons: None,
    }
    .no_annotation()]
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// MCP server that exposes Azure DevOps work items and Teams posting.
#[derive(Clone)]
pub struct DevOpsMcpServer {
    config: Arc<Config>,
    http: reqwest::Client,
    tool_router: ToolRouter<Self>,
    prompt_router: PromptRouter<Self>,
}

#[tool_handler(router = self.tool_router)]
#[prompt_handler(router = self.prompt_router)]
impl ServerHandler for DevOpsMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder()
                .enable_prompts()
                .enable_resources()
                .enable_tools()
                .build(),
            server_info: Implementation {
                name: "azure-devops-mcp-server".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "This MCP server fetches Azure DevOps issues, stores the latest batch \
                 locally, renders an HTML report and posts it to Microsoft Teams.  \
                 Run getazzureIssuesid before get-issues-by-state or postReportToTeams."
                    .into(),
            ),
        }
    }

    async fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        Ok(ListResourceTemplatesResult::with_all_items(resource_templates()))
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        let text = self.work_item_resource(&request.uri).await;
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::TextResourceContents {
                uri: request.uri,
                mime_type: Some("application/json".into()),
                text,
                meta: None,
            }],
        })
    }
}

#[tool_router]
impl DevOpsMcpServer {
    // ------------------------------------------------------------------
    // Azure DevOps work items
    // ------------------------------------------------------------------

    /// Query issue ids (most recently changed first), fetch their details,
    /// overwrite the local snapshot and optionally write the HTML report.
    #[tool(
        name = "getazzureIssuesid",
        description = "Fetch Azure DevOps issues ordered by last change, save them to the local \
                       snapshot and render the HTML work item report.  Credentials default to \
                       AZURE_USERNAME / AZURE_PASSWORD."
    )]
    async fn fetch_issues(
        &self,
        Parameters(params): Parameters<FetchIssuesParams>,
    ) -> Result<String, String> {
        tracing::info!("getazzureIssuesid invoked");
        self.fetch_and_store(params)
            .await
            .map_err(|e| failure("Failed to fetch Azure DevOps issues", e))
    }

    /// Fetch details for explicit ids.  The snapshot is left untouched.
    #[tool(
        name = "getIssuesDetailsById",
        description = "Fetch Azure DevOps work item details for the given ids and return the raw JSON."
    )]
    async fn issue_details(
        &self,
        Parameters(params): Parameters<IssueDetailsParams>,
    ) -> Result<String, String> {
        tracing::info!(count = params.ids.len(), "getIssuesDetailsById invoked");
        self.fetch_details(params)
            .await
            .map_err(|e| failure("Failed to fetch work item details", e))
    }

    // ------------------------------------------------------------------
    // Teams
    // ------------------------------------------------------------------

    /// Post the last rendered HTML report to Teams as an Adaptive Card.
    #[tool(
        name = "postReportToTeams",
        description = "Post the last generated work item report to Microsoft Teams as an Adaptive Card."
    )]
    async fn post_report_to_teams(&self) -> Result<String, String> {
        tracing::info!("postReportToTeams invoked");
        self.post_report()
            .await
            .map_err(|e| failure("Failed to post report to Teams", e))
    }

    // ------------------------------------------------------------------
    // Passthrough
    // ------------------------------------------------------------------

    #[tool(
        name = "api-request",
        description = "Send an arbitrary HTTP request and return the status and response body."
    )]
    async fn api_request(
        &self,
        Parameters(params): Parameters<ApiRequestParams>,
    ) -> Result<String, String> {
        tracing::info!(url = %params.url, method = %params.method, "api-request invoked");
        self.passthrough(params)
            .await
            .map_err(|e| failure("API request failed", e))
    }

    #[tool(
        name = "azure-api-get",
        description = "GET an Azure DevOps REST URL with Basic authentication and return the \
                       status and response body."
    )]
    async fn azure_api_get(
        &self,
        Parameters(params): Parameters<AzureApiGetParams>,
    ) -> Result<String, String> {
        tracing::info!(url = %params.url, "azure-api-get invoked");
        self.authenticated_get(params)
            .await
            .map_err(|e| failure("Azure DevOps GET failed", e))
    }

    #[tool(
        name = "azure-api-get-and-post-teams",
        description = "GET an Azure DevOps REST URL and post the JSON response to a Teams \
                       incoming webhook as a code block."
    )]
    async fn azure_api_get_and_post_teams(
        &self,
        Parameters(params): Parameters<AzureGetAndPostTeamsParams>,
    ) -> Result<String, String> {
        tracing::info!(url = %params.url, "azure-api-get-and-post-teams invoked");
        self.forward_to_teams(params)
            .await
            .map_err(|e| failure("Failed to forward Azure DevOps response to Teams", e))
    }
}

#[prompt_router]
impl DevOpsMcpServer {
    /// List the titles of stored issues in a given state.
    #[prompt(
        name = "get-issues-by-state",
        description = "List the titles of the locally stored Azure DevOps issues whose state matches exactly."
    )]
    async fn issues_by_state(
        &self,
        Parameters(args): Parameters<IssuesByStateArgs>,
    ) -> Vec<PromptMessage> {
        tracing::info!(state = %args.state, "get-issues-by-state invoked");
        let text = match self.issue_store().load().await {
            Ok(items) => issues_in_state(&items, &args.state),
            Err(e) => failure("Failed to read stored issues", e),
        };
        vec![PromptMessage::new_text(PromptMessageRole::User, text)]
    }
}

impl DevOpsMcpServer {
    /// Create a new server instance.
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            http: reqwest::Client::new(),
            tool_router: Self::tool_router(),
            prompt_router: Self::prompt_router(),
        }
    }

    fn issue_store(&self) -> IssueStore {
        IssueStore::new(&self.config.snapshot_path)
    }

    async fn fetch_and_store(&self, params: FetchIssuesParams) -> Result<String> {
        let cfg = self.config.require_devops()?;
        let credentials = self.config.credentials(params.username, params.pat)?;

        let mut ids = devops::query_issue_ids(&self.http, cfg, &credentials).await?;
        let total = ids.len();
        if total > MAX_BATCH_SIZE {
            tracing::warn!(total, "Keeping only the {MAX_BATCH_SIZE} most recently changed issues");
            ids.truncate(MAX_BATCH_SIZE);
        }

        let items = if ids.is_empty() {
            Vec::new()
        } else {
            devops::fetch_work_items(&self.http, cfg, &credentials, &ids).await?
        };

        let store = self.issue_store();
        store.save(&items).await?;

        let mut summary = format!(
            "Fetched {} of {} issue(s) from Azure DevOps.\nSnapshot saved to {}",
            items.len(),
            total,
            store.path().display()
        );

        if params.render_report.unwrap_or(true) {
            let path = &self.config.report_path;
            report::write_report(path, &report::render_html(&items)).await?;
            summary.push_str(&format!("\nHTML report written to {}", path.display()));
        }

        Ok(summary)
    }

    async fn fetch_details(&self, params: IssueDetailsParams) -> Result<String> {
        let cfg = self.config.require_devops()?;
        let credentials = self.config.credentials(params.username, params.pat)?;
        let body = devops::fetch_work_items_raw(&self.http, cfg, &credentials, &params.ids).await?;
        serde_json::to_string_pretty(&body).context("Failed to serialise work item details")
    }

    async fn post_report(&self) -> Result<String> {
        let webhook = self.config.require_teams_webhook()?;
        let html = report::read_report(&self.config.report_path).await?;
        let table = report::parse_html_table(&html)?;
        let card = report::to_adaptive_card(&table, Utc::now());

        let response = teams::post_card(&self.http, webhook, card)
            .await?
            .error_for_status()
            .context("Teams webhook rejected the report")?;

        Ok(format!(
            "Posted work item report with {} row(s) to Teams (status {}).",
            table.rows.len(),
            response.status
        ))
    }

    async fn passthrough(&self, params: ApiRequestParams) -> Result<String> {
        let method = http::parse_method(&params.method)?;
        let request = HttpRequest::new(method, params.url).headers(params.headers);
        let request = match params.body {
            None | Some(Value::Null) => request,
            Some(Value::String(text)) => request.text_body(text),
            Some(value) => request.json_body(&value),
        };
        passthrough_result(http::send(&self.http, request).await?)
    }

    async fn authenticated_get(&self, params: AzureApiGetParams) -> Result<String> {
        let request = HttpRequest::get(params.url)
            .headers(params.headers)
            .basic_auth(Credentials::new(params.username, params.password));
        passthrough_result(http::send(&self.http, request).await?)
    }

    async fn forward_to_teams(&self, params: AzureGetAndPostTeamsParams) -> Result<String> {
        let credentials = self.config.credentials(params.username, params.password)?;
        let request = HttpRequest::get(params.url)
            .headers(params.headers)
            .basic_auth(credentials);

        let response = http::send(&self.http, request)
            .await?
            .error_for_status()
            .context("Azure DevOps request failed")?;

        let message = teams::json_code_block(&response.body.to_string());
        let posted = teams::post_text(&self.http, &params.teams_webhook_url, &message)
            .await?
            .error_for_status()
            .context("Teams webhook rejected the message")?;

        Ok(format!(
            "Azure DevOps responded with status {}; posted to Teams (status {}).",
            response.status, posted.status
        ))
    }

    /// JSON text for `azure-workitem://{id}`; failures become `{ "error": ... }`.
    async fn work_item_resource(&self, uri: &str) -> String {
        let result: Result<Value> = async {
            let id = parse_work_item_uri(uri)?;
            let cfg = self.config.require_devops()?;
            let credentials = self.config.credentials(None, None)?;
            devops::get_work_item(&self.http, cfg, &credentials, id).await
        }
        .await;

        let value = result.unwrap_or_else(|e| {
            tracing::warn!(%uri, "Failed to read work item resource: {e:#}");
            json!({ "error": format!("{e:#}") })
        });
        serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
    }
}
