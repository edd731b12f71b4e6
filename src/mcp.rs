//! MCP server exposing registered operations as tools.

use anyhow::Result;
use rmcp::{
    ErrorData, RoleServer, ServerHandler,
    model::{
        CallToolRequestParam, CallToolResult, Content, ListToolsResult, PaginatedRequestParam,
        ServerCapabilities, ServerInfo, Tool,
    },
    service::RequestContext,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::registry::{DispatchError, Envelope, JsonObject, Operation, Payload, Registry};

fn tool_from_operation(operation: &Operation) -> Tool {
    Tool::new(
        operation.name().to_string(),
        operation.description().to_string(),
        operation.input_schema(),
    )
}

fn serialization_error(e: &serde_json::Error) -> ErrorData {
    ErrorData::internal_error(format!("Failed to serialize result: {e}"), None)
}

/// Map a dispatcher result onto an MCP tool result.
///
/// Failures are reported as tool errors carrying the JSON error envelope,
/// so the calling agent can read the kind and offending parameter.
fn to_call_tool_result(
    result: std::result::Result<Payload, DispatchError>,
) -> std::result::Result<CallToolResult, ErrorData> {
    match result {
        Ok(Payload::Text(text)) => Ok(CallToolResult::success(vec![Content::text(text)])),
        Ok(payload) => {
            let text = serde_json::to_string_pretty(&payload).map_err(|e| serialization_error(&e))?;
            Ok(CallToolResult::success(vec![Content::text(text)]))
        }
        Err(e) => {
            let envelope = Envelope::from(Err(e));
            let text =
                serde_json::to_string_pretty(&envelope).map_err(|e| serialization_error(&e))?;
            Ok(CallToolResult::error(vec![Content::text(text)]))
        }
    }
}

/// Run one tool call; the in-flight invocation is dropped when `ct` fires.
async fn dispatch_tool_call(
    registry: &Registry,
    name: &str,
    arguments: Option<JsonObject>,
    ct: &CancellationToken,
) -> std::result::Result<CallToolResult, ErrorData> {
    let arguments = arguments.unwrap_or_default();

    tokio::select! {
        result = registry.invoke(name, &arguments) => to_call_tool_result(result),
        () = ct.cancelled() => {
            tracing::info!("Call to '{}' cancelled by client", name);
            Err(ErrorData::internal_error(
                format!("Operation '{name}' was cancelled"),
                None,
            ))
        }
    }
}

pub struct McpServer {
    name: String,
    version: String,
    registry: Arc<Registry>,
}

impl McpServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>, registry: Registry) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            registry: Arc::new(registry),
        }
    }

    pub async fn run(self) -> Result<()> {
        use rmcp::ServiceExt;

        tracing::info!("MCP server starting: {} v{}", self.name, self.version);

        let transport = rmcp::transport::stdio();
        let server = self.serve(transport).await?;
        server.waiting().await?;

        tracing::info!("MCP server shutting down");
        Ok(())
    }

    fn tools(&self) -> Vec<Tool> {
        self.registry
            .operations()
            .iter()
            .map(tool_from_operation)
            .collect()
    }
}

impl ServerHandler for McpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: rmcp::model::Implementation {
                name: self.name.clone(),
                version: self.version.clone(),
                ..Default::default()
            },
            instructions: Some(
                "MongoDB administration server. Workflow: \
                 1) listDatabases to see available databases, \
                 2) listCollections with db to get exact collection names (case-sensitive!), \
                 3) listIndexes with db and collection to inspect indexes, \
                 4) createCollection with db and collection to add a collection. \
                 Errors are returned as JSON with a kind (unknown_operation, invalid_argument, \
                 backend) and a message."
                    .to_string(),
            ),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult::with_all_items(self.tools()))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        dispatch_tool_call(&self.registry, &request.name, request.arguments, &context.ct).await
    }
}
