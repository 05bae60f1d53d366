use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::context::ShellContext;
use crate::error::AppError;
use crate::server::schemas::tool_definitions;
use crate::server::shell_tools::{
    ParseCommandParams, ReadOutputParams, ReleaseTaskParams, RunCommandParams, ServiceIdParams,
    ServiceLogsParams, ShellTools, StartServiceParams,
};

pub struct ToolHandler {
    tools: ShellTools,
}

impl ToolHandler {
    pub fn new(ctx: Arc<ShellContext>) -> Self {
        Self {
            tools: ShellTools::new(ctx),
        }
    }

    #[instrument(skip(self, arguments))]
    pub async fn handle_tool_call(&self, tool: &str, arguments: Value) -> Result<Value, AppError> {
        info!("Handling tool call for: {}", tool);
        let arguments = match arguments {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        // Parses the arguments into the tool's params and serializes the result.
        macro_rules! handle_tool {
            ($method:ident :: <$param_type:ty>) => {{
                let params: $param_type = serde_json::from_value(arguments)
                    .map_err(|e| AppError::InvalidInputArgument(e.to_string()))?;
                let result = self.tools.$method(&params).await?;
                Ok(serde_json::to_value(&result)?)
            }};
            ($method:ident ()) => {{
                let result = self.tools.$method().await?;
                Ok(serde_json::to_value(&result)?)
            }};
        }

        match tool {
            "list_tools" => Ok(serde_json::to_value(tool_definitions())?),
            "parse_command" => handle_tool!(parse_command::<ParseCommandParams>),
            "run_command" => handle_tool!(run_command::<RunCommandParams>),
            "read_output" => handle_tool!(read_output::<ReadOutputParams>),
            "list_sessions" => handle_tool!(list_sessions()),
            "release_task" => handle_tool!(release_task::<ReleaseTaskParams>),
            "start_service" => handle_tool!(start_service::<StartServiceParams>),
            "stop_service" => handle_tool!(stop_service::<ServiceIdParams>),
            "get_service" => handle_tool!(get_service::<ServiceIdParams>),
            "list_services" => handle_tool!(list_services()),
            "get_service_logs" => handle_tool!(get_service_logs::<ServiceLogsParams>),
            _ => {
                error!("Unknown tool called: {}", tool);
                Err(AppError::UnknownTool(tool.to_string()))
            }
        }
    }
}
