use serde::Serialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

impl ToolDefinition {
    fn new(name: &'static str, description: &'static str, input_schema: Value) -> Self {
        Self {
            name,
            description,
            input_schema,
        }
    }
}

// Helper to create a JSON schema property
fn create_prop(type_str: &str, description: &str) -> Value {
    json!({
        "type": type_str,
        "description": description
    })
}

fn create_enum_prop(enum_values: Vec<&str>, description: &str) -> Value {
    json!({
        "type": "string",
        "enum": enum_values,
        "description": description
    })
}

fn object_schema(required: &[&str], properties: Vec<(&str, Value)>) -> Value {
    let properties: Map<String, Value> = properties
        .into_iter()
        .map(|(name, prop)| (name.to_string(), prop))
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

const CWD_GUIDANCE: &str = "Working directory. Absolute, tilde-expanded (~/...) or relative to DEFAULT_CWD. Defaults to DEFAULT_CWD.";

pub fn empty_schema() -> Value {
    object_schema(&[], vec![])
}

pub fn parse_command_schema() -> Value {
    object_schema(
        &["command"],
        vec![("command", create_prop("string", "Shell command line to split into segments."))],
    )
}

pub fn run_command_schema() -> Value {
    object_schema(
        &["command"],
        vec![
            ("command", create_prop("string", "Shell command line to run.")),
            ("cwd", create_prop("string", CWD_GUIDANCE)),
            (
                "task_id",
                create_prop("string", "Task the session is affiliated with. Sessions of other tasks are never reused."),
            ),
            (
                "provider",
                create_enum_prop(
                    vec!["integrated", "spawned"],
                    "Where the command runs. Defaults to the host terminal when one is attached.",
                ),
            ),
            (
                "timeout_ms",
                create_prop("integer", "How long to wait for completion before returning. Defaults to COMMAND_TIMEOUT_MS."),
            ),
        ],
    )
}

pub fn read_output_schema() -> Value {
    object_schema(
        &["session_id"],
        vec![("session_id", create_prop("integer", "Session to read unretrieved output from."))],
    )
}

pub fn release_task_schema() -> Value {
    object_schema(
        &["task_id"],
        vec![("task_id", create_prop("string", "Task whose sessions become available for reuse."))],
    )
}

pub fn start_service_schema() -> Value {
    object_schema(
        &["command"],
        vec![
            ("command", create_prop("string", "Long-running command, e.g. a dev server.")),
            ("cwd", create_prop("string", CWD_GUIDANCE)),
            (
                "ready_pattern",
                create_prop("string", "Regex matched against output lines; a match marks the service ready. Use (?i) for case-insensitive."),
            ),
            ("health_check_url", create_prop("string", "URL polled with HTTP GET until it answers with a success status.")),
            ("health_check_interval_ms", create_prop("integer", "Polling interval for health_check_url. Default 1000.")),
        ],
    )
}

pub fn service_id_schema() -> Value {
    object_schema(
        &["service_id"],
        vec![("service_id", create_prop("string", "Identifier returned by start_service."))],
    )
}

pub fn service_logs_schema() -> Value {
    object_schema(
        &["service_id"],
        vec![
            ("service_id", create_prop("string", "Identifier returned by start_service.")),
            ("lines", create_prop("integer", "Number of most recent lines to return. Defaults to all retained lines.")),
        ],
    )
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new("list_tools", "List available tools and their input schemas.", empty_schema()),
        ToolDefinition::new(
            "parse_command",
            "Split a command line into operator-delimited segments.",
            parse_command_schema(),
        ),
        ToolDefinition::new(
            "run_command",
            "Run a command in a pooled terminal session and wait for it to finish.",
            run_command_schema(),
        ),
        ToolDefinition::new("read_output", "Read output a session has not yet returned.", read_output_schema()),
        ToolDefinition::new("list_sessions", "List terminal sessions in the pool.", empty_schema()),
        ToolDefinition::new(
            "release_task",
            "Release every session affiliated with a task.",
            release_task_schema(),
        ),
        ToolDefinition::new("start_service", "Start a long-running background service.", start_service_schema()),
        ToolDefinition::new("stop_service", "Stop a background service.", service_id_schema()),
        ToolDefinition::new("get_service", "Get the state of one service.", service_id_schema()),
        ToolDefinition::new("list_services", "List services that have not stopped cleanly.", empty_schema()),
        ToolDefinition::new("get_service_logs", "Read a service's retained output lines.", service_logs_schema()),
    ]
}
