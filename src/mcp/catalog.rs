use crate::errors::{ErrorCode, McpError};
use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

fn tool(name: &str, description: &str, input_schema: Value) -> ToolDef {
    ToolDef {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

fn connection_id_schema() -> Value {
    json!({"type": "string", "description": "Connection id returned by connect"})
}

fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

static TOOL_CATALOG: Lazy<Vec<ToolDef>> = Lazy::new(|| {
    vec![
        tool(
            "connect",
            "Open (or reuse) an SSH connection to a remote host",
            object_schema(
                json!({
                    "host": {"type": "string"},
                    "username": {"type": "string"},
                    "port": {"type": "integer", "minimum": 1, "maximum": 65535},
                    "password": {"type": "string"},
                    "privateKey": {"type": "string", "description": "PEM or OpenSSH private key material"},
                    "passphrase": {"type": "string"},
                    "name": {"type": "string"},
                    "rememberPassword": {"type": "boolean", "default": true},
                    "tags": {"type": "array", "items": {"type": "string"}},
                }),
                &["host", "username"],
            ),
        ),
        tool(
            "disconnect",
            "Disconnect an SSH connection, keeping its stored record",
            object_schema(json!({"connectionId": connection_id_schema()}), &["connectionId"]),
        ),
        tool(
            "getConnection",
            "Show one connection's state",
            object_schema(json!({"connectionId": connection_id_schema()}), &["connectionId"]),
        ),
        tool(
            "deleteConnection",
            "Disconnect and forget a connection including stored credentials",
            object_schema(json!({"connectionId": connection_id_schema()}), &["connectionId"]),
        ),
        tool(
            "listConnections",
            "List known connections and their states",
            object_schema(json!({}), &[]),
        ),
        tool(
            "executeCommand",
            "Run a one-shot command on the remote host (sudo, Docker context and tmux aware)",
            object_schema(
                json!({
                    "connectionId": connection_id_schema(),
                    "command": {"type": "string"},
                    "cwd": {"type": "string"},
                    "timeout": {"type": "integer", "minimum": 1, "description": "Timeout in milliseconds"},
                    "force": {"type": "boolean", "description": "Bypass the tmux busy-pane check"},
                }),
                &["connectionId", "command"],
            ),
        ),
        tool(
            "backgroundExecute",
            "Run a command periodically; one background task per connection",
            object_schema(
                json!({
                    "connectionId": connection_id_schema(),
                    "command": {"type": "string"},
                    "interval": {"type": "integer", "minimum": 1, "default": 10000, "description": "Interval in milliseconds"},
                    "cwd": {"type": "string"},
                }),
                &["connectionId", "command"],
            ),
        ),
        tool(
            "stopBackground",
            "Stop the connection's background task",
            object_schema(json!({"connectionId": connection_id_schema()}), &["connectionId"]),
        ),
        tool(
            "listBackgroundTasks",
            "List running background tasks",
            object_schema(json!({}), &[]),
        ),
        tool(
            "stopAllBackgroundTasks",
            "Stop every background task",
            object_schema(json!({}), &[]),
        ),
        tool(
            "listActiveSessions",
            "Overview of connections with their terminals, tunnels and tasks",
            object_schema(json!({}), &[]),
        ),
        tool(
            "uploadFile",
            "Upload a local file over SFTP",
            object_schema(
                json!({
                    "connectionId": connection_id_schema(),
                    "localPath": {"type": "string"},
                    "remotePath": {"type": "string"},
                }),
                &["connectionId", "localPath", "remotePath"],
            ),
        ),
        tool(
            "downloadFile",
            "Download a remote file over SFTP",
            object_schema(
                json!({
                    "connectionId": connection_id_schema(),
                    "remotePath": {"type": "string"},
                    "localPath": {"type": "string"},
                }),
                &["connectionId", "remotePath"],
            ),
        ),
        tool(
            "batchUploadFiles",
            "Upload several files sequentially; poll the returned transfer ids",
            object_schema(
                json!({
                    "connectionId": connection_id_schema(),
                    "files": {
                        "type": "array",
                        "minItems": 1,
                        "items": {
                            "type": "object",
                            "properties": {
                                "localPath": {"type": "string"},
                                "remotePath": {"type": "string"},
                            },
                            "required": ["localPath", "remotePath"],
                        },
                    },
                }),
                &["connectionId", "files"],
            ),
        ),
        tool(
            "batchDownloadFiles",
            "Download several files sequentially; poll the returned transfer ids",
            object_schema(
                json!({
                    "connectionId": connection_id_schema(),
                    "files": {
                        "type": "array",
                        "minItems": 1,
                        "items": {
                            "type": "object",
                            "properties": {
                                "localPath": {"type": "string"},
                                "remotePath": {"type": "string"},
                            },
                            "required": ["remotePath"],
                        },
                    },
                }),
                &["connectionId", "files"],
            ),
        ),
        tool(
            "getFileTransferStatus",
            "Inspect one transfer record",
            object_schema(json!({"transferId": {"type": "string"}}), &["transferId"]),
        ),
        tool(
            "listFileTransfers",
            "List transfer records",
            object_schema(json!({}), &[]),
        ),
        tool(
            "createTunnel",
            "Forward a local TCP port to a remote endpoint through SSH",
            object_schema(
                json!({
                    "connectionId": connection_id_schema(),
                    "localPort": {"type": "integer", "minimum": 1, "maximum": 65535},
                    "remoteHost": {"type": "string"},
                    "remotePort": {"type": "integer", "minimum": 1, "maximum": 65535},
                    "description": {"type": "string"},
                }),
                &["connectionId", "localPort", "remoteHost", "remotePort"],
            ),
        ),
        tool(
            "closeTunnel",
            "Close a tunnel and all of its socket pairs",
            object_schema(json!({"tunnelId": {"type": "string"}}), &["tunnelId"]),
        ),
        tool(
            "listTunnels",
            "List active tunnels",
            object_schema(json!({}), &[]),
        ),
        tool(
            "createTerminalSession",
            "Open an interactive shell with a PTY",
            object_schema(
                json!({
                    "connectionId": connection_id_schema(),
                    "rows": {"type": "integer", "minimum": 1, "default": 24},
                    "cols": {"type": "integer", "minimum": 1, "default": 80},
                    "term": {"type": "string", "default": "xterm-256color"},
                }),
                &["connectionId"],
            ),
        ),
        tool(
            "writeToTerminal",
            "Write bytes to a terminal session",
            object_schema(
                json!({
                    "sessionId": {"type": "string"},
                    "data": {"type": "string"},
                }),
                &["sessionId", "data"],
            ),
        ),
        tool(
            "resizeTerminal",
            "Resize a terminal session's PTY",
            object_schema(
                json!({
                    "sessionId": {"type": "string"},
                    "rows": {"type": "integer", "minimum": 1},
                    "cols": {"type": "integer", "minimum": 1},
                }),
                &["sessionId", "rows", "cols"],
            ),
        ),
        tool(
            "closeTerminalSession",
            "Close a terminal session",
            object_schema(json!({"sessionId": {"type": "string"}}), &["sessionId"]),
        ),
        tool(
            "listTerminalSessions",
            "List open terminal sessions",
            object_schema(json!({}), &[]),
        ),
        tool(
            "executeCommandInDocker",
            "Run a command inside a Docker container on the remote host",
            object_schema(
                json!({
                    "connectionId": connection_id_schema(),
                    "containerName": {"type": "string"},
                    "command": {"type": "string"},
                    "workdir": {"type": "string"},
                    "user": {"type": "string"},
                    "interactive": {"type": "boolean", "default": false},
                    "timeout": {"type": "integer", "minimum": 1},
                }),
                &["connectionId", "containerName", "command"],
            ),
        ),
        tool(
            "diagnoseContainerEnvironment",
            "Probe a container's shell, OS, user and package manager",
            object_schema(
                json!({
                    "connectionId": connection_id_schema(),
                    "containerName": {"type": "string"},
                    "packageName": {"type": "string"},
                }),
                &["connectionId", "containerName"],
            ),
        ),
        tool(
            "exitContainer",
            "Leave the active container context so commands run on the host again",
            object_schema(json!({"connectionId": connection_id_schema()}), &["connectionId"]),
        ),
        tool(
            "listContainers",
            "List containers on the remote host (cached for 30 seconds)",
            object_schema(
                json!({
                    "connectionId": connection_id_schema(),
                    "forceRefresh": {"type": "boolean", "default": false},
                }),
                &["connectionId"],
            ),
        ),
    ]
});

static TOOL_MAP: Lazy<HashMap<String, &'static ToolDef>> = Lazy::new(|| {
    TOOL_CATALOG
        .iter()
        .map(|tool| (tool.name.clone(), tool))
        .collect()
});

static TOOL_VALIDATORS: Lazy<HashMap<String, JSONSchema>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for tool in TOOL_CATALOG.iter() {
        if let Ok(schema) = JSONSchema::compile(&tool.input_schema) {
            map.insert(tool.name.clone(), schema);
        }
    }
    map
});

pub fn tool_catalog() -> &'static Vec<ToolDef> {
    &TOOL_CATALOG
}

pub fn tool_by_name(name: &str) -> Option<&'static ToolDef> {
    TOOL_MAP.get(name).copied()
}

pub fn validate_tool_args(tool_name: &str, args: &Value) -> Result<(), McpError> {
    let Some(schema) = TOOL_VALIDATORS.get(tool_name) else {
        return Ok(());
    };
    if let Err(errors) = schema.validate(args) {
        let rendered: Vec<String> = errors
            .take(5)
            .map(|err| {
                let path = err.instance_path.to_string();
                if path.is_empty() {
                    err.to_string()
                } else {
                    format!("{}: {}", path, err)
                }
            })
            .collect();
        return Err(McpError::new(
            ErrorCode::InvalidParams,
            format!(
                "Invalid arguments for {}: {}",
                tool_name,
                rendered.join("; ")
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_covers_the_tool_surface() {
        let expected = [
            "connect",
            "disconnect",
            "getConnection",
            "deleteConnection",
            "listConnections",
            "executeCommand",
            "backgroundExecute",
            "stopBackground",
            "listBackgroundTasks",
            "stopAllBackgroundTasks",
            "listActiveSessions",
            "uploadFile",
            "downloadFile",
            "batchUploadFiles",
            "batchDownloadFiles",
            "getFileTransferStatus",
            "listFileTransfers",
            "createTunnel",
            "closeTunnel",
            "listTunnels",
            "createTerminalSession",
            "writeToTerminal",
            "executeCommandInDocker",
            "diagnoseContainerEnvironment",
        ];
        for name in expected {
            assert!(tool_by_name(name).is_some(), "missing tool {}", name);
        }
    }

    #[test]
    fn every_tool_schema_compiles() {
        for tool in tool_catalog() {
            assert!(
                JSONSchema::compile(&tool.input_schema).is_ok(),
                "schema for {} must compile",
                tool.name
            );
        }
    }

    #[test]
    fn validation_rejects_missing_required_fields() {
        let err = validate_tool_args("connect", &serde_json::json!({"host": "h"}));
        assert!(err.is_err());
        assert!(validate_tool_args(
            "connect",
            &serde_json::json!({"host": "h", "username": "u"})
        )
        .is_ok());
    }

    #[test]
    fn validation_rejects_unknown_fields() {
        let err = validate_tool_args(
            "disconnect",
            &serde_json::json!({"connectionId": "x", "bogus": 1}),
        );
        assert!(err.is_err());
    }
}
