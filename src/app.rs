use crate::constants::sweep;
use crate::errors::ToolError;
use crate::managers::{
    commands::CommandManager, connections::ConnectionManager, docker::DockerManager,
    terminals::TerminalToolManager, transfers::TransferToolManager, tunnels::TunnelToolManager,
    ToolHandler,
};
use crate::mcp::catalog::tool_catalog;
use crate::services::background::BackgroundRunner;
use crate::services::context::ContainerContext;
use crate::services::credentials::CredentialStore;
use crate::services::events::EventBus;
use crate::services::exec::CommandEngine;
use crate::services::logger::Logger;
use crate::services::registry::ConnectionRegistry;
use crate::services::security::Security;
use crate::services::store::ConnectionStore;
use crate::services::terminals::TerminalManager;
use crate::services::transfers::TransferManager;
use crate::services::tunnels::TunnelManager;
use crate::services::validation::Validation;
use crate::utils::paths::{resolve_connections_path, resolve_credentials_path};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct App {
    pub logger: Logger,
    pub events: EventBus,
    pub registry: Arc<ConnectionRegistry>,
    pub background: Arc<BackgroundRunner>,
    pub transfers: Arc<TransferManager>,
    pub tunnels: Arc<TunnelManager>,
    pub terminals: Arc<TerminalManager>,
    pub context: Arc<ContainerContext>,
    handlers: HashMap<&'static str, Arc<dyn ToolHandler>>,
}

impl App {
    pub fn initialize(logger: Logger) -> Result<Self, ToolError> {
        let validation = Validation::new();
        let events = EventBus::default();

        let security = Arc::new(Security::new()?);
        let store = Arc::new(ConnectionStore::open(resolve_connections_path())?);
        let credentials = Arc::new(CredentialStore::new(
            logger.clone(),
            security,
            resolve_credentials_path(),
        ));
        let registry = Arc::new(ConnectionRegistry::new(
            logger.clone(),
            store,
            credentials.clone(),
            events.clone(),
        ));
        let context = Arc::new(ContainerContext::new());
        let engine = Arc::new(CommandEngine::new(
            logger.clone(),
            registry.clone(),
            credentials.clone(),
            context.clone(),
        ));
        let background = Arc::new(BackgroundRunner::new(
            logger.clone(),
            engine.clone(),
            registry.clone(),
        ));
        let transfers = Arc::new(TransferManager::new(
            logger.clone(),
            registry.clone(),
            events.clone(),
        ));
        let tunnels = Arc::new(TunnelManager::new(
            logger.clone(),
            registry.clone(),
            events.clone(),
        ));
        let terminals = Arc::new(TerminalManager::new(
            logger.clone(),
            registry.clone(),
            credentials.clone(),
            events.clone(),
        ));

        // A connection that stops being usable takes its dependents with it.
        {
            let background = background.clone();
            registry.register_disconnect_hook(Box::new(move |id| {
                background.stop(id);
            }));
        }
        {
            let tunnels = tunnels.clone();
            registry.register_disconnect_hook(Box::new(move |id| {
                tunnels.close_for_connection(id);
            }));
        }
        {
            let terminals = terminals.clone();
            registry.register_disconnect_hook(Box::new(move |id| {
                terminals.close_for_connection(id);
            }));
        }
        {
            let context = context.clone();
            registry.register_disconnect_hook(Box::new(move |id| {
                context.exit_container(id);
            }));
        }

        let connection_manager = Arc::new(ConnectionManager::new(
            logger.clone(),
            validation.clone(),
            registry.clone(),
        ));
        let command_manager = Arc::new(CommandManager::new(
            logger.clone(),
            validation.clone(),
            registry.clone(),
            engine.clone(),
            background.clone(),
            terminals.clone(),
            tunnels.clone(),
        ));
        let transfer_manager = Arc::new(TransferToolManager::new(
            logger.clone(),
            validation.clone(),
            transfers.clone(),
        ));
        let tunnel_manager = Arc::new(TunnelToolManager::new(
            logger.clone(),
            validation.clone(),
            tunnels.clone(),
        ));
        let terminal_manager = Arc::new(TerminalToolManager::new(
            logger.clone(),
            validation.clone(),
            terminals.clone(),
        ));
        let docker_manager = Arc::new(DockerManager::new(
            logger.clone(),
            validation,
            engine.clone(),
            context.clone(),
        ));

        let mut handlers: HashMap<&'static str, Arc<dyn ToolHandler>> = HashMap::new();
        for tool in [
            "connect",
            "disconnect",
            "getConnection",
            "deleteConnection",
            "listConnections",
        ] {
            handlers.insert(tool, connection_manager.clone());
        }
        for tool in [
            "executeCommand",
            "backgroundExecute",
            "stopBackground",
            "listBackgroundTasks",
            "stopAllBackgroundTasks",
            "listActiveSessions",
        ] {
            handlers.insert(tool, command_manager.clone());
        }
        for tool in [
            "uploadFile",
            "downloadFile",
            "batchUploadFiles",
            "batchDownloadFiles",
            "getFileTransferStatus",
            "listFileTransfers",
        ] {
            handlers.insert(tool, transfer_manager.clone());
        }
        for tool in ["createTunnel", "closeTunnel", "listTunnels"] {
            handlers.insert(tool, tunnel_manager.clone());
        }
        for tool in [
            "createTerminalSession",
            "writeToTerminal",
            "resizeTerminal",
            "closeTerminalSession",
            "listTerminalSessions",
        ] {
            handlers.insert(tool, terminal_manager.clone());
        }
        for tool in [
            "executeCommandInDocker",
            "diagnoseContainerEnvironment",
            "exitContainer",
            "listContainers",
        ] {
            handlers.insert(tool, docker_manager.clone());
        }

        Self::validate_tool_wiring(&handlers)?;

        let app = Self {
            logger,
            events,
            registry,
            background,
            transfers,
            tunnels,
            terminals,
            context,
            handlers,
        };
        app.spawn_janitor();
        Ok(app)
    }

    fn validate_tool_wiring(
        handlers: &HashMap<&'static str, Arc<dyn ToolHandler>>,
    ) -> Result<(), ToolError> {
        let mut missing: Vec<String> = tool_catalog()
            .iter()
            .filter(|tool| !handlers.contains_key(tool.name.as_str()))
            .map(|tool| tool.name.clone())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort();
        Err(ToolError::internal("Tool wiring is incomplete")
            .with_details(serde_json::json!({ "missing_tools": missing })))
    }

    pub fn handler_for(&self, tool: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(tool).cloned()
    }

    /// Retention sweeps: terminal transfer records after an hour, terminals
    /// idle a day, container contexts idle half an hour.
    fn spawn_janitor(&self) {
        let logger = self.logger.child("janitor");
        let transfers = self.transfers.clone();
        let terminals = self.terminals.clone();
        let context = self.context.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(sweep::JANITOR_INTERVAL_MS)).await;
                let removed =
                    transfers.sweep(chrono::Utc::now(), sweep::TRANSFER_RETENTION_MS);
                let closed = terminals.sweep_idle(sweep::TERMINAL_IDLE_MS);
                let deactivated = context.sweep_idle(sweep::CONTAINER_IDLE_MS);
                if removed + closed + deactivated > 0 {
                    logger.debug(
                        "sweep",
                        Some(&serde_json::json!({
                            "transfers_removed": removed,
                            "terminals_closed": closed,
                            "contexts_deactivated": deactivated,
                        })),
                    );
                }
            }
        });
    }

    /// Tear down everything that holds remote resources.
    pub fn shutdown(&self) {
        let stopped = self.background.stop_all();
        let mut tunnels_closed = 0;
        for tunnel in self.tunnels.list() {
            if let Some(id) = tunnel.get("id").and_then(|v| v.as_str()) {
                if self.tunnels.close(id) {
                    tunnels_closed += 1;
                }
            }
        }
        let mut terminals_closed = 0;
        for session in self.terminals.list() {
            if let Some(id) = session.get("id").and_then(|v| v.as_str()) {
                if self.terminals.close(id) {
                    terminals_closed += 1;
                }
            }
        }
        self.logger.info(
            "shutdown complete",
            Some(&serde_json::json!({
                "background_stopped": stopped,
                "tunnels_closed": tunnels_closed,
                "terminals_closed": terminals_closed,
            })),
        );
    }
}
