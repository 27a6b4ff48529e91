//! Command execution.
//!
//! Each subcommand maps onto one [`TodoApi`] operation (or a token provider
//! call for `login`/`logout`) and prints its result as pretty JSON.

use crate::cli::Command;
use crate::config::Config;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use todoforge_auth::{
    ConsolePrompt, FileCachePlugin, InteractiveTokenProvider, PublicClient, StaticTokenProvider,
};
use todoforge_graph::{filter, TaskStatus, TodoApi, TodoTask};
use tracing::{debug, info};

/// Environment variable holding a ready-made bearer token.
///
/// When set, sign-in and the token cache are bypassed entirely.
pub const TOKEN_ENV: &str = "TODOFORGE_TOKEN";

/// Graph client plus the interactive provider behind it, if any.
pub struct Session {
    api: TodoApi,
    interactive: Option<Arc<InteractiveTokenProvider<PublicClient>>>,
}

impl Session {
    pub fn from_config(config: &Config) -> Result<Self> {
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.is_empty() {
                info!("Using bearer token from {}", TOKEN_ENV);
                let api = TodoApi::with_base_url(
                    Arc::new(StaticTokenProvider::new(token)),
                    config.graph.base_url.clone(),
                );
                return Ok(Self {
                    api,
                    interactive: None,
                });
            }
        }

        let cache_path = config.cache_path()?;
        debug!("Token cache: {}", cache_path.display());

        let client = PublicClient::new(config.auth_config())?
            .with_cache_plugin(Arc::new(FileCachePlugin::new(cache_path)));
        let provider = Arc::new(
            InteractiveTokenProvider::new(
                client,
                config.auth.scopes.clone(),
                Arc::new(ConsolePrompt::new(config.auth.open_browser)),
            )
            .with_flow(config.auth.flow),
        );
        let api = TodoApi::with_base_url(provider.clone(), config.graph.base_url.clone());

        Ok(Self {
            api,
            interactive: Some(provider),
        })
    }

    fn interactive(&self) -> Result<&InteractiveTokenProvider<PublicClient>> {
        match &self.interactive {
            Some(provider) => Ok(provider),
            None => bail!("sign-in is disabled while {} is set", TOKEN_ENV),
        }
    }

    pub async fn run(&self, command: Command) -> Result<()> {
        match command {
            Command::Login { force } => {
                let provider = self.interactive()?;
                let result = if force {
                    provider.acquire_interactive().await?
                } else {
                    provider.acquire().await?
                };
                print_json(&json!({
                    "username": result.account.username,
                    "tenantId": result.account.tenant_id,
                    "expiresOn": result.expires_on,
                    "scopes": result.scopes,
                }))
            }
            Command::Logout => {
                let removed = self.interactive()?.sign_out().await?;
                print_json(&json!({ "removedAccounts": removed }))
            }
            Command::Lists { filter, pending } => {
                let filter = task_filter(filter, pending);
                let lists = self.api.get_lists(filter.as_deref()).await?;
                print_json(&lists)
            }
            Command::List { id } => print_json(&self.api.get_list(&id).await?),
            Command::ListId { name } => print_json(&self.api.get_list_id_by_name(&name).await?),
            Command::CreateList { name } => print_json(&self.api.create_task_list(&name).await?),
            Command::Tasks {
                list_id,
                filter,
                pending,
            } => {
                let filter = task_filter(filter, pending);
                let tasks = self
                    .api
                    .get_list_tasks(&list_id, filter.as_deref())
                    .await?;
                print_json(&tasks)
            }
            Command::Task { list_id, task_id } => {
                print_json(&self.api.get_task(&list_id, &task_id).await?)
            }
            Command::CreateTask {
                list_id,
                title,
                json,
            } => {
                let task = build_task(title, None, json.as_deref())?;
                print_json(&self.api.create_task(&list_id, &task).await?)
            }
            Command::UpdateTask {
                list_id,
                task_id,
                title,
                status,
                json,
            } => {
                let task = build_task(title, status, json.as_deref())?;
                if task == TodoTask::default() {
                    bail!("nothing to update: pass --title, --status or --json");
                }
                print_json(&self.api.update_task(&list_id, &task_id, &task).await?)
            }
        }
    }
}

/// OData filter for task queries; `pending` excludes completed tasks.
pub fn task_filter(filter: Option<String>, pending: bool) -> Option<String> {
    if pending {
        Some(filter::status_ne(TaskStatus::Completed))
    } else {
        filter
    }
}

/// Build a task body from an optional JSON file, then apply flag overrides.
pub fn build_task(
    title: Option<String>,
    status: Option<TaskStatus>,
    json_file: Option<&Path>,
) -> Result<TodoTask> {
    let mut task = match json_file {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read task file: {}", path.display()))?;
            serde_json::from_str::<TodoTask>(&content)
                .with_context(|| format!("Failed to parse task file: {}", path.display()))?
        }
        None => TodoTask::default(),
    };

    if let Some(title) = title {
        task.title = Some(title);
    }
    if let Some(status) = status {
        task.status = Some(status);
    }

    Ok(task)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let output = serde_json::to_string_pretty(value)?;
    println!("{}", output);
    Ok(())
}
