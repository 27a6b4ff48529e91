//! # todoforge-graph
//!
//! Microsoft To Do operations over the Microsoft Graph API.
//!
//! [`TodoApi`] maps each operation onto one Graph v1.0 endpoint:
//! - Listing task lists, optionally with their tasks attached
//! - Looking up, fetching and creating task lists
//! - Listing, fetching, creating and updating tasks
//!
//! ## Authentication
//!
//! Every request asks the injected [`TokenProvider`] for a bearer token
//! first, so token renewal happens transparently between calls.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use todoforge_auth::StaticTokenProvider;
//! use todoforge_graph::TodoApi;
//!
//! # async fn example() -> todoforge_graph::Result<()> {
//! let api = TodoApi::new(Arc::new(StaticTokenProvider::new("token123")));
//!
//! for list in api.get_lists(None).await? {
//!     let count = list.tasks.as_ref().map_or(0, Vec::len);
//!     println!("{}: {} task(s)", list.display_name, count);
//! }
//! # Ok(())
//! # }
//! ```

use futures::future::join_all;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use todoforge_auth::{AuthError, TokenProvider};
use tracing::{debug, warn};

pub mod filter;
pub mod models;

use models::CollectionPage;
pub use models::{DateTimeTimeZone, Importance, ItemBody, TaskStatus, TodoTask, TodoTaskList};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("API request failed: {status} - {body}")]
    Api { status: StatusCode, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid base URL: {0}")]
    InvalidBaseUrl(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateListRequest<'a> {
    display_name: &'a str,
}

// ============================================================================
// API Implementation
// ============================================================================

/// Microsoft To Do client.
pub struct TodoApi {
    token_provider: Arc<dyn TokenProvider>,
    client: Client,
    base_url: String,
}

impl TodoApi {
    pub const GRAPH_BASE_URL: &'static str = "https://graph.microsoft.com/v1.0";

    /// Create a client against the public Graph endpoint.
    pub fn new(token_provider: Arc<dyn TokenProvider>) -> Self {
        Self::with_base_url(token_provider, Self::GRAPH_BASE_URL)
    }

    /// Create a client against a custom Graph root (national clouds, tests).
    pub fn with_base_url(token_provider: Arc<dyn TokenProvider>, base_url: impl Into<String>) -> Self {
        Self {
            token_provider,
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build an endpoint URL, percent-encoding each path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| GraphError::InvalidBaseUrl(format!("{}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| GraphError::InvalidBaseUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Authorize and send a request, decoding a successful JSON response.
    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let token = self.token_provider.access_token().await?;
        let response = request.bearer_auth(&token).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GraphError::Api { status, body });
        }

        Ok(response.json().await?)
    }

    /// GET a collection, following `@odata.nextLink` until exhausted.
    async fn fetch_collection<T: DeserializeOwned>(
        &self,
        url: Url,
        filter: Option<&str>,
    ) -> Result<Vec<T>> {
        debug!("GET {} (filter: {:?})", url, filter);
        let mut request = self.client.get(url);
        if let Some(filter) = filter {
            request = request.query(&[("$filter", filter)]);
        }

        let mut page: CollectionPage<T> = self.execute(request).await?;
        let mut items = std::mem::take(&mut page.value);

        while let Some(next_link) = page.next_link.take() {
            debug!("GET {}", next_link);
            page = self.execute(self.client.get(&next_link)).await?;
            items.append(&mut page.value);
        }

        Ok(items)
    }

    // ------------------------------------------------------------------------
    // List operations
    // ------------------------------------------------------------------------

    /// Fetch all task lists and attach each list's tasks.
    ///
    /// Task fetches run concurrently, one per list. A list whose tasks
    /// cannot be fetched gets an empty task set instead of failing the
    /// whole call.
    pub async fn get_lists(&self, filter: Option<&str>) -> Result<Vec<TodoTaskList>> {
        let url = self.endpoint(&["me", "todo", "lists"])?;
        let lists: Vec<TodoTaskList> = self.fetch_collection(url, None).await?;

        let task_sets = join_all(
            lists
                .iter()
                .map(|list| self.get_list_tasks(&list.id, filter)),
        )
        .await;

        let lists = lists
            .into_iter()
            .zip(task_sets)
            .map(|(mut list, tasks)| {
                let tasks = match tasks {
                    Ok(tasks) => tasks.unwrap_or_default(),
                    Err(e) => {
                        warn!("Unable to fetch tasks from list {}: {}", list.display_name, e);
                        Vec::new()
                    }
                };
                list.tasks = Some(tasks);
                list
            })
            .collect();

        Ok(lists)
    }

    /// Id of the first list whose display name contains `name`.
    pub async fn get_list_id_by_name(&self, name: &str) -> Result<Option<String>> {
        if name.is_empty() {
            return Ok(None);
        }

        let url = self.endpoint(&["me", "todo", "lists"])?;
        let filter = filter::display_name_contains(name);
        debug!("GET {} (filter: {})", url, filter);

        let page: CollectionPage<TodoTaskList> = self
            .execute(self.client.get(url).query(&[("$filter", filter.as_str())]))
            .await?;

        Ok(page.value.into_iter().next().map(|list| list.id))
    }

    pub async fn get_list(&self, list_id: &str) -> Result<Option<TodoTaskList>> {
        if list_id.is_empty() {
            return Ok(None);
        }

        let url = self.endpoint(&["me", "todo", "lists", list_id])?;
        debug!("GET {}", url);
        Ok(Some(self.execute(self.client.get(url)).await?))
    }

    pub async fn create_task_list(&self, display_name: &str) -> Result<Option<TodoTaskList>> {
        if display_name.is_empty() {
            return Ok(None);
        }

        let url = self.endpoint(&["me", "todo", "lists"])?;
        debug!("POST {}", url);
        let request = self
            .client
            .post(url)
            .json(&CreateListRequest { display_name });
        Ok(Some(self.execute(request).await?))
    }

    // ------------------------------------------------------------------------
    // Task operations
    // ------------------------------------------------------------------------

    /// Tasks of one list, optionally narrowed by an OData filter.
    ///
    /// Request failures are reported as a warning and yield `Ok(None)`;
    /// only authentication failures are returned as errors.
    pub async fn get_list_tasks(
        &self,
        list_id: &str,
        filter: Option<&str>,
    ) -> Result<Option<Vec<TodoTask>>> {
        if list_id.is_empty() {
            return Ok(None);
        }

        let url = self.endpoint(&["me", "todo", "lists", list_id, "tasks"])?;
        let filter = filter.filter(|f| !f.is_empty());

        match self.fetch_collection(url, filter).await {
            Ok(tasks) => Ok(Some(tasks)),
            Err(GraphError::Auth(e)) => Err(GraphError::Auth(e)),
            Err(e) => {
                warn!("Unable to acquire tasks from list {}: {}", list_id, e);
                Ok(None)
            }
        }
    }

    pub async fn get_task(&self, list_id: &str, task_id: &str) -> Result<TodoTask> {
        let url = self.endpoint(&["me", "todo", "lists", list_id, "tasks", task_id])?;
        debug!("GET {}", url);
        self.execute(self.client.get(url)).await
    }

    pub async fn create_task(&self, list_id: &str, task: &TodoTask) -> Result<TodoTask> {
        let url = self.endpoint(&["me", "todo", "lists", list_id, "tasks"])?;
        debug!("POST {}", url);
        self.execute(self.client.post(url).json(task)).await
    }

    /// PATCH a task; only the properties set on `task` are sent.
    pub async fn update_task(
        &self,
        list_id: &str,
        task_id: &str,
        task: &TodoTask,
    ) -> Result<TodoTask> {
        let url = self.endpoint(&["me", "todo", "lists", list_id, "tasks", task_id])?;
        debug!("PATCH {}", url);
        self.execute(self.client.patch(url).json(task)).await
    }
}

// ============================================================================
// Tests
// ============================================================================
