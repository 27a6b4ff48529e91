//! Command-line interface definition.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use todoforge_graph::TaskStatus;

/// Command-line client for Microsoft To Do.
///
/// Sign-in uses the device-code flow; tokens are cached on disk and renewed
/// silently. Results are printed as JSON on stdout.
#[derive(Debug, Parser)]
#[command(name = "todoforge", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sign in and cache the tokens
    Login {
        /// Run the device-code flow even if a cached account exists
        #[arg(long)]
        force: bool,
    },

    /// Remove all cached accounts
    Logout,

    /// List all task lists with their tasks
    Lists {
        /// OData $filter applied to each list's tasks
        #[arg(long, conflicts_with = "pending")]
        filter: Option<String>,

        /// Only include tasks that are not completed
        #[arg(long)]
        pending: bool,
    },

    /// Show one task list
    List {
        /// Task list id
        id: String,
    },

    /// Print the id of the first list whose name contains NAME
    ListId {
        name: String,
    },

    /// Create a task list
    CreateList {
        name: String,
    },

    /// List the tasks of one list
    Tasks {
        list_id: String,

        /// OData $filter applied to the tasks
        #[arg(long, conflicts_with = "pending")]
        filter: Option<String>,

        /// Only include tasks that are not completed
        #[arg(long)]
        pending: bool,
    },

    /// Show one task
    Task {
        list_id: String,
        task_id: String,
    },

    /// Create a task
    CreateTask {
        list_id: String,

        /// Task title
        #[arg(long, required_unless_present = "json")]
        title: Option<String>,

        /// JSON file with the task body; --title overrides its title
        #[arg(long, value_name = "FILE")]
        json: Option<PathBuf>,
    },

    /// Update a task; only the given properties are changed
    UpdateTask {
        list_id: String,
        task_id: String,

        /// New title
        #[arg(long)]
        title: Option<String>,

        /// New status (notStarted, inProgress, completed, waitingOnOthers, deferred)
        #[arg(long)]
        status: Option<TaskStatus>,

        /// JSON file with properties to set
        #[arg(long, value_name = "FILE")]
        json: Option<PathBuf>,
    },
}
