//! # confstore CLI Module
//!
//! ## Available Commands
//!
//! - `schemas` - Show the registered schemas
//! - `create` - Create beans
//! - `set` - Replace beans
//! - `merge` - Patch beans
//! - `get` - Show one bean
//! - `list` - Show every bean of a schema
//! - `delete` - Delete beans of a schema
//! - `query` - Find beans with restriction expressions
//! - `singleton` - Create the empty instance of a singleton schema

mod commands;

use crate::config::{AppConfig, Backend, Settings};
use clap::{Args, Parser, Subcommand};
use confstore_core::ConfstoreError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// confstore - schema-driven configuration store
///
/// Provisions and inspects configuration beans declared by TOML schema files.
#[derive(Parser, Debug)]
#[command(name = "confstore")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress confirmation messages
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Settings file (defaults to ./confstore.toml when present)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the bean database
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Storage backend
    #[arg(short = 'B', long, global = true, value_enum)]
    pub backend: Option<Backend>,

    /// Schema-definition file
    #[arg(short = 'S', long, global = true)]
    pub schemas: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Merge the flags over a settings file.
    pub fn settings(&self, file: AppConfig) -> Settings {
        Settings::resolve(
            file,
            self.database.clone(),
            self.backend,
            self.schemas.clone(),
        )
    }
}

/// Bean contents given on the command line or in a JSON file.
#[derive(Args, Debug, Clone, Default)]
pub struct BeanInput {
    /// Schema name
    pub schema: Option<String>,

    /// Instance id (omit for singletons)
    pub id: Option<String>,

    /// Property value as `name=value`; repeat for multi-valued properties
    #[arg(short = 's', long = "set", value_name = "NAME=VALUE")]
    pub values: Vec<String>,

    /// Reference as `name=instance`; repeat for reference lists
    #[arg(short = 'r', long = "ref", value_name = "NAME=INSTANCE")]
    pub refs: Vec<String>,

    /// JSON file holding one bean or an array of beans
    #[arg(short, long, conflicts_with_all = ["schema", "id", "values", "refs"])]
    pub file: Option<PathBuf>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the registered schemas
    Schemas {
        /// Only this schema
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Create beans that do not exist yet
    Create {
        #[command(flatten)]
        input: BeanInput,
    },

    /// Replace stored beans completely
    Set {
        #[command(flatten)]
        input: BeanInput,
    },

    /// Patch stored beans; fields not given are kept
    Merge {
        #[command(flatten)]
        input: BeanInput,

        /// Remove a property or reference
        #[arg(short, long, value_name = "NAME")]
        unset: Vec<String>,
    },

    /// Show one bean
    Get {
        /// Schema name
        schema: String,

        /// Instance id (omit for singletons)
        id: Option<String>,

        /// Resolve singleton references
        #[arg(short, long)]
        eager: bool,
    },

    /// Show every bean of a schema
    List {
        /// Schema name
        schema: String,
    },

    /// Delete beans of one schema
    Delete {
        /// Schema name
        schema: String,

        /// Instance ids
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Find beans matching restriction expressions (combined with AND)
    Query {
        /// Schema name
        schema: String,

        /// Restriction such as `port>8000`, `host~prod`, `zone in a,b`
        #[arg(short = 'w', long = "where", value_name = "EXPR")]
        restrictions: Vec<String>,

        /// Index of the first match to return
        #[arg(long, default_value = "0")]
        first: usize,

        /// Maximum number of beans to return
        #[arg(long)]
        max: Option<usize>,
    },

    /// Create the empty instance of a singleton schema unless it exists
    Singleton {
        /// Schema name
        schema: String,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI against effective settings.
pub fn execute(cli: Cli, settings: &Settings) -> Result<(), ConfstoreError> {
    let output = Output {
        json_mode: cli.json_mode,
        quiet: cli.quiet,
    };

    let Some(command) = cli.command else {
        return cmd_info(settings, output);
    };
    let store = open_store(settings)?;

    match command {
        Commands::Schemas { name } => cmd_schemas(&store, output, name.as_deref()),
        Commands::Create { input } => cmd_write(&store, output, WriteMode::Create, &input, &[]),
        Commands::Set { input } => cmd_write(&store, output, WriteMode::Set, &input, &[]),
        Commands::Merge { input, unset } => {
            cmd_write(&store, output, WriteMode::Merge, &input, &unset)
        }
        Commands::Get { schema, id, eager } => {
            cmd_get(&store, output, &schema, id.as_deref(), eager)
        }
        Commands::List { schema } => cmd_list(&store, output, &schema),
        Commands::Delete { schema, ids } => cmd_delete(&store, output, &schema, &ids),
        Commands::Query {
            schema,
            restrictions,
            first,
            max,
        } => cmd_query(&store, output, &schema, &restrictions, first, max),
        Commands::Singleton { schema } => cmd_singleton(&store, output, &schema),
    }
}
