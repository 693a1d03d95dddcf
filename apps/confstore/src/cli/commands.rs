//! # CLI Command Implementations

use super::BeanInput;
use crate::config::{Backend, SchemaFile, Settings, read_input};
use crate::expr::parse_all;
use confstore_core::{Bean, BeanId, ConfigStore, ConfstoreError, QueryResult};
use std::path::Path;

/// How results are printed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Output {
    pub json_mode: bool,
    pub quiet: bool,
}

impl Output {
    fn json(&self, value: &serde_json::Value) {
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
    }

    /// Confirmation line, dropped in quiet mode.
    fn note(&self, message: &str) {
        if !self.quiet {
            println!("{}", message);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Create,
    Set,
    Merge,
}

impl WriteMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Set => "set",
            Self::Merge => "merge",
        }
    }

    fn past_tense(self) -> &'static str {
        match self {
            Self::Create => "Created",
            Self::Set => "Replaced",
            Self::Merge => "Merged",
        }
    }
}

// =============================================================================
// STORE
// =============================================================================

/// Open the configured backend and register the schema file, if any.
pub fn open_store(settings: &Settings) -> Result<ConfigStore, ConfstoreError> {
    let store = match settings.backend {
        Backend::Redb => ConfigStore::open_redb(&settings.database)?,
        Backend::Memory => {
            tracing::warn!("memory backend selected, changes are discarded on exit");
            ConfigStore::in_memory()
        }
    };
    if let Some(path) = &settings.schemas {
        let file = SchemaFile::load(path)?;
        let count = file.schema.len();
        store.register_schemas(file.schema)?;
        tracing::debug!(count, path = %path.display(), "registered schemas");
    }
    Ok(store)
}

// =============================================================================
// INFO COMMAND
// =============================================================================

/// Show the effective settings.
pub fn cmd_info(settings: &Settings, output: Output) -> Result<(), ConfstoreError> {
    if output.json_mode {
        output.json(&serde_json::json!({
            "database": settings.database.to_string_lossy(),
            "backend": settings.backend.to_string(),
            "schemas": settings.schemas.as_ref().map(|p| p.to_string_lossy().to_string()),
            "version": env!("CARGO_PKG_VERSION"),
        }));
        return Ok(());
    }

    println!("confstore {}", env!("CARGO_PKG_VERSION"));
    println!("========={}", "=".repeat(env!("CARGO_PKG_VERSION").len() + 1));
    println!("Database: {}", settings.database.display());
    println!("Backend:  {}", settings.backend);
    match &settings.schemas {
        Some(path) => println!("Schemas:  {}", path.display()),
        None => println!("Schemas:  (none)"),
    }
    println!();
    println!("Run `confstore --help` for the available commands.");
    Ok(())
}

// =============================================================================
// SCHEMAS COMMAND
// =============================================================================

pub fn cmd_schemas(
    store: &ConfigStore,
    output: Output,
    name: Option<&str>,
) -> Result<(), ConfstoreError> {
    let schemas = match name {
        Some(name) => vec![store.schema(name)?],
        None => store.schemas().all(),
    };

    if output.json_mode {
        let list: Vec<serde_json::Value> = schemas
            .iter()
            .map(|s| serde_json::to_value(s.as_ref()).unwrap_or_default())
            .collect();
        output.json(&serde_json::Value::Array(list));
        return Ok(());
    }

    if schemas.is_empty() {
        println!("No schemas registered (use --schemas or the `schemas` setting).");
        return Ok(());
    }
    for schema in schemas {
        let kind = if schema.singleton { " (singleton)" } else { "" };
        println!("{}{}", schema.name, kind);
        for property in &schema.properties {
            let mut flags = Vec::new();
            if property.id {
                flags.push("id");
            }
            if property.indexed {
                flags.push("indexed");
            }
            if property.immutable {
                flags.push("immutable");
            }
            let shape = match (property.target_schema(), property.collection_kind()) {
                (Some(target), _) if property.is_multi_valued() => format!("[-> {}]", target),
                (Some(target), _) => format!("-> {}", target),
                (None, Some(collection)) => {
                    format!("{:?}<{}>", collection, property.value_type()).to_lowercase()
                }
                (None, None) => property.value_type().to_string(),
            };
            if flags.is_empty() {
                println!("  {:<20} {}", property.name, shape);
            } else {
                println!("  {:<20} {} [{}]", property.name, shape, flags.join(", "));
            }
        }
    }
    Ok(())
}

// =============================================================================
// WRITE COMMANDS
// =============================================================================

/// Build beans from command-line values or a JSON file.
pub fn build_beans(
    store: &ConfigStore,
    input: &BeanInput,
    unset: &[String],
) -> Result<Vec<Bean>, ConfstoreError> {
    let mut beans = match &input.file {
        Some(path) => read_bean_file(path)?,
        None => vec![bean_from_args(store, input)?],
    };
    for bean in &mut beans {
        let schema = store.schema(bean.schema_name())?;
        for name in unset {
            if schema.is_reference(name) {
                bean.set_references(name.clone(), Vec::new());
            } else if schema.is_property(name) {
                bean.set_property(name.clone(), Vec::new());
            } else {
                return Err(ConfstoreError::PropertyNotInSchema {
                    schema: schema.name.clone(),
                    property: name.clone(),
                });
            }
        }
    }
    Ok(beans)
}

fn read_bean_file(path: &Path) -> Result<Vec<Bean>, ConfstoreError> {
    let text = read_input(path)?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| ConfstoreError::Serialization(format!("Invalid bean file: {}", e)))?;
    let parsed = if value.is_array() {
        serde_json::from_value::<Vec<Bean>>(value)
    } else {
        serde_json::from_value::<Bean>(value).map(|bean| vec![bean])
    };
    parsed.map_err(|e| ConfstoreError::Serialization(format!("Invalid bean file: {}", e)))
}

fn split_assignment(raw: &str) -> Result<(&str, &str), ConfstoreError> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim(), value))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| ConfstoreError::InvalidData(format!("Expected NAME=VALUE, got '{}'", raw)))
}

fn bean_from_args(store: &ConfigStore, input: &BeanInput) -> Result<Bean, ConfstoreError> {
    let schema_name = input
        .schema
        .as_deref()
        .ok_or_else(|| ConfstoreError::InvalidData("Missing schema name or --file".to_string()))?;
    let schema = store.schema(schema_name)?;
    let id = match (&input.id, schema.singleton) {
        (Some(id), _) => BeanId::new(schema_name, id.as_str()),
        (None, true) => BeanId::singleton(schema_name),
        (None, false) => {
            return Err(ConfstoreError::InvalidData(format!(
                "Schema '{}' needs an instance id",
                schema_name
            )));
        }
    };

    let mut bean = Bean::new(id);
    for raw in &input.values {
        let (name, value) = split_assignment(raw)?;
        bean.add_property(name, value);
    }
    for raw in &input.refs {
        let (name, instance) = split_assignment(raw)?;
        let target = schema.reference_schema(name).ok_or_else(|| {
            ConfstoreError::ReferenceNotInSchema {
                schema: schema.name.clone(),
                reference: name.to_string(),
            }
        })?;
        bean.add_reference(name, BeanId::new(target, instance));
    }
    Ok(bean)
}

pub fn cmd_write(
    store: &ConfigStore,
    output: Output,
    mode: WriteMode,
    input: &BeanInput,
    unset: &[String],
) -> Result<(), ConfstoreError> {
    let beans = build_beans(store, input, unset)?;
    let ids: Vec<BeanId> = beans.iter().map(|b| b.id().detached()).collect();
    tracing::info!(operation = mode.as_str(), count = ids.len(), "writing beans");

    match mode {
        WriteMode::Create => store.create_all(beans)?,
        WriteMode::Set => store.set_all(beans)?,
        WriteMode::Merge => store.merge_all(beans)?,
    }

    if output.json_mode {
        output.json(&serde_json::json!({
            "operation": mode.as_str(),
            "count": ids.len(),
            "beans": ids.iter().map(ToString::to_string).collect::<Vec<_>>(),
        }));
        return Ok(());
    }
    for id in &ids {
        output.note(&format!("{} {}", mode.past_tense(), id));
    }
    Ok(())
}

pub fn cmd_singleton(
    store: &ConfigStore,
    output: Output,
    schema: &str,
) -> Result<(), ConfstoreError> {
    let created = store.create_singleton(schema)?;
    if output.json_mode {
        output.json(&serde_json::json!({ "schema": schema, "created": created }));
    } else if created {
        output.note(&format!("Created {}", BeanId::singleton(schema)));
    } else {
        output.note(&format!("{} already exists", BeanId::singleton(schema)));
    }
    Ok(())
}

pub fn cmd_delete(
    store: &ConfigStore,
    output: Output,
    schema: &str,
    ids: &[String],
) -> Result<(), ConfstoreError> {
    let removed = store.delete_all(schema, ids)?;
    if output.json_mode {
        output.json(&serde_json::json!({
            "operation": "delete",
            "count": removed.len(),
            "beans": removed.iter().map(|b| b.id().to_string()).collect::<Vec<_>>(),
        }));
        return Ok(());
    }
    for bean in &removed {
        output.note(&format!("Deleted {}", bean.id()));
    }
    Ok(())
}

// =============================================================================
// READ COMMANDS
// =============================================================================

pub fn cmd_get(
    store: &ConfigStore,
    output: Output,
    schema: &str,
    id: Option<&str>,
    eager: bool,
) -> Result<(), ConfstoreError> {
    let definition = store.schema(schema)?;
    let id = match id {
        Some(id) => BeanId::new(schema, id),
        None if definition.singleton => BeanId::singleton(schema),
        None => {
            return Err(ConfstoreError::InvalidData(format!(
                "Schema '{}' needs an instance id",
                schema
            )));
        }
    };
    let bean = if eager {
        store.get_eager(&id)?
    } else {
        store.get(&id)?
    };
    let bean = bean.ok_or(ConfstoreError::BeanNotFound(id))?;

    if output.json_mode {
        output.json(&bean_json(&bean));
    } else {
        print_bean(&bean);
    }
    Ok(())
}

pub fn cmd_list(store: &ConfigStore, output: Output, schema: &str) -> Result<(), ConfstoreError> {
    let beans = store.list(schema)?;
    if output.json_mode {
        output.json(&serde_json::Value::Array(beans.iter().map(bean_json).collect()));
        return Ok(());
    }
    if beans.is_empty() {
        println!("No beans of schema '{}'", schema);
    }
    for bean in &beans {
        print_bean(bean);
    }
    Ok(())
}

pub fn cmd_query(
    store: &ConfigStore,
    output: Output,
    schema: &str,
    expressions: &[String],
    first: usize,
    max: Option<usize>,
) -> Result<(), ConfstoreError> {
    let restrictions = parse_all(expressions)?;
    let mut query = store.query(schema)?.set_first_result(first);
    if let Some(max) = max {
        query = query.set_max_results(max);
    }
    for restriction in restrictions {
        query = query.add(restriction);
    }
    tracing::debug!(restriction = %query.spec().restriction(), "running query");
    let result = query.retrieve()?;
    print_query_result(&result, output);
    Ok(())
}

fn print_query_result(result: &QueryResult, output: Output) {
    if output.json_mode {
        output.json(&serde_json::json!({
            "count": result.len(),
            "next_first_result": result.next_first_result().offset(),
            "beans": result.beans().iter().map(bean_json).collect::<Vec<_>>(),
        }));
        return;
    }
    for bean in result.beans() {
        print_bean(bean);
    }
    output.note(&format!(
        "{} bean(s), next page starts at {}",
        result.len(),
        result.next_first_result()
    ));
}

// =============================================================================
// RENDERING
// =============================================================================

/// JSON form of a bean, with resolved references expanded inline.
pub fn bean_json(bean: &Bean) -> serde_json::Value {
    let properties: serde_json::Map<String, serde_json::Value> = bean
        .properties()
        .iter()
        .map(|(name, values)| (name.clone(), serde_json::json!(values)))
        .collect();
    let references: serde_json::Map<String, serde_json::Value> = bean
        .reference_map()
        .iter()
        .map(|(name, targets)| {
            let targets: Vec<serde_json::Value> = targets
                .iter()
                .map(|target| match target.bean() {
                    Some(resolved) => bean_json(resolved),
                    None => serde_json::json!(target.to_string()),
                })
                .collect();
            (name.clone(), serde_json::Value::Array(targets))
        })
        .collect();
    serde_json::json!({
        "schema": bean.schema_name(),
        "id": bean.instance_id(),
        "default": bean.is_default(),
        "properties": properties,
        "references": references,
    })
}

fn print_bean(bean: &Bean) {
    let marker = if bean.is_default() { " (default)" } else { "" };
    println!("{}{}", bean.id(), marker);
    print_fields(bean, 1);
}

fn print_fields(bean: &Bean, depth: usize) {
    let indent = "  ".repeat(depth);
    for (name, values) in bean.properties() {
        match values.as_slice() {
            [single] => println!("{}{} = {}", indent, name, single),
            many => println!("{}{} = [{}]", indent, name, many.join(", ")),
        }
    }
    for (name, targets) in bean.reference_map() {
        for target in targets {
            println!("{}{} -> {}", indent, name, target);
            if let Some(resolved) = target.bean() {
                print_fields(resolved, depth + 1);
            }
        }
    }
}
