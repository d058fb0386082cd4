//! Logical-replication publication builder
//!
//! The wire form of a PostgresPublication carries three optional selection
//! fields. They are validated once and turned into a closed [`TableSelection`]
//! from which CREATE and ALTER statements are rendered.

use thiserror::Error;

use crate::crd::{PostgresPublicationSpec, PublicationParameters, PublicationTable};
use crate::resources::sql::{quote_identifier, quote_literal, quote_qualified};

/// Server default for the `publish` parameter
pub const DEFAULT_PUBLISH: &str = "insert, update, delete, truncate";

/// Malformed publication spec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublicationSpecError {
    #[error("publication name is required")]
    MissingName,

    #[error("one of allTables, tablesInSchema or tables must be set")]
    NoSelection,

    #[error("only one of allTables, tablesInSchema or tables can be set")]
    MultipleSelections,

    #[error("tablesInSchema must not be empty")]
    EmptySchemaList,

    #[error("tablesInSchema must not contain an empty schema name")]
    EmptySchemaName,

    #[error("tables must not be empty")]
    EmptyTableList,

    #[error("table entries must have a tableName")]
    EmptyTableName,

    #[error("table {0} cannot have a column list when tablesInSchema is used")]
    ColumnsWithSchemaList(String),

    #[error("table {0} has an empty column list")]
    EmptyColumns(String),

    #[error("table {0} has an empty row filter")]
    EmptyRowFilter(String),
}

/// Which tables a publication covers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TableSelection {
    AllTables,
    TablesInSchema(Vec<String>),
    Tables(Vec<PublicationTable>),
}

impl TableSelection {
    pub fn is_all_tables(&self) -> bool {
        matches!(self, TableSelection::AllTables)
    }
}

impl TryFrom<&PostgresPublicationSpec> for TableSelection {
    type Error = PublicationSpecError;

    fn try_from(spec: &PostgresPublicationSpec) -> Result<Self, Self::Error> {
        let all_tables = spec.all_tables.unwrap_or(false);

        // Column lists cannot be published next to whole schemas
        if spec.tables_in_schema.is_some()
            && let Some(tables) = &spec.tables
            && let Some(table) = tables.iter().find(|t| t.columns.is_some())
        {
            return Err(PublicationSpecError::ColumnsWithSchemaList(
                table.table_name.clone(),
            ));
        }

        let selected = [
            all_tables,
            spec.tables_in_schema.is_some(),
            spec.tables.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();

        match selected {
            0 => return Err(PublicationSpecError::NoSelection),
            1 => {}
            _ => return Err(PublicationSpecError::MultipleSelections),
        }

        if all_tables {
            return Ok(TableSelection::AllTables);
        }

        if let Some(schemas) = &spec.tables_in_schema {
            if schemas.is_empty() {
                return Err(PublicationSpecError::EmptySchemaList);
            }
            if schemas.iter().any(|s| s.trim().is_empty()) {
                return Err(PublicationSpecError::EmptySchemaName);
            }
            return Ok(TableSelection::TablesInSchema(schemas.clone()));
        }

        let tables = spec.tables.clone().unwrap_or_default();
        if tables.is_empty() {
            return Err(PublicationSpecError::EmptyTableList);
        }
        for table in &tables {
            validate_table(table)?;
        }
        Ok(TableSelection::Tables(tables))
    }
}

fn validate_table(table: &PublicationTable) -> Result<(), PublicationSpecError> {
    if table.table_name.trim().is_empty() {
        return Err(PublicationSpecError::EmptyTableName);
    }
    if let Some(columns) = &table.columns
        && (columns.is_empty() || columns.iter().any(|c| c.trim().is_empty()))
    {
        return Err(PublicationSpecError::EmptyColumns(table.table_name.clone()));
    }
    if let Some(filter) = &table.additional_where
        && filter.trim().is_empty()
    {
        return Err(PublicationSpecError::EmptyRowFilter(
            table.table_name.clone(),
        ));
    }
    Ok(())
}

/// A validated publication
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicationDefinition {
    pub name: String,
    pub selection: TableSelection,
    pub parameters: PublicationParameters,
}

impl TryFrom<&PostgresPublicationSpec> for PublicationDefinition {
    type Error = PublicationSpecError;

    fn try_from(spec: &PostgresPublicationSpec) -> Result<Self, Self::Error> {
        if spec.name.trim().is_empty() {
            return Err(PublicationSpecError::MissingName);
        }
        Ok(Self {
            name: spec.name.clone(),
            selection: TableSelection::try_from(spec)?,
            parameters: spec.with_parameters.clone().unwrap_or_default(),
        })
    }
}

/// A rendered publication statement
///
/// The variant tells the engine what the statement does to the catalog so that
/// callers (and test doubles) need not parse SQL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublicationStatement {
    Create {
        name: String,
        all_tables: bool,
        sql: String,
    },
    Rename {
        from: String,
        to: String,
        sql: String,
    },
    Alter {
        name: String,
        sql: String,
    },
}

impl PublicationStatement {
    pub fn sql(&self) -> &str {
        match self {
            PublicationStatement::Create { sql, .. }
            | PublicationStatement::Rename { sql, .. }
            | PublicationStatement::Alter { sql, .. } => sql,
        }
    }
}

fn render_table(table: &PublicationTable) -> String {
    let mut rendered = quote_qualified(&table.table_name);
    if let Some(columns) = &table.columns {
        let columns: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
        rendered.push_str(&format!(" ({})", columns.join(", ")));
    }
    if let Some(filter) = &table.additional_where {
        rendered.push_str(&format!(" WHERE ({})", filter));
    }
    rendered
}

fn render_schemas(schemas: &[String]) -> String {
    schemas
        .iter()
        .map(|s| quote_identifier(s))
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_tables(tables: &[PublicationTable]) -> String {
    tables
        .iter()
        .map(render_table)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Build the CREATE PUBLICATION statement
pub fn build_create(definition: &PublicationDefinition) -> PublicationStatement {
    let name = &definition.name;
    let mut sql = format!("CREATE PUBLICATION {}", quote_identifier(name));

    match &definition.selection {
        TableSelection::AllTables => sql.push_str(" FOR ALL TABLES"),
        TableSelection::TablesInSchema(schemas) => {
            sql.push_str(&format!(" FOR TABLES IN SCHEMA {}", render_schemas(schemas)))
        }
        TableSelection::Tables(tables) => {
            sql.push_str(&format!(" FOR TABLE {}", render_tables(tables)))
        }
    }

    let mut options = Vec::new();
    if let Some(publish) = &definition.parameters.publish {
        options.push(format!("publish = {}", quote_literal(publish)));
    }
    if let Some(via_root) = definition.parameters.publish_via_partition_root {
        options.push(format!("publish_via_partition_root = {}", via_root));
    }
    if !options.is_empty() {
        sql.push_str(&format!(" WITH ({})", options.join(", ")));
    }

    PublicationStatement::Create {
        name: name.clone(),
        all_tables: definition.selection.is_all_tables(),
        sql,
    }
}

/// Build the statements bringing the publication currently named `current`
/// in line with `definition`
///
/// Parameters that are not set in the spec are reset to the server defaults.
pub fn build_alter(current: &str, definition: &PublicationDefinition) -> Vec<PublicationStatement> {
    let name = &definition.name;
    let quoted = quote_identifier(name);
    let mut statements = Vec::new();

    if current != name {
        statements.push(PublicationStatement::Rename {
            from: current.to_string(),
            to: name.clone(),
            sql: format!(
                "ALTER PUBLICATION {} RENAME TO {}",
                quote_identifier(current),
                quoted
            ),
        });
    }

    match &definition.selection {
        TableSelection::AllTables => {}
        TableSelection::TablesInSchema(schemas) => statements.push(PublicationStatement::Alter {
            name: name.clone(),
            sql: format!(
                "ALTER PUBLICATION {} SET TABLES IN SCHEMA {}",
                quoted,
                render_schemas(schemas)
            ),
        }),
        TableSelection::Tables(tables) => statements.push(PublicationStatement::Alter {
            name: name.clone(),
            sql: format!(
                "ALTER PUBLICATION {} SET TABLE {}",
                quoted,
                render_tables(tables)
            ),
        }),
    }

    let publish = definition
        .parameters
        .publish
        .as_deref()
        .unwrap_or(DEFAULT_PUBLISH);
    let via_root = definition
        .parameters
        .publish_via_partition_root
        .unwrap_or(false);
    statements.push(PublicationStatement::Alter {
        name: name.clone(),
        sql: format!(
            "ALTER PUBLICATION {} SET (publish = {}, publish_via_partition_root = {})",
            quoted,
            quote_literal(publish),
            via_root
        ),
    });

    statements
}
