//! SQL statement builders
//!
//! Every DDL statement the operator issues is rendered here. Identifiers are
//! always double-quoted and string literals single-quote escaped, so values
//! coming from resource specs can never break out of their position.

use rand::Rng;
use thiserror::Error;

use crate::crd::RoleAttributes;

/// PostgreSQL's maximum identifier length in bytes (NAMEDATALEN - 1)
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Length of generated passwords
pub const PASSWORD_LENGTH: usize = 32;

/// Identifier rejected before it reaches the server
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("{kind} name must not be empty")]
    Empty { kind: &'static str },

    #[error("{kind} name {name:?} is {len} bytes long, the limit is {MAX_IDENTIFIER_LENGTH}")]
    TooLong {
        kind: &'static str,
        name: String,
        len: usize,
    },
}

/// Check a generated identifier against PostgreSQL's limits
///
/// The server silently truncates long identifiers, which would make two
/// different resources collide on the same physical object.
pub fn validate_identifier(kind: &'static str, name: &str) -> Result<(), IdentifierError> {
    if name.is_empty() {
        return Err(IdentifierError::Empty { kind });
    }
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(IdentifierError::TooLong {
            kind,
            name: name.to_string(),
            len: name.len(),
        });
    }
    Ok(())
}

/// Quote a SQL identifier (table name, column name, etc.)
///
/// - `my_table` -> `"my_table"`
/// - `table"name` -> `"table""name"`
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified name (`schema.table`)
pub fn quote_qualified(name: &str) -> String {
    match name.split_once('.') {
        Some((schema, object)) => {
            format!("{}.{}", quote_identifier(schema), quote_identifier(object))
        }
        None => quote_identifier(name),
    }
}

/// Escape a SQL string literal by doubling single quotes
pub fn escape_sql_string(s: &str) -> String {
    s.replace('\'', "''")
}

/// Render a single-quoted string literal
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", escape_sql_string(s))
}

/// Generate a random alphanumeric password
pub fn generate_password() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

    let mut rng = rand::rng();
    (0..PASSWORD_LENGTH)
        .filter_map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET.get(idx).map(|&c| c as char)
        })
        .collect()
}

// =============================================================================
// Roles
// =============================================================================

/// Access level granted on a schema
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SchemaAccess {
    /// USAGE plus SELECT on tables
    Read,
    /// USAGE plus DML on tables and sequences
    ReadWrite,
}

pub fn create_group_role(role: &str) -> String {
    format!("CREATE ROLE {} NOLOGIN", quote_identifier(role))
}

fn role_attributes_clause(attributes: &RoleAttributes) -> String {
    let mut clause = String::new();
    if let Some(limit) = attributes.connection_limit {
        clause.push_str(&format!(" CONNECTION LIMIT {}", limit));
    }
    clause.push_str(if attributes.replication {
        " REPLICATION"
    } else {
        " NOREPLICATION"
    });
    clause.push_str(if attributes.bypass_rls {
        " BYPASSRLS"
    } else {
        " NOBYPASSRLS"
    });
    clause
}

pub fn create_login_role(role: &str, password: &str, attributes: &RoleAttributes) -> String {
    format!(
        "CREATE ROLE {} WITH LOGIN PASSWORD {}{}",
        quote_identifier(role),
        quote_literal(password),
        role_attributes_clause(attributes)
    )
}

pub fn alter_login_role(role: &str, password: &str, attributes: &RoleAttributes) -> String {
    format!(
        "ALTER ROLE {} WITH LOGIN PASSWORD {}{}",
        quote_identifier(role),
        quote_literal(password),
        role_attributes_clause(attributes)
    )
}

pub fn rename_role(from: &str, to: &str) -> String {
    format!(
        "ALTER ROLE {} RENAME TO {}",
        quote_identifier(from),
        quote_identifier(to)
    )
}

pub fn grant_role(group: &str, member: &str, with_admin: bool) -> String {
    let mut sql = format!(
        "GRANT {} TO {}",
        quote_identifier(group),
        quote_identifier(member)
    );
    if with_admin {
        sql.push_str(" WITH ADMIN OPTION");
    }
    sql
}

pub fn revoke_role(group: &str, member: &str) -> String {
    format!(
        "REVOKE {} FROM {}",
        quote_identifier(group),
        quote_identifier(member)
    )
}

/// Make `role` switch to `group` on connect to `database`
pub fn set_role_in_database(role: &str, database: &str, group: &str) -> String {
    format!(
        "ALTER ROLE {} IN DATABASE {} SET role TO {}",
        quote_identifier(role),
        quote_identifier(database),
        quote_identifier(group)
    )
}

pub fn reset_role_in_database(role: &str, database: &str) -> String {
    format!(
        "ALTER ROLE {} IN DATABASE {} RESET role",
        quote_identifier(role),
        quote_identifier(database)
    )
}

pub fn drop_role(role: &str) -> String {
    format!("DROP ROLE IF EXISTS {}", quote_identifier(role))
}

// =============================================================================
// Databases
// =============================================================================

pub fn create_database(database: &str, owner: &str) -> String {
    format!(
        "CREATE DATABASE {} OWNER {}",
        quote_identifier(database),
        quote_identifier(owner)
    )
}

pub fn rename_database(from: &str, to: &str) -> String {
    format!(
        "ALTER DATABASE {} RENAME TO {}",
        quote_identifier(from),
        quote_identifier(to)
    )
}

pub fn alter_database_owner(database: &str, owner: &str) -> String {
    format!(
        "ALTER DATABASE {} OWNER TO {}",
        quote_identifier(database),
        quote_identifier(owner)
    )
}

pub fn grant_database_connect(database: &str, role: &str) -> String {
    format!(
        "GRANT CONNECT ON DATABASE {} TO {}",
        quote_identifier(database),
        quote_identifier(role)
    )
}

pub fn drop_database(database: &str) -> String {
    format!("DROP DATABASE IF EXISTS {}", quote_identifier(database))
}

// =============================================================================
// Schemas and extensions
// =============================================================================

pub fn create_schema(schema: &str, owner: &str) -> String {
    format!(
        "CREATE SCHEMA IF NOT EXISTS {} AUTHORIZATION {}",
        quote_identifier(schema),
        quote_identifier(owner)
    )
}

fn cascade_clause(cascade: bool) -> &'static str {
    if cascade { " CASCADE" } else { "" }
}

pub fn drop_schema(schema: &str, cascade: bool) -> String {
    format!(
        "DROP SCHEMA IF EXISTS {}{}",
        quote_identifier(schema),
        cascade_clause(cascade)
    )
}

/// Statements granting `access` on `schema` to `role`, including default
/// privileges for objects `owner` creates later
pub fn grant_schema_privileges(
    schema: &str,
    owner: &str,
    role: &str,
    access: SchemaAccess,
) -> Vec<String> {
    let schema = quote_identifier(schema);
    let owner = quote_identifier(owner);
    let role = quote_identifier(role);

    let table_privileges = match access {
        SchemaAccess::Read => "SELECT",
        SchemaAccess::ReadWrite => "SELECT, INSERT, UPDATE, DELETE",
    };

    let mut statements = vec![
        format!("GRANT USAGE ON SCHEMA {schema} TO {role}"),
        format!("GRANT {table_privileges} ON ALL TABLES IN SCHEMA {schema} TO {role}"),
        format!(
            "ALTER DEFAULT PRIVILEGES FOR ROLE {owner} IN SCHEMA {schema} GRANT {table_privileges} ON TABLES TO {role}"
        ),
    ];

    if access == SchemaAccess::ReadWrite {
        statements.push(format!(
            "GRANT USAGE, SELECT ON ALL SEQUENCES IN SCHEMA {schema} TO {role}"
        ));
        statements.push(format!(
            "ALTER DEFAULT PRIVILEGES FOR ROLE {owner} IN SCHEMA {schema} GRANT USAGE, SELECT ON SEQUENCES TO {role}"
        ));
    }

    statements
}

/// Kind of a schema object subject to re-ownership
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Table,
    Type,
}

/// A table or user-defined type inside a schema
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaObject {
    pub kind: ObjectKind,
    pub schema: String,
    pub name: String,
}

pub fn alter_object_owner(object: &SchemaObject, owner: &str) -> String {
    let keyword = match object.kind {
        ObjectKind::Table => "TABLE",
        ObjectKind::Type => "TYPE",
    };
    format!(
        "ALTER {} {}.{} OWNER TO {}",
        keyword,
        quote_identifier(&object.schema),
        quote_identifier(&object.name),
        quote_identifier(owner)
    )
}

pub fn create_extension(extension: &str) -> String {
    format!(
        "CREATE EXTENSION IF NOT EXISTS {}",
        quote_identifier(extension)
    )
}

pub fn drop_extension(extension: &str, cascade: bool) -> String {
    format!(
        "DROP EXTENSION IF EXISTS {}{}",
        quote_identifier(extension),
        cascade_clause(cascade)
    )
}

// =============================================================================
// Publications
// =============================================================================

pub fn drop_publication(name: &str) -> String {
    format!("DROP PUBLICATION IF EXISTS {}", quote_identifier(name))
}
