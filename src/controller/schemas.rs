//! Schemas and extensions of a database
//!
//! Both lists are diffed against what the previous pass tracked in status.
//! Items that left the desired list are dropped only when `dropOnRemove` is
//! set; otherwise they are merely forgotten.

use tracing::{debug, info};

use crate::controller::error::Result;
use crate::crd::{DatabaseModulesList, DatabaseRoles};
use crate::resources::PgEngine;
use crate::resources::sql::SchemaAccess;

/// Items tracked by the previous pass that are no longer desired
pub fn removed_items(tracked: &[String], desired: &[String]) -> Vec<String> {
    tracked
        .iter()
        .filter(|item| !desired.contains(item))
        .cloned()
        .collect()
}

fn track(tracked: &mut Vec<String>, item: &str) {
    if !tracked.iter().any(|t| t == item) {
        tracked.push(item.to_string());
    }
}

/// Sync schemas; returns the new tracked list
pub async fn sync_schemas(
    engine: &dyn PgEngine,
    modules: &DatabaseModulesList,
    tracked: &[String],
    roles: &DatabaseRoles,
) -> Result<Vec<String>> {
    let removed = removed_items(tracked, &modules.list);
    let mut result: Vec<String> = tracked
        .iter()
        .filter(|t| !removed.contains(t))
        .cloned()
        .collect();

    for schema in &removed {
        if modules.drop_on_remove {
            info!(schema = %schema, cascade = modules.delete_with_cascade, "Dropping schema");
            engine
                .drop_schema(schema, modules.delete_with_cascade)
                .await?;
        } else {
            debug!(schema = %schema, "Forgetting schema");
        }
    }

    for schema in &modules.list {
        if !engine.schema_exists(schema).await? {
            info!(schema = %schema, "Creating schema");
            engine.create_schema(schema, &roles.owner).await?;
            track(&mut result, schema);
        }

        engine
            .grant_schema_privileges(schema, &roles.owner, &roles.reader, SchemaAccess::Read)
            .await?;
        engine
            .grant_schema_privileges(schema, &roles.owner, &roles.writer, SchemaAccess::ReadWrite)
            .await?;

        for object in engine.foreign_owned_objects(schema, &roles.owner).await? {
            debug!(schema = %schema, object = %object.name, "Reassigning object owner");
            engine.alter_object_owner(&object, &roles.owner).await?;
        }
    }

    Ok(result)
}

/// Sync extensions; returns the new tracked list
pub async fn sync_extensions(
    engine: &dyn PgEngine,
    modules: &DatabaseModulesList,
    tracked: &[String],
) -> Result<Vec<String>> {
    let removed = removed_items(tracked, &modules.list);
    let mut result: Vec<String> = tracked
        .iter()
        .filter(|t| !removed.contains(t))
        .cloned()
        .collect();

    for extension in &removed {
        if modules.drop_on_remove {
            info!(extension = %extension, cascade = modules.delete_with_cascade, "Dropping extension");
            engine
                .drop_extension(extension, modules.delete_with_cascade)
                .await?;
        }
    }

    for extension in &modules.list {
        if !engine.extension_exists(extension).await? {
            info!(extension = %extension, "Creating extension");
            engine.create_extension(extension).await?;
            track(&mut result, extension);
        }
    }

    Ok(result)
}
