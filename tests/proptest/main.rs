// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for naming, validation and lifecycle rules
//!
//! These tests use proptest to generate random inputs and verify that:
//! 1. Identifier validation accepts exactly the names PostgreSQL keeps intact
//! 2. Publication table selection accepts exactly one selector
//! 3. Quoting is reversible and login names alternate
//! 4. The phase lifecycle never rejects a reconcile outcome

use std::collections::BTreeMap;

use proptest::prelude::*;

use postgres_provisioner::controller::rotation::{login_name, next_login};
use postgres_provisioner::controller::schemas::removed_items;
use postgres_provisioner::controller::state_machine::{LifecycleEvent, LifecyclePhase, next_phase};
use postgres_provisioner::crd::{
    DatabasePhase, PostgresPublicationSpec, PublicationPhase, PublicationTable, ResourceRef,
};
use postgres_provisioner::resources::publication::{PublicationSpecError, TableSelection};
use postgres_provisioner::resources::secret::connection_args;
use postgres_provisioner::resources::sql::{
    MAX_IDENTIFIER_LENGTH, quote_identifier, validate_identifier,
};

// =============================================================================
// Helpers
// =============================================================================

fn publication_spec(
    all_tables: Option<bool>,
    tables_in_schema: Option<Vec<String>>,
    tables: Option<Vec<PublicationTable>>,
) -> PostgresPublicationSpec {
    PostgresPublicationSpec {
        name: "orders_pub".to_string(),
        database: ResourceRef::new("orders"),
        drop_on_delete: false,
        all_tables,
        tables_in_schema,
        tables,
        with_parameters: None,
        replication_slot_name: None,
        replication_slot_plugin: None,
    }
}

// =============================================================================
// Strategies
// =============================================================================

/// Identifier within the server limit
fn valid_identifier() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_-]{0,62}"
}

/// Identifier the server would truncate
fn overlong_identifier() -> impl Strategy<Value = String> {
    (MAX_IDENTIFIER_LENGTH + 1..=200).prop_map(|len| "x".repeat(len))
}

fn schema_list() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z]{1,12}", 1..5)
}

fn table() -> impl Strategy<Value = PublicationTable> {
    (
        "[a-z]{1,8}(\\.[a-z]{1,8})?",
        prop::option::of(prop::collection::vec("[a-z]{1,8}", 1..4)),
        prop::option::of("[a-z]{1,8} > [0-9]{1,3}"),
    )
        .prop_map(|(table_name, columns, additional_where)| PublicationTable {
            table_name,
            columns,
            additional_where,
        })
}

fn table_list() -> impl Strategy<Value = Vec<PublicationTable>> {
    prop::collection::vec(table(), 1..5)
}

fn lifecycle_event() -> impl Strategy<Value = LifecycleEvent> {
    prop_oneof![
        Just(LifecycleEvent::ReconcileSucceeded),
        Just(LifecycleEvent::ReconcileFailed),
    ]
}

// =============================================================================
// Property tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_valid_identifiers_accepted(name in valid_identifier()) {
        prop_assert!(validate_identifier("role", &name).is_ok());
    }

    #[test]
    fn prop_overlong_identifiers_rejected(name in overlong_identifier()) {
        let err = validate_identifier("role", &name).unwrap_err();
        let expected = format!("{} bytes", name.len());
        prop_assert!(err.to_string().contains(&expected));
    }

    #[test]
    fn prop_quote_identifier_is_reversible(name in "[a-zA-Z0-9_\"-]{1,40}") {
        let quoted = quote_identifier(&name);
        prop_assert!(quoted.starts_with('"') && quoted.ends_with('"'));
        let inner = &quoted[1..quoted.len() - 1];
        prop_assert_eq!(inner.replace("\"\"", "\""), name);
    }

    #[test]
    fn prop_login_names_alternate(prefix in "[a-z]{1,20}") {
        let a = login_name(&prefix, "A");
        let b = next_login(&prefix, &a);
        prop_assert_eq!(&b, &login_name(&prefix, "B"));
        prop_assert_eq!(next_login(&prefix, &b), a);
    }

    #[test]
    fn prop_single_selector_accepted(
        choice in 0..3usize,
        schemas in schema_list(),
        tables in table_list(),
    ) {
        let spec = match choice {
            0 => publication_spec(Some(true), None, None),
            1 => publication_spec(None, Some(schemas), None),
            _ => publication_spec(None, None, Some(tables)),
        };
        let selection = TableSelection::try_from(&spec).unwrap();
        prop_assert_eq!(selection.is_all_tables(), choice == 0);
    }

    #[test]
    fn prop_multiple_selectors_rejected(
        schemas in schema_list(),
        tables in table_list(),
        all_tables in any::<bool>(),
    ) {
        let tables: Vec<PublicationTable> = tables
            .into_iter()
            .map(|t| PublicationTable { columns: None, ..t })
            .collect();
        let spec = publication_spec(Some(all_tables), Some(schemas), Some(tables));
        prop_assert_eq!(
            TableSelection::try_from(&spec),
            Err(PublicationSpecError::MultipleSelections)
        );
    }

    #[test]
    fn prop_columns_next_to_schemas_rejected(
        schemas in schema_list(),
        name in "[a-z]{1,8}",
        columns in prop::collection::vec("[a-z]{1,8}", 1..4),
    ) {
        let table = PublicationTable {
            table_name: name.clone(),
            columns: Some(columns),
            additional_where: None,
        };
        let spec = publication_spec(None, Some(schemas), Some(vec![table]));
        prop_assert_eq!(
            TableSelection::try_from(&spec),
            Err(PublicationSpecError::ColumnsWithSchemaList(name))
        );
    }

    #[test]
    fn prop_removed_items_are_tracked_and_undesired(
        tracked in prop::collection::vec("[a-d]", 0..8),
        desired in prop::collection::vec("[a-d]", 0..8),
    ) {
        for item in removed_items(&tracked, &desired) {
            prop_assert!(tracked.contains(&item));
            prop_assert!(!desired.contains(&item));
        }
    }

    #[test]
    fn prop_connection_args_keep_every_parameter(
        base in prop::collection::vec("[a-z]{1,6}=[a-z0-9]{1,6}", 0..4),
        extra in prop::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{1,6}", 0..4),
    ) {
        let args = connection_args(&base.join("&"), &extra);
        let parts: Vec<&str> = args.split('&').filter(|p| !p.is_empty()).collect();
        prop_assert_eq!(parts.len(), base.len() + extra.len());
        for (k, v) in &extra {
            let pair = format!("{}={}", k, v);
            prop_assert!(parts.contains(&pair.as_str()));
        }
    }

    #[test]
    fn prop_lifecycle_accepts_every_outcome(events in prop::collection::vec(lifecycle_event(), 1..20)) {
        let mut database = DatabasePhase::default();
        let mut publication = PublicationPhase::default();
        for event in events {
            database = next_phase(database, event).unwrap();
            publication = next_phase(publication, event).unwrap();
            let expected = match event {
                LifecycleEvent::ReconcileSucceeded => DatabasePhase::ready(),
                LifecycleEvent::ReconcileFailed => DatabasePhase::failed(),
            };
            prop_assert_eq!(database, expected);
        }
    }
}

#[test]
fn test_empty_extra_parameters_keep_base() {
    assert_eq!(connection_args("sslmode=disable", &BTreeMap::new()), "sslmode=disable");
}
