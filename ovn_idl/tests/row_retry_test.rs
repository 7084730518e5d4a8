//! Waiting for rows that have not reached the mirror yet.

mod common;

use std::time::{Duration, Instant};

use common::{nb_fixture, nb_idl};
use ovn_idl::{IdlError, Value};

#[tokio::test]
async fn test_row_check_survives_propagation_lag() {
    let (engine, server) = nb_fixture();
    let writer = nb_idl(&engine, None).await;
    let reader = nb_idl(&engine, None).await;
    server.set_propagation_delay(Duration::from_millis(100));

    let (written, found) = tokio::join!(
        writer.transaction(false, |txn| {
            txn.insert("Logical_Switch", [("name", Value::from("neutron-net1"))])?;
            Ok(())
        }),
        reader
            .backend()
            .check_for_row_by_value_and_retry("Logical_Switch", "name", "neutron-net1"),
    );
    assert!(written.unwrap().is_committed());
    let found = found.unwrap();
    assert_eq!(found.get_str("name"), Some("neutron-net1"));
    assert_eq!(server.row("Logical_Switch", &found.uuid()).unwrap().revision, found.revision());
}

#[tokio::test]
async fn test_row_check_gives_up_after_budget() {
    let (engine, _server) = nb_fixture();
    let nb = nb_idl(&engine, None).await;

    let start = Instant::now();
    let err = nb
        .backend()
        .check_for_row_by_value_and_retry("Logical_Switch", "name", "neutron-never")
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(err.is_row_not_found());
    assert_eq!(
        err.to_string(),
        "neutron-never does not exist in name of Logical_Switch"
    );
    assert!(elapsed >= Duration::from_millis(400), "gave up after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
}

#[tokio::test]
async fn test_row_check_on_unregistered_table() {
    let (engine, _server) = nb_fixture();
    let nb = nb_idl(&engine, None).await;

    let err = nb
        .backend()
        .check_for_row_by_value_and_retry("ACL", "action", "drop")
        .await
        .unwrap_err();
    assert!(matches!(err, IdlError::TableNotFound(_)));
}

#[tokio::test]
async fn test_presence_checks() {
    let (engine, _server) = nb_fixture();
    let nb = nb_idl(&engine, None).await;
    let backend = nb.backend();

    assert!(backend.is_table_present("Load_Balancer"));
    assert!(backend.is_table_present("NB_Global"));
    // In the server schema, but never registered.
    assert!(!backend.is_table_present("ACL"));
    // Registered, but unknown to this server.
    assert!(!backend.is_table_present("HA_Chassis_Group"));

    assert!(backend.is_col_present("Load_Balancer", "ip_port_mappings"));
    assert!(!backend.is_col_present("Load_Balancer", "selection_fields"));
    for column in ["x", "name", ""] {
        assert!(!backend.is_col_present("NoSuchTable", column));
    }
}
