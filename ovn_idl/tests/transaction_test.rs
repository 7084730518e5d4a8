//! Transaction outcomes under concurrent writers.

mod common;

use common::{nb_cfg, nb_fixture, nb_idl};
use ovn_idl::{IdlError, RowView, Transaction, TxnOutcome, Value};
use tokio::task::JoinSet;
use uuid::Uuid;

const LB_TABLE: &str = "Load_Balancer";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disjoint_transactions_all_commit() {
    let (engine, server) = nb_fixture();
    let nb = nb_idl(&engine, None).await;

    let mut lbs = Vec::new();
    for i in 0..8 {
        let mut lb = Uuid::nil();
        let outcome = nb
            .transaction(false, |txn| {
                lb = txn.insert(LB_TABLE, [("name", Value::from(format!("lb-{i}")))])?;
                Ok(())
            })
            .await
            .unwrap();
        assert!(outcome.is_committed());
        lbs.push(lb);
    }

    let mut tasks = JoinSet::new();
    for (i, lb) in lbs.iter().copied().enumerate() {
        let nb = nb.clone();
        tasks.spawn(async move {
            let row = nb.backend().lookup(LB_TABLE, &lb).unwrap();
            nb.transaction(false, |txn| {
                txn.verify(LB_TABLE, &row)?;
                txn.set_key(LB_TABLE, lb, "external_ids", "neutron:member", format!("m{i}"))
            })
            .await
        });
    }

    let mut committed = 0;
    while let Some(result) = tasks.join_next().await {
        assert_eq!(result.unwrap().unwrap(), TxnOutcome::Committed);
        committed += 1;
    }
    assert_eq!(committed, 8);
    for lb in &lbs {
        assert!(server
            .row(LB_TABLE, lb)
            .unwrap()
            .map_entry("external_ids", "neutron:member")
            .is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_same_row_conflict_has_one_winner() {
    let (engine, server) = nb_fixture();
    let first = nb_idl(&engine, None).await;
    let second = nb_idl(&engine, None).await;

    let lb = server
        .insert_row(LB_TABLE, [("name", Value::from("lb-shared"))])
        .unwrap();
    let seen_first = first
        .backend()
        .check_for_row_by_value_and_retry(LB_TABLE, "name", "lb-shared")
        .await
        .unwrap();
    let seen_second = second
        .backend()
        .check_for_row_by_value_and_retry(LB_TABLE, "name", "lb-shared")
        .await
        .unwrap();
    assert_eq!(seen_first.revision(), seen_second.revision());

    let rename = |view: RowView, name: &'static str| {
        move |txn: &mut Transaction| {
            txn.verify(LB_TABLE, &view)?;
            txn.update(LB_TABLE, view.uuid(), [("name", Value::from(name))])
        }
    };
    let (a, b) = tokio::join!(
        first.transaction(false, rename(seen_first, "lb-first")),
        second.transaction(false, rename(seen_second, "lb-second")),
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    let winners = outcomes.iter().filter(|o| o.is_committed()).count();
    assert_eq!(winners, 1);
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, TxnOutcome::AbortedConflict { .. })));

    let name = server
        .row(LB_TABLE, &lb)
        .unwrap()
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string);
    let expected = if outcomes[0].is_committed() {
        "lb-first"
    } else {
        "lb-second"
    };
    assert_eq!(name.as_deref(), Some(expected));
}

#[tokio::test]
async fn test_bump_nb_cfg_on_commit() {
    let (engine, server) = nb_fixture();
    let nb = nb_idl(&engine, None).await;

    let outcome = nb
        .transaction(true, |txn| {
            txn.insert(LB_TABLE, [("name", Value::from("lb-1"))])?;
            Ok(())
        })
        .await
        .unwrap();
    assert!(outcome.is_committed());
    assert_eq!(nb_cfg(&server), 1);
    assert_eq!(nb.nb_global().unwrap().get_integer("nb_cfg"), Some(1));

    nb.transaction(false, |txn| {
        txn.insert(LB_TABLE, [("name", Value::from("lb-2"))])?;
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(nb_cfg(&server), 1);
}

#[tokio::test]
async fn test_failed_transaction_keeps_nb_cfg() {
    let (engine, server) = nb_fixture();
    let nb = nb_idl(&engine, None).await;

    server.fail_next_commit("constraint violation");
    let err = nb
        .transaction(true, |txn| {
            txn.insert(LB_TABLE, [("name", Value::from("lb-1"))])?;
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, IdlError::Transaction(_)));

    let err = nb
        .transaction(true, |txn| txn.delete(LB_TABLE, Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, IdlError::RecordNotFound { .. }));

    assert_eq!(nb_cfg(&server), 0);
    assert!(server.rows(LB_TABLE).is_empty());
}

#[tokio::test]
async fn test_errors_while_queueing_abandon_transaction() {
    let (engine, server) = nb_fixture();
    let nb = nb_idl(&engine, None).await;
    let before = server.generation();

    let err = nb
        .transaction(true, |txn| {
            txn.insert(LB_TABLE, [("name", Value::from("lb-1"))])?;
            txn.insert("ACL", [("priority", Value::from(1001i64))])?;
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, IdlError::TableNotFound(_)));
    assert_eq!(server.generation(), before);
}
