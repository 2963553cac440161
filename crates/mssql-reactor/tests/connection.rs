//! Transaction command flow against a scripted transport peer.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::timeout;

use mssql_reactor::{
    Client, Connection, ConnectionOptions, Error, IsolationLevel, TransactionDefinition,
    TransactionStatus, Transport, TransportPeer, ValidationDepth,
};
use tds_wire::{
    ClientMessage, Done, DoneProc, DoneStatus, EnvChange, EnvChangeType, Message, ServerError,
};

const WAIT: Duration = Duration::from_secs(5);

fn done_final() -> Message {
    Message::Done(Done {
        status: DoneStatus::default(),
        current_command: 0,
        row_count: 0,
    })
}

fn done_proc_final() -> Message {
    Message::DoneProc(DoneProc {
        status: DoneStatus::default(),
        current_command: 0,
        row_count: 0,
    })
}

fn env_change(change_type: EnvChangeType, new_value: &[u8]) -> Message {
    Message::EnvChange(EnvChange {
        change_type,
        new_value: Bytes::copy_from_slice(new_value),
        old_value: Bytes::new(),
    })
}

/// Answer SQL batches by matching on their text prefix; record every batch.
fn spawn_sql_responder(peer: TransportPeer) -> Arc<Mutex<Vec<String>>> {
    let batches = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&batches);

    tokio::spawn(async move {
        let TransportPeer {
            mut requests,
            responses,
        } = peer;
        let descriptor = [9, 9, 9, 9, 9, 9, 9, 9];

        while let Some(request) = requests.recv().await {
            let reply: Vec<Message> = match &request {
                ClientMessage::SqlBatch(batch) => {
                    captured.lock().push(batch.sql.clone());
                    if batch.sql.starts_with("BEGIN TRANSACTION") {
                        vec![env_change(EnvChangeType::BeginTx, &descriptor), done_final()]
                    } else if batch.sql.contains("COMMIT TRANSACTION") {
                        vec![env_change(EnvChangeType::CommitTx, &[]), done_final()]
                    } else if batch.sql.contains("ROLLBACK TRANSACTION;") {
                        vec![env_change(EnvChangeType::RollbackTx, &[]), done_final()]
                    } else {
                        vec![done_final()]
                    }
                }
                ClientMessage::Rpc(_) => vec![done_proc_final()],
                ClientMessage::Attention => Vec::new(),
            };

            for message in reply {
                if responses.send(Ok(message)).await.is_err() {
                    return;
                }
            }
        }
    });

    batches
}

#[tokio::test]
async fn test_begin_and_commit_update_transaction_state() {
    let (transport, peer) = Transport::channel(64);
    let batches = spawn_sql_responder(peer);

    let client = Client::new(transport);
    let connection = Connection::new(client.clone(), ConnectionOptions::new());

    assert_eq!(client.transaction_status(), TransactionStatus::AutoCommit);
    assert!(client.transaction_descriptor().is_empty());

    connection.begin_transaction().await.expect("begin");
    assert_eq!(client.transaction_status(), TransactionStatus::Started);
    assert!(!client.transaction_descriptor().is_empty());

    connection.commit_transaction().await.expect("commit");
    assert_eq!(client.transaction_status(), TransactionStatus::Explicit);
    assert!(client.transaction_descriptor().is_empty());

    let batches = batches.lock();
    assert_eq!(batches[0], "BEGIN TRANSACTION;");
    assert!(batches[1].starts_with("IF @@TRANCOUNT > 0 COMMIT TRANSACTION;"));
}

#[tokio::test]
async fn test_begin_transaction_with_attributes() {
    let (transport, peer) = Transport::channel(64);
    let batches = spawn_sql_responder(peer);

    let client = Client::new(transport);
    let connection = Connection::new(client, ConnectionOptions::new());

    connection
        .begin_transaction_with(
            TransactionDefinition::new()
                .name("audit-run")
                .mark("nightly")
                .isolation_level(IsolationLevel::Serializable),
        )
        .await
        .expect("begin");

    let batches = batches.lock();
    assert_eq!(
        batches[0],
        "BEGIN TRANSACTION audit_run WITH MARK 'nightly';SET TRANSACTION ISOLATION LEVEL SERIALIZABLE;"
    );
}

#[tokio::test]
async fn test_connection_lock_wait_timeout_applies_at_begin() {
    let (transport, peer) = Transport::channel(64);
    let batches = spawn_sql_responder(peer);

    let client = Client::new(transport);
    let options = ConnectionOptions::new()
        .with_lock_wait_timeout(mssql_reactor::SignedDuration::negative(Duration::from_secs(1)));
    let connection = Connection::new(client, options);

    connection.begin_transaction().await.expect("begin");

    let batches = batches.lock();
    assert_eq!(batches[0], "BEGIN TRANSACTION;SET LOCK_TIMEOUT -1;");
}

#[tokio::test]
async fn test_commit_restores_isolation_level() {
    let (transport, peer) = Transport::channel(64);
    let batches = spawn_sql_responder(peer);

    let client = Client::new(transport);
    let connection = Connection::new(client, ConnectionOptions::new());

    connection
        .begin_transaction_with(
            TransactionDefinition::new().isolation_level(IsolationLevel::Snapshot),
        )
        .await
        .expect("begin");
    assert_eq!(
        connection.transaction_isolation_level(),
        IsolationLevel::Snapshot
    );

    connection.commit_transaction().await.expect("commit");
    assert_eq!(
        connection.transaction_isolation_level(),
        IsolationLevel::ReadCommitted
    );

    let batches = batches.lock();
    assert!(
        batches[1].contains("SET TRANSACTION ISOLATION LEVEL READ COMMITTED"),
        "cleanup must restore the previous isolation level: {batches:?}"
    );
}

#[tokio::test]
async fn test_begin_is_skipped_when_transaction_started() {
    let (transport, peer) = Transport::channel(64);
    let batches = spawn_sql_responder(peer);

    let client = Client::new(transport);
    let connection = Connection::new(client, ConnectionOptions::new());

    connection.begin_transaction().await.expect("begin");
    connection.begin_transaction().await.expect("second begin");

    assert_eq!(batches.lock().len(), 1);
}

#[tokio::test]
async fn test_savepoint_sql() {
    let (transport, peer) = Transport::channel(64);
    let batches = spawn_sql_responder(peer);

    let client = Client::new(transport);
    let connection = Connection::new(client, ConnectionOptions::new());

    connection.create_savepoint("before.update").await.expect("savepoint");
    assert!(!connection.is_auto_commit());

    // Savepoint rollback requires a started transaction.
    connection.begin_transaction().await.expect("begin");
    connection
        .rollback_to_savepoint("before.update")
        .await
        .expect("rollback to savepoint");

    let batches = batches.lock();
    assert_eq!(
        batches[0],
        "SET IMPLICIT_TRANSACTIONS ON; IF @@TRANCOUNT = 0 BEGIN BEGIN TRAN IF @@TRANCOUNT = 2 COMMIT TRAN END SAVE TRAN before_update;"
    );
    assert_eq!(batches[2], "ROLLBACK TRANSACTION before_update");
}

#[tokio::test]
async fn test_invalid_savepoint_name_is_rejected_before_io() {
    let (transport, peer) = Transport::channel(64);
    let batches = spawn_sql_responder(peer);

    let client = Client::new(transport);
    let connection = Connection::new(client, ConnectionOptions::new());

    let result = connection.create_savepoint("bad name!").await;
    assert!(matches!(result, Err(Error::InvalidIdentifier(_))));
    assert!(batches.lock().is_empty());
}

#[tokio::test]
async fn test_server_error_in_batch_is_returned() {
    let (transport, peer) = Transport::channel(64);

    tokio::spawn(async move {
        let TransportPeer {
            mut requests,
            responses,
        } = peer;
        while requests.recv().await.is_some() {
            let error = Message::Error(ServerError {
                number: 1205,
                state: 1,
                class: 13,
                message: "deadlock victim".into(),
                server: String::new(),
                procedure: String::new(),
                line: 1,
            });
            if responses.send(Ok(error)).await.is_err() {
                return;
            }
            if responses.send(Ok(done_final())).await.is_err() {
                return;
            }
        }
    });

    let client = Client::new(transport);
    let connection = Connection::new(client, ConnectionOptions::new());

    let result = timeout(WAIT, connection.set_auto_commit(false))
        .await
        .expect("timely reply");
    assert!(matches!(result, Err(Error::Server { number: 1205, .. })));
}

#[tokio::test]
async fn test_validate_remote_round_trips() {
    let (transport, peer) = Transport::channel(64);
    let _batches = spawn_sql_responder(peer);

    let client = Client::new(transport);
    let connection = Connection::new(client, ConnectionOptions::new());

    assert!(connection.validate(ValidationDepth::Local).await);
    assert!(
        timeout(WAIT, connection.validate(ValidationDepth::Remote))
            .await
            .expect("timely validation")
    );
}
