//! Coordinator failover: durable-record replay scenarios.

mod common;

use common::{harness, harness_with_log, MockTransport, SpyRecovery};
use memkv::common::types::{ServerId, ServiceMask};
use memkv::coordinator::log::{DurableLog, LogRecord, MemLog, SledLog};
use memkv::coordinator::recovery;
use memkv::coordinator::server_list::CoordinatorServerList;
use std::sync::Arc;

const MASTER_MEMBER: ServiceMask =
    ServiceMask(ServiceMask::MASTER.0 | ServiceMask::MEMBERSHIP.0);

#[test]
fn orphan_enlisting_intent_is_completed_on_replay() {
    // The coordinator crashed between appending the ServerEnlisting
    // intent and appending the ServerEnlisted commit.
    let log = Arc::new(MemLog::new());
    let id = ServerId::new(1, 0);
    log.append(
        &LogRecord::ServerEnlisting {
            server_id: id.as_u64(),
            services: MASTER_MEMBER.0,
            read_speed: 0,
            service_locator: "tcp:A".to_string(),
        },
        &[],
    )
    .unwrap();

    let h = harness_with_log(log.clone());
    let applied = recovery::replay(&h.list, log.as_ref()).unwrap();
    assert_eq!(applied, 1);

    // The entry materialized and the commit record superseded the intent.
    let entry = h.list.get(id).unwrap();
    assert_eq!(entry.service_locator, "tcp:A");
    let records = log.records().unwrap();
    assert_eq!(records.len(), 1);
    assert!(matches!(records[0].1, LogRecord::ServerEnlisted { .. }));

    // The registry matches the timeline where the coordinator never
    // crashed.
    let control = harness();
    control
        .list
        .enlist_server(None, MASTER_MEMBER, 0, "tcp:A")
        .unwrap();
    assert_eq!(
        h.list.serialize(ServiceMask::ALL).servers,
        control.list.serialize(ServiceMask::ALL).servers
    );
}

#[test]
fn replaying_intent_then_commit_is_idempotent() {
    let id = ServerId::new(1, 0);
    let intent = LogRecord::ServerEnlisting {
        server_id: id.as_u64(),
        services: ServiceMask::BACKUP.0,
        read_speed: 120,
        service_locator: "tcp:B".to_string(),
    };
    let commit = LogRecord::ServerEnlisted {
        server_id: id.as_u64(),
        services: ServiceMask::BACKUP.0,
        read_speed: 120,
        service_locator: "tcp:B".to_string(),
    };

    let h = harness();
    let intent_id = h.log.append(&intent, &[]).unwrap();
    h.list.recover_enlist_server(&intent, intent_id).unwrap();
    let once = h.list.serialize(ServiceMask::ALL).servers;

    h.list.recover_enlisted_server(&commit, 99).unwrap();
    let twice = h.list.serialize(ServiceMask::ALL).servers;
    assert_eq!(once, twice);
    assert_eq!(h.list.backup_count(), 1);
}

#[test]
fn server_down_record_resumes_on_replay() {
    // Crash happened after the ServerDown record but before the
    // invalidations: replay finds the commit for the enlistment plus the
    // orphan down record.
    let log = Arc::new(MemLog::new());
    let h = harness_with_log(log.clone());
    let id = h
        .list
        .enlist_server(None, ServiceMask::BACKUP, 100, "tcp:B")
        .unwrap();
    let down_record = log
        .append(&LogRecord::ServerDown { server_id: id.as_u64() }, &[])
        .unwrap();

    h.list.recover_server_down(
        &LogRecord::ServerDown { server_id: id.as_u64() },
        down_record,
    )
    .unwrap();

    // The backup is gone and every record about it was invalidated.
    assert_eq!(h.list.backup_count(), 0);
    assert!(h.list.get(id).is_err());
    assert!(log.records().unwrap().is_empty());
}

#[test]
fn recovery_info_record_restores_entry_metadata() {
    let log = Arc::new(MemLog::new());
    let h = harness_with_log(log.clone());
    let id = h
        .list
        .enlist_server(None, MASTER_MEMBER, 0, "tcp:A")
        .unwrap();

    let record = LogRecord::ServerUpdate {
        server_id: id.as_u64(),
        master_recovery_info: b"epoch=4".to_vec(),
    };
    let record_id = log.append(&record, &[]).unwrap();
    h.list
        .recover_master_recovery_info(&record, record_id)
        .unwrap();

    let entry = h.list.get(id).unwrap();
    assert_eq!(entry.master_recovery_info, b"epoch=4");
    assert_eq!(entry.server_update_log_id, record_id);
}

#[test]
fn replay_tolerates_update_for_departed_server() {
    let log = Arc::new(MemLog::new());
    log.append(
        &LogRecord::ServerUpdate {
            server_id: ServerId::new(9, 1).as_u64(),
            master_recovery_info: b"stale".to_vec(),
        },
        &[],
    )
    .unwrap();

    let h = harness_with_log(log.clone());
    let applied = recovery::replay(&h.list, log.as_ref()).unwrap();
    assert_eq!(applied, 0);
    // The stale record was invalidated on the way through.
    assert!(log.records().unwrap().is_empty());
}

#[test]
fn full_failover_cycle_over_sled() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coord-log");

    let snapshot_before;
    {
        let log = Arc::new(SledLog::open(&path).unwrap());
        let list = CoordinatorServerList::new(
            log.clone(),
            MockTransport::new(),
            SpyRecovery::new(),
            3,
        );
        list.enlist_server(None, MASTER_MEMBER, 0, "tcp:A").unwrap();
        list.enlist_server(None, ServiceMask::BACKUP, 200, "tcp:B")
            .unwrap();
        list.set_master_recovery_info(ServerId::new(1, 0), b"log-head=77")
            .unwrap();
        snapshot_before = list.serialize(ServiceMask::ALL);
    }

    // New incarnation over the same sled directory.
    let log = Arc::new(SledLog::open(&path).unwrap());
    let list = CoordinatorServerList::new(
        log.clone(),
        MockTransport::new(),
        SpyRecovery::new(),
        3,
    );
    let applied = recovery::replay(&list, log.as_ref()).unwrap();
    assert!(applied >= 2);

    assert_eq!(
        list.serialize(ServiceMask::ALL).servers,
        snapshot_before.servers
    );
    assert_eq!(
        list.get(ServerId::new(1, 0)).unwrap().master_recovery_info,
        b"log-head=77"
    );
}
