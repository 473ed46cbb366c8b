//! Backup selection against a coordinator-fed roster.

mod common;

use common::harness;
use memkv::common::types::{ServerId, ServiceMask};
use memkv::placement::{BackupRoster, BackupSelector, BackupStats};
use memkv::coordinator::server_list::CoordinatorServerList;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::sync::Arc;

fn cluster_with_backups(bandwidths: &[u32]) -> (common::Harness, Vec<ServerId>) {
    let h = harness();
    let ids = bandwidths
        .iter()
        .enumerate()
        .map(|(i, &bw)| {
            h.list
                .enlist_server(None, ServiceMask::BACKUP, bw, &format!("tcp:b{}", i))
                .unwrap()
        })
        .collect();
    (h, ids)
}

#[test]
fn roster_reflects_live_backups_only() {
    let (h, ids) = cluster_with_backups(&[100, 100, 100, 100]);
    h.list
        .enlist_server(
            None,
            ServiceMask::MASTER | ServiceMask::MEMBERSHIP,
            0,
            "tcp:m",
        )
        .unwrap();
    h.list.server_down(ids[0]).unwrap();

    let roster = h.list.backup_list().unwrap();
    let roster_ids: HashSet<ServerId> = roster.iter().map(|b| b.server_id).collect();
    assert_eq!(roster.len(), 3);
    assert!(!roster_ids.contains(&ids[0]));
    for host in &roster {
        let stats = BackupStats::unpack(host.user_data);
        assert_eq!(stats.bandwidth, 100);
        assert_eq!(stats.num_segments, 0);
    }
}

#[test]
fn select_three_replicas_from_ten_backups() {
    let (h, ids) = cluster_with_backups(&[100, 200, 50, 400, 100, 100, 300, 100, 100, 250]);
    let list: Arc<CoordinatorServerList> = h.list.clone();
    let mut selector = BackupSelector::with_rng(list, StdRng::seed_from_u64(1));

    let chosen = selector.select(3).unwrap();
    assert_eq!(chosen.len(), 3);

    // All distinct, all actual backups.
    let distinct: HashSet<ServerId> = chosen.iter().copied().collect();
    assert_eq!(distinct.len(), 3);
    for id in &chosen {
        assert!(ids.contains(id));
    }

    // The primary carries the placement.
    let primary = chosen[0];
    assert_eq!(selector.host_stats(primary).unwrap().num_segments, 1);
    for secondary in &chosen[1..] {
        assert_eq!(selector.host_stats(*secondary).unwrap().num_segments, 0);
    }
}

#[test]
fn repeated_selection_spreads_load() {
    let (h, ids) = cluster_with_backups(&[100; 10]);
    let list: Arc<CoordinatorServerList> = h.list.clone();
    let mut selector = BackupSelector::with_rng(list, StdRng::seed_from_u64(2));

    // Place many segments; every backup ends up a primary at least once.
    for _ in 0..40 {
        selector.select(1).unwrap();
    }
    let placed: Vec<u32> = ids
        .iter()
        .map(|&id| selector.host_stats(id).unwrap().num_segments)
        .collect();
    assert!(placed.iter().all(|&n| n > 0), "placements: {:?}", placed);
    assert_eq!(placed.iter().sum::<u32>(), 40);
}

#[test]
fn selection_follows_cluster_churn_after_refresh() {
    let (h, ids) = cluster_with_backups(&[100, 100, 100]);
    let list: Arc<CoordinatorServerList> = h.list.clone();
    let mut selector = BackupSelector::with_rng(list, StdRng::seed_from_u64(3));
    selector.select(1).unwrap();

    // A backup dies; after a refresh the selector never picks it again.
    h.list.server_down(ids[2]).unwrap();
    selector.refresh().unwrap();
    for _ in 0..10 {
        let chosen = selector.select(2).unwrap();
        assert!(!chosen.contains(&ids[2]));
    }
}
