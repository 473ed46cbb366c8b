//! Shared test harness: controllable transport, spy recovery manager.
#![allow(dead_code)]

use memkv::common::types::ServerId;
use memkv::common::{Error, Result};
use memkv::coordinator::log::MemLog;
use memkv::coordinator::propagation::{MembershipTransport, UpdateRpc};
use memkv::coordinator::recovery::RecoveryManager;
use memkv::coordinator::registry::ServerEntry;
use memkv::coordinator::server_list::CoordinatorServerList;
use memkv::coordinator::updates::MembershipMessage;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Transport whose RPCs complete immediately; failures are injected per
/// target. Every dispatched message is recorded for assertions.
pub struct MockTransport {
    sent: Mutex<Vec<(ServerId, Arc<MembershipMessage>)>>,
    fail: Mutex<HashSet<ServerId>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail: Mutex::new(HashSet::new()),
        })
    }

    /// Make every subsequent RPC to `target` fail.
    pub fn fail_target(&self, target: ServerId) {
        self.fail.lock().unwrap().insert(target);
    }

    pub fn heal_target(&self, target: ServerId) {
        self.fail.lock().unwrap().remove(&target);
    }

    /// All messages dispatched to `target`, in dispatch order.
    pub fn sent_to(&self, target: ServerId) -> Vec<Arc<MembershipMessage>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == target)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

struct MockRpc {
    target: ServerId,
    fail: bool,
}

impl UpdateRpc for MockRpc {
    fn target(&self) -> ServerId {
        self.target
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn wait(self: Box<Self>) -> Result<()> {
        if self.fail {
            Err(Error::ServerNotUp(self.target))
        } else {
            Ok(())
        }
    }

    fn cancel(self: Box<Self>) {}
}

impl MembershipTransport for MockTransport {
    fn send_update(
        &self,
        target: ServerId,
        _locator: &str,
        message: Arc<MembershipMessage>,
    ) -> Box<dyn UpdateRpc> {
        self.sent.lock().unwrap().push((target, message));
        let fail = self.fail.lock().unwrap().contains(&target);
        Box::new(MockRpc { target, fail })
    }
}

/// Records every master-recovery kick.
pub struct SpyRecovery {
    kicked: Mutex<Vec<ServerId>>,
}

impl SpyRecovery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            kicked: Mutex::new(Vec::new()),
        })
    }

    pub fn kicked(&self) -> Vec<ServerId> {
        self.kicked.lock().unwrap().clone()
    }
}

impl RecoveryManager for SpyRecovery {
    fn start_master_recovery(&self, entry: &ServerEntry) {
        self.kicked.lock().unwrap().push(entry.server_id);
    }
}

pub struct Harness {
    pub list: Arc<CoordinatorServerList>,
    pub log: Arc<MemLog>,
    pub transport: Arc<MockTransport>,
    pub recovery: Arc<SpyRecovery>,
}

pub fn harness() -> Harness {
    harness_with_log(Arc::new(MemLog::new()))
}

pub fn harness_with_log(log: Arc<MemLog>) -> Harness {
    let transport = MockTransport::new();
    let recovery = SpyRecovery::new();
    let list = CoordinatorServerList::new(
        log.clone(),
        transport.clone(),
        recovery.clone(),
        3,
    );
    Harness {
        list,
        log,
        transport,
        recovery,
    }
}
