//! Membership update propagation
//!
//! A single dedicated worker keeps the cluster's server lists up to date
//! without holding the coordinator lock across network waits. The worker
//! owns an ordered collection of RPC slots partitioned into three ranges:
//!
//! ```text
//! [ active … ][ inactive … ][ unused … ]
//!             ↑ first empty slot      ↑ max_rpcs (grows)
//! ```
//!
//! Each pass reaps any number of finished RPCs (compacting active slots to
//! the front) but dispatches at most one new RPC. Scanning a slot is far
//! cheaper than starting an RPC, so `max_rpcs` settles near the point
//! where one RPC finishes per pass; when a pass ends with every slot
//! active, the ceiling grows by a fixed step.

use crate::common::types::ServerId;
use crate::common::Result;
use crate::coordinator::server_list::CoordinatorServerList;
use crate::coordinator::updates::MembershipMessage;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// How many RPC slots to add when a pass exhausts them.
pub const RPC_SLOT_STEP: usize = 8;

/// One dispatched-but-unconfirmed membership update.
///
/// Polled by the worker outside the coordinator lock; `wait` consumes the
/// handle once `is_ready` reports completion. `cancel` abandons the RPC
/// without waiting.
pub trait UpdateRpc: Send {
    fn target(&self) -> ServerId;
    fn is_ready(&self) -> bool;
    fn wait(self: Box<Self>) -> Result<()>;
    fn cancel(self: Box<Self>);
}

/// Starts membership-update RPCs toward cluster members.
pub trait MembershipTransport: Send + Sync {
    fn send_update(
        &self,
        target: ServerId,
        locator: &str,
        message: Arc<MembershipMessage>,
    ) -> Box<dyn UpdateRpc>;
}

/// One unit of propagation work: a message to send to one target.
///
/// The payload is a shared handle into the update buffer, so it stays
/// valid until the matching `work_success`/`work_failed` even if the
/// buffer prunes the version meanwhile.
pub struct WorkUnit {
    pub target: ServerId,
    pub locator: String,
    /// First contact: the message is a full snapshot, not a delta.
    pub send_full_list: bool,
    /// Version the target will have confirmed once this unit succeeds.
    pub update_version_tail: u64,
    pub message: Arc<MembershipMessage>,
}

/// Body of the dedicated propagation thread. Exits when
/// `halt_updater` flips the stop switch; any in-flight RPCs are cancelled
/// and their targets rolled back.
pub(crate) fn update_loop(list: Arc<CoordinatorServerList>) {
    let transport = list.transport();
    let mut max_rpcs = RPC_SLOT_STEP;
    let mut slots: VecDeque<Option<Box<dyn UpdateRpc>>> = VecDeque::new();

    while !list.should_stop() {
        // Phase 0: allocate slots up to the current ceiling.
        while slots.len() < max_rpcs {
            slots.push_back(None);
        }

        // Phase 1: reap finished RPCs, compacting actives to the front.
        let mut idx = 0;
        while idx < slots.len() && !list.should_stop() {
            let ready = match slots[idx].as_ref() {
                // First empty slot: end of the active range.
                None => break,
                Some(rpc) => rpc.is_ready(),
            };
            if !ready {
                idx += 1;
                continue;
            }
            if let Some(Some(rpc)) = slots.remove(idx) {
                let target = rpc.target();
                match rpc.wait() {
                    Ok(()) => list.work_success(target),
                    Err(e) => {
                        debug!("membership update to {} failed: {}", target, e);
                        list.work_failed(target);
                    }
                }
            }
            slots.push_back(None);
        }

        // Phase 2: start at most one new RPC.
        if idx < slots.len() && !list.should_stop() {
            if let Some(work) = list.get_work() {
                debug!(
                    "dispatching {} version {} to server {}",
                    if work.send_full_list { "full list" } else { "update" },
                    work.update_version_tail,
                    work.target
                );
                slots[idx] =
                    Some(transport.send_update(work.target, &work.locator, work.message));
                idx += 1;
            }
        }

        // Phase 3: expand the ceiling, or sleep when fully idle.
        if idx == slots.len() {
            max_rpcs += RPC_SLOT_STEP;
        } else if idx == 0 {
            list.wait_for_work();
        }
    }

    // Stopping: cancel everything still in flight and roll the targets
    // back so a restarted updater retries them.
    for slot in slots.drain(..) {
        if let Some(rpc) = slot {
            list.work_failed(rpc.target());
            rpc.cancel();
        }
    }
}
