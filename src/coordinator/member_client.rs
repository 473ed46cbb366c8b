//! gRPC transport for pushed membership updates
//!
//! The propagation worker is a plain thread that polls RPC handles; this
//! transport bridges it onto tonic by spawning each push onto the tokio
//! runtime and exposing the task handle through the poll/wait surface.
//!
//! Service locators are expected to be connectable URIs
//! (e.g. `http://host:port`).

use crate::common::types::ServerId;
use crate::common::{Error, Result};
use crate::coordinator::propagation::{MembershipTransport, UpdateRpc};
use crate::coordinator::updates::MembershipMessage;
use crate::proto;
use crate::proto::membership_subscriber_client::MembershipSubscriberClient;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

pub struct GrpcTransport {
    handle: Handle,
}

impl GrpcTransport {
    /// `handle` names the runtime the push tasks run on.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl MembershipTransport for GrpcTransport {
    fn send_update(
        &self,
        target: ServerId,
        locator: &str,
        message: Arc<MembershipMessage>,
    ) -> Box<dyn UpdateRpc> {
        let endpoint = locator.to_string();
        let request: proto::ServerListMessage = message.as_ref().into();

        let task = self.handle.spawn(async move {
            let mut client = MembershipSubscriberClient::connect(endpoint)
                .await
                .map_err(|e| Error::RpcFailed(e.to_string()))?;
            let reply = client.update_server_list(request).await?;
            Ok(reply.into_inner().current_version)
        });

        Box::new(GrpcUpdateRpc {
            target,
            handle: self.handle.clone(),
            task,
        })
    }
}

struct GrpcUpdateRpc {
    target: ServerId,
    handle: Handle,
    task: JoinHandle<Result<u64>>,
}

impl UpdateRpc for GrpcUpdateRpc {
    fn target(&self) -> ServerId {
        self.target
    }

    fn is_ready(&self) -> bool {
        self.task.is_finished()
    }

    fn wait(self: Box<Self>) -> Result<()> {
        match self.handle.block_on(self.task) {
            Ok(Ok(_current_version)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(join_err) => Err(Error::RpcFailed(join_err.to_string())),
        }
    }

    fn cancel(self: Box<Self>) {
        self.task.abort();
    }
}
