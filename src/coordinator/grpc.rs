//! Coordinator gRPC service
//!
//! Exposes the authoritative membership mutations (enlist, server-down,
//! recovery-info) and the full-list query to storage servers and tooling.
//! Conversions between the in-memory types and the generated protobuf
//! types live here, next to the service.

use crate::common::types::{ServerId, ServerStatus, ServiceMask};
use crate::coordinator::server_list::CoordinatorServerList;
use crate::coordinator::updates::{EntryState, MembershipMessage, MessageKind};
use crate::proto;
use crate::proto::coordinator_membership_server::{
    CoordinatorMembership, CoordinatorMembershipServer,
};
use std::sync::Arc;
use tonic::{Request, Response, Status};

impl From<&EntryState> for proto::ServerState {
    fn from(state: &EntryState) -> Self {
        Self {
            server_id: state.server_id.as_u64(),
            services: state.services.0,
            service_locator: state.service_locator.clone(),
            status: state.status.as_u32(),
            expected_read_mbytes_per_sec: state.expected_read_mbytes_per_sec,
            replication_id: state.replication_id,
        }
    }
}

impl TryFrom<&proto::ServerState> for EntryState {
    type Error = Status;

    fn try_from(state: &proto::ServerState) -> Result<Self, Status> {
        Ok(Self {
            server_id: ServerId::from_u64(state.server_id)
                .ok_or_else(|| Status::invalid_argument("server_id has index 0"))?,
            services: ServiceMask(state.services),
            service_locator: state.service_locator.clone(),
            status: ServerStatus::from_u32(state.status)
                .ok_or_else(|| Status::invalid_argument("unknown server status"))?,
            expected_read_mbytes_per_sec: state.expected_read_mbytes_per_sec,
            replication_id: state.replication_id,
        })
    }
}

impl From<&MembershipMessage> for proto::ServerListMessage {
    fn from(message: &MembershipMessage) -> Self {
        let kind = match message.kind {
            MessageKind::FullList => proto::ListKind::FullList,
            MessageKind::Update => proto::ListKind::Update,
        };
        Self {
            version_number: message.version,
            kind: kind as i32,
            servers: message.servers.iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<&proto::ServerListMessage> for MembershipMessage {
    type Error = Status;

    fn try_from(message: &proto::ServerListMessage) -> Result<Self, Status> {
        let kind = match message.kind() {
            proto::ListKind::FullList => MessageKind::FullList,
            proto::ListKind::Update => MessageKind::Update,
        };
        Ok(Self {
            version: message.version_number,
            kind,
            servers: message
                .servers
                .iter()
                .map(TryInto::try_into)
                .collect::<Result<_, _>>()?,
        })
    }
}

/// Membership service backed by the coordinator server list.
pub struct MembershipGrpcService {
    list: Arc<CoordinatorServerList>,
}

impl MembershipGrpcService {
    pub fn new(list: Arc<CoordinatorServerList>) -> Self {
        Self { list }
    }

    /// Converts this service into a gRPC server instance.
    pub fn into_server(self) -> CoordinatorMembershipServer<Self> {
        CoordinatorMembershipServer::new(self)
    }
}

#[tonic::async_trait]
impl CoordinatorMembership for MembershipGrpcService {
    async fn enlist_server(
        &self,
        req: Request<proto::EnlistRequest>,
    ) -> Result<Response<proto::EnlistReply>, Status> {
        let req = req.into_inner();
        let replaces = ServerId::from_u64(req.replaces_id);

        let id = self
            .list
            .enlist_server(
                replaces,
                ServiceMask(req.services),
                req.read_speed_mbytes_per_sec,
                &req.service_locator,
            )
            .map_err(|e| e.to_grpc_status())?;

        Ok(Response::new(proto::EnlistReply {
            server_id: id.as_u64(),
        }))
    }

    async fn server_down(
        &self,
        req: Request<proto::ServerDownRequest>,
    ) -> Result<Response<proto::ServerDownReply>, Status> {
        let req = req.into_inner();
        let id = ServerId::from_u64(req.server_id)
            .ok_or_else(|| Status::invalid_argument("server_id has index 0"))?;

        self.list
            .server_down(id)
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(proto::ServerDownReply {}))
    }

    async fn set_master_recovery_info(
        &self,
        req: Request<proto::SetRecoveryInfoRequest>,
    ) -> Result<Response<proto::SetRecoveryInfoReply>, Status> {
        let req = req.into_inner();
        let id = ServerId::from_u64(req.server_id)
            .ok_or_else(|| Status::invalid_argument("server_id has index 0"))?;

        self.list
            .set_master_recovery_info(id, &req.recovery_info)
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(proto::SetRecoveryInfoReply {}))
    }

    async fn get_server_list(
        &self,
        req: Request<proto::GetServerListRequest>,
    ) -> Result<Response<proto::ServerListMessage>, Status> {
        let req = req.into_inner();
        // An empty filter means "everything": callers asking for no
        // services at all are really asking for the whole list.
        let services = if req.services == 0 {
            ServiceMask::ALL
        } else {
            ServiceMask(req.services)
        };
        let snapshot = self.list.serialize(services);
        Ok(Response::new((&snapshot).into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_conversion_roundtrip() {
        let message = MembershipMessage {
            version: 7,
            kind: MessageKind::Update,
            servers: vec![EntryState {
                server_id: ServerId::new(3, 2),
                services: ServiceMask::BACKUP | ServiceMask::MEMBERSHIP,
                service_locator: "tcp:backup".into(),
                status: ServerStatus::Crashed,
                expected_read_mbytes_per_sec: 250,
                replication_id: 9,
            }],
        };

        let wire: proto::ServerListMessage = (&message).into();
        assert_eq!(wire.version_number, 7);
        assert_eq!(wire.kind(), proto::ListKind::Update);

        let back: MembershipMessage = (&wire).try_into().unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_invalid_wire_state_rejected() {
        let wire = proto::ServerState {
            server_id: 0,
            services: 0,
            service_locator: String::new(),
            status: 0,
            expected_read_mbytes_per_sec: 0,
            replication_id: 0,
        };
        assert!(EntryState::try_from(&wire).is_err());
    }
}
