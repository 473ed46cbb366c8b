//! Coordinator server wiring

use crate::common::{CoordinatorConfig, Result};
use crate::coordinator::grpc::MembershipGrpcService;
use crate::coordinator::http::{create_router, CoordState};
use crate::coordinator::log::SledLog;
use crate::coordinator::member_client::GrpcTransport;
use crate::coordinator::recovery::{self, LoggingRecovery};
use crate::coordinator::server_list::CoordinatorServerList;
use std::sync::Arc;

pub struct Coordinator {
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting coordinator");
        tracing::info!("  gRPC API: {}", self.config.bind_addr);
        tracing::info!("  admin API: {}", self.config.admin_addr);
        tracing::info!("  log path: {}", self.config.log_path.display());
        tracing::info!("  replication factor: {}", self.config.replication_factor);

        // Open the durable log and replay whatever the previous
        // incarnation left behind.
        let log = Arc::new(SledLog::open(&self.config.log_path)?);
        let transport = Arc::new(GrpcTransport::new(tokio::runtime::Handle::current()));
        let list = CoordinatorServerList::new(
            log.clone(),
            transport,
            Arc::new(LoggingRecovery),
            self.config.replication_factor,
        );

        let replayed = recovery::replay(&list, log.as_ref())?;
        if replayed > 0 {
            tracing::info!("replayed {} durable records", replayed);
        }
        list.start_updater();

        // Membership gRPC server
        let grpc_service = MembershipGrpcService::new(list.clone());
        let grpc_server = tonic::transport::Server::builder()
            .add_service(grpc_service.into_server())
            .serve(self.config.bind_addr);

        // Admin HTTP server
        let http_router = create_router(CoordState { list: list.clone() });
        let http_listener = tokio::net::TcpListener::bind(self.config.admin_addr).await?;
        let http_server = axum::serve(http_listener, http_router);

        tracing::info!("coordinator ready (v{})", crate::VERSION);

        tokio::select! {
            res = grpc_server => {
                if let Err(e) = res {
                    tracing::error!("gRPC server error: {}", e);
                }
            }
            res = http_server => {
                if let Err(e) = res {
                    tracing::error!("HTTP server error: {}", e);
                }
            }
        }

        list.halt_updater();
        Ok(())
    }
}
