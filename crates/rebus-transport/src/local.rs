// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-process transport.
//!
//! Master and agents share one address space; RPCs are channel sends into
//! the master loop and signals are direct channel deliveries. Nothing can
//! be lost, and per-subscriber ordering matches emission order.

use crate::{
    AgentChannel, Registration, RpcClient, RpcHandle, Transport, TransportError, reject_on_error,
};
use async_trait::async_trait;
use rebus_master::MasterHandle;
use rebus_proto::{RpcRequest, RpcResponse};
use rebus_storage::Storage;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Transport for agents living in the master's process.
#[derive(Clone)]
pub struct LocalTransport {
    master: MasterHandle,
}

impl LocalTransport {
    /// Wrap an already-running master.
    #[must_use]
    pub fn new(master: MasterHandle) -> Self {
        LocalTransport { master }
    }

    /// Spawn a master over `storage` and return a transport onto it.
    pub fn spawn(
        storage: Box<dyn Storage>,
    ) -> (Self, MasterHandle, tokio::task::JoinHandle<()>) {
        let (master, join) = rebus_master::spawn(storage);
        (LocalTransport::new(master.clone()), master, join)
    }

    /// Handle to the underlying master (for shutdown and tests).
    #[must_use]
    pub fn master(&self) -> &MasterHandle {
        &self.master
    }
}

struct LocalRpc {
    master: MasterHandle,
}

#[async_trait]
impl RpcClient for LocalRpc {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, TransportError> {
        if !self.master.is_running() {
            return Err(TransportError::MasterUnavailable);
        }
        Ok(self.master.call(request).await)
    }

    fn detach(&self, agent_id: &str) {
        self.master.unsubscribe(agent_id);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn join(&self, registration: Registration) -> Result<AgentChannel, TransportError> {
        let token = self
            .master
            .allocate_id()
            .await
            .ok_or(TransportError::MasterUnavailable)?;
        let agent_id = format!("{}-{token}", registration.name);

        let (signal_tx, signals) = mpsc::unbounded_channel();
        self.master.subscribe(agent_id.clone(), signal_tx);

        let rpc = RpcHandle::new(
            agent_id.clone(),
            Arc::new(LocalRpc {
                master: self.master.clone(),
            }),
        );
        let response = rpc
            .call(RpcRequest::Register {
                agent_id: agent_id.clone(),
                domain: registration.domain,
                path: format!("/agent/{}", registration.name),
                config: registration.config,
            })
            .await?;
        if let Err(err) = reject_on_error(response) {
            self.master.unsubscribe(&agent_id);
            return Err(err);
        }
        Ok(AgentChannel { rpc, signals })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rebus_core::{DEFAULT_DOMAIN, Descriptor, Value};
    use rebus_proto::Signal;
    use rebus_storage::RamStorage;

    fn registration(name: &str) -> Registration {
        Registration::new(name, DEFAULT_DOMAIN, "{\"output_altering_options\":[]}".into())
    }

    #[tokio::test]
    async fn join_grants_sequential_ids() {
        let (transport, master, _join) = LocalTransport::spawn(Box::new(RamStorage::new()));
        let a = transport.join(registration("cat")).await.unwrap();
        let b = transport.join(registration("cat")).await.unwrap();
        assert_eq!(a.agent_id(), "cat-0");
        assert_eq!(b.agent_id(), "cat-1");
        master.shutdown(true);
    }

    #[tokio::test]
    async fn peers_see_each_others_pushes() {
        let (transport, master, _join) = LocalTransport::spawn(Box::new(RamStorage::new()));
        let publisher = transport.join(registration("inject")).await.unwrap();
        let mut watcher = transport.join(registration("watch")).await.unwrap();

        let descriptor = Descriptor::new(
            "hi",
            "/raw",
            Value::Bytes(b"HELLOWORLD".to_vec()),
            DEFAULT_DOMAIN,
            "inject",
        )
        .unwrap();
        let pushed = publisher
            .rpc
            .call(RpcRequest::Push {
                agent_id: publisher.agent_id().to_owned(),
                descriptor: Box::new(descriptor.clone()),
            })
            .await
            .unwrap();
        assert!(pushed.as_bool());

        let signal = watcher.signals.recv().await.unwrap();
        match signal {
            Signal::NewDescriptor { selector, sender_id, .. } => {
                assert_eq!(selector, descriptor.selector());
                assert_eq!(sender_id, "inject-0");
            }
            other => panic!("expected new_descriptor, got {other:?}"),
        }
        master.shutdown(true);
    }

    #[tokio::test]
    async fn malformed_config_is_rejected_at_join() {
        let (transport, master, _join) = LocalTransport::spawn(Box::new(RamStorage::new()));
        let registration = Registration::new("bad", DEFAULT_DOMAIN, "not json".into());
        assert!(matches!(
            transport.join(registration).await,
            Err(TransportError::Rejected(_))
        ));
        master.shutdown(true);
    }
}
