// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared scaffolding for the integration tests: a two-processor world
//! where each "processor" is a full runtime context and the fabric plays
//! the role of the inter-processor transport.

use std::sync::Arc;

use abi::{IpcResult, ProcId};
use ipc::messageq::MessageQModule;
use ipc::multiproc::{MultiProc, MultiProcConfig};
use ipc::nameserver::{NameServerModule, NameServerRemote};
use ipc::transport::Fabric;

pub const HOST: ProcId = ProcId(0);
pub const PEER: ProcId = ProcId(1);

/// One processor's runtime context.
pub struct Node {
    pub mp: Arc<MultiProc>,
    pub ns: Arc<NameServerModule>,
    pub mq: Arc<MessageQModule>,
}

impl Node {
    fn new(fabric: &Arc<Fabric>, self_id: ProcId) -> Node {
        let mp = MultiProc::setup(MultiProcConfig {
            names: vec!["HOST".into(), "IPU".into()],
            self_id,
            base_cluster_id: 0,
        })
        .unwrap();
        let ns = NameServerModule::setup(mp.clone());
        let mq = MessageQModule::setup(
            mp.clone(),
            &ns,
            fabric.clone(),
            Default::default(),
        )
        .unwrap();
        Node { mp, ns, mq }
    }
}

/// In-process stand-in for the remote name-server driver: answers a
/// peer's queries straight out of the target module's local tables. On
/// hardware this is a request/response protocol over the transport; the
/// lookup semantics are identical, and answering synchronously satisfies
/// the zero-timeout probe contract for any timeout value.
pub struct NameServerBridge {
    target: Arc<NameServerModule>,
}

impl NameServerRemote for NameServerBridge {
    fn get(
        &self,
        instance: &str,
        name: &str,
        value: &mut [u8],
        _timeout_ms: u32,
    ) -> IpcResult<u32> {
        let inst = self
            .target
            .get_handle(instance)
            .ok_or(abi::IpcError::NotFound)?;
        inst.get_local(name, value)
    }
}

/// A two-processor world: both runtime contexts share one fabric, their
/// name servers are bridged, and MessageQ is attached both ways.
pub struct World {
    pub fabric: Arc<Fabric>,
    pub host: Node,
    pub peer: Node,
}

impl World {
    pub fn new() -> World {
        let fabric = Fabric::new();
        let host = Node::new(&fabric, HOST);
        let peer = Node::new(&fabric, PEER);

        host.ns
            .register_remote_driver(
                Arc::new(NameServerBridge {
                    target: peer.ns.clone(),
                }),
                PEER,
            )
            .unwrap();
        peer.ns
            .register_remote_driver(
                Arc::new(NameServerBridge {
                    target: host.ns.clone(),
                }),
                HOST,
            )
            .unwrap();

        host.mq.attach(PEER).unwrap();
        peer.mq.attach(HOST).unwrap();

        World { fabric, host, peer }
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}
