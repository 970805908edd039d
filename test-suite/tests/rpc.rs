// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RPC channel discovery and management traffic between the two
//! processor contexts: the service side publishes its channel through the
//! name server, the host resolves it remotely and drives the protocol
//! over the fabric.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use abi::ProcId;
use ipc::nameserver::NameServerParams;
use ipc::transport::WaitSet;
use svc_omaprpc::{
    request, ChannelInfo, ChannelParams, CreateInstance, FuncDeclaration,
    FuncSignature, InstanceHandle, MsgHeader, MsgType, OmapRpc,
    ServiceManager, MSG_HEADER_SIZE,
};
use test_suite::{World, HOST, PEER};
use zerocopy::{FromBytes, FromZeros, IntoBytes};

struct Mgr {
    next: AtomicU32,
    live: Mutex<Vec<u32>>,
}

impl ServiceManager for Mgr {
    fn create_service(&self, _name: &str) -> Result<u32, u32> {
        let ep = self.next.fetch_add(1, Ordering::SeqCst);
        self.live.lock().unwrap().push(ep);
        Ok(ep)
    }
    fn delete_service(&self, endpoint: u32) -> u32 {
        self.live.lock().unwrap().retain(|&e| e != endpoint);
        0
    }
}

#[test]
fn discover_create_destroy() {
    let world = World::new();

    // Service side: a name table peers can query remotely, and the
    // channel itself.
    let svc_ns = world
        .peer
        .ns
        .create(
            "rpmsg-rpc",
            NameServerParams {
                max_value_len: 4,
                max_name_len: 64,
                ..Default::default()
            },
        )
        .unwrap();
    let mgr = Arc::new(Mgr {
        next: AtomicU32::new(0x400),
        live: Mutex::new(Vec::new()),
    });
    let rpc = Arc::new(
        OmapRpc::create_channel(
            &world.fabric,
            PEER,
            ChannelParams {
                channel_name: "vision".into(),
                dst_proc: HOST,
                port: 59,
                service_mgr: mgr.clone(),
                funcs: vec![FuncDeclaration {
                    func: Arc::new(|_| 0),
                    signature: FuncSignature::named("Detect"),
                }],
                srv_del_notify: None,
            },
            Some(&svc_ns),
        )
        .unwrap(),
    );
    let server = {
        let rpc = rpc.clone();
        std::thread::spawn(move || rpc.run())
    };

    // Host side: resolve the channel port through the remote driver,
    // then exchange management messages.
    let host_ns = world
        .host
        .ns
        .create(
            "rpmsg-rpc",
            NameServerParams {
                max_value_len: 4,
                max_name_len: 64,
                ..Default::default()
            },
        )
        .unwrap();
    let port = host_ns.get_u32("vision", Some(&[PEER])).unwrap() as u16;
    assert_eq!(port, 59);

    let host_rx = world.fabric.bind(HOST, 0x300, PEER).unwrap();
    let ws = WaitSet::new();
    host_rx.attach_waiter(&ws);
    let rpc_addr = (ProcId(PEER.0), port);
    let host_addr = (HOST, 0x300);

    let transact = |req: Vec<u8>| -> Vec<u8> {
        world.fabric.send_to(rpc_addr, host_addr, &req).unwrap();
        ws.wait(Some(Duration::from_secs(5)), || host_rx.try_recv())
            .unwrap()
            .payload
    };

    // Channel info: bootstrap entry plus one published function.
    let reply = transact(request(MsgType::QueryChanInfo, &[]));
    let (hdr, body) = MsgHeader::ref_from_prefix(&reply).unwrap();
    assert_eq!(hdr.msg_type.get(), MsgType::ChanInfo as u32);
    assert_eq!(reply.len(), MSG_HEADER_SIZE + hdr.msg_len.get() as usize);
    let info = ChannelInfo::ref_from_prefix(body).unwrap().0;
    assert_eq!(info.num_funcs.get(), 2);

    // Create an instance, then tear it down.
    let mut create = CreateInstance::new_zeroed();
    create.name[..6].copy_from_slice(b"vision");
    let reply = transact(request(MsgType::CreateInstance, create.as_bytes()));
    let (hdr, body) = MsgHeader::ref_from_prefix(&reply).unwrap();
    assert_eq!(hdr.msg_type.get(), MsgType::InstanceCreated as u32);
    let handle = InstanceHandle::ref_from_prefix(body).unwrap().0;
    assert_eq!(handle.status.get(), 0);
    let endpoint = handle.endpoint_address.get();
    assert_eq!(*mgr.live.lock().unwrap(), vec![endpoint]);

    let mut destroy = InstanceHandle::new_zeroed();
    destroy.endpoint_address.set(endpoint);
    let reply =
        transact(request(MsgType::DestroyInstance, destroy.as_bytes()));
    let (hdr, _) = MsgHeader::ref_from_prefix(&reply).unwrap();
    assert_eq!(hdr.msg_type.get(), MsgType::InstanceDestroyed as u32);
    assert!(mgr.live.lock().unwrap().is_empty());

    rpc.shutdown();
    server.join().unwrap();
}
