use std::net::SocketAddr;
use std::time::Duration;

use super::*;
use crate::provider::{
    CmEvent as _, CmId as _, CompletionQueue as _, EventChannel as _, ProtectionDomain as _,
    QueuePair as _,
};
use crate::types::{AccessFlags, ConnParam, QpCapability, QpInitAttr, QpType, SendFlags};
use crate::types::{WcOpcode, WcStatus, WorkCompletion};

struct Side {
    // field order is the teardown order
    qp: SimQp,
    cq: SimCq,
    _cc: SimCompChannel,
    mr: SimMr,
    _pd: SimPd,
    id: SimCmId,
    channel: Option<SimEventChannel>,
}

fn qp_attr() -> QpInitAttr {
    QpInitAttr {
        cap: QpCapability {
            max_send_wr: 16,
            max_recv_wr: 16,
            max_send_sge: 8,
            max_recv_sge: 8,
            max_inline_data: 0,
        },
        qp_type: QpType::RC,
        sq_sig_all: false,
    }
}

fn expect_event(channel: &SimEventChannel, kind: CmEventType) -> SimCmEvent {
    assert!(channel.poll(Some(Duration::from_secs(5))).unwrap());
    let ev = channel.get_cm_event().unwrap();
    assert_eq!(ev.event(), kind, "got {}", ev);
    ev
}

fn provision(id: SimCmId, channel: Option<SimEventChannel>, buf_len: usize) -> Side {
    let pd = id.alloc_pd().unwrap();
    let mr = pd
        .reg_mr(
            vec![0u8; buf_len].into_boxed_slice(),
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
        )
        .unwrap();
    let cc = id.create_comp_channel().unwrap();
    let cq = id.create_cq(16, &cc).unwrap();
    let qp = id.create_qp(&pd, &cq, &qp_attr()).unwrap();
    Side {
        qp,
        cq,
        _cc: cc,
        mr,
        _pd: pd,
        id,
        channel,
    }
}

fn listen(fabric: &SimFabric) -> (SimCmId, SimEventChannel, SocketAddr) {
    let channel = fabric.create_event_channel().unwrap();
    let id = fabric.create_id(&channel, PortSpace::TCP).unwrap();
    id.bind_addr(&"0.0.0.0:0".parse().unwrap()).unwrap();
    id.listen(16).unwrap();
    let addr = id.local_addr().unwrap();
    (id, channel, addr)
}

/// Connects a client to `addr` and returns (server, client) sides.
fn connect_pair(fabric: &SimFabric, listen_ch: &SimEventChannel, addr: SocketAddr) -> (Side, Side) {
    let ch = fabric.create_event_channel().unwrap();
    let id = fabric.create_id(&ch, PortSpace::TCP).unwrap();
    id.resolve_addr(&addr, 2000).unwrap();
    drop(expect_event(&ch, CmEventType::AddrResolved));
    id.resolve_route(2000).unwrap();
    drop(expect_event(&ch, CmEventType::RouteResolved));
    let client = provision(id, Some(ch), 64);
    client.id.connect(&ConnParam::default()).unwrap();

    let mut ev = expect_event(listen_ch, CmEventType::ConnectRequest);
    let mut server_id = ev.take_id().unwrap();
    drop(ev);
    server_id
        .migrate_id(fabric.create_event_channel().unwrap())
        .unwrap();
    let server = provision(server_id, None, 64);
    server.id.accept(&ConnParam::default()).unwrap();
    drop(expect_event(
        server.id.event_channel().unwrap(),
        CmEventType::Established,
    ));
    drop(expect_event(
        client.channel.as_ref().unwrap(),
        CmEventType::Established,
    ));
    (server, client)
}

fn wait_one(cq: &SimCq) -> WorkCompletion {
    let mut wc = [WorkCompletion::default(); 1];
    for _ in 0..100_000 {
        if cq.poll(&mut wc).unwrap() == 1 {
            return wc[0];
        }
    }
    panic!("no completion");
}

#[test]
fn send_lands_in_posted_receive() {
    let fabric = SimFabric::new();
    let (_lid, lch, addr) = listen(&fabric);
    let (server, mut client) = connect_pair(&fabric, &lch, addr);

    unsafe { server.qp.post_recv(7, &server.mr, 64) }.unwrap();
    client.mr[..5].copy_from_slice(b"hello");
    unsafe { client.qp.post_send(9, &client.mr, 5, SendFlags::SIGNALED) }.unwrap();

    let wc = wait_one(&server.cq);
    assert_eq!((wc.wr_id, wc.opcode, wc.status, wc.byte_len), (7, WcOpcode::Recv, WcStatus::Success, 5));
    assert_eq!(&server.mr[..5], b"hello");
    let wc = wait_one(&client.cq);
    assert_eq!((wc.wr_id, wc.opcode, wc.status), (9, WcOpcode::Send, WcStatus::Success));
}

#[test]
fn send_before_receive_waits_for_the_receive() {
    let fabric = SimFabric::new();
    let (_lid, lch, addr) = listen(&fabric);
    let (server, mut client) = connect_pair(&fabric, &lch, addr);

    client.mr[..4].copy_from_slice(b"PING");
    unsafe { client.qp.post_send(1, &client.mr, 4, SendFlags::SIGNALED) }.unwrap();
    let mut wc = [WorkCompletion::default(); 4];
    assert_eq!(client.cq.poll(&mut wc).unwrap(), 0);

    unsafe { server.qp.post_recv(2, &server.mr, 64) }.unwrap();
    assert_eq!(wait_one(&server.cq).byte_len, 4);
    assert_eq!(wait_one(&client.cq).status, WcStatus::Success);
}

#[test]
fn oversized_message_fails_both_sides() {
    let fabric = SimFabric::new();
    let (_lid, lch, addr) = listen(&fabric);
    let (server, client) = connect_pair(&fabric, &lch, addr);

    unsafe { server.qp.post_recv(1, &server.mr, 8) }.unwrap();
    unsafe { client.qp.post_send(2, &client.mr, 32, SendFlags::SIGNALED) }.unwrap();
    assert_eq!(wait_one(&server.cq).status, WcStatus::LocLenErr);
    assert_eq!(wait_one(&client.cq).status, WcStatus::RemInvReqErr);
}

#[test]
fn disconnect_flushes_receives_and_notifies_both() {
    let fabric = SimFabric::new();
    let (_lid, lch, addr) = listen(&fabric);
    let (server, client) = connect_pair(&fabric, &lch, addr);

    unsafe { server.qp.post_recv(3, &server.mr, 64) }.unwrap();
    client.id.disconnect().unwrap();
    drop(expect_event(
        client.channel.as_ref().unwrap(),
        CmEventType::Disconnected,
    ));
    drop(expect_event(
        server.id.event_channel().unwrap(),
        CmEventType::Disconnected,
    ));
    let wc = wait_one(&server.cq);
    assert_eq!((wc.wr_id, wc.status), (3, WcStatus::WrFlushErr));

    // a second disconnect is harmless
    server.id.disconnect().unwrap();
}

#[test]
fn connect_without_listener_is_rejected() {
    let fabric = SimFabric::new();
    let ch = fabric.create_event_channel().unwrap();
    let id = fabric.create_id(&ch, PortSpace::TCP).unwrap();
    id.resolve_addr(&"127.0.0.1:1".parse().unwrap(), 2000).unwrap();
    drop(expect_event(&ch, CmEventType::AddrResolved));
    id.resolve_route(2000).unwrap();
    drop(expect_event(&ch, CmEventType::RouteResolved));
    id.connect(&ConnParam::default()).unwrap();
    let ev = expect_event(&ch, CmEventType::Rejected);
    assert_eq!(ev.status(), libc::ECONNREFUSED);
}

#[test]
fn listen_twice_on_same_address_fails() {
    let fabric = SimFabric::new();
    let (_lid, _lch, addr) = listen(&fabric);
    let ch = fabric.create_event_channel().unwrap();
    let id = fabric.create_id(&ch, PortSpace::TCP).unwrap();
    id.bind_addr(&addr).unwrap();
    let err = id.listen(16).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EADDRINUSE));
}

#[test]
fn poll_times_out_without_events() {
    let fabric = SimFabric::new();
    let ch = fabric.create_event_channel().unwrap();
    assert!(!ch.poll(Some(Duration::from_millis(10))).unwrap());
}

#[test]
fn injected_fault_fails_once() {
    let fabric = SimFabric::new();
    fabric.inject(Fault::AllocPd);
    let ch = fabric.create_event_channel().unwrap();
    let id = fabric.create_id(&ch, PortSpace::TCP).unwrap();
    assert!(id.alloc_pd().is_err());
    assert!(id.alloc_pd().is_ok());
    assert!(fabric.pending_faults().is_empty());
}

#[test]
fn region_keeps_domain_alive() {
    let fabric = SimFabric::new();
    let ch = fabric.create_event_channel().unwrap();
    let id = fabric.create_id(&ch, PortSpace::TCP).unwrap();
    let serial = id.serial();
    let pd = id.alloc_pd().unwrap();
    let mr = pd
        .reg_mr(vec![0u8; 8].into_boxed_slice(), AccessFlags::LOCAL_WRITE)
        .unwrap();
    drop(pd);
    drop(mr);
    let ops: Vec<Op> = fabric
        .journal()
        .into_iter()
        .filter(|e| e.id == serial)
        .map(|e| e.op)
        .collect();
    assert_eq!(
        ops,
        [Op::CreateId, Op::AllocPd, Op::RegMr, Op::DeregMr, Op::DeallocPd]
    );
}
