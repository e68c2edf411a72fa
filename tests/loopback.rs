//! Client and server sessions talking over one software fabric.

use std::net::SocketAddr;
use std::thread::{self, JoinHandle};

use rdread::config::{CLIENT_QP_CAPS, CONN_PARAMS, CQ_DEPTH, RESOLVE_TIMEOUT};
use rdread::fabric::RecvWr;
use rdread::prelude::*;
use rdread::sim::SimFabric;
use rdread::Error;

fn server_addr() -> SocketAddr {
    "0.0.0.0:1717".parse().unwrap()
}

/// Start a server and let it handle `events` events on its own thread.
fn serve(fabric: &SimFabric, events: usize) -> JoinHandle<ServerSession<SimFabric>> {
    let mut server = ServerSession::new(fabric, &Config::default()).unwrap();
    thread::spawn(move || {
        for _ in 0..events {
            server.process_next_event().unwrap();
        }
        server
    })
}

#[test]
fn hello_world() {
    let fabric = SimFabric::with_device("rxe_0");
    // CONNECT_REQUEST, ESTABLISHED, DISCONNECTED.
    let server = serve(&fabric, 3);

    let mut client = ClientSession::connect(&fabric, server_addr()).unwrap();
    assert_eq!(client.state(), ClientState::Established);

    let desc = client.fetch_descriptor().unwrap();
    assert_eq!(desc.len, 13);

    let data = client.read().unwrap();
    assert_eq!(data, b"hello world!\0");
    assert_eq!(data.len(), desc.len as usize);

    client.disconnect().unwrap();
    assert_eq!(client.state(), ClientState::Disconnected);

    let server = server.join().unwrap();
    assert_eq!(server.connections(), 0);
    assert_eq!(server.descriptor(), desc);
}

#[test]
fn custom_payload() {
    let fabric = SimFabric::with_device("mlx5_0");
    let config = Config {
        device: "mlx5_0".to_owned(),
        payload: "x".repeat(4096),
        ..Config::default()
    };
    let mut server = ServerSession::new(&fabric, &config).unwrap();
    let server = thread::spawn(move || {
        for _ in 0..3 {
            server.process_next_event().unwrap();
        }
    });

    let mut client = ClientSession::connect(&fabric, server_addr()).unwrap();
    let data = client.read().unwrap();
    assert_eq!(data.len(), 4097);
    assert!(data[..4096].iter().all(|&b| b == b'x'));
    assert_eq!(data[4096], 0);

    client.disconnect().unwrap();
    server.join().unwrap();
}

#[test]
fn no_listener() {
    let fabric = SimFabric::with_device("rxe_0");
    let err = ClientSession::connect(&fabric, server_addr()).err().unwrap();
    assert!(matches!(
        err,
        Error::RemoteRejected {
            kind: CmEventKind::Rejected,
            ..
        }
    ));
}

#[test]
fn late_receive_loses_the_descriptor() {
    let fabric = SimFabric::with_device("rxe_0");
    // CONNECT_REQUEST, ESTABLISHED: the descriptor is sent right away.
    let server = serve(&fabric, 2);

    let channel = fabric.create_event_channel().unwrap();
    let id = channel.create_id(None).unwrap();
    id.resolve_addr(server_addr(), RESOLVE_TIMEOUT).unwrap();
    expect_event::<SimFabric>(&channel, CmEventKind::AddrResolved).unwrap();
    id.resolve_route(RESOLVE_TIMEOUT).unwrap();
    expect_event::<SimFabric>(&channel, CmEventKind::RouteResolved).unwrap();

    let ctx = id.context().unwrap();
    let pd = ctx.alloc_pd().unwrap();
    let comp_channel = ctx.create_comp_channel().unwrap();
    let cq = ctx.create_cq(CQ_DEPTH, &comp_channel).unwrap();
    cq.req_notify().unwrap();
    let qp = id.create_qp(&pd, &cq, &CLIENT_QP_CAPS).unwrap();

    // Connect without a receive posted.
    id.connect(&CONN_PARAMS).unwrap();
    expect_event::<SimFabric>(&channel, CmEventKind::Established).unwrap();
    let server = server.join().unwrap();
    assert_eq!(server.connections(), 1);

    let meta = RegisteredBuf::zeroed(&pd, Descriptor::SIZE, Permission::LOCAL_WRITE).unwrap();
    unsafe { qp.post_recv(&RecvWr::new(1, meta.sge())) }.unwrap();

    // The message is gone: nothing arrives and the buffer is untouched.
    let mut wc = [Wc::default(); 4];
    assert_eq!(cq.poll_into(&mut wc).unwrap(), 0);
    assert_eq!(comp_channel.pending_events(), 0);
    assert!(meta.iter().all(|&b| b == 0));

    drop(qp);
    drop(meta);
}

#[test]
fn read_with_bad_key() {
    let fabric = SimFabric::with_device("rxe_0");
    // CONNECT_REQUEST, ESTABLISHED, DISCONNECTED.
    let server = serve(&fabric, 3);

    let mut client = ClientSession::connect(&fabric, server_addr()).unwrap();
    let mut desc = client.fetch_descriptor().unwrap();
    desc.rkey ^= 0xffff_0000;

    let err = client.read_remote(&desc).unwrap_err();
    assert!(matches!(
        err,
        Error::WorkRequestFailed {
            status: WcStatus::RemAccessErr,
            index: 0
        }
    ));
    assert_eq!(client.state(), ClientState::Failed);

    drop(client);
    assert_eq!(server.join().unwrap().connections(), 0);
}

#[test]
fn read_past_the_end() {
    let fabric = SimFabric::with_device("rxe_0");
    let server = serve(&fabric, 3);

    let mut client = ClientSession::connect(&fabric, server_addr()).unwrap();
    let mut desc = client.fetch_descriptor().unwrap();
    desc.len += 1;

    let err = client.read_remote(&desc).unwrap_err();
    assert!(matches!(
        err,
        Error::WorkRequestFailed {
            status: WcStatus::RemAccessErr,
            index: 0
        }
    ));

    drop(client);
    server.join().unwrap();
}

#[test]
fn server_survives_a_vanished_client() {
    let fabric = SimFabric::with_device("rxe_0");
    let mut server = ServerSession::new(&fabric, &Config::default()).unwrap();

    // A client that gives up before being accepted.
    {
        let channel = fabric.create_event_channel().unwrap();
        let id = channel.create_id(None).unwrap();
        id.resolve_addr(server_addr(), RESOLVE_TIMEOUT).unwrap();
        expect_event::<SimFabric>(&channel, CmEventKind::AddrResolved).unwrap();
        id.resolve_route(RESOLVE_TIMEOUT).unwrap();
        expect_event::<SimFabric>(&channel, CmEventKind::RouteResolved).unwrap();

        let ctx = id.context().unwrap();
        let pd = ctx.alloc_pd().unwrap();
        let comp_channel = ctx.create_comp_channel().unwrap();
        let cq = ctx.create_cq(CQ_DEPTH, &comp_channel).unwrap();
        let qp = id.create_qp(&pd, &cq, &CLIENT_QP_CAPS).unwrap();
        id.connect(&CONN_PARAMS).unwrap();
        drop(qp);
    }

    // Failed CONNECT_REQUEST, then CONNECT_REQUEST, ESTABLISHED, DISCONNECTED.
    let server = thread::spawn(move || {
        for _ in 0..4 {
            server.process_next_event().unwrap();
        }
        server
    });

    let mut client = ClientSession::connect(&fabric, server_addr()).unwrap();
    assert_eq!(client.read().unwrap(), b"hello world!\0");
    client.disconnect().unwrap();

    let server = server.join().unwrap();
    assert_eq!(server.connections(), 0);
}
