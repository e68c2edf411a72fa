//! The passive side: expose one buffer and hand its descriptor to every
//! client that connects.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;

use crate::config::{Config, CONN_PARAMS, CQ_DEPTH, LISTEN_BACKLOG, SERVER_QP_CAPS};
use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::fabric::*;
use crate::region::RegisteredBuf;

const META_WR_ID: u64 = 1;

/// Resources of one accepted connection.
struct Connection<F: Fabric> {
    // Field order is drop order.
    qp: F::Qp,
    _cq: F::Cq,
    _id: F::CmId,
}

/// A listening server exposing one remotely readable buffer.
pub struct ServerSession<F: Fabric> {
    // Field order is drop order.
    conns: HashMap<ConnKey, Connection<F>>,
    listener: F::CmId,
    channel: F::EventChannel,
    meta: RegisteredBuf<F::Mr>,
    _data: RegisteredBuf<F::Mr>,
    comp_channel: F::CompChannel,
    pd: F::Pd,
    ctx: F::Context,

    descriptor: Descriptor,
    addr: SocketAddr,
}

impl<F: Fabric> ServerSession<F> {
    /// Open the configured device, register the payload and start listening.
    pub fn new(fabric: &F, config: &Config) -> Result<Self> {
        let devices = fabric
            .devices()
            .map_err(Error::setup("ibv_get_device_list"))?;
        if devices.is_empty() {
            log::error!("rdread: no RDMA device found");
        }
        let mut found = None;
        for dev in devices {
            if dev.name().map_err(Error::setup("ibv_get_device_name"))? == config.device {
                found = Some(dev);
                break;
            }
        }
        let dev = found.ok_or_else(|| Error::DeviceNotFound(config.device.clone()))?;
        let ctx = dev.open().map_err(Error::setup("ibv_open_device"))?;
        log::info!("device {} is opened", config.device);

        let pd = ctx.alloc_pd().map_err(Error::setup("ibv_alloc_pd"))?;

        let data = RegisteredBuf::register(&pd, config.payload_bytes(), Permission::REMOTE_READ)?;
        let descriptor = Descriptor::for_region(&data);
        let meta = RegisteredBuf::register(
            &pd,
            Box::new(descriptor.encode()),
            Permission::LOCAL_WRITE,
        )?;

        let comp_channel = ctx
            .create_comp_channel()
            .map_err(Error::setup("ibv_create_comp_channel"))?;

        let channel = fabric
            .create_event_channel()
            .map_err(Error::setup("rdma_create_event_channel"))?;
        let listener = channel
            .create_id(Some(&ctx))
            .map_err(Error::setup("rdma_create_id"))?;
        let addr = config.socket_addr();
        listener
            .bind_addr(addr)
            .map_err(Error::setup("rdma_bind_addr"))?;
        listener
            .listen(LISTEN_BACKLOG)
            .map_err(Error::setup("rdma_listen"))?;
        log::info!("server is listening at: {}", addr);

        Ok(Self {
            conns: HashMap::new(),
            listener,
            channel,
            meta,
            _data: data,
            comp_channel,
            pd,
            ctx,
            descriptor,
            addr,
        })
    }

    /// The descriptor handed to clients.
    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The listening connection id.
    pub fn listener(&self) -> &F::CmId {
        &self.listener
    }

    /// Number of live connections.
    pub fn connections(&self) -> usize {
        self.conns.len()
    }

    /// Handle the next event.
    ///
    /// Handler failures only affect the connection concerned; they are
    /// logged and the server carries on. An error is returned only when the
    /// event channel itself fails.
    pub fn process_next_event(&mut self) -> Result<()> {
        let mut event = self
            .channel
            .get_event()
            .map_err(Error::transport("rdma_get_cm_event"))?;
        let kind = event.kind();
        log::info!("a new {} type event is received", kind);

        // Resources released by the handlers. Destroying an id waits for its
        // events, so these are dropped only after the acknowledgement.
        let mut refused = None;
        let mut closed = None;
        let res = match kind {
            CmEventKind::ConnectRequest => self.on_connect_request(&mut event, &mut refused),
            CmEventKind::Established => self.on_established(event.conn()),
            CmEventKind::Disconnected => {
                closed = self.conns.remove(&event.conn());
                if closed.is_none() {
                    log::warn!("rdread: disconnect of unknown connection {:?}", event.conn());
                }
                Ok(())
            }
            CmEventKind::ConnectError | CmEventKind::Unreachable | CmEventKind::Rejected => {
                closed = self.conns.remove(&event.conn());
                log::warn!(
                    "rdread: connection {:?} failed with {} (status {})",
                    event.conn(),
                    kind,
                    event.status()
                );
                Ok(())
            }
            other => {
                log::info!("event {} (status {}) ignored", other, event.status());
                Ok(())
            }
        };
        if let Err(e) = res {
            log::error!("rdread: handling {} failed: {}", kind, e);
        }

        if let Err(e) = event.ack() {
            log::error!("rdread: failed to acknowledge the cm event {}: {}", kind, e);
        }
        drop(refused);
        if let Some(conn) = closed {
            drop(conn);
            log::info!("connection released, {} remaining", self.conns.len());
        }
        Ok(())
    }

    /// Handle events until the event channel fails.
    pub fn run(&mut self) -> Result<Infallible> {
        loop {
            self.process_next_event()?;
        }
    }

    fn on_connect_request(
        &mut self,
        event: &mut F::Event,
        refused: &mut Option<F::CmId>,
    ) -> Result<()> {
        let Some(id) = event.take_id() else {
            return Err(Error::SetupFailed {
                step: "connect request",
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "event carries no connection id",
                ),
            });
        };

        match self.accept(&id) {
            Ok((cq, qp)) => {
                log::info!("connection accepted: qpn={:#x}", qp.qp_num());
                self.conns.insert(
                    id.key(),
                    Connection {
                        qp,
                        _cq: cq,
                        _id: id,
                    },
                );
                Ok(())
            }
            Err(e) => {
                if let Err(e) = id.reject() {
                    log::warn!("rdread: failed to reject a connect request: {}", e);
                }
                *refused = Some(id);
                Err(e)
            }
        }
    }

    fn accept(&self, id: &F::CmId) -> Result<(F::Cq, F::Qp)> {
        let cq = self
            .ctx
            .create_cq(CQ_DEPTH, &self.comp_channel)
            .map_err(Error::setup("ibv_create_cq"))?;
        let qp = id
            .create_qp(&self.pd, &cq, &SERVER_QP_CAPS)
            .map_err(Error::setup("rdma_create_qp"))?;
        id.accept(&CONN_PARAMS)
            .map_err(Error::setup("rdma_accept"))?;
        Ok((cq, qp))
    }

    fn on_established(&mut self, key: ConnKey) -> Result<()> {
        let conn = self.conns.get(&key).ok_or_else(|| Error::SetupFailed {
            step: "established",
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("unknown connection {:?}", key),
            ),
        })?;

        let wr = SendWr::send(META_WR_ID, self.meta.sge());
        // SAFETY: `meta` outlives every connection's queue pair.
        unsafe { conn.qp.post_send(&wr) }.map_err(Error::post("descriptor SEND"))?;
        log::info!("descriptor sent to qpn={:#x}", conn.qp.qp_num());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::client::ClientSession;
    use crate::config::{CLIENT_QP_CAPS, RESOLVE_TIMEOUT};
    use crate::event::expect_event;
    use crate::sim::SimFabric;

    const PAYLOAD: &[u8] = b"hello world!\0";

    /// Send a connect request to `addr`, then tear the initiator down before
    /// anyone answers it.
    fn abandon_connect_request(fabric: &SimFabric, addr: SocketAddr) {
        let channel = fabric.create_event_channel().unwrap();
        let id = channel.create_id(None).unwrap();
        id.resolve_addr(addr, RESOLVE_TIMEOUT).unwrap();
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
        drop(id);
    }

    #[test]
    fn setup_describes_the_payload() {
        let fabric = SimFabric::with_device("rxe_0");
        let server = ServerSession::new(&fabric, &Config::default()).unwrap();

        let desc = server.descriptor();
        assert_eq!(desc.len, 13);
        assert_eq!(server.local_addr(), "0.0.0.0:1717".parse().unwrap());
        assert_eq!(server.connections(), 0);
        assert_eq!(fabric.listeners(), 1);
        assert_eq!(fabric.registered_regions(), 2);

        drop(server);
        assert_eq!(fabric.listeners(), 0);
        assert_eq!(fabric.registered_regions(), 0);
    }

    #[test]
    fn device_not_found() {
        let fabric = SimFabric::with_device("mlx5_0");
        let err = ServerSession::new(&fabric, &Config::default()).err().unwrap();
        assert!(matches!(err, Error::DeviceNotFound(ref name) if name == "rxe_0"));
    }

    #[test]
    fn address_in_use() {
        let fabric = SimFabric::with_device("rxe_0");
        let _first = ServerSession::new(&fabric, &Config::default()).unwrap();
        let err = ServerSession::new(&fabric, &Config::default()).err().unwrap();
        assert!(matches!(err, Error::SetupFailed { step: "rdma_bind_addr", .. }));
    }

    #[test]
    fn every_event_is_acknowledged() {
        let fabric = SimFabric::with_device("rxe_0");
        let mut server = ServerSession::new(&fabric, &Config::default()).unwrap();
        let addr = server.local_addr();

        // Refused: the initiator is gone, so the accept fails.
        abandon_connect_request(&fabric, addr);
        assert_eq!(server.channel.pending(), 1);
        server.process_next_event().unwrap();
        assert_eq!(server.channel.unacked(), 0);
        assert_eq!(server.connections(), 0);

        let client = thread::spawn({
            let fabric = fabric.clone();
            move || {
                let mut client = ClientSession::connect(&fabric, addr).unwrap();
                let first = client.read().unwrap();
                let second = client.read().unwrap();
                client.disconnect().unwrap();
                (first, second)
            }
        });

        // CONNECT_REQUEST
        server.process_next_event().unwrap();
        assert_eq!(server.channel.unacked(), 0);
        assert_eq!(server.connections(), 1);
        let key = *server.conns.keys().next().unwrap();
        assert_ne!(key, server.listener().key());

        // ESTABLISHED
        server.process_next_event().unwrap();
        assert_eq!(server.channel.unacked(), 0);
        assert_eq!(server.connections(), 1);

        // DISCONNECTED
        server.process_next_event().unwrap();
        assert_eq!(server.channel.unacked(), 0);
        assert_eq!(server.connections(), 0);

        let (first, second) = client.join().unwrap();
        assert_eq!(first, PAYLOAD);
        assert_eq!(second, PAYLOAD);
        assert_eq!(server.channel.pending(), 0);
    }

    #[test]
    fn failed_connection_is_released() {
        let fabric = SimFabric::with_device("rxe_0");
        let mut server = ServerSession::new(&fabric, &Config::default()).unwrap();
        let addr = server.local_addr();

        let (data_tx, data_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let client = thread::spawn({
            let fabric = fabric.clone();
            move || {
                let mut client = ClientSession::connect(&fabric, addr).unwrap();
                data_tx.send(client.read().unwrap()).unwrap();
                release_rx.recv().unwrap();
            }
        });

        // CONNECT_REQUEST, ESTABLISHED.
        server.process_next_event().unwrap();
        server.process_next_event().unwrap();
        assert_eq!(data_rx.recv().unwrap(), PAYLOAD);
        assert_eq!(server.connections(), 1);

        let conn = *server.conns.keys().next().unwrap();
        server
            .channel
            .inject(CmEventKind::ConnectError, -libc::ETIMEDOUT, conn);
        server.process_next_event().unwrap();
        assert_eq!(server.connections(), 0);
        assert_eq!(server.channel.unacked(), 0);

        release_tx.send(()).unwrap();
        client.join().unwrap();
        assert_eq!(server.channel.pending(), 0);
    }
}
