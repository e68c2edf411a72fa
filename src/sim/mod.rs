//! An in-process software fabric.
//!
//! Both endpoints of a connection live in the same process and share one
//! [`SimFabric`]. Memory registration, queue pairs and the connection
//! manager behave like their verbs counterparts closely enough to run the
//! whole protocol, including its failure modes:
//!
//! - a SEND with no receive posted at the peer is dropped and fails the
//!   sender with [`WcStatus::RnrRetryExcErr`];
//! - a READ checks key, protection domain, permission and bounds on both
//!   sides, failing with [`WcStatus::RemAccessErr`] or
//!   [`WcStatus::LocProtErr`];
//! - connecting to an address nobody listens on yields `REJECTED`, and
//!   resolving an address on a fabric without devices yields `ADDR_ERROR`.
//!
//! Keys are synthetic and never reused within a fabric.
//!
//! [`WcStatus::RnrRetryExcErr`]: crate::fabric::WcStatus::RnrRetryExcErr
//! [`WcStatus::RemAccessErr`]: crate::fabric::WcStatus::RemAccessErr
//! [`WcStatus::LocProtErr`]: crate::fabric::WcStatus::LocProtErr

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::fabric::*;

mod cm;
mod cq;
mod qp;

pub use self::cm::{SimCmEvent, SimCmId, SimEventChannel};
pub use self::cq::{SimCompChannel, SimCq, SimCqRef};
pub use self::qp::SimQp;

use self::cm::IdShared;

/// Lock a mutex, ignoring poisoning; the protected state stays consistent
/// across every critical section in this module.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn os_err(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// A registered span of process memory.
struct Region {
    addr: u64,
    len: usize,
    perm: Permission,
    pd: usize,
}

impl Region {
    fn covers(&self, addr: u64, len: usize) -> bool {
        let (Some(end), Some(region_end)) = (
            addr.checked_add(len as u64),
            self.addr.checked_add(self.len as u64),
        ) else {
            return false;
        };
        addr >= self.addr && end <= region_end
    }
}

#[derive(Default)]
struct World {
    listeners: HashMap<SocketAddr, (ConnKey, Weak<IdShared>)>,
    regions: HashMap<u32, Region>,
}

impl World {
    /// Look up the region `key` and check it for an access of `len` bytes at
    /// `addr` from protection domain `pd`.
    fn check(&self, key: u32, pd: usize, addr: u64, len: usize, need: Permission) -> bool {
        match self.regions.get(&key) {
            Some(region) => region.pd == pd && region.perm.contains(need) && region.covers(addr, len),
            None => false,
        }
    }

    /// Find the listener for `addr`, falling back to wildcard listeners on
    /// the same port.
    fn listener(&self, addr: SocketAddr) -> Option<Arc<IdShared>> {
        let port = addr.port();
        [
            addr,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        ]
        .iter()
        .find_map(|a| self.listeners.get(a).and_then(|(_, l)| l.upgrade()))
    }
}

struct Shared {
    devices: Vec<String>,
    next_key: AtomicU32,
    next_handle: AtomicUsize,
    world: Mutex<World>,
}

/// Handle to a software fabric. Clones share the same fabric.
#[derive(Clone)]
pub struct SimFabric {
    shared: Arc<Shared>,
}

impl SimFabric {
    /// Create a fabric with the named devices.
    pub fn new(devices: &[&str]) -> Self {
        Self {
            shared: Arc::new(Shared {
                devices: devices.iter().map(|d| d.to_string()).collect(),
                next_key: AtomicU32::new(0x100),
                next_handle: AtomicUsize::new(1),
                world: Mutex::new(World::default()),
            }),
        }
    }

    /// Create a fabric with a single device.
    pub fn with_device(name: &str) -> Self {
        Self::new(&[name])
    }

    /// Number of memory regions currently registered.
    pub fn registered_regions(&self) -> usize {
        lock(&self.shared.world).regions.len()
    }

    /// Number of addresses currently listened on.
    pub fn listeners(&self) -> usize {
        lock(&self.shared.world)
            .listeners
            .values()
            .filter(|(_, l)| l.strong_count() > 0)
            .count()
    }

    fn has_devices(&self) -> bool {
        !self.shared.devices.is_empty()
    }

    fn next_key(&self) -> u32 {
        self.shared.next_key.fetch_add(1, Ordering::Relaxed)
    }

    fn next_handle(&self) -> usize {
        self.shared.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn world(&self) -> MutexGuard<'_, World> {
        lock(&self.shared.world)
    }
}

impl Fabric for SimFabric {
    type Device = SimDevice;
    type Context = SimContext;
    type Pd = SimPd;
    type Mr = SimMr;
    type CompChannel = SimCompChannel;
    type Cq = SimCq;
    type EventChannel = SimEventChannel;
    type Event = SimCmEvent;
    type CmId = SimCmId;
    type Qp = SimQp;

    fn devices(&self) -> io::Result<Vec<SimDevice>> {
        Ok((0..self.shared.devices.len())
            .map(|index| SimDevice {
                fabric: self.clone(),
                index,
            })
            .collect())
    }

    fn create_event_channel(&self) -> io::Result<SimEventChannel> {
        Ok(SimEventChannel::new(self.clone()))
    }
}

pub struct SimDevice {
    fabric: SimFabric,
    index: usize,
}

impl Device<SimFabric> for SimDevice {
    fn name(&self) -> io::Result<String> {
        Ok(self.fabric.shared.devices[self.index].clone())
    }

    fn open(&self) -> io::Result<SimContext> {
        Ok(SimContext {
            fabric: self.fabric.clone(),
            device: self.index,
        })
    }
}

/// An opened software device.
#[derive(Clone)]
pub struct SimContext {
    fabric: SimFabric,
    device: usize,
}

impl SimContext {
    pub fn device_name(&self) -> &str {
        &self.fabric.shared.devices[self.device]
    }
}

impl DeviceContext<SimFabric> for SimContext {
    fn alloc_pd(&self) -> io::Result<SimPd> {
        Ok(SimPd {
            fabric: self.fabric.clone(),
            id: self.fabric.next_handle(),
        })
    }

    fn create_comp_channel(&self) -> io::Result<SimCompChannel> {
        Ok(SimCompChannel::new())
    }

    fn create_cq(&self, depth: u32, channel: &SimCompChannel) -> io::Result<SimCq> {
        if depth == 0 {
            return Err(os_err(libc::EINVAL));
        }
        Ok(SimCq::new(depth, channel))
    }
}

pub struct SimPd {
    fabric: SimFabric,
    id: usize,
}

impl ProtectionDomain for SimPd {
    type Mr = SimMr;

    unsafe fn reg_mr(&self, addr: *mut u8, len: usize, perm: Permission) -> io::Result<SimMr> {
        if addr.is_null() || len == 0 {
            return Err(os_err(libc::EINVAL));
        }

        let key = self.fabric.next_key();
        let addr = addr as u64;
        self.fabric.world().regions.insert(
            key,
            Region {
                addr,
                len,
                perm,
                pd: self.id,
            },
        );
        Ok(SimMr {
            fabric: self.fabric.clone(),
            key,
            addr,
            len,
            registered: true,
        })
    }
}

pub struct SimMr {
    fabric: SimFabric,
    key: u32,
    addr: u64,
    len: usize,
    registered: bool,
}

impl SimMr {
    fn release(&mut self) -> io::Result<()> {
        if !std::mem::replace(&mut self.registered, false) {
            return Ok(());
        }
        match self.fabric.world().regions.remove(&self.key) {
            Some(_) => Ok(()),
            None => Err(os_err(libc::EINVAL)),
        }
    }
}

impl MemoryRegion for SimMr {
    fn addr(&self) -> u64 {
        self.addr
    }

    fn len(&self) -> usize {
        self.len
    }

    fn lkey(&self) -> u32 {
        self.key
    }

    fn rkey(&self) -> u32 {
        self.key
    }

    fn dereg(mut self) -> io::Result<()> {
        self.release()
    }
}

impl Drop for SimMr {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("sim: failed to deregister key {:#x}: {}", self.key, e);
        }
    }
}
