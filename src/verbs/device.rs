use std::ffi::CStr;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use super::{Context, Verbs};
use crate::bindings::*;
use crate::fabric;

raw_handle! {
    /// Handle of `*mut ibv_device`.
    IbvDevice => ibv_device
}

impl IbvDevice {
    /// Get the name of this device.
    pub fn name(&self) -> io::Result<String> {
        // SAFETY: FFI.
        let name = unsafe { ibv_get_device_name(self.as_ptr()) };
        if name.is_null() {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: `ibv_get_device_name` returns a pointer to a valid C string.
        let name = unsafe { CStr::from_ptr(name) };
        Ok(name.to_string_lossy().into_owned())
    }
}

/// Owner of the array returned by `ibv_get_device_list`.
struct IbvDeviceList(NonNull<*mut ibv_device>);

// SAFETY: the list is immutable once returned.
unsafe impl Send for IbvDeviceList {}
unsafe impl Sync for IbvDeviceList {}

impl Drop for IbvDeviceList {
    fn drop(&mut self) {
        // SAFETY: FFI; contexts opened from the list stay valid.
        unsafe { ibv_free_device_list(self.0.as_ptr()) };
    }
}

/// Get the RDMA devices present on this host.
pub(super) fn list() -> io::Result<Vec<Device>> {
    let mut n = 0i32;

    // SAFETY: FFI.
    let list = unsafe { ibv_get_device_list(&mut n) };
    let list = NonNull::new(list).ok_or_else(io::Error::last_os_error)?;
    let list = Arc::new(IbvDeviceList(list));

    let devices = (0..n.max(0) as usize)
        .filter_map(|i| {
            // SAFETY: `ibv_get_device_list` returns an array of `n` non-null
            // device pointers.
            let dev = unsafe { *list.0.as_ptr().add(i) };
            NonNull::new(dev).map(|dev| Device {
                dev: IbvDevice(dev),
                _list: list.clone(),
            })
        })
        .collect();
    Ok(devices)
}

/// An RDMA device, not yet opened.
pub struct Device {
    dev: IbvDevice,
    _list: Arc<IbvDeviceList>,
}

impl fabric::Device<Verbs> for Device {
    fn name(&self) -> io::Result<String> {
        self.dev.name()
    }

    fn open(&self) -> io::Result<Context> {
        // SAFETY: FFI.
        let ctx = unsafe { ibv_open_device(self.dev.as_ptr()) };
        let ctx = NonNull::new(ctx).ok_or_else(io::Error::last_os_error)?;
        Ok(Context::opened(ctx))
    }
}
