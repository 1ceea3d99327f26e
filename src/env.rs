//! Library initialization and the process-wide device registry.
//!
//! The only process-global state: an init refcount, the device list built
//! from the config file, and the registered transports. Everything else is
//! endpoint-local.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config;
use crate::endpoint::Endpoint;
use crate::sock::SockTransport;
use crate::status::{Result, Status};
use crate::transport::{Caps, Device, Transport};
use crate::ABI_VERSION;

struct Globals {
    refs: u32,
    flags: u32,
    devices: Vec<Device>,
}

static GLOBALS: Mutex<Option<Globals>> = Mutex::new(None);

/// Initialize the library: parse `CCI_CONFIG`, register transports, and
/// enumerate devices.
///
/// Calling `init` again with the same or a subset of the flags is a
/// refcounted no-op; requesting new behaviors after the fact fails with
/// `Invalid`. Each successful call needs a matching [`finalize`].
pub fn init(abi_version: u32, flags: u32) -> Result<Caps> {
    if abi_version != ABI_VERSION {
        return Err(Status::Invalid);
    }
    let mut guard = GLOBALS.lock().unwrap();
    if let Some(g) = guard.as_mut() {
        if flags & !g.flags == 0 {
            g.refs += 1;
            return Ok(Caps::THREAD_SAFETY);
        }
        return Err(Status::Invalid);
    }

    let profiles = config::load_from_env()?;
    let transports: Vec<Arc<dyn Transport>> = vec![SockTransport::new()];
    let mut devices = Vec::new();
    for t in &transports {
        for spec in t.enumerate(&profiles)? {
            devices.push(Device::new(spec, t.clone()));
        }
    }
    devices.sort_by(|a, b| b.priority().cmp(&a.priority()));
    debug!(devices = devices.len(), "library initialized");

    *guard = Some(Globals {
        refs: 1,
        flags,
        devices,
    });
    Ok(Caps::THREAD_SAFETY)
}

/// Release one init reference; the last call tears the registry down.
pub fn finalize() -> Result<()> {
    let mut guard = GLOBALS.lock().unwrap();
    match guard.as_mut() {
        None => Err(Status::Generic),
        Some(g) => {
            g.refs -= 1;
            if g.refs == 0 {
                *guard = None;
            }
            Ok(())
        }
    }
}

/// The enumerated devices, ordered by descending priority.
pub fn get_devices() -> Result<Vec<Device>> {
    GLOBALS
        .lock()
        .unwrap()
        .as_ref()
        .map(|g| g.devices.clone())
        .ok_or(Status::Generic)
}

/// Create an endpoint on `device`, or on the default device when `None`.
///
/// Returns the endpoint; the wake handle is available through
/// [`Endpoint::os_handle`].
pub fn create_endpoint(device: Option<&Device>, _flags: u32) -> Result<Endpoint> {
    let dev = match device {
        Some(d) => d.clone(),
        None => default_device()?,
    };
    if !dev.up() {
        return Err(Status::NoDevice);
    }
    let ops = dev.transport().create_endpoint(&dev, None)?;
    Ok(Endpoint::new(ops))
}

/// Create an endpoint bound to a transport-specific service (a port for
/// socket transports).
pub fn create_endpoint_at(device: &Device, service: &str, _flags: u32) -> Result<Endpoint> {
    if !device.up() {
        return Err(Status::NoDevice);
    }
    let ops = device.transport().create_endpoint(device, Some(service))?;
    Ok(Endpoint::new(ops))
}

fn default_device() -> Result<Device> {
    let guard = GLOBALS.lock().unwrap();
    let g = guard.as_ref().ok_or(Status::Generic)?;
    g.devices
        .iter()
        .find(|d| d.is_default() && d.up())
        .or_else(|| g.devices.iter().find(|d| d.up()))
        .cloned()
        .ok_or(Status::NoDevice)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_rejects_wrong_abi() {
        assert_eq!(init(ABI_VERSION + 1, 0), Err(Status::Invalid));
    }

    #[test]
    fn test_finalize_without_init() {
        // No unit test initializes the library, so the registry is empty.
        assert_eq!(finalize(), Err(Status::Generic));
        assert!(get_devices().is_err());
    }
}
