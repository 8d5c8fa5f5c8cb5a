#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

pub mod lock;
pub mod status;
pub mod trigger;
pub mod util;

#[derive(Debug)]
#[non_exhaustive]
pub enum DeviceError {
    NotSupported,
    IoTimeout,
    IoError,
}

/// The embedding application's view of one instrument endpoint.
///
/// The HiSLIP server delivers complete message-unit payloads to [Device::execute]
/// and forwards out-of-band protocol events to the remaining methods. All methods
/// are called with the device mutex held, one message at a time.
pub trait Device {
    /// Execute a complete command sequence as assembled from the synchronous
    /// channel. Returning `Some(data)` queues `data` as the response to this
    /// message unit, `None` produces no response.
    fn execute(&mut self, cmd: &[u8]) -> Option<Vec<u8>>;

    /// Return the current device status (STB) byte.
    /// The MAV bit (0x10) is owned by the session layer and will be overwritten.
    fn get_status(&mut self) -> u8;

    /// Send a trigger signal to the device
    fn trigger(&mut self, _source: trigger::Source) -> Result<(), DeviceError> {
        Err(DeviceError::NotSupported)
    }

    /// Device clear, i.e. abandon any in-progress command and reset the
    /// input/output queues. Does not change device settings.
    fn clear(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Set remote/local state
    ///
    /// When in remote, frontpanel or any other local controls (except for a
    /// 'local' button if any) should be ignored.
    fn set_remote(&mut self, _remote: bool) -> Result<(), DeviceError> {
        Err(DeviceError::NotSupported)
    }

    /// Enable/disable lockout for the 'local' button
    fn set_local_lockout(&mut self, _enable: bool) {
        // Do nothing
    }
}

impl<T: Device + ?Sized> Device for Box<T> {
    fn execute(&mut self, cmd: &[u8]) -> Option<Vec<u8>> {
        (**self).execute(cmd)
    }

    fn get_status(&mut self) -> u8 {
        (**self).get_status()
    }

    fn trigger(&mut self, source: trigger::Source) -> Result<(), DeviceError> {
        (**self).trigger(source)
    }

    fn clear(&mut self) -> Result<(), DeviceError> {
        (**self).clear()
    }

    fn set_remote(&mut self, remote: bool) -> Result<(), DeviceError> {
        (**self).set_remote(remote)
    }

    fn set_local_lockout(&mut self, enable: bool) {
        (**self).set_local_lockout(enable)
    }
}
