use alloc::{sync::Arc, vec::Vec};
use futures::lock::Mutex;

use crate::{Device, DeviceError};

fn trim_ascii(cmd: &[u8]) -> &[u8] {
    let start = cmd
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(cmd.len());
    let end = cmd
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &cmd[start..end]
}

/// Responds to every message with the message itself.
pub struct EchoDevice;

impl EchoDevice {
    pub fn new_arc() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self))
    }
}

impl Device for EchoDevice {
    fn execute(&mut self, cmd: &[u8]) -> Option<Vec<u8>> {
        if cmd.is_empty() {
            None
        } else {
            Some(cmd.to_vec())
        }
    }

    fn get_status(&mut self) -> u8 {
        0
    }

    fn trigger(&mut self, _source: crate::trigger::Source) -> Result<(), DeviceError> {
        Ok(())
    }

    fn clear(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// A fake instrument answering a handful of common queries.
pub struct SimpleDevice;

impl SimpleDevice {
    pub fn new_arc() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self))
    }
}

impl Device for SimpleDevice {
    fn execute(&mut self, cmd: &[u8]) -> Option<Vec<u8>> {
        match trim_ascii(cmd) {
            x if x.eq_ignore_ascii_case(b"*IDN?") => {
                Some(b"Cyberdyne systems,T800 Model 101,A9012.C,V2.4".to_vec())
            }
            x if x.eq_ignore_ascii_case(b"EVENT") => None,
            x if x.eq_ignore_ascii_case(b"QUERY?") => Some(b"RESPONSE".to_vec()),
            _ => None,
        }
    }

    fn get_status(&mut self) -> u8 {
        0
    }

    fn trigger(&mut self, _source: crate::trigger::Source) -> Result<(), DeviceError> {
        Ok(())
    }

    fn clear(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}
