// src/utils.rs

//! A collection of utility functions for platform-specific operations.
//!
//! This module provides helpers for:
//! - Reading and setting Android properties.
//! - Binding the daemon's abstract Unix socket and querying peer credentials.
//! - A trait (`UnixStreamExt`) for the integer and string framing shared with the app.

use anyhow::{Result, bail};
use std::io::{self, Read, Write};
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};

#[cfg(target_os = "android")]
use std::os::android::net::SocketAddrExt;
#[cfg(target_os = "linux")]
use std::os::linux::net::SocketAddrExt;

// --- Android Property Utilities ---

/// Retrieves an Android system property value.
#[cfg(target_os = "android")]
pub fn get_property(name: &str) -> Result<String> {
    use std::ffi::{CString, c_char};

    let name = CString::new(name)?;
    let mut buf = vec![0u8; 92]; // PROP_VALUE_MAX
    let len = unsafe { __system_property_get(name.as_ptr(), buf.as_mut_ptr() as *mut c_char) };
    if len > 0 {
        Ok(String::from_utf8_lossy(&buf[..len as usize]).to_string())
    } else {
        Ok(String::new())
    }
}

#[cfg(not(target_os = "android"))]
pub fn get_property(_name: &str) -> Result<String> {
    Ok(String::new())
}

/// Sets an Android system property through the property service.
#[cfg(target_os = "android")]
pub fn set_property(name: &str, value: &str) -> Result<()> {
    use std::ffi::CString;

    let c_name = CString::new(name)?;
    let c_value = CString::new(value)?;
    let ret = unsafe { __system_property_set(c_name.as_ptr(), c_value.as_ptr()) };
    if ret != 0 {
        bail!("Property service rejected {name}={value}");
    }
    Ok(())
}

#[cfg(not(target_os = "android"))]
pub fn set_property(name: &str, _value: &str) -> Result<()> {
    bail!("Cannot set {name}: no property service on this platform")
}

// --- Unix Socket and IPC Extensions ---

/// An extension trait for `UnixStream` to read and write the app's wire primitives.
///
/// Integers are 4-byte signed values in native byte order. Strings are an
/// integer length followed by that many UTF-8 bytes.
pub trait UnixStreamExt {
    fn read_i32(&mut self) -> Result<i32>;
    /// The daemon only ever sends strings; reading them is the app's side.
    #[cfg(test)]
    fn read_string(&mut self) -> Result<String>;
    fn write_i32(&mut self, value: i32) -> Result<()>;
    fn write_string(&mut self, value: &str) -> Result<()>;
}

impl UnixStreamExt for UnixStream {
    fn read_i32(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(i32::from_ne_bytes(buf))
    }

    #[cfg(test)]
    fn read_string(&mut self) -> Result<String> {
        let len = self.read_i32()?;
        let Ok(len) = usize::try_from(len) else {
            bail!("Negative string length: {len}");
        };
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_all(&value.to_ne_bytes())?;
        Ok(())
    }

    fn write_string(&mut self, value: &str) -> Result<()> {
        let len = i32::try_from(value.len())?;
        self.write_i32(len)?;
        self.write_all(value.as_bytes())?;
        Ok(())
    }
}

/// Builds the address for an abstract socket name.
pub fn abstract_socket_addr(name: &str) -> io::Result<SocketAddr> {
    SocketAddr::from_abstract_name(name)
}

/// Binds a listener to an abstract socket name.
///
/// Abstract names vanish with their last holder, so there is no stale file to
/// clean up. A name that is still held makes this fail with `AddrInUse`.
pub fn unix_listener_from_abstract(name: &str) -> io::Result<UnixListener> {
    UnixListener::bind_addr(&abstract_socket_addr(name)?)
}

/// Connects to an abstract socket name.
#[cfg(test)]
pub fn unix_stream_from_abstract(name: &str) -> io::Result<UnixStream> {
    UnixStream::connect_addr(&abstract_socket_addr(name)?)
}

// --- FFI for Android System APIs ---
#[cfg(target_os = "android")]
unsafe extern "C" {
    fn __system_property_get(name: *const std::ffi::c_char, value: *mut std::ffi::c_char) -> u32;
    fn __system_property_set(name: *const std::ffi::c_char, value: *const std::ffi::c_char) -> i32;
}
