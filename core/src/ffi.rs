//! FFI Module - C-ABI exports for host integration
//!
//! Lets a game engine or other native host drive the client and relay
//! server through opaque handles. Callbacks run on the transport's worker
//! thread; pointers handed to them are only valid for the duration of the
//! call.
#![allow(clippy::not_unsafe_ptr_arg_deref)]

use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use std::ptr;

use crate::packet::PacketBuffer;
use crate::transport::{
    ClientConfig, ClientHandler, ClientTransport, Endpoint, ServerConfig, ServerHandler,
    ServerTransport,
};

/// Called with the bytes of one received datagram
pub type FfiReceiveCallback = extern "C" fn(data: *const u8, len: usize, user_data: *mut c_void);

/// Called with a NUL-terminated "ip:port" string
pub type FfiEndpointCallback = extern "C" fn(endpoint: *const c_char, user_data: *mut c_void);

/// Server callback table; any entry may be null
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FfiServerCallbacks {
    pub on_receive: Option<FfiReceiveCallback>,
    pub on_client_connect: Option<FfiEndpointCallback>,
    pub on_client_disconnect: Option<FfiEndpointCallback>,
}

/// Host context pointer, passed back untouched.
struct UserData(*mut c_void);

// The host owns whatever the pointer refers to and must make it safe to use
// from the worker thread.
unsafe impl Send for UserData {}

struct FfiClientHandler {
    on_receive: Option<FfiReceiveCallback>,
    user_data: UserData,
}

impl ClientHandler for FfiClientHandler {
    fn on_receive(&mut self, packet: &mut PacketBuffer) {
        if let Some(callback) = self.on_receive {
            let data = packet.as_slice();
            callback(data.as_ptr(), data.len(), self.user_data.0);
        }
    }
}

struct FfiServerHandler {
    callbacks: FfiServerCallbacks,
    user_data: UserData,
}

impl FfiServerHandler {
    fn notify(&self, callback: Option<FfiEndpointCallback>, endpoint: Endpoint) {
        let Some(callback) = callback else { return };
        match CString::new(endpoint.to_string()) {
            Ok(s) => callback(s.as_ptr(), self.user_data.0),
            Err(e) => tracing::error!("Endpoint string for FFI: {}", e),
        }
    }
}

impl ServerHandler for FfiServerHandler {
    fn on_receive(&mut self, packet: &mut PacketBuffer) {
        if let Some(callback) = self.callbacks.on_receive {
            let data = packet.as_slice();
            callback(data.as_ptr(), data.len(), self.user_data.0);
        }
    }

    fn on_client_connect(&mut self, endpoint: Endpoint) {
        self.notify(self.callbacks.on_client_connect, endpoint);
    }

    fn on_client_disconnect(&mut self, endpoint: Endpoint) {
        self.notify(self.callbacks.on_client_disconnect, endpoint);
    }
}

/// Opaque handle to a client transport
pub struct TucanClientHandle {
    client: ClientTransport,
}

/// Opaque handle to a relay server
pub struct TucanServerHandle {
    server: ServerTransport,
}

fn client_mut<'a>(handle: *mut TucanClientHandle) -> Option<&'a mut ClientTransport> {
    if handle.is_null() {
        return None;
    }
    Some(unsafe { &mut (*handle).client })
}

fn server_ref<'a>(handle: *const TucanServerHandle) -> Option<&'a ServerTransport> {
    if handle.is_null() {
        return None;
    }
    Some(unsafe { &(*handle).server })
}

/// Install the default log subscriber
#[no_mangle]
pub extern "C" fn tucan_init_logging() {
    crate::init();
}

// ============================================================================
// Client
// ============================================================================

/// Start a client aimed at `address:port`.
/// Returns null on error; free with `tucan_client_destroy`
#[no_mangle]
pub extern "C" fn tucan_client_create(
    address: *const c_char,
    port: u16,
    on_receive: Option<FfiReceiveCallback>,
    user_data: *mut c_void,
) -> *mut TucanClientHandle {
    if address.is_null() {
        return ptr::null_mut();
    }
    let address = unsafe { CStr::from_ptr(address) }.to_string_lossy();

    let config = match ClientConfig::new(&address, port) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to create client: {}", e);
            return ptr::null_mut();
        }
    };
    let handler = FfiClientHandler {
        on_receive,
        user_data: UserData(user_data),
    };

    match ClientTransport::start(config, handler) {
        Ok(client) => Box::into_raw(Box::new(TucanClientHandle { client })),
        Err(e) => {
            tracing::error!("Failed to start client: {}", e);
            ptr::null_mut()
        }
    }
}

/// Returns 0 on success, -1 on error
#[no_mangle]
pub extern "C" fn tucan_client_write_bytes(
    handle: *mut TucanClientHandle,
    data: *const u8,
    len: usize,
) -> i32 {
    let Some(client) = client_mut(handle) else {
        return -1;
    };
    if len == 0 {
        return 0;
    }
    if data.is_null() {
        return -1;
    }
    let data = unsafe { std::slice::from_raw_parts(data, len) };
    client.write_bytes(data);
    0
}

#[no_mangle]
pub extern "C" fn tucan_client_write_int16(handle: *mut TucanClientHandle, value: i16) -> i32 {
    match client_mut(handle) {
        Some(client) => {
            client.write_int16(value);
            0
        }
        None => -1,
    }
}

#[no_mangle]
pub extern "C" fn tucan_client_write_int32(handle: *mut TucanClientHandle, value: i32) -> i32 {
    match client_mut(handle) {
        Some(client) => {
            client.write_int32(value);
            0
        }
        None => -1,
    }
}

#[no_mangle]
pub extern "C" fn tucan_client_write_int64(handle: *mut TucanClientHandle, value: i64) -> i32 {
    match client_mut(handle) {
        Some(client) => {
            client.write_int64(value);
            0
        }
        None => -1,
    }
}

#[no_mangle]
pub extern "C" fn tucan_client_write_float32(handle: *mut TucanClientHandle, value: f32) -> i32 {
    match client_mut(handle) {
        Some(client) => {
            client.write_float32(value);
            0
        }
        None => -1,
    }
}

/// Write a length-prefixed ASCII string. A null `value` writes nothing.
/// Returns -1 for non-ASCII input
#[no_mangle]
pub extern "C" fn tucan_client_write_string(
    handle: *mut TucanClientHandle,
    value: *const c_char,
) -> i32 {
    let Some(client) = client_mut(handle) else {
        return -1;
    };
    if value.is_null() {
        return 0;
    }
    let Ok(value) = unsafe { CStr::from_ptr(value) }.to_str() else {
        return -1;
    };
    match client.write_string(value) {
        Ok(()) => 0,
        Err(e) => {
            tracing::warn!("Rejected string: {}", e);
            -1
        }
    }
}

#[no_mangle]
pub extern "C" fn tucan_client_clear_buffer(handle: *mut TucanClientHandle) {
    if let Some(client) = client_mut(handle) {
        client.clear_buffer();
    }
}

#[no_mangle]
pub extern "C" fn tucan_client_buffer_size(handle: *mut TucanClientHandle) -> usize {
    client_mut(handle).map_or(0, |client| client.buffer_size())
}

/// Send the outgoing buffer. Returns 0 on success, -1 on error
#[no_mangle]
pub extern "C" fn tucan_client_send(handle: *mut TucanClientHandle) -> i32 {
    let Some(client) = client_mut(handle) else {
        return -1;
    };
    match client.send() {
        Ok(_) => 0,
        Err(e) => {
            tracing::warn!("Client send failed: {}", e);
            -1
        }
    }
}

/// Disconnect and free the client
#[no_mangle]
pub extern "C" fn tucan_client_destroy(handle: *mut TucanClientHandle) {
    if !handle.is_null() {
        unsafe {
            let _ = Box::from_raw(handle);
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Start a relay server. `max_clients <= 0` means unbounded.
/// Returns null on error; free with `tucan_server_destroy`
#[no_mangle]
pub extern "C" fn tucan_server_create(
    port: u16,
    max_clients: i32,
    wait_for_all: bool,
    callbacks: FfiServerCallbacks,
    user_data: *mut c_void,
) -> *mut TucanServerHandle {
    let mut config = ServerConfig::new(port).with_wait_for_all(wait_for_all);
    if max_clients > 0 {
        config = config.with_max_clients(max_clients as usize);
    }
    let handler = FfiServerHandler {
        callbacks,
        user_data: UserData(user_data),
    };

    match ServerTransport::start(config, handler) {
        Ok(server) => Box::into_raw(Box::new(TucanServerHandle { server })),
        Err(e) => {
            tracing::error!("Failed to start server: {}", e);
            ptr::null_mut()
        }
    }
}

/// Bound port, or 0 on error
#[no_mangle]
pub extern "C" fn tucan_server_port(handle: *const TucanServerHandle) -> u16 {
    server_ref(handle)
        .and_then(|server| server.local_addr().ok())
        .map_or(0, |addr| addr.port())
}

#[no_mangle]
pub extern "C" fn tucan_server_client_count(handle: *const TucanServerHandle) -> usize {
    server_ref(handle).map_or(0, |server| server.client_count())
}

/// Stop and free the server
#[no_mangle]
pub extern "C" fn tucan_server_destroy(handle: *mut TucanServerHandle) {
    if !handle.is_null() {
        unsafe {
            let _ = Box::from_raw(handle);
        }
    }
}
