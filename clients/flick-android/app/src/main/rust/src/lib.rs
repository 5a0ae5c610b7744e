// Flick Android JNI Bindings
//
// Exposes the TCP transfer engine to the Android host. Discovery runs on the
// Kotlin side (NsdManager); this library only moves bytes. Every call is
// synchronous on the calling JVM thread, so the host runs it on a worker
// thread and receives progress through its ProgressListener.
//
// File descriptors passed to sendFile/receiveFile are owned by the library
// from then on and closed when the call returns. getFileInfo only borrows.

#![deny(unsafe_op_in_unsafe_fn)]

use flick_core::{Endpoint, TransferEngine, TransferHandle};
use flick_transport::{EngineConfig, TcpEngine};
use jni::JNIEnv;
use jni::objects::{JClass, JObject, JString};
use jni::sys::{jint, jstring};
use std::mem::ManuallyDrop;
use std::net::IpAddr;

mod error;
mod progress;
mod transfers;

use error::{Error, Result};
use progress::JniProgress;
use transfers::ActiveTransfer;

fn init_logging() {
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(log::LevelFilter::Info)
            .with_tag("flick-android"),
    );
}

fn to_jstring(env: &mut JNIEnv, text: &str) -> jstring {
    match env.new_string(text) {
        Ok(s) => s.into_raw(),
        Err(e) => {
            log::error!("Failed to create Java string: {e}");
            std::ptr::null_mut()
        }
    }
}

fn check_fd(fd: jint) -> Result<()> {
    if fd < 0 {
        return Err(Error::InvalidArgument(format!("file descriptor {fd}")));
    }
    Ok(())
}

fn check_port(port: jint) -> Result<u16> {
    u16::try_from(port).map_err(|_| Error::InvalidArgument(format!("port {port}")))
}

fn engine() -> TcpEngine {
    TcpEngine::new(EngineConfig::default())
}

fn file_info(env: &mut JNIEnv, fd: jint, filename: &JString) -> Result<String> {
    check_fd(fd)?;
    let name: String = env.get_string(filename)?.into();

    // SAFETY: the host keeps ownership of `fd`; ManuallyDrop keeps us from
    // closing it.
    let handle = ManuallyDrop::new(unsafe { TransferHandle::from_raw_fd(fd) });
    let size = handle.probe_size()?;

    Ok(format!("Success!\nFile Name: {name}\nSize: {size} bytes"))
}

fn send<'local>(
    env: &mut JNIEnv<'local>,
    port: jint,
    fd: jint,
    listener: &JObject<'local>,
) -> Result<String> {
    let port = check_port(port)?;
    check_fd(fd)?;

    // SAFETY: the host hands ownership of `fd` over with this call.
    let source = unsafe { TransferHandle::from_raw_fd(fd) };
    let transfer = ActiveTransfer::start();
    let progress = JniProgress::new(env, listener);

    log::info!("Serving file on port {port}");
    let report = engine().send(port, source, &progress, transfer.token())?;
    Ok(report.to_string())
}

fn receive<'local>(
    env: &mut JNIEnv<'local>,
    remote_ip: &JString<'local>,
    remote_port: jint,
    fd: jint,
    listener: &JObject<'local>,
) -> Result<String> {
    let ip: String = env.get_string(remote_ip)?.into();
    let host: IpAddr = ip
        .trim()
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("address {ip}")))?;
    let endpoint = Endpoint::new(host, check_port(remote_port)?);
    check_fd(fd)?;

    // SAFETY: the host hands ownership of `fd` over with this call.
    let destination = unsafe { TransferHandle::from_raw_fd(fd) };
    let transfer = ActiveTransfer::start();
    let progress = JniProgress::new(env, listener);

    log::info!("Receiving from {endpoint}");
    let report = engine().receive(endpoint, destination, &progress, transfer.token())?;
    Ok(report.to_string())
}

/// Report the display name and size of an open file
///
/// Returns a status text; a size probe failure is reported as text too.
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_example_flickshare_jni_RustBridge_getFileInfo<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    fd: jint,
    filename: JString<'local>,
) -> jstring {
    init_logging();

    let text = match file_info(&mut env, fd, &filename) {
        Ok(text) => text,
        Err(e) => format!("Rust FD Error: {e}"),
    };
    to_jstring(&mut env, &text)
}

/// Listen on `port`, accept one peer and stream the file behind `fd`
///
/// Blocks until the transfer ends or `cancelTransfer` is called.
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_example_flickshare_jni_RustBridge_sendFile<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    port: jint,
    fd: jint,
    listener: JObject<'local>,
) -> jstring {
    init_logging();

    let text = match send(&mut env, port, fd, &listener) {
        Ok(text) => text,
        Err(e) => {
            log::error!("Send failed: {e}");
            e.to_string()
        }
    };
    to_jstring(&mut env, &text)
}

/// Connect to the sender at `remote_ip:remote_port` and write the stream to
/// the file behind `fd`
///
/// Bytes already written stay in the file when the transfer fails.
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_example_flickshare_jni_RustBridge_receiveFile<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    remote_ip: JString<'local>,
    remote_port: jint,
    fd: jint,
    listener: JObject<'local>,
) -> jstring {
    init_logging();

    let text = match receive(&mut env, &remote_ip, remote_port, fd, &listener) {
        Ok(text) => text,
        Err(e) => {
            log::error!("Receive failed: {e}");
            e.to_string()
        }
    };
    to_jstring(&mut env, &text)
}

/// Cancel every running send or receive; returns how many were signalled
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_example_flickshare_jni_RustBridge_cancelTransfer<'local>(
    _env: JNIEnv<'local>,
    _class: JClass<'local>,
) -> jint {
    init_logging();
    jint::try_from(transfers::cancel_all()).unwrap_or(jint::MAX)
}
