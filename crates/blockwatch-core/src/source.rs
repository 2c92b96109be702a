//! Kernel notification sources.
//!
//! A source delivers raw attribute maps (one per uevent) to a sink callback
//! on its own thread. [`NetlinkSource`] listens on the kernel uevent netlink
//! socket; [`ChannelSource`] is fed in-process.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::error::{EventError, EventResult};
use crate::event::Attributes;
use crate::udev;

/// Callback receiving the raw attribute map of each notification.
pub type RawEventSink = Arc<dyn Fn(Attributes) + Send + Sync>;

/// A subscription to kernel device notifications.
pub trait UeventSource: Send {
    /// Start delivering notifications to `sink`.
    fn subscribe(&mut self, sink: RawEventSink) -> EventResult<()>;

    /// Stop delivering notifications. Safe to call when not subscribed.
    fn unsubscribe(&mut self);

    /// Returns true while subscribed.
    fn is_active(&self) -> bool;
}

const LIBUDEV_PREFIX: &[u8] = b"libudev\0";
const UDEV_MONITOR_MAGIC: u32 = 0xfeed_cafe;
const UDEV_HEADER_LEN: usize = 40;
const RECV_BUFFER_LEN: usize = 16 * 1024;

/// Decode one netlink uevent datagram.
///
/// Accepts both raw kernel frames (`action@devpath\0KEY=VALUE\0...`) and
/// frames re-broadcast by udev (`libudev\0` header followed by properties).
/// Returns `None` for malformed frames or frames without an `ACTION`.
pub fn parse_frame(buf: &[u8]) -> Option<Attributes> {
    let attrs = if buf.starts_with(LIBUDEV_PREFIX) {
        parse_udev_frame(buf)?
    } else {
        parse_kernel_frame(buf)?
    };
    attrs.contains_key("ACTION").then_some(attrs)
}

fn parse_kernel_frame(buf: &[u8]) -> Option<Attributes> {
    let mut fields = buf.split(|b| *b == 0);
    let header = std::str::from_utf8(fields.next()?).ok()?;
    if !header.contains('@') {
        return None;
    }

    let mut attrs = parse_properties(fields);
    // the kernel reports node names relative to /dev
    if let Some(devname) = attrs.get_mut("DEVNAME") {
        if !devname.starts_with('/') {
            devname.insert_str(0, "/dev/");
        }
    }
    Some(attrs)
}

fn parse_udev_frame(buf: &[u8]) -> Option<Attributes> {
    if buf.len() < UDEV_HEADER_LEN {
        return None;
    }
    let word = |at: usize| -> Option<[u8; 4]> { buf.get(at..at + 4)?.try_into().ok() };

    if u32::from_be_bytes(word(8)?) != UDEV_MONITOR_MAGIC {
        return None;
    }
    let offset = u32::from_ne_bytes(word(16)?) as usize;
    let len = u32::from_ne_bytes(word(20)?) as usize;
    let props = buf.get(offset..offset.checked_add(len)?)?;
    Some(parse_properties(props.split(|b| *b == 0)))
}

fn parse_properties<'a>(fields: impl Iterator<Item = &'a [u8]>) -> Attributes {
    fields
        .filter_map(|field| {
            let field = std::str::from_utf8(field).ok()?;
            let (key, value) = field.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Live source reading `NETLINK_KOBJECT_UEVENT`.
pub struct NetlinkSource {
    config: ManagerConfig,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl NetlinkSource {
    /// Create an unsubscribed source.
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    fn open_socket(&self) -> EventResult<OwnedFd> {
        // SAFETY: socket(2) has no memory-safety preconditions; the result is checked.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                libc::NETLINK_KOBJECT_UEVENT,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: raw is a valid descriptor that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let size = libc::c_int::try_from(self.config.receive_buffer_bytes).unwrap_or(libc::c_int::MAX);
        // SAFETY: the option value points at a live c_int of the stated length.
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &size as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            warn!("Failed to set uevent receive buffer: {}", io::Error::last_os_error());
        }

        // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = self.config.netlink_group.mask();
        // SAFETY: addr is a properly initialized sockaddr_nl of the stated length.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(EventError::Source(format!(
                "netlink bind failed: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(fd)
    }
}

impl UeventSource for NetlinkSource {
    fn subscribe(&mut self, sink: RawEventSink) -> EventResult<()> {
        if self.is_active() {
            return Err(EventError::Source("already subscribed".to_string()));
        }
        // reap a reader that stopped on its own
        self.unsubscribe();

        let fd = self.open_socket()?;
        let running = Arc::clone(&self.running);
        let subsystem = self.config.subsystem.clone();
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        running.store(true, Ordering::SeqCst);

        let reader = thread::Builder::new()
            .name("uevent-reader".to_string())
            .spawn(move || read_loop(fd, running, subsystem, poll, sink));
        match reader {
            Ok(handle) => {
                info!(
                    "Subscribed to {:?} uevents for subsystem {}",
                    self.config.netlink_group, self.config.subsystem
                );
                self.reader = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    fn unsubscribe(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!("uevent reader thread panicked");
            }
            info!("Unsubscribed from uevents");
        }
    }

    fn is_active(&self) -> bool {
        self.reader.is_some() && self.running.load(Ordering::SeqCst)
    }
}

impl Drop for NetlinkSource {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn read_loop(
    fd: OwnedFd,
    running: Arc<AtomicBool>,
    subsystem: String,
    poll: Duration,
    sink: RawEventSink,
) {
    let timeout = libc::c_int::try_from(poll.as_millis()).unwrap_or(libc::c_int::MAX);
    let mut buf = vec![0u8; RECV_BUFFER_LEN];

    while running.load(Ordering::SeqCst) {
        let mut pfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a single valid pollfd.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("uevent poll failed: {}", err);
            break;
        }
        if rc == 0 {
            continue;
        }
        if pfd.revents & (libc::POLLHUP | libc::POLLNVAL) != 0 && pfd.revents & libc::POLLIN == 0 {
            error!("uevent socket closed (revents {:#x})", pfd.revents);
            break;
        }
        // POLLERR carries a pending ENOBUFS, reported by recv
        if pfd.revents & (libc::POLLIN | libc::POLLERR) == 0 {
            continue;
        }

        // SAFETY: buf is valid for writes of buf.len() bytes.
        let n = unsafe {
            libc::recv(
                fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ENOBUFS) => warn!("uevent receive buffer overrun, events were lost"),
                Some(libc::EINTR) | Some(libc::EAGAIN) => {}
                _ => {
                    error!("uevent receive failed: {}", err);
                    break;
                }
            }
            continue;
        }

        let Some(attrs) = parse_frame(&buf[..n as usize]) else {
            debug!("discarding malformed uevent frame ({} bytes)", n);
            continue;
        };
        if udev::subsystem(&attrs) != Some(subsystem.as_str()) {
            continue;
        }
        sink(attrs);
    }
    running.store(false, Ordering::SeqCst);
    debug!("uevent reader exiting");
}

/// In-process source; notifications are pushed through a [`ChannelSender`].
///
/// Delivery runs the sink on the sending thread, the way a netlink reader
/// thread would.
#[derive(Default)]
pub struct ChannelSource {
    sink: Arc<RwLock<Option<RawEventSink>>>,
}

impl ChannelSource {
    /// Create an unsubscribed source.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle for pushing notifications into this source.
    pub fn sender(&self) -> ChannelSender {
        ChannelSender {
            sink: Arc::clone(&self.sink),
        }
    }
}

impl UeventSource for ChannelSource {
    fn subscribe(&mut self, sink: RawEventSink) -> EventResult<()> {
        *self.sink.write() = Some(sink);
        Ok(())
    }

    fn unsubscribe(&mut self) {
        self.sink.write().take();
    }

    fn is_active(&self) -> bool {
        self.sink.read().is_some()
    }
}

/// Sending half of a [`ChannelSource`].
#[derive(Clone)]
pub struct ChannelSender {
    sink: Arc<RwLock<Option<RawEventSink>>>,
}

impl ChannelSender {
    /// Deliver one notification. Returns false if nobody is subscribed.
    pub fn send(&self, attributes: Attributes) -> bool {
        let sink = self.sink.read().clone();
        match sink {
            Some(sink) => {
                sink(attributes);
                true
            }
            None => false,
        }
    }
}
