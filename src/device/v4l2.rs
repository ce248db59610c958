//! V4L2 implementation of the capture driver seam.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::{CaptureStream, Stream};
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::device::driver::{
    CaptureDriver, DriverFrame, DriverInfo, FormatRequest, LoopWaker, Readiness,
};
use crate::device::frame::FrameGeometry;
use crate::{CameraError, Result};

fn nix_err(err: nix::errno::Errno) -> CameraError {
    CameraError::DriverIo(io::Error::from_raw_os_error(err as i32))
}

fn not_connected(what: &str) -> CameraError {
    CameraError::DriverIo(io::Error::new(io::ErrorKind::NotConnected, what.to_string()))
}

/// Capture driver backed by a memory-mapped V4L2 buffer queue.
///
/// The readiness wait polls the device fd together with a self-pipe, so a
/// caller thread can interrupt the capture loop without waiting for the poll
/// timeout to expire.
pub struct V4l2Driver {
    path: String,
    device: Option<Box<Device>>,
    stream: Option<MmapStream<'static>>,
    wake_rx: OwnedFd,
    wake_tx: Arc<OwnedFd>,
    geometry: Option<FrameGeometry>,
    cursor: u32,
    count: u32,
}

impl V4l2Driver {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let (wake_rx, wake_tx) = nix::unistd::pipe2(OFlag::O_NONBLOCK).map_err(nix_err)?;
        Ok(Self {
            path: path.into(),
            device: None,
            stream: None,
            wake_rx,
            wake_tx: Arc::new(wake_tx),
            geometry: None,
            cursor: 0,
            count: 0,
        })
    }

    fn drain_wake_pipe(&self) {
        let mut sink = [0u8; 16];
        while let Ok(n) = nix::unistd::read(self.wake_rx.as_fd(), &mut sink) {
            if n == 0 {
                break;
            }
        }
    }
}

impl CaptureDriver for V4l2Driver {
    fn open(&mut self) -> Result<DriverInfo> {
        let device = Device::with_path(&self.path)?;
        let caps = device.query_caps()?;
        info!("device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CameraError::UnsupportedFormat(format!(
                "{} does not support video capture",
                self.path
            )));
        }
        if !caps.capabilities.contains(CapFlags::STREAMING) {
            return Err(CameraError::UnsupportedFormat(format!(
                "{} does not support streaming i/o",
                self.path
            )));
        }

        let info = DriverInfo {
            card: caps.card.clone(),
            driver: caps.driver.clone(),
        };
        self.device = Some(Box::new(device));
        Ok(info)
    }

    fn close(&mut self) {
        self.stream = None;
        self.device = None;
        debug!(path = %self.path, "device closed");
    }

    fn negotiate(&mut self, request: &FormatRequest) -> Result<FrameGeometry> {
        let device = self.device.as_ref().ok_or_else(|| not_connected("device not open"))?;

        let wanted = FourCC::new(request.format.fourcc());
        let mut fmt = device.format()?;
        fmt.width = request.width;
        fmt.height = request.height;
        fmt.fourcc = wanted;

        // The driver may silently substitute a nearby supported size; only
        // the format read back is authoritative.
        let actual = device.set_format(&fmt)?;
        if actual.fourcc != wanted {
            return Err(CameraError::UnsupportedFormat(format!(
                "driver substituted {} for {}",
                actual.fourcc, wanted
            )));
        }

        let frame_size = if actual.size > 0 {
            actual.size as usize
        } else {
            request.format.frame_size(actual.width, actual.height)
        };
        let geometry = FrameGeometry {
            width: actual.width,
            height: actual.height,
            format: request.format,
            frame_size,
        };
        debug!(
            width = geometry.width,
            height = geometry.height,
            requested_width = request.width,
            requested_height = request.height,
            frame_size,
            "format negotiated"
        );
        self.geometry = Some(geometry);
        Ok(geometry)
    }

    fn stream_on(&mut self, buffers: u32) -> Result<u32> {
        let device = self.device.as_ref().ok_or_else(|| not_connected("device not open"))?;
        let mut stream = MmapStream::with_buffers(device, Type::VideoCapture, buffers)?;
        // queues every buffer driver-owned, then requests stream-on
        stream.start()?;
        self.stream = Some(stream);
        self.count = buffers;
        self.cursor = 0;
        info!(buffers, "capture stream started");
        Ok(buffers)
    }

    fn stream_off(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            // stream-off first; the buffers unmap when the stream drops
            stream.stop()?;
        }
        self.count = 0;
        Ok(())
    }

    fn wait_frame(&mut self, timeout: Duration) -> Result<Readiness> {
        let device = self.device.as_ref().ok_or_else(|| not_connected("device not open"))?;
        let dev_fd = unsafe { BorrowedFd::borrow_raw(device.handle().fd()) };
        let mut fds = [
            PollFd::new(dev_fd, PollFlags::POLLIN),
            PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN),
        ];
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let n = poll(&mut fds, PollTimeout::from(millis)).map_err(nix_err)?;
        if n == 0 {
            return Ok(Readiness::TimedOut);
        }
        let woken = fds[1]
            .revents()
            .map_or(false, |r| r.contains(PollFlags::POLLIN));
        let ready = fds[0]
            .revents()
            .map_or(false, |r| r.intersects(PollFlags::POLLIN | PollFlags::POLLERR));
        if woken {
            self.drain_wake_pipe();
            return Ok(Readiness::Cancelled);
        }
        if ready {
            Ok(Readiness::Frame)
        } else {
            Ok(Readiness::TimedOut)
        }
    }

    fn dequeue(&mut self) -> Result<DriverFrame> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| not_connected("stream not started"))?;

        let (buf, meta) = stream.next()?;
        let len = if meta.bytesused > 0 {
            (meta.bytesused as usize).min(buf.len())
        } else {
            buf.len()
        };
        let data = Bytes::copy_from_slice(&buf[..len]);
        let timestamp = Duration::from_secs(meta.timestamp.sec as u64)
            + Duration::from_micros(meta.timestamp.usec as u64);

        // The mmap stream keeps the kernel buffer id to itself and requeues
        // the slot on the following dequeue; the index handed out here is the
        // pipeline's ledger slot, cycled in lockstep.
        let index = self.cursor;
        self.cursor = (self.cursor + 1) % self.count.max(1);

        Ok(DriverFrame {
            index,
            data,
            timestamp,
        })
    }

    fn requeue(&mut self, index: u32) -> Result<()> {
        // Deferred: see dequeue(). The kernel-side QBUF happens inside the
        // stream on the next exchange.
        let _ = index;
        Ok(())
    }

    fn waker(&self) -> LoopWaker {
        let wake_tx = self.wake_tx.clone();
        LoopWaker::new(move || {
            let _ = nix::unistd::write(wake_tx.as_fd(), &[1u8]);
        })
    }
}
