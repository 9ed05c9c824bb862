//! The video sink: the kernel device consuming frames for the host.
//!
//! [`V4l2Sink`] wraps the `/dev/videoN` node the f_uvc driver binds,
//! opened read/write and non-blocking. Would-block on dequeue paths is not
//! an error, it means "no work yet" and surfaces as `Ok(None)`.

use crate::buffers::{BufferPool, MappedMemory, VideoBuffer};
use crate::v4l2;
use crate::{FourCc, PixelFormat};
use anyhow::{bail, ensure, Context, Result};
use nix::errno::Errno;
use std::fs::{File, OpenOptions};
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use uvc_proto::SetupPacket;

/// A UVC function event dequeued from the sink.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UvcEvent {
    Connect,
    Disconnect,
    Setup(SetupPacket),
    /// Data phase following a SET_CUR setup.
    Data(Vec<u8>),
    StreamOn,
    StreamOff,
}

/// Reply to a class setup request, in the function driver's
/// `uvc_request_data` shape. A negative length tells the driver to stall
/// ep0 instead of answering.
#[derive(Clone, Debug)]
pub struct UvcResponse {
    data: [u8; 60],
    length: i32,
}

impl UvcResponse {
    /// No reply expected; the driver stalls the control endpoint.
    pub fn no_reply() -> Self {
        Self {
            data: [0; 60],
            length: v4l2::RESPONSE_NO_REPLY,
        }
    }

    /// Reply with exactly `bytes`.
    pub fn payload(bytes: &[u8]) -> Self {
        Self::padded(bytes, bytes.len())
    }

    /// Reply of `length` bytes starting with `prefix`, zero-padded.
    pub fn padded(prefix: &[u8], length: usize) -> Self {
        let mut resp = Self {
            data: [0; 60],
            length: length.min(60) as i32,
        };
        let head = prefix.len().min(60);
        resp.data[..head].copy_from_slice(&prefix[..head]);
        resp
    }

    pub fn length(&self) -> i32 {
        self.length
    }

    /// The reply bytes, empty for a stall.
    pub fn bytes(&self) -> &[u8] {
        if self.length < 0 {
            &[]
        } else {
            &self.data[..self.length as usize]
        }
    }

    fn raw(&self) -> &[u8; 60] {
        &self.data
    }
}

/// Device seam of the streaming engine and the control state machine.
pub trait VideoSink {
    fn fd(&self) -> RawFd;

    /// Push a pixel format, returning the kernel-adjusted result.
    fn set_format(&mut self, format: &PixelFormat) -> Result<PixelFormat>;

    /// Allocate and map `count` kernel buffers.
    fn request_buffers(&mut self, count: u32) -> Result<BufferPool>;

    /// Free the kernel-side allocation. The mapped pool must be dropped
    /// first.
    fn release_buffers(&mut self) -> Result<()>;

    fn queue(&mut self, index: u32, bytesused: u32) -> Result<()>;

    /// Retrieve a completed buffer; `None` when the kernel has none ready.
    fn dequeue(&mut self) -> Result<Option<u32>>;

    fn stream_on(&mut self) -> Result<()>;

    fn stream_off(&mut self) -> Result<()>;

    fn subscribe_event(&mut self, event_type: u32) -> Result<()>;

    /// Next pending UVC event; `None` when the queue is empty.
    fn dequeue_event(&mut self) -> Result<Option<UvcEvent>>;

    fn send_response(&mut self, response: &UvcResponse) -> Result<()>;
}

pub struct V4l2Sink {
    file: File,
    path: PathBuf,
}

impl V4l2Sink {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .with_context(|| format!("open UVC device {}", path.display()))?;
        debug!(device = %path.display(), "opened UVC device");
        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }
}

impl VideoSink for V4l2Sink {
    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn set_format(&mut self, format: &PixelFormat) -> Result<PixelFormat> {
        let mut pix: v4l2::PixFormat = unsafe { mem::zeroed() };
        pix.width = format.width;
        pix.height = format.height;
        pix.pixelformat = format.fourcc.to_u32();
        pix.field = v4l2::FIELD_NONE;
        pix.sizeimage = format.sizeimage;
        let mut fmt: v4l2::Format = unsafe { mem::zeroed() };
        fmt.type_ = v4l2::BUF_TYPE_VIDEO_OUTPUT;
        fmt.fmt = v4l2::FormatUnion { pix };

        unsafe { v4l2::vidioc_s_fmt(self.fd(), &mut fmt) }
            .with_context(|| format!("set format on {}", self.path.display()))?;

        let pix = unsafe { fmt.fmt.pix };
        let adjusted = PixelFormat {
            width: pix.width,
            height: pix.height,
            fourcc: FourCc::from_u32(pix.pixelformat),
            sizeimage: pix.sizeimage,
        };
        debug!(?adjusted, "format applied");
        Ok(adjusted)
    }

    fn request_buffers(&mut self, count: u32) -> Result<BufferPool> {
        let mut req: v4l2::RequestBuffers = unsafe { mem::zeroed() };
        req.count = count;
        req.type_ = v4l2::BUF_TYPE_VIDEO_OUTPUT;
        req.memory = v4l2::MEMORY_MMAP;
        unsafe { v4l2::vidioc_reqbufs(self.fd(), &mut req) }.context("request video buffers")?;
        ensure!(req.count > 0, "kernel granted no buffers");

        let mut buffers = Vec::with_capacity(req.count as usize);
        for index in 0..req.count {
            let mut buf: v4l2::Buffer = unsafe { mem::zeroed() };
            buf.index = index;
            buf.type_ = v4l2::BUF_TYPE_VIDEO_OUTPUT;
            buf.memory = v4l2::MEMORY_MMAP;
            unsafe { v4l2::vidioc_querybuf(self.fd(), &mut buf) }
                .with_context(|| format!("query buffer {index}"))?;

            let offset = unsafe { buf.m.offset };
            let memory = MappedMemory::new(self.fd(), buf.length as usize, offset as usize)
                .with_context(|| format!("map buffer {index}"))?;
            buffers.push(VideoBuffer::new(index, Box::new(memory)));
        }
        debug!(count = req.count, "video buffers mapped");
        Ok(BufferPool::new(buffers))
    }

    fn release_buffers(&mut self) -> Result<()> {
        let mut req: v4l2::RequestBuffers = unsafe { mem::zeroed() };
        req.count = 0;
        req.type_ = v4l2::BUF_TYPE_VIDEO_OUTPUT;
        req.memory = v4l2::MEMORY_MMAP;
        unsafe { v4l2::vidioc_reqbufs(self.fd(), &mut req) }.context("release video buffers")?;
        Ok(())
    }

    fn queue(&mut self, index: u32, bytesused: u32) -> Result<()> {
        let mut buf: v4l2::Buffer = unsafe { mem::zeroed() };
        buf.index = index;
        buf.type_ = v4l2::BUF_TYPE_VIDEO_OUTPUT;
        buf.memory = v4l2::MEMORY_MMAP;
        buf.bytesused = bytesused;
        unsafe { v4l2::vidioc_qbuf(self.fd(), &mut buf) }
            .with_context(|| format!("queue buffer {index}"))?;
        Ok(())
    }

    fn dequeue(&mut self) -> Result<Option<u32>> {
        let mut buf: v4l2::Buffer = unsafe { mem::zeroed() };
        buf.type_ = v4l2::BUF_TYPE_VIDEO_OUTPUT;
        buf.memory = v4l2::MEMORY_MMAP;
        match unsafe { v4l2::vidioc_dqbuf(self.fd(), &mut buf) } {
            Ok(_) => Ok(Some(buf.index)),
            Err(Errno::EAGAIN) => Ok(None),
            Err(err) => Err(err).context("dequeue buffer"),
        }
    }

    fn stream_on(&mut self) -> Result<()> {
        let buf_type = v4l2::BUF_TYPE_VIDEO_OUTPUT as libc::c_int;
        unsafe { v4l2::vidioc_streamon(self.fd(), &buf_type) }.context("stream on")?;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        let buf_type = v4l2::BUF_TYPE_VIDEO_OUTPUT as libc::c_int;
        unsafe { v4l2::vidioc_streamoff(self.fd(), &buf_type) }.context("stream off")?;
        Ok(())
    }

    fn subscribe_event(&mut self, event_type: u32) -> Result<()> {
        let mut sub: v4l2::EventSubscription = unsafe { mem::zeroed() };
        sub.type_ = event_type;
        unsafe { v4l2::vidioc_subscribe_event(self.fd(), &sub) }
            .with_context(|| format!("subscribe event {event_type:#010x}"))?;
        Ok(())
    }

    fn dequeue_event(&mut self) -> Result<Option<UvcEvent>> {
        let mut event: v4l2::Event = unsafe { mem::zeroed() };
        match unsafe { v4l2::vidioc_dqevent(self.fd(), &mut event) } {
            Ok(_) => {}
            Err(Errno::ENOENT) | Err(Errno::EAGAIN) => return Ok(None),
            Err(err) => return Err(err).context("dequeue UVC event"),
        }

        let data = unsafe { event.u.data };
        trace!(event_type = event.type_, "UVC event");
        let parsed = match event.type_ {
            uvc_proto::UVC_EVENT_CONNECT => UvcEvent::Connect,
            uvc_proto::UVC_EVENT_DISCONNECT => UvcEvent::Disconnect,
            uvc_proto::UVC_EVENT_STREAMON => UvcEvent::StreamOn,
            uvc_proto::UVC_EVENT_STREAMOFF => UvcEvent::StreamOff,
            uvc_proto::UVC_EVENT_SETUP => {
                UvcEvent::Setup(SetupPacket::from_bytes(data[..8].try_into().unwrap()))
            }
            uvc_proto::UVC_EVENT_DATA => {
                // The payload is a uvc_request_data: native i32 length, then
                // up to 60 bytes of data.
                let length = i32::from_ne_bytes(data[..4].try_into().unwrap());
                let length = length.clamp(0, 60) as usize;
                UvcEvent::Data(data[4..4 + length].to_vec())
            }
            other => bail!("unexpected event {other:#010x} on {}", self.path.display()),
        };
        Ok(Some(parsed))
    }

    fn send_response(&mut self, response: &UvcResponse) -> Result<()> {
        let reply = v4l2::RequestData {
            length: response.length(),
            data: *response.raw(),
        };
        unsafe { v4l2::uvcioc_send_response(self.fd(), &reply) }.context("send UVC response")?;
        Ok(())
    }
}
