//! Kernel ABI for the V4L2 output node exposed by the f_uvc function driver.
//!
//! Only the subset of the V4L2 and g_uvc interfaces this runtime touches is
//! declared here; layouts match the 64-bit kernel structures.

use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

pub const BUF_TYPE_VIDEO_OUTPUT: u32 = 2;
pub const MEMORY_MMAP: u32 = 1;
pub const FIELD_NONE: u32 = 1;

/// `uvc_request_data.length` value telling the function driver to stall ep0
/// instead of answering (`-EL2HLT`).
pub const RESPONSE_NO_REPLY: i32 = -51;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PixFormat {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union FormatUnion {
    pub pix: PixFormat,
    // The kernel union is 200 bytes and pointer-aligned.
    pub raw: [u64; 25],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Format {
    pub type_: u32,
    pub fmt: FormatUnion,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RequestBuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct TimeCode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union BufferM {
    pub offset: u32,
    pub userptr: libc::c_ulong,
    pub planes: *mut libc::c_void,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: TimeCode,
    pub sequence: u32,
    pub memory: u32,
    pub m: BufferM,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct EventSubscription {
    pub type_: u32,
    pub id: u32,
    pub flags: u32,
    pub reserved: [u32; 5],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union EventUnion {
    pub data: [u8; 64],
    // Force the kernel union's 8-byte alignment.
    pub raw: [u64; 8],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Event {
    pub type_: u32,
    pub u: EventUnion,
    pub pending: u32,
    pub sequence: u32,
    pub timestamp: libc::timespec,
    pub id: u32,
    pub reserved: [u32; 8],
}

/// `struct uvc_request_data`: the reply issued to a class setup request.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RequestData {
    pub length: i32,
    pub data: [u8; 60],
}

ioctl_readwrite!(vidioc_g_fmt, b'V', 4, Format);
ioctl_readwrite!(vidioc_s_fmt, b'V', 5, Format);
ioctl_readwrite!(vidioc_reqbufs, b'V', 8, RequestBuffers);
ioctl_readwrite!(vidioc_querybuf, b'V', 9, Buffer);
ioctl_readwrite!(vidioc_qbuf, b'V', 15, Buffer);
ioctl_readwrite!(vidioc_dqbuf, b'V', 17, Buffer);
ioctl_write_ptr!(vidioc_streamon, b'V', 18, libc::c_int);
ioctl_write_ptr!(vidioc_streamoff, b'V', 19, libc::c_int);
ioctl_read!(vidioc_dqevent, b'V', 89, Event);
ioctl_write_ptr!(vidioc_subscribe_event, b'V', 90, EventSubscription);
ioctl_write_ptr!(uvcioc_send_response, b'U', 1, RequestData);
