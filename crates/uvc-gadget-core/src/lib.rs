//! User-space runtime for a USB Video Class gadget function.
//!
//! The kernel's f_uvc driver forwards the host's class requests as V4L2
//! events on the bound video node; this crate answers them (probe/commit
//! negotiation), and once the host starts the stream it keeps the node fed
//! with frames through a pool of memory-mapped output buffers. Everything
//! runs on one thread, driven by a level-triggered poll reactor.

use anyhow::Result;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::{trace, warn};

pub mod buffers;
pub mod configfs;
pub mod control;
pub mod events;
pub mod sink;
pub mod source;
pub mod stream;
pub mod v4l2;

use configfs::FunctionConfig;
use control::{CommitAction, ControlState};
use events::{EventLoop, Interest};
use sink::{UvcEvent, VideoSink};
use stream::{StreamState, UvcStream};

/// Four character code identifying a pixel format.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const fn new(repr: &[u8; 4]) -> Self {
        Self(*repr)
    }

    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub fn from_u32(code: u32) -> Self {
        Self(code.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({self})")
    }
}

/// A concrete pixel format negotiated with the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelFormat {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCc,
    pub sizeimage: u32,
}

/// The assembled gadget: control state machine, sink, and stream
/// orchestrator, pumped by the reactor.
///
/// Registered as the exception-readiness callback for the UVC device node;
/// each invocation drains every pending event so a SET_CUR setup and its
/// data phase are always handled in order within one dispatch.
pub struct UvcGadget {
    sink: Rc<RefCell<dyn VideoSink>>,
    stream: Rc<RefCell<UvcStream>>,
    control: ControlState,
}

impl UvcGadget {
    pub fn new(
        config: Rc<FunctionConfig>,
        sink: Rc<RefCell<dyn VideoSink>>,
        stream: Rc<RefCell<UvcStream>>,
    ) -> Self {
        Self {
            sink,
            stream,
            control: ControlState::new(config),
        }
    }

    /// Subscribe the event kinds the runtime reacts to.
    pub fn prepare(&mut self) -> Result<()> {
        let mut sink = self.sink.borrow_mut();
        for event_type in [
            uvc_proto::UVC_EVENT_SETUP,
            uvc_proto::UVC_EVENT_DATA,
            uvc_proto::UVC_EVENT_STREAMON,
            uvc_proto::UVC_EVENT_STREAMOFF,
        ] {
            sink.subscribe_event(event_type)?;
        }
        Ok(())
    }

    /// Reactor callback: drain and dispatch every pending UVC event.
    pub fn process_events(&mut self, ev_loop: &mut EventLoop) {
        loop {
            let next = self.sink.borrow_mut().dequeue_event();
            match next {
                Ok(Some(event)) => {
                    if let Err(err) = self.dispatch(event, ev_loop) {
                        warn!(error = ?err, "event handling failed");
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = ?err, "event dequeue failed");
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, event: UvcEvent, ev_loop: &mut EventLoop) -> Result<()> {
        match event {
            UvcEvent::Connect | UvcEvent::Disconnect => {
                trace!(?event, "connection event ignored");
                Ok(())
            }
            UvcEvent::Setup(setup) => {
                let response = self.control.handle_setup(&setup);
                self.sink.borrow_mut().send_response(&response)
            }
            UvcEvent::Data(payload) => {
                if let Some(action) = self.control.handle_data(&payload) {
                    self.apply_commit(action, ev_loop)?;
                }
                Ok(())
            }
            UvcEvent::StreamOn => self.start_stream(ev_loop),
            UvcEvent::StreamOff => self.stop_stream(ev_loop),
        }
    }

    fn apply_commit(&mut self, action: CommitAction, ev_loop: &mut EventLoop) -> Result<()> {
        let mut stream = self.stream.borrow_mut();
        if stream.state() == StreamState::Streaming {
            // The orchestrator stops the stream before reconfiguring; the
            // buffer-ready watch has to go with it.
            ev_loop.unwatch(self.sink.borrow().fd(), Interest::READABLE);
        }
        stream.apply_format(action.format)?;
        stream.set_frame_rate(action.fps);
        Ok(())
    }

    fn start_stream(&mut self, ev_loop: &mut EventLoop) -> Result<()> {
        self.stream.borrow_mut().enable(true)?;
        let stream = Rc::clone(&self.stream);
        let fd = self.sink.borrow().fd();
        ev_loop.watch(fd, Interest::READABLE, move |_| {
            stream.borrow_mut().on_buffer_ready();
        });
        Ok(())
    }

    fn stop_stream(&mut self, ev_loop: &mut EventLoop) -> Result<()> {
        ev_loop.unwatch(self.sink.borrow().fd(), Interest::READABLE);
        self.stream.borrow_mut().enable(false)
    }
}
