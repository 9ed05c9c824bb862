//! Probe/commit negotiation for the VideoStreaming interface.
//!
//! [`ControlState`] only interprets setup and data phases and hands back
//! the response (or commit outcome) to apply; it never touches the device.
//! The processing-unit controls of the VideoControl interface are answered
//! by a stub claiming both GET and SET are permitted.

use crate::configfs::FunctionConfig;
use crate::sink::UvcResponse;
use crate::{FourCc, PixelFormat};
use std::rc::Rc;
use tracing::{debug, trace, warn};
use uvc_proto::{
    ControlRequest, ControlSelector, SetupPacket, StreamingControl, CONTROL_INFO_GET_SET,
    STREAMING_CONTROL_LEN,
};

/// Streaming parameters produced by a committed negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitAction {
    pub format: PixelFormat,
    pub fps: u32,
}

/// Build a streaming-control block for the requested format, frame and
/// interval, restricted to what the function actually declares.
///
/// Indices are 1-based and clamped as unsigned values, so `u32::MAX`
/// (the GET_MAX probe) lands on the last format and frame. The interval is
/// the first declared entry at least as long as the request, or the
/// largest one.
pub fn fill_streaming_control(
    config: &FunctionConfig,
    iformat: u32,
    iframe: u32,
    ival: u32,
) -> StreamingControl {
    let Some(format) = config
        .formats
        .get(iformat.clamp(1, config.num_formats().max(1)) as usize - 1)
    else {
        return StreamingControl::default();
    };
    let iformat = iformat.clamp(1, config.num_formats());

    let num_frames = format.frames.len() as u32;
    let Some(frame) = format
        .frames
        .get(iframe.clamp(1, num_frames.max(1)) as usize - 1)
    else {
        return StreamingControl::default();
    };
    let iframe = iframe.clamp(1, num_frames);

    let interval = frame
        .intervals
        .iter()
        .copied()
        .find(|&entry| ival <= entry)
        .or_else(|| frame.intervals.last().copied())
        .unwrap_or(ival);

    StreamingControl {
        hint: 1,
        format_index: iformat as u8,
        frame_index: iframe as u8,
        frame_interval: interval,
        max_video_frame_size: frame.width * frame.height * 2,
        max_payload_transfer_size: config.streaming_max_packet,
        framing_info: 3,
        prefered_version: 1,
        max_version: 1,
        ..Default::default()
    }
}

pub struct ControlState {
    config: Rc<FunctionConfig>,
    probe: StreamingControl,
    commit: StreamingControl,
    pending: Option<ControlSelector>,
}

impl ControlState {
    pub fn new(config: Rc<FunctionConfig>) -> Self {
        let defaults = fill_streaming_control(&config, 1, 1, 0);
        Self {
            config,
            probe: defaults,
            commit: defaults,
            pending: None,
        }
    }

    pub fn probe(&self) -> &StreamingControl {
        &self.probe
    }

    pub fn commit(&self) -> &StreamingControl {
        &self.commit
    }

    /// Interpret a setup stage and produce the reply to send.
    ///
    /// Any pending data-phase expectation is dropped first; only
    /// class-typed requests addressed to one of the function's interfaces
    /// get an answer, everything else stalls.
    pub fn handle_setup(&mut self, setup: &SetupPacket) -> UvcResponse {
        self.pending = None;

        if !setup.is_class() {
            trace!(
                request_type = setup.request_type,
                request = setup.request,
                "non-class request ignored"
            );
            return UvcResponse::no_reply();
        }
        if !setup.targets_interface() {
            return UvcResponse::no_reply();
        }

        let interface = setup.interface();
        if interface == self.config.control_interface {
            self.control_interface_request(setup)
        } else if interface == self.config.streaming_interface {
            self.streaming_request(setup)
        } else {
            warn!(interface, "class request for unknown interface");
            UvcResponse::no_reply()
        }
    }

    /// Interim VideoControl responder: report every control as readable
    /// and writable.
    fn control_interface_request(&self, setup: &SetupPacket) -> UvcResponse {
        debug!(
            request = setup.request,
            selector = setup.selector(),
            "control interface request"
        );
        UvcResponse::padded(&[CONTROL_INFO_GET_SET], setup.length as usize)
    }

    fn streaming_request(&mut self, setup: &SetupPacket) -> UvcResponse {
        let Ok(request) = ControlRequest::try_from(setup.request) else {
            warn!(request = setup.request, "unknown streaming request");
            return UvcResponse::no_reply();
        };
        let Ok(selector) = ControlSelector::try_from(setup.selector()) else {
            debug!(selector = setup.selector(), "streaming selector ignored");
            return UvcResponse::no_reply();
        };
        debug!(?request, ?selector, "streaming request");

        match request {
            ControlRequest::SetCur => {
                // The data phase follows as a separate event.
                self.pending = Some(selector);
                UvcResponse::padded(&[], STREAMING_CONTROL_LEN)
            }
            ControlRequest::GetCur => {
                let block = match selector {
                    ControlSelector::Probe => &self.probe,
                    ControlSelector::Commit => &self.commit,
                };
                UvcResponse::payload(&block.encode())
            }
            ControlRequest::GetMin | ControlRequest::GetDef => {
                UvcResponse::payload(&fill_streaming_control(&self.config, 1, 1, 0).encode())
            }
            ControlRequest::GetMax => UvcResponse::payload(
                &fill_streaming_control(&self.config, u32::MAX, u32::MAX, u32::MAX).encode(),
            ),
            ControlRequest::GetRes => UvcResponse::payload(&[0; STREAMING_CONTROL_LEN]),
            ControlRequest::GetLen => UvcResponse::payload(&[0x00, 0x22]),
            ControlRequest::GetInfo => UvcResponse::payload(&[CONTROL_INFO_GET_SET]),
        }
    }

    /// Apply a SET_CUR data phase to the pending control block.
    ///
    /// Returns the parameters to commit when the block was the commit
    /// control. Out-of-sequence or short payloads are dropped.
    pub fn handle_data(&mut self, payload: &[u8]) -> Option<CommitAction> {
        let Some(selector) = self.pending.take() else {
            warn!("data phase without a pending control, dropping");
            return None;
        };
        let request = match StreamingControl::decode(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "malformed data phase, dropping");
                return None;
            }
        };

        let filled = fill_streaming_control(
            &self.config,
            u32::from(request.format_index),
            u32::from(request.frame_index),
            request.frame_interval,
        );

        match selector {
            ControlSelector::Probe => {
                debug!(
                    format = filled.format_index,
                    frame = filled.frame_index,
                    interval = filled.frame_interval,
                    "probe updated"
                );
                self.probe = filled;
                None
            }
            ControlSelector::Commit => {
                self.commit = filled;
                if filled.format_index == 0 {
                    warn!("commit against a function with no formats, dropping");
                    return None;
                }
                let format = &self.config.formats[usize::from(filled.format_index) - 1];
                let frame = &format.frames[usize::from(filled.frame_index) - 1];
                let sizeimage = if format.fourcc == FourCc::new(b"MJPG") {
                    // No encoder here; trust the host-declared payload size.
                    filled.max_video_frame_size
                } else {
                    frame.width * frame.height * 2
                };
                let fps = 10_000_000 / filled.frame_interval.max(1);
                debug!(
                    width = frame.width,
                    height = frame.height,
                    fourcc = %format.fourcc,
                    fps,
                    "commit"
                );
                Some(CommitAction {
                    format: PixelFormat {
                        width: frame.width,
                        height: frame.height,
                        fourcc: format.fourcc,
                        sizeimage,
                    },
                    fps,
                })
            }
        }
    }
}
