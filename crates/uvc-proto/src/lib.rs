#![no_std]

use core::{convert::TryFrom, fmt};

/// Number of bytes in a USB control setup stage.
pub const SETUP_PACKET_LEN: usize = 8;
/// Number of bytes in an encoded [`StreamingControl`] block (UVC 1.1).
pub const STREAMING_CONTROL_LEN: usize = 34;

/// bmRequestType type mask and the values this runtime cares about.
pub const USB_TYPE_MASK: u8 = 0x60;
pub const USB_TYPE_STANDARD: u8 = 0x00;
pub const USB_TYPE_CLASS: u8 = 0x20;
/// bmRequestType recipient mask; class requests must target an interface.
pub const USB_RECIP_MASK: u8 = 0x1f;
pub const USB_RECIP_INTERFACE: u8 = 0x01;

/// Base of the V4L2 private event space the gadget driver emits into.
pub const V4L2_EVENT_PRIVATE_START: u32 = 0x0800_0000;
pub const UVC_EVENT_CONNECT: u32 = V4L2_EVENT_PRIVATE_START;
pub const UVC_EVENT_DISCONNECT: u32 = V4L2_EVENT_PRIVATE_START + 1;
pub const UVC_EVENT_STREAMON: u32 = V4L2_EVENT_PRIVATE_START + 2;
pub const UVC_EVENT_STREAMOFF: u32 = V4L2_EVENT_PRIVATE_START + 3;
pub const UVC_EVENT_SETUP: u32 = V4L2_EVENT_PRIVATE_START + 4;
pub const UVC_EVENT_DATA: u32 = V4L2_EVENT_PRIVATE_START + 5;

/// GET_INFO capability byte: GET and SET operations permitted.
pub const CONTROL_INFO_GET_SET: u8 = 0x03;

/// Errors surfaced while decoding control-plane messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtoError {
    /// Buffer length did not match the wire expectation.
    InvalidLength { expected: usize, actual: usize },
    /// Incoming bRequest is not a video-class control request.
    InvalidRequest(u8),
    /// Control selector is neither probe nor commit.
    InvalidSelector(u8),
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::InvalidLength { expected, actual } => {
                write!(f, "invalid payload length {actual}, expected {expected}")
            }
            ProtoError::InvalidRequest(req) => write!(f, "invalid class request {req:#04x}"),
            ProtoError::InvalidSelector(cs) => write!(f, "invalid control selector {cs:#04x}"),
        }
    }
}

/// Result alias for protocol parsing operations.
pub type Result<T> = core::result::Result<T, ProtoError>;

/// Video-class control requests (UVC 1.1, A.8).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlRequest {
    SetCur = 0x01,
    GetCur = 0x81,
    GetMin = 0x82,
    GetMax = 0x83,
    GetRes = 0x84,
    GetLen = 0x85,
    GetInfo = 0x86,
    GetDef = 0x87,
}

impl TryFrom<u8> for ControlRequest {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::SetCur),
            0x81 => Ok(Self::GetCur),
            0x82 => Ok(Self::GetMin),
            0x83 => Ok(Self::GetMax),
            0x84 => Ok(Self::GetRes),
            0x85 => Ok(Self::GetLen),
            0x86 => Ok(Self::GetInfo),
            0x87 => Ok(Self::GetDef),
            other => Err(ProtoError::InvalidRequest(other)),
        }
    }
}

impl From<ControlRequest> for u8 {
    fn from(req: ControlRequest) -> Self {
        req as u8
    }
}

/// VideoStreaming interface control selectors handled by the negotiator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlSelector {
    Probe = 0x01,
    Commit = 0x02,
}

impl TryFrom<u8> for ControlSelector {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Probe),
            0x02 => Ok(Self::Commit),
            other => Err(ProtoError::InvalidSelector(other)),
        }
    }
}

/// The 8-byte setup stage of a USB control transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn from_bytes(bytes: [u8; SETUP_PACKET_LEN]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn is_class(&self) -> bool {
        self.request_type & USB_TYPE_MASK == USB_TYPE_CLASS
    }

    pub fn is_standard(&self) -> bool {
        self.request_type & USB_TYPE_MASK == USB_TYPE_STANDARD
    }

    pub fn targets_interface(&self) -> bool {
        self.request_type & USB_RECIP_MASK == USB_RECIP_INTERFACE
    }

    /// Interface number addressed by the request.
    pub fn interface(&self) -> u8 {
        (self.index & 0xff) as u8
    }

    /// Control selector carried in the high byte of wValue.
    pub fn selector(&self) -> u8 {
        (self.value >> 8) as u8
    }
}

/// UVC 1.1 video probe/commit control block.
///
/// 34 bytes on the wire, little-endian. Two instances live in the
/// negotiator: the tentative probe block and the active commit block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamingControl {
    pub hint: u16,
    pub format_index: u8,
    pub frame_index: u8,
    pub frame_interval: u32,
    pub key_frame_rate: u16,
    pub p_frame_rate: u16,
    pub comp_quality: u16,
    pub comp_window_size: u16,
    pub delay: u16,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
    pub clock_frequency: u32,
    pub framing_info: u8,
    pub prefered_version: u8,
    pub min_version: u8,
    pub max_version: u8,
}

impl StreamingControl {
    pub fn encode(&self) -> [u8; STREAMING_CONTROL_LEN] {
        let mut buf = [0u8; STREAMING_CONTROL_LEN];
        buf[0..2].copy_from_slice(&self.hint.to_le_bytes());
        buf[2] = self.format_index;
        buf[3] = self.frame_index;
        buf[4..8].copy_from_slice(&self.frame_interval.to_le_bytes());
        buf[8..10].copy_from_slice(&self.key_frame_rate.to_le_bytes());
        buf[10..12].copy_from_slice(&self.p_frame_rate.to_le_bytes());
        buf[12..14].copy_from_slice(&self.comp_quality.to_le_bytes());
        buf[14..16].copy_from_slice(&self.comp_window_size.to_le_bytes());
        buf[16..18].copy_from_slice(&self.delay.to_le_bytes());
        buf[18..22].copy_from_slice(&self.max_video_frame_size.to_le_bytes());
        buf[22..26].copy_from_slice(&self.max_payload_transfer_size.to_le_bytes());
        buf[26..30].copy_from_slice(&self.clock_frequency.to_le_bytes());
        buf[30] = self.framing_info;
        buf[31] = self.prefered_version;
        buf[32] = self.min_version;
        buf[33] = self.max_version;
        buf
    }

    /// Decode a block from a data-phase payload.
    ///
    /// Trailing bytes beyond the 34-byte block are tolerated; hosts pad the
    /// data phase to wLength.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < STREAMING_CONTROL_LEN {
            return Err(ProtoError::InvalidLength {
                expected: STREAMING_CONTROL_LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            hint: u16::from_le_bytes([bytes[0], bytes[1]]),
            format_index: bytes[2],
            frame_index: bytes[3],
            frame_interval: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            key_frame_rate: u16::from_le_bytes([bytes[8], bytes[9]]),
            p_frame_rate: u16::from_le_bytes([bytes[10], bytes[11]]),
            comp_quality: u16::from_le_bytes([bytes[12], bytes[13]]),
            comp_window_size: u16::from_le_bytes([bytes[14], bytes[15]]),
            delay: u16::from_le_bytes([bytes[16], bytes[17]]),
            max_video_frame_size: u32::from_le_bytes([bytes[18], bytes[19], bytes[20], bytes[21]]),
            max_payload_transfer_size: u32::from_le_bytes([
                bytes[22], bytes[23], bytes[24], bytes[25],
            ]),
            clock_frequency: u32::from_le_bytes([bytes[26], bytes[27], bytes[28], bytes[29]]),
            framing_info: bytes[30],
            prefered_version: bytes[31],
            min_version: bytes[32],
            max_version: bytes[33],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> StreamingControl {
        StreamingControl {
            hint: 1,
            format_index: 1,
            frame_index: 2,
            frame_interval: 333_333,
            max_video_frame_size: 1280 * 720 * 2,
            max_payload_transfer_size: 3072,
            framing_info: 3,
            prefered_version: 1,
            max_version: 1,
            ..Default::default()
        }
    }

    #[test]
    fn streaming_control_round_trip() {
        let block = sample_block();
        let bytes = block.encode();
        assert_eq!(StreamingControl::decode(&bytes).unwrap(), block);
    }

    #[test]
    fn streaming_control_wire_offsets() {
        let bytes = sample_block().encode();
        assert_eq!(bytes.len(), STREAMING_CONTROL_LEN);
        // bmHint, bFormatIndex, bFrameIndex, dwFrameInterval.
        assert_eq!(&bytes[0..2], &[0x01, 0x00]);
        assert_eq!(bytes[2], 1);
        assert_eq!(bytes[3], 2);
        assert_eq!(&bytes[4..8], &333_333u32.to_le_bytes());
        // dwMaxVideoFrameSize at 18, dwMaxPayloadTransferSize at 22.
        assert_eq!(&bytes[18..22], &1_843_200u32.to_le_bytes());
        assert_eq!(&bytes[22..26], &3072u32.to_le_bytes());
        // bmFramingInfo, bPreferedVersion, bMinVersion, bMaxVersion.
        assert_eq!(&bytes[30..34], &[3, 1, 0, 1]);
    }

    #[test]
    fn streaming_control_rejects_short_payload() {
        assert_eq!(
            StreamingControl::decode(&[0u8; 26]),
            Err(ProtoError::InvalidLength {
                expected: STREAMING_CONTROL_LEN,
                actual: 26,
            })
        );
    }

    #[test]
    fn streaming_control_tolerates_padded_payload() {
        let block = sample_block();
        let mut padded = [0u8; 60];
        padded[..STREAMING_CONTROL_LEN].copy_from_slice(&block.encode());
        assert_eq!(StreamingControl::decode(&padded).unwrap(), block);
    }

    #[test]
    fn setup_packet_fields() {
        // Class GET_CUR of the probe control on interface 1.
        let setup = SetupPacket::from_bytes([0xa1, 0x81, 0x00, 0x01, 0x01, 0x00, 0x22, 0x00]);
        assert!(setup.is_class());
        assert!(setup.targets_interface());
        assert_eq!(setup.interface(), 1);
        assert_eq!(setup.selector(), ControlSelector::Probe as u8);
        assert_eq!(setup.length, 34);
    }

    #[test]
    fn request_code_conversions() {
        for code in [0x01, 0x81, 0x82, 0x83, 0x84, 0x85, 0x86, 0x87] {
            let req = ControlRequest::try_from(code).unwrap();
            assert_eq!(u8::from(req), code);
        }
        assert_eq!(
            ControlRequest::try_from(0x80),
            Err(ProtoError::InvalidRequest(0x80))
        );
    }

    #[test]
    fn selector_conversions() {
        assert_eq!(ControlSelector::try_from(0x01), Ok(ControlSelector::Probe));
        assert_eq!(ControlSelector::try_from(0x02), Ok(ControlSelector::Commit));
        assert_eq!(
            ControlSelector::try_from(0x03),
            Err(ProtoError::InvalidSelector(0x03))
        );
    }
}
