//! Native command framing and continuation handling
//!
//! Every native DESFire command travels inside an ISO 7816-4 envelope:
//!
//! ```text
//! 90 <cmd> 00 00 [<Lc> <data>] 00
//! ```
//!
//! Responses longer than one frame, and commands whose parameters do not fit
//! one frame, are split using the `AF` continuation command and the `91 AF`
//! status.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{Level, debug, trace, warn};

use crate::config::FramerConfig;
use crate::response::{Response, status::StatusWord};
use crate::transport::CardTransport;
use crate::{Error, Result};

/// Class byte of every wrapped native command
pub const CLA: u8 = 0x90;

/// Command code of a continuation frame
pub const ADDITIONAL_FRAME: u8 = 0xAF;

/// Largest parameter block a short APDU can carry
pub const MAX_SHORT_DATA: usize = 255;

/// Wrap a native command in the ISO 7816-4 envelope
///
/// `None` omits the Lc byte entirely, while `Some(&[])` still yields
/// `Lc = 00`. The card's APDU parser depends on this distinction.
pub fn wrap(command: u8, parameters: Option<&[u8]>) -> Result<Bytes> {
    let data_len = parameters.map_or(0, <[u8]>::len);
    if data_len > MAX_SHORT_DATA {
        return Err(Error::CommandTooLong(data_len));
    }

    let mut buffer = BytesMut::with_capacity(6 + data_len);
    buffer.put_u8(CLA);
    buffer.put_u8(command);
    buffer.put_u8(0x00);
    buffer.put_u8(0x00);
    if let Some(parameters) = parameters {
        buffer.put_u8(data_len as u8);
        buffer.put_slice(parameters);
    }
    buffer.put_u8(0x00);

    Ok(buffer.freeze())
}

/// Status word of a raw response frame
pub fn status_of(response: &[u8]) -> Result<StatusWord> {
    match response {
        [.., sw1, sw2] => Ok(StatusWord::new(*sw1, *sw2)),
        _ => Err(Error::MalformedResponse("response shorter than status word")),
    }
}

/// Payload of a raw response frame, without the trailing status word
pub fn payload_of(response: &[u8]) -> Result<&[u8]> {
    response
        .len()
        .checked_sub(2)
        .map(|split| &response[..split])
        .ok_or(Error::MalformedResponse("response shorter than status word"))
}

/// Map a terminal status word to the core error taxonomy
pub fn check_status(status: StatusWord) -> Result<()> {
    if status.is_ok() {
        Ok(())
    } else if status.is_permission_denied() {
        Err(Error::AccessDenied)
    } else if status.is_authentication_error() {
        Err(Error::AuthenticationRequired)
    } else {
        Err(Error::status(status))
    }
}

/// Drives wrapped native exchanges over a transport
#[derive(Debug, Clone, Copy, Default)]
pub struct Framer {
    config: FramerConfig,
}

impl Framer {
    /// Create a framer with the given configuration
    pub const fn new(config: FramerConfig) -> Self {
        Self { config }
    }

    /// Active configuration
    pub const fn config(&self) -> &FramerConfig {
        &self.config
    }

    /// Send exactly one frame and return the response without interpreting it
    ///
    /// Handshakes use this directly because `91 AF` there means "next step",
    /// not "more data".
    pub fn transceive<T: CardTransport + ?Sized>(
        &self,
        transport: &mut T,
        command: u8,
        parameters: Option<&[u8]>,
    ) -> Result<Response> {
        let frame = wrap(command, parameters)?;
        let raw = transport.transmit_raw(&frame)?;
        let response = Response::try_from(raw)?;
        log_status(command, response.status());
        Ok(response)
    }

    /// Send a command and collect every continuation frame of the response
    ///
    /// While the card answers `91 AF`, a bare continuation frame is sent and
    /// the payloads are concatenated in order. A terminal error status
    /// discards everything collected so far.
    pub fn send_and_collect<T: CardTransport + ?Sized>(
        &self,
        transport: &mut T,
        command: u8,
        parameters: Option<&[u8]>,
    ) -> Result<Bytes> {
        let first = self.transceive(transport, command, parameters)?;
        self.collect(transport, first)
    }

    /// Send a command whose parameters may exceed one frame, then collect
    /// the response
    ///
    /// The first frame carries the command code and the first chunk; the
    /// remaining chunks follow as continuation frames. Every intermediate
    /// frame must be acknowledged with an empty `91 AF`.
    pub fn send_chunked<T: CardTransport + ?Sized>(
        &self,
        transport: &mut T,
        command: u8,
        parameters: &[u8],
    ) -> Result<Bytes> {
        let chunk_size = self.config.max_frame_data.max(1);
        if parameters.len() <= chunk_size {
            return self.send_and_collect(transport, command, Some(parameters));
        }

        let total = parameters.len().div_ceil(chunk_size);
        if total > self.config.max_frames {
            return Err(Error::FrameLimitExceeded(self.config.max_frames));
        }

        let mut code = command;
        let mut response = None;

        for (index, chunk) in parameters.chunks(chunk_size).enumerate() {
            let current = self.transceive(transport, code, Some(chunk))?;
            if index + 1 < total {
                if !current.is_additional_frame() {
                    check_status(current.status())?;
                    return Err(Error::MalformedResponse(
                        "card ended exchange before all data was sent",
                    ));
                }
                if !current.payload().is_empty() {
                    return Err(Error::MalformedResponse(
                        "unexpected payload while sending data",
                    ));
                }
            }
            response = Some(current);
            code = ADDITIONAL_FRAME;
        }

        debug!(command = format_args!("{command:02X}"), frames = total, "Sent chunked command");
        let response = response.ok_or(Error::MalformedResponse("no frame was sent"))?;
        self.collect(transport, response)
    }

    fn collect<T: CardTransport + ?Sized>(
        &self,
        transport: &mut T,
        first: Response,
    ) -> Result<Bytes> {
        let mut frames = 1usize;
        let mut status = first.status();
        let mut collected = BytesMut::from(first.payload().as_ref());

        while status.is_additional_frame() {
            if frames >= self.config.max_frames {
                return Err(Error::FrameLimitExceeded(frames));
            }
            let next = self.transceive(transport, ADDITIONAL_FRAME, None)?;
            frames += 1;
            status = next.status();
            collected.extend_from_slice(next.payload());
        }

        check_status(status)?;
        trace!(frames, length = collected.len(), "Collected response");
        Ok(collected.freeze())
    }
}

fn log_status(command: u8, status: StatusWord) {
    if status.tracing_level() == Level::WARN {
        warn!(
            command = format_args!("{command:02X}"),
            %status,
            description = status.description(),
            "Card returned error status"
        );
    } else {
        debug!(command = format_args!("{command:02X}"), %status, "Frame exchanged");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::transport::TransportError;
    use hex_literal::hex;

    #[test]
    fn test_wrap_with_parameters() {
        let frame = wrap(0x5A, Some(&[0xA1, 0xA2, 0xA3])).unwrap();
        assert_eq!(frame.as_ref(), hex!("905A000003A1A2A300"));
    }

    #[test]
    fn test_wrap_none_and_empty_differ() {
        assert_eq!(wrap(0x60, None).unwrap().as_ref(), hex!("9060000000"));
        assert_eq!(wrap(0x60, Some(&[])).unwrap().as_ref(), hex!("906000000000"));
    }

    #[test]
    fn test_wrap_rejects_oversized() {
        let data = [0u8; 256];
        assert_eq!(wrap(0x3D, Some(&data)), Err(Error::CommandTooLong(256)));
    }

    #[test]
    fn test_status_and_payload_of() {
        let raw = hex!("AABB91AF");
        assert_eq!(status_of(&raw).unwrap(), StatusWord::ADDITIONAL_FRAME);
        assert_eq!(payload_of(&raw).unwrap(), &hex!("AABB"));
        assert!(status_of(&[0x91]).is_err());
        assert!(payload_of(&[]).is_err());
    }

    #[test]
    fn test_send_and_collect_continuation() {
        let mut transport = MockTransport::new([
            hex!("01020391AF").to_vec(),
            hex!("040591AF").to_vec(),
            hex!("069100").to_vec(),
        ]);
        let framer = Framer::default();

        let data = framer.send_and_collect(&mut transport, 0x60, None).unwrap();

        assert_eq!(data.as_ref(), hex!("010203040506"));
        assert_eq!(transport.transmit_count(), 3);
        assert_eq!(transport.commands[0].as_ref(), hex!("9060000000"));
        assert_eq!(transport.commands[1].as_ref(), hex!("90AF000000"));
        assert_eq!(transport.commands[2].as_ref(), hex!("90AF000000"));
    }

    #[test]
    fn test_send_and_collect_error_statuses() {
        let framer = Framer::default();

        let mut transport = MockTransport::new([hex!("919D").to_vec()]);
        assert_eq!(
            framer.send_and_collect(&mut transport, 0xBD, Some(&[0x01])),
            Err(Error::AccessDenied)
        );

        let mut transport = MockTransport::new([hex!("91AE").to_vec()]);
        assert_eq!(
            framer.send_and_collect(&mut transport, 0xBD, Some(&[0x01])),
            Err(Error::AuthenticationRequired)
        );

        // Payload collected before the error is discarded
        let mut transport = MockTransport::new([hex!("AA91AF").to_vec(), hex!("91F0").to_vec()]);
        assert_eq!(
            framer.send_and_collect(&mut transport, 0xBD, Some(&[0x01])),
            Err(Error::status(StatusWord::FILE_NOT_FOUND))
        );
    }

    #[test]
    fn test_send_and_collect_transport_error() {
        let framer = Framer::default();
        let mut transport = MockTransport::new([hex!("91AF").to_vec()]);
        transport.push_error(TransportError::TagLost);

        assert_eq!(
            framer.send_and_collect(&mut transport, 0x60, None),
            Err(Error::Transport(TransportError::TagLost))
        );
    }

    #[test]
    fn test_frame_limit() {
        let framer = Framer::new(FramerConfig::new().with_max_frames(2));
        let mut transport = MockTransport::new([
            hex!("0191AF").to_vec(),
            hex!("0291AF").to_vec(),
            hex!("039100").to_vec(),
        ]);

        assert_eq!(
            framer.send_and_collect(&mut transport, 0x60, None),
            Err(Error::FrameLimitExceeded(2))
        );
        assert_eq!(transport.transmit_count(), 2);
    }

    #[test]
    fn test_send_chunked() {
        let framer = Framer::new(FramerConfig::new().with_max_frame_data(4));
        let mut transport = MockTransport::new([
            hex!("91AF").to_vec(),
            hex!("91AF").to_vec(),
            hex!("9100").to_vec(),
        ]);

        let params = hex!("01020304050607080910");
        let data = framer.send_chunked(&mut transport, 0x3D, &params).unwrap();

        assert!(data.is_empty());
        assert_eq!(transport.commands[0].as_ref(), hex!("903D0000040102030400"));
        assert_eq!(transport.commands[1].as_ref(), hex!("90AF0000040506070800"));
        assert_eq!(transport.commands[2].as_ref(), hex!("90AF000002091000"));
    }

    #[test]
    fn test_send_chunked_early_error() {
        let framer = Framer::new(FramerConfig::new().with_max_frame_data(2));
        let mut transport = MockTransport::new([hex!("917E").to_vec()]);

        assert_eq!(
            framer.send_chunked(&mut transport, 0x3D, &hex!("010203")),
            Err(Error::status(StatusWord::LENGTH_ERROR))
        );
        assert_eq!(transport.transmit_count(), 1);
    }
}
