//! Binary frame codec for the PTY channel.
//!
//! Binary frames default to raw terminal bytes. File transfers are
//! type-prefixed: a marker byte, a u16 big-endian name length, the name,
//! then the payload. The markers are invalid UTF-8 lead bytes, so raw
//! terminal traffic can never alias them.

use bytes::{BufMut, Bytes, BytesMut};

/// First byte of a client→server file-upload frame.
pub const UPLOAD_MARKER: u8 = 0xFE;
/// First byte of a server→client file-download frame.
pub const DOWNLOAD_MARKER: u8 = 0xFD;

/// A decoded client→server binary frame
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// Raw bytes destined for the hosted process's stdin.
    Input(Bytes),
    /// One chunk of a file upload into the session's working directory.
    Upload { name: String, data: Bytes },
}

/// A decoded server→client binary frame
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// Raw hosted-process output bytes.
    Output(Bytes),
    /// One chunk of a file download. An empty `data` terminates the transfer.
    Download { name: String, data: Bytes },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame header truncated")]
    Truncated,
    #[error("file name is not valid UTF-8")]
    BadName,
}

fn decode_named(frame: &Bytes) -> Result<(String, Bytes), FrameError> {
    if frame.len() < 3 {
        return Err(FrameError::Truncated);
    }
    let name_len = u16::from_be_bytes([frame[1], frame[2]]) as usize;
    let payload_start = 3 + name_len;
    if frame.len() < payload_start {
        return Err(FrameError::Truncated);
    }
    let name = std::str::from_utf8(&frame[3..payload_start])
        .map_err(|_| FrameError::BadName)?
        .to_string();
    Ok((name, frame.slice(payload_start..)))
}

fn encode_named(marker: u8, name: &str, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(3 + name.len() + data.len());
    buf.put_u8(marker);
    buf.put_u16(name.len() as u16);
    buf.put_slice(name.as_bytes());
    buf.put_slice(data);
    buf.freeze()
}

/// Decode a binary frame received from a viewer.
pub fn decode_client_frame(frame: Bytes) -> Result<ClientFrame, FrameError> {
    match frame.first() {
        Some(&UPLOAD_MARKER) => {
            let (name, data) = decode_named(&frame)?;
            Ok(ClientFrame::Upload { name, data })
        }
        _ => Ok(ClientFrame::Input(frame)),
    }
}

/// Decode a binary frame received from the session host.
pub fn decode_server_frame(frame: Bytes) -> Result<ServerFrame, FrameError> {
    match frame.first() {
        Some(&DOWNLOAD_MARKER) => {
            let (name, data) = decode_named(&frame)?;
            Ok(ServerFrame::Download { name, data })
        }
        _ => Ok(ServerFrame::Output(frame)),
    }
}

/// Encode a file-upload chunk (client side).
pub fn encode_upload(name: &str, data: &[u8]) -> Bytes {
    encode_named(UPLOAD_MARKER, name, data)
}

/// Encode a file-download chunk (server side).
pub fn encode_download(name: &str, data: &[u8]) -> Bytes {
    encode_named(DOWNLOAD_MARKER, name, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_bytes_decode_as_input() {
        let frame = Bytes::from_static(b"ls -la\n");
        assert_eq!(
            decode_client_frame(frame.clone()).unwrap(),
            ClientFrame::Input(frame)
        );
    }

    #[test]
    fn control_bytes_are_not_mistaken_for_uploads() {
        // Ctrl-A .. Ctrl-Z and ESC sequences are everyday terminal input.
        let frame = Bytes::from_static(&[0x01, 0x1b, 0x5b, 0x41]);
        assert!(matches!(
            decode_client_frame(frame).unwrap(),
            ClientFrame::Input(_)
        ));
    }

    #[test]
    fn upload_roundtrip() {
        let encoded = encode_upload("notes.txt", b"hello");
        match decode_client_frame(encoded).unwrap() {
            ClientFrame::Upload { name, data } => {
                assert_eq!(name, "notes.txt");
                assert_eq!(&data[..], b"hello");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn download_terminator_is_empty_payload() {
        let encoded = encode_download("out.bin", b"");
        match decode_server_frame(encoded).unwrap() {
            ServerFrame::Download { name, data } => {
                assert_eq!(name, "out.bin");
                assert!(data.is_empty());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn truncated_upload_header_is_an_error() {
        let frame = Bytes::from_static(&[UPLOAD_MARKER, 0x00]);
        assert_eq!(decode_client_frame(frame), Err(FrameError::Truncated));

        // Name length pointing past the end of the frame.
        let frame = Bytes::from_static(&[UPLOAD_MARKER, 0x00, 0x10, b'a']);
        assert_eq!(decode_client_frame(frame), Err(FrameError::Truncated));
    }
}
