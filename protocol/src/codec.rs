//! Length-prefixed protobuf framing.
//!
//! Every frame is an unsigned varint byte length followed by an encoded
//! protobuf message, the framing DHT streams use on the wire.

use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted from a remote peer.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;
/// A u64 varint never needs more than ten bytes.
const MAX_VARINT_LEN: usize = 10;

/// Errors from reading or writing frames.
#[derive(Debug)]
pub enum CodecError {
    /// IO error during read/write operations.
    Io(io::Error),
    /// The frame body is not a valid protobuf message.
    Decode(prost::DecodeError),
    /// The announced frame length exceeds [`MAX_FRAME_SIZE`].
    FrameTooLarge(usize),
    /// The length prefix is not a valid varint.
    InvalidLength,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Io(e) => write!(f, "IO error: {e}"),
            CodecError::Decode(e) => write!(f, "Message decoding error: {e}"),
            CodecError::FrameTooLarge(len) => {
                write!(f, "Frame of {len} bytes exceeds limit of {MAX_FRAME_SIZE}")
            }
            CodecError::InvalidLength => write!(f, "Invalid frame length prefix"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Io(e) => Some(e),
            CodecError::Decode(e) => Some(e),
            CodecError::FrameTooLarge(_) => None,
            CodecError::InvalidLength => None,
        }
    }
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        CodecError::Io(e)
    }
}

impl From<prost::DecodeError> for CodecError {
    fn from(e: prost::DecodeError) -> Self {
        CodecError::Decode(e)
    }
}

/// Encode a message as a complete frame.
pub fn encode_frame<M: prost::Message>(message: &M) -> Vec<u8> {
    message.encode_length_delimited_to_vec()
}

/// State machine for [`FrameReader::read`].
///
/// Tracking progress here instead of in locals makes `read` cancellation
/// safe: an interrupted read resumes where it left off on the next call.
#[derive(Debug)]
enum ReceiveState {
    /// Reading the varint length prefix one byte at a time.
    ReadingLength {
        prefix: [u8; MAX_VARINT_LEN],
        bytes_read: usize,
    },
    /// Reading the message body.
    ReadingPayload { buffer: Vec<u8>, bytes_read: usize },
}

impl ReceiveState {
    fn reading_length() -> Self {
        ReceiveState::ReadingLength {
            prefix: [0u8; MAX_VARINT_LEN],
            bytes_read: 0,
        }
    }

    fn reading_payload(len: usize) -> Self {
        ReceiveState::ReadingPayload {
            buffer: vec![0u8; len],
            bytes_read: 0,
        }
    }
}

/// Reader half of a framed stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    receive_state: ReceiveState,
    reader: R,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            receive_state: ReceiveState::reading_length(),
            reader,
        }
    }

    /// Read the next message.
    ///
    /// This function is cancellation safe, it can be used with `tokio::select!`
    /// without leaving the reader in an inconsistent state.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(message))` - A complete message was read.
    /// * `Ok(None)` - The stream ended cleanly before the first byte of a frame.
    /// * `Err(CodecError)` - IO failure, truncated frame, or undecodable body.
    pub async fn read<M>(&mut self) -> Result<Option<M>, CodecError>
    where
        M: prost::Message + Default,
    {
        loop {
            match &mut self.receive_state {
                ReceiveState::ReadingLength { prefix, bytes_read } => {
                    let n = self
                        .reader
                        .read(&mut prefix[*bytes_read..*bytes_read + 1])
                        .await?;
                    if n == 0 {
                        if *bytes_read == 0 {
                            return Ok(None);
                        }
                        return Err(CodecError::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed while reading frame length",
                        )));
                    }
                    *bytes_read += 1;

                    // High bit clear marks the last byte of the varint.
                    if prefix[*bytes_read - 1] & 0x80 != 0 {
                        if *bytes_read == MAX_VARINT_LEN {
                            self.receive_state = ReceiveState::reading_length();
                            return Err(CodecError::InvalidLength);
                        }
                        continue;
                    }

                    let Ok(len) = prost::encoding::decode_varint(&mut &prefix[..*bytes_read])
                    else {
                        self.receive_state = ReceiveState::reading_length();
                        return Err(CodecError::InvalidLength);
                    };
                    let len = len as usize;
                    if len > MAX_FRAME_SIZE {
                        self.receive_state = ReceiveState::reading_length();
                        return Err(CodecError::FrameTooLarge(len));
                    }
                    self.receive_state = ReceiveState::reading_payload(len);
                }

                ReceiveState::ReadingPayload { buffer, bytes_read } => {
                    while *bytes_read < buffer.len() {
                        let n = self.reader.read(&mut buffer[*bytes_read..]).await?;
                        if n == 0 {
                            return Err(CodecError::Io(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed while reading frame payload",
                            )));
                        }
                        *bytes_read += n;
                    }

                    let message = M::decode(buffer.as_slice());
                    self.receive_state = ReceiveState::reading_length();
                    return Ok(Some(message?));
                }
            }
        }
    }
}

/// Writer half of a framed stream.
#[derive(Debug)]
pub struct FrameWriter<W> {
    writer: W,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one message as a frame and flush it.
    pub async fn write<M: prost::Message>(&mut self, message: &M) -> Result<(), CodecError> {
        self.writer.write_all(&encode_frame(message)).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut down the write side, signalling the end of the stream to the peer.
    pub async fn shutdown(&mut self) -> Result<(), CodecError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// A bidirectional framed stream.
#[derive(Debug)]
pub struct Framed<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
}

impl<R, W> Framed<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        }
    }

    /// See [`FrameReader::read`].
    pub async fn read<M>(&mut self) -> Result<Option<M>, CodecError>
    where
        M: prost::Message + Default,
    {
        self.reader.read().await
    }

    pub async fn write<M: prost::Message>(&mut self, message: &M) -> Result<(), CodecError> {
        self.writer.write(message).await
    }

    pub async fn shutdown(&mut self) -> Result<(), CodecError> {
        self.writer.shutdown().await
    }

    /// Split into independent reader and writer halves.
    pub fn into_split(self) -> (FrameReader<R>, FrameWriter<W>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, MessageType};
    use tokio_test::io::Builder as MockIoBuilder;

    fn find_node(key: &[u8]) -> Message {
        Message::request(MessageType::FindNode, key)
    }

    #[tokio::test]
    async fn test_basic_message_receive() {
        let bytes = encode_frame(&find_node(b"abc"));
        let mock_reader = MockIoBuilder::new().read(&bytes).build();
        let mut framed = Framed::new(mock_reader, Vec::new());

        let received: Message = framed.read().await.unwrap().unwrap();
        assert_eq!(received, find_node(b"abc"));
    }

    #[tokio::test]
    async fn test_send_message() {
        let mock_reader = MockIoBuilder::new().build();
        let mut framed = Framed::new(mock_reader, Vec::new());
        framed.write(&find_node(b"abc")).await.unwrap();

        let (_, writer) = framed.into_split();
        assert_eq!(writer.writer, encode_frame(&find_node(b"abc")));
    }

    #[tokio::test]
    async fn test_clean_eof_is_no_message() {
        let mock_reader = MockIoBuilder::new().build();
        let mut reader = FrameReader::new(mock_reader);

        let received: Option<Message> = reader.read().await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        // Varint encoding of MAX_FRAME_SIZE + 1.
        let mut prefix = Vec::new();
        prost::encoding::encode_varint((MAX_FRAME_SIZE + 1) as u64, &mut prefix);
        let mock_reader = MockIoBuilder::new().read(&prefix).build();
        let mut reader = FrameReader::new(mock_reader);

        let result = reader.read::<Message>().await;
        assert!(matches!(result, Err(CodecError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn test_invalid_length_prefix() {
        let prefix = [0xffu8; MAX_VARINT_LEN];
        let mock_reader = MockIoBuilder::new().read(&prefix).build();
        let mut reader = FrameReader::new(mock_reader);

        let result = reader.read::<Message>().await;
        assert!(matches!(result, Err(CodecError::InvalidLength)));
    }

    #[tokio::test]
    async fn test_overflowing_length_resets_reader() {
        // Ten byte varint whose last byte overflows 64 bits.
        let mut prefix = vec![0xffu8; MAX_VARINT_LEN - 1];
        prefix.push(0x02);
        let mock_reader = MockIoBuilder::new()
            .read(&prefix)
            .read(&encode_frame(&find_node(b"next")))
            .build();
        let mut reader = FrameReader::new(mock_reader);

        let result = reader.read::<Message>().await;
        assert!(matches!(result, Err(CodecError::InvalidLength)));

        let received: Message = reader.read().await.unwrap().unwrap();
        assert_eq!(received, find_node(b"next"));
    }

    #[tokio::test]
    async fn test_invalid_message() {
        // Valid length prefix, body is a truncated length-delimited field.
        let data = [0x03, 0x12, 0x05, 0x01];
        let mock_reader = MockIoBuilder::new().read(&data).build();
        let mut reader = FrameReader::new(mock_reader);

        let result = reader.read::<Message>().await;
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[tokio::test]
    async fn test_unexpected_eof_during_length() {
        let mock_reader = MockIoBuilder::new().read(&[0x80]).build();
        let mut reader = FrameReader::new(mock_reader);

        let result = reader.read::<Message>().await;
        assert!(matches!(result, Err(CodecError::Io(_))));
    }

    #[tokio::test]
    async fn test_unexpected_eof_during_payload() {
        let mut bytes = encode_frame(&find_node(b"a longer key"));
        bytes.truncate(4);
        let mock_reader = MockIoBuilder::new().read(&bytes).build();
        let mut reader = FrameReader::new(mock_reader);

        let result = reader.read::<Message>().await;
        assert!(matches!(result, Err(CodecError::Io(_))));
    }

    #[tokio::test]
    async fn test_cancellation_safety() {
        let bytes = encode_frame(&find_node(b"abc"));

        // One byte per read call.
        let mut mock_reader = MockIoBuilder::new();
        for i in 0..bytes.len() {
            mock_reader.read(&bytes[i..i + 1]);
        }
        let mut reader = FrameReader::new(mock_reader.build());

        let received: Message = reader.read().await.unwrap().unwrap();
        assert_eq!(received, find_node(b"abc"));
    }

    #[tokio::test]
    async fn test_multiple_messages() {
        let mut combined = encode_frame(&find_node(b"one"));
        combined.extend_from_slice(&encode_frame(&find_node(b"two")));
        let mock_reader = MockIoBuilder::new().read(&combined).build();
        let mut reader = FrameReader::new(mock_reader);

        let first: Message = reader.read().await.unwrap().unwrap();
        let second: Message = reader.read().await.unwrap().unwrap();
        assert_eq!(first.key, b"one".to_vec());
        assert_eq!(second.key, b"two".to_vec());
        assert!(reader.read::<Message>().await.unwrap().is_none());
    }
}
