// ABOUTME: Demultiplexing of channel-tagged container output into stdout and stderr buffers
// ABOUTME: Reassembles length-prefixed frames across arbitrary read boundaries

use crate::engine::{LogStream, OutputChunk, StreamType};
use crate::error::{Result, SandboxError};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the `[stream, 0, 0, 0, len_be_u32]` frame header
pub const FRAME_HEADER_LEN: usize = 8;

const READ_CHUNK: usize = 8 * 1024;

/// How a raw output stream is laid out on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Length-prefixed frames tagged with their channel
    Multiplexed,
    /// TTY output: already a single combined stream
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: StreamType,
    pub payload: Vec<u8>,
}

/// Encode one frame; the inverse of [`FrameDecoder::push`]
pub fn encode_frame(stream: StreamType, payload: &[u8]) -> Vec<u8> {
    let tag = match stream {
        StreamType::Stdout => 1u8,
        StreamType::Stderr => 2u8,
    };
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&[tag, 0, 0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Incremental frame decoder that keeps partial headers and payloads between pushes
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every frame they complete
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        self.pending.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut offset = 0;
        while self.pending.len() - offset >= FRAME_HEADER_LEN {
            let header = &self.pending[offset..offset + FRAME_HEADER_LEN];
            let stream = match header[0] {
                // stdin is echoed back on the stdout channel
                0 | 1 => StreamType::Stdout,
                // 3 is the daemon's own error channel
                2 | 3 => StreamType::Stderr,
                other => {
                    return Err(SandboxError::LogRetrieval(format!(
                        "unknown stream tag {} in frame header",
                        other
                    )))
                }
            };
            let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
            let end = offset + FRAME_HEADER_LEN + len;
            if self.pending.len() < end {
                break;
            }
            frames.push(Frame {
                stream,
                payload: self.pending[offset + FRAME_HEADER_LEN..end].to_vec(),
            });
            offset = end;
        }
        self.pending.drain(..offset);
        Ok(frames)
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Signal end of stream; a partial trailing frame is an error
    pub fn finish(self) -> Result<()> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::LogRetrieval(format!(
                "stream ended inside a frame ({} trailing bytes)",
                self.pending.len()
            )))
        }
    }
}

/// Demultiplexed output; every buffer is present even when empty
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogBuffers {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Both channels in arrival order
    pub combined: Vec<u8>,
}

impl LogBuffers {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn combined_text(&self) -> String {
        String::from_utf8_lossy(&self.combined).into_owned()
    }

    /// All of stdout followed by all of stderr
    pub fn stdout_then_stderr(&self) -> String {
        let mut text = self.stdout_text();
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        text
    }

    pub fn is_empty(&self) -> bool {
        self.combined.is_empty()
    }
}

/// Accumulates already-separated output chunks
#[derive(Debug, Default)]
pub struct LogCollector {
    buffers: LogBuffers,
}

impl LogCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stream: StreamType, data: &[u8]) {
        match stream {
            StreamType::Stdout => self.buffers.stdout.extend_from_slice(data),
            StreamType::Stderr => self.buffers.stderr.extend_from_slice(data),
        }
        self.buffers.combined.extend_from_slice(data);
    }

    pub fn push_chunk(&mut self, chunk: &OutputChunk) {
        self.push(chunk.stream, &chunk.data);
    }

    pub fn finish(self) -> LogBuffers {
        self.buffers
    }
}

/// Read `reader` to end and split it per `framing`
pub async fn demux_reader<R>(mut reader: R, framing: Framing) -> Result<LogBuffers>
where
    R: AsyncRead + Unpin,
{
    let mut collector = LogCollector::new();
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| SandboxError::LogRetrieval(e.to_string()))?;
        if n == 0 {
            break;
        }
        match framing {
            Framing::Raw => collector.push(StreamType::Stdout, &buf[..n]),
            Framing::Multiplexed => {
                for frame in decoder.push(&buf[..n])? {
                    collector.push(frame.stream, &frame.payload);
                }
            }
        }
    }

    decoder.finish()?;
    Ok(collector.finish())
}

/// Drain whatever form of log stream an engine handed back
pub async fn collect(stream: LogStream) -> Result<LogBuffers> {
    match stream {
        LogStream::Framed { reader, framing } => demux_reader(reader, framing).await,
        LogStream::Chunks(mut output) => {
            let mut collector = LogCollector::new();
            while let Some(chunk) = output.receiver.recv().await {
                let chunk = chunk.map_err(|e| SandboxError::LogRetrieval(e.to_string()))?;
                collector.push_chunk(&chunk);
            }
            Ok(collector.finish())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio_test::io::Builder;

    fn interleaved() -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let parts: [(StreamType, &[u8]); 6] = [
            (StreamType::Stdout, b"hello "),
            (StreamType::Stderr, b"warn: x\n"),
            (StreamType::Stdout, b"world\n"),
            (StreamType::Stdout, b""),
            (StreamType::Stderr, b"fatal\n"),
            (StreamType::Stdout, b"bye\n"),
        ];
        let mut wire = Vec::new();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        for (stream, payload) in parts {
            wire.extend(encode_frame(stream, payload));
            match stream {
                StreamType::Stdout => stdout.extend_from_slice(payload),
                StreamType::Stderr => stderr.extend_from_slice(payload),
            }
        }
        (wire, stdout, stderr)
    }

    #[tokio::test]
    async fn test_demux_frames_split_across_reads() {
        let (wire, stdout, stderr) = interleaved();

        // Boundaries inside a header, inside a payload and exactly on a frame edge
        let cuts = [3usize, 11, 14, 22, 30, 41];
        let mut builder = Builder::new();
        let mut start = 0;
        for cut in cuts {
            builder.read(&wire[start..cut]);
            start = cut;
        }
        builder.read(&wire[start..]);

        let buffers = demux_reader(builder.build(), Framing::Multiplexed)
            .await
            .unwrap();
        assert_eq!(buffers.stdout, stdout);
        assert_eq!(buffers.stderr, stderr);
        assert_eq!(
            buffers.combined_text(),
            "hello warn: x\nworld\nfatal\nbye\n"
        );
    }

    #[tokio::test]
    async fn test_stdout_then_stderr_ordering() {
        let (wire, _, _) = interleaved();
        let buffers = demux_reader(&wire[..], Framing::Multiplexed).await.unwrap();
        assert_eq!(
            buffers.stdout_then_stderr(),
            "hello world\nbye\nwarn: x\nfatal\n"
        );
    }

    #[tokio::test]
    async fn test_demux_byte_at_a_time() {
        let (wire, stdout, stderr) = interleaved();
        let mut builder = Builder::new();
        for byte in wire.chunks(1) {
            builder.read(byte);
        }
        let buffers = demux_reader(builder.build(), Framing::Multiplexed)
            .await
            .unwrap();
        assert_eq!(buffers.stdout, stdout);
        assert_eq!(buffers.stderr, stderr);
    }

    #[tokio::test]
    async fn test_demux_ends_on_stderr_frame() {
        let mut wire = encode_frame(StreamType::Stdout, b"out");
        wire.extend(encode_frame(StreamType::Stderr, b"err"));
        let buffers = demux_reader(Builder::new().read(&wire).build(), Framing::Multiplexed)
            .await
            .unwrap();
        assert_eq!(buffers.stdout_text(), "out");
        assert_eq!(buffers.stderr_text(), "err");
    }

    #[tokio::test]
    async fn test_empty_stream_yields_empty_buffers() {
        let buffers = demux_reader(Builder::new().build(), Framing::Multiplexed)
            .await
            .unwrap();
        assert_eq!(buffers, LogBuffers::default());
        assert!(buffers.is_empty());
        assert_eq!(buffers.stdout_text(), "");
    }

    #[tokio::test]
    async fn test_raw_framing_is_passthrough() {
        let raw = b"\x01\x00\x00\x00not a frame at all";
        let buffers = demux_reader(Builder::new().read(raw).build(), Framing::Raw)
            .await
            .unwrap();
        assert_eq!(buffers.stdout, raw.to_vec());
        assert_eq!(buffers.combined, raw.to_vec());
        assert!(buffers.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let wire = encode_frame(StreamType::Stdout, b"abcdef");
        let err = demux_reader(
            Builder::new().read(&wire[..wire.len() - 2]).build(),
            Framing::Multiplexed,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SandboxError::LogRetrieval(_)));
    }

    #[test]
    fn test_decoder_retains_partial_header() {
        let wire = encode_frame(StreamType::Stderr, b"xyz");
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(&wire[..5]).unwrap().is_empty());
        assert_eq!(decoder.buffered(), 5);

        let frames = decoder.push(&wire[5..]).unwrap();
        assert_eq!(
            frames,
            vec![Frame {
                stream: StreamType::Stderr,
                payload: b"xyz".to_vec()
            }]
        );
        decoder.finish().unwrap();
    }

    #[test]
    fn test_decoder_rejects_unknown_tag() {
        let mut decoder = FrameDecoder::new();
        let err = decoder.push(&[9, 0, 0, 0, 0, 0, 0, 1, b'x']).unwrap_err();
        assert!(matches!(err, SandboxError::LogRetrieval(_)));
    }

    #[test]
    fn test_stdin_tag_maps_to_stdout() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&[0, 0, 0, 0, 0, 0, 0, 2, b'o', b'k']).unwrap();
        assert_eq!(frames[0].stream, StreamType::Stdout);
    }

    #[tokio::test]
    async fn test_collect_chunk_stream() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tx.send(Ok(OutputChunk::new(StreamType::Stdout, b"a".to_vec())))
            .unwrap();
        tx.send(Ok(OutputChunk::new(StreamType::Stderr, b"b".to_vec())))
            .unwrap();
        drop(tx);

        let buffers = collect(LogStream::Chunks(crate::engine::OutputStream { receiver: rx }))
            .await
            .unwrap();
        assert_eq!(buffers.combined_text(), "ab");
        assert_eq!(buffers.stderr_text(), "b");
    }
}
