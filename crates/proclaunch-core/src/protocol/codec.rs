//! Binary framing for launcher packets.
//!
//! ```text
//! [u32 LE: payload len][u8: packet type][u64 LE: token][payload of len]
//! ```
//!
//! Payload fields are little-endian. Strings and byte arrays carry a `u32`
//! length prefix, lists and maps a `u32` element count. Every inner length is
//! checked against what is left of the payload, and a payload must be
//! consumed exactly.

use super::packet::{Packet, PacketBody, ProcessFinishedPacket, StartProcessPacket};
use super::types::{PacketType, Token};
use crate::config::PacketConfig;
use crate::error::{LauncherError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Append the encoded form of `packet` to `dst`.
///
/// Fails without touching `dst` when the payload would exceed
/// [`PacketConfig::MAX_PACKET_SIZE`].
pub fn encode(packet: &Packet, dst: &mut BytesMut) -> Result<()> {
    let start = dst.len();
    dst.put_u32_le(0);
    dst.put_u8(packet.packet_type().as_u8());
    dst.put_u64_le(packet.token.as_u64());

    let payload_start = dst.len();
    encode_body(&packet.body, dst);
    let size = dst.len() - payload_start;

    if size > PacketConfig::MAX_PACKET_SIZE {
        dst.truncate(start);
        return Err(LauncherError::InvalidPacketSize {
            size,
            max: PacketConfig::MAX_PACKET_SIZE,
        });
    }

    dst[start..start + 4].copy_from_slice(&(size as u32).to_le_bytes());
    Ok(())
}

/// Encode a single packet into a fresh buffer.
pub fn serialize(packet: &Packet) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    encode(packet, &mut buf)?;
    Ok(buf.freeze())
}

/// Take one complete packet off the front of `src`.
///
/// Returns `Ok(None)` and leaves `src` untouched while the packet is still
/// incomplete. An oversized length prefix or unknown type is rejected as soon
/// as the header is available, before any payload is buffered.
pub fn decode(src: &mut BytesMut) -> Result<Option<Packet>> {
    if src.len() < PacketConfig::HEADER_SIZE {
        return Ok(None);
    }

    let mut header = &src[..PacketConfig::HEADER_SIZE];
    let size = header.get_u32_le() as usize;
    let raw_type = header.get_u8();
    let token = Token::from_raw(header.get_u64_le());

    if size > PacketConfig::MAX_PACKET_SIZE {
        return Err(LauncherError::InvalidPacketSize {
            size,
            max: PacketConfig::MAX_PACKET_SIZE,
        });
    }
    let packet_type = PacketType::decode(raw_type)?;

    let total = PacketConfig::HEADER_SIZE + size;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(PacketConfig::HEADER_SIZE);
    let payload = src.split_to(size).freeze();
    let body = decode_body(packet_type, payload)?;
    Ok(Some(Packet::new(token, body)))
}

fn encode_body(body: &PacketBody, dst: &mut BytesMut) {
    match body {
        PacketBody::StartProcess(start) => {
            put_string(dst, &start.command);
            dst.put_u32_le(start.arguments.len() as u32);
            for arg in &start.arguments {
                put_string(dst, arg);
            }
            put_string(dst, &start.working_directory);
            dst.put_u32_le(start.env.len() as u32);
            for (key, value) in &start.env {
                put_string(dst, key);
                put_string(dst, value);
            }
            dst.put_u8(start.channel_mode.as_u8());
            put_string(dst, &start.standard_input_file);
            dst.put_u8(start.process_mode.as_u8());
            put_bytes(dst, &start.write_data);
            dst.put_u8(start.below_normal_priority as u8);
            put_string(dst, &start.native_arguments);
            dst.put_u8(start.low_priority as u8);
            dst.put_u8(start.unix_terminal_disabled as u8);
        }
        PacketBody::WriteIntoProcess(data)
        | PacketBody::ReadyReadStandardOutput(data)
        | PacketBody::ReadyReadStandardError(data) => put_bytes(dst, data),
        PacketBody::StopProcess | PacketBody::Shutdown => {}
        PacketBody::ProcessError {
            error,
            error_string,
        } => {
            dst.put_u8(error.as_u8());
            put_string(dst, error_string);
        }
        PacketBody::ProcessStarted { pid } => dst.put_u64_le(*pid),
        PacketBody::ProcessFinished(finished) => {
            dst.put_u8(finished.error.as_u8());
            put_string(dst, &finished.error_string);
            dst.put_i32_le(finished.exit_code);
            dst.put_u8(finished.exit_status.as_u8());
            put_bytes(dst, &finished.standard_output);
            put_bytes(dst, &finished.standard_error);
        }
    }
}

fn decode_body(packet_type: PacketType, payload: Bytes) -> Result<PacketBody> {
    let mut fields = FieldReader::new(payload);
    let body = match packet_type {
        PacketType::StartProcess => {
            let command = fields.string("command")?;
            let arguments = fields.string_list("arguments")?;
            let working_directory = fields.string("working directory")?;
            let env = fields.env()?;
            let channel_mode = fields.wire_enum("channel mode")?;
            let standard_input_file = fields.string("stdin file")?;
            let process_mode = fields.wire_enum("process mode")?;
            let write_data = fields.bytes("write data")?;
            let below_normal_priority = fields.bool("below normal priority")?;
            let native_arguments = fields.string("native arguments")?;
            let low_priority = fields.bool("low priority")?;
            let unix_terminal_disabled = fields.bool("unix terminal disabled")?;
            PacketBody::StartProcess(StartProcessPacket {
                command,
                arguments,
                working_directory,
                env,
                channel_mode,
                standard_input_file,
                process_mode,
                write_data,
                below_normal_priority,
                native_arguments,
                low_priority,
                unix_terminal_disabled,
            })
        }
        PacketType::WriteIntoProcess => PacketBody::WriteIntoProcess(fields.bytes("data")?),
        PacketType::StopProcess => PacketBody::StopProcess,
        PacketType::Shutdown => PacketBody::Shutdown,
        PacketType::ProcessError => PacketBody::ProcessError {
            error: fields.wire_enum("process error")?,
            error_string: fields.string("error string")?,
        },
        PacketType::ProcessStarted => PacketBody::ProcessStarted {
            pid: fields.u64("pid")?,
        },
        PacketType::ReadyReadStandardOutput => {
            PacketBody::ReadyReadStandardOutput(fields.bytes("stdout")?)
        }
        PacketType::ReadyReadStandardError => {
            PacketBody::ReadyReadStandardError(fields.bytes("stderr")?)
        }
        PacketType::ProcessFinished => PacketBody::ProcessFinished(ProcessFinishedPacket {
            error: fields.wire_enum("process error")?,
            error_string: fields.string("error string")?,
            exit_code: fields.i32("exit code")?,
            exit_status: fields.wire_enum("exit status")?,
            standard_output: fields.bytes("stdout")?,
            standard_error: fields.bytes("stderr")?,
        }),
    };
    fields.finish(packet_type)?;
    Ok(body)
}

fn put_bytes(dst: &mut BytesMut, data: &[u8]) {
    dst.put_u32_le(data.len() as u32);
    dst.put_slice(data);
}

fn put_string(dst: &mut BytesMut, value: &str) {
    put_bytes(dst, value.as_bytes());
}

/// Bounds-checked cursor over one packet payload.
struct FieldReader {
    buf: Bytes,
}

impl FieldReader {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, len: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < len {
            return Err(LauncherError::malformed(format!(
                "{} needs {} bytes but only {} remain",
                what,
                len,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn bool(&mut self, what: &str) -> Result<bool> {
        match self.u8(what)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(LauncherError::malformed(format!(
                "{} has invalid boolean value {}",
                what, other
            ))),
        }
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        self.need(4, what)?;
        Ok(self.buf.get_u32_le())
    }

    fn i32(&mut self, what: &str) -> Result<i32> {
        self.need(4, what)?;
        Ok(self.buf.get_i32_le())
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        self.need(8, what)?;
        Ok(self.buf.get_u64_le())
    }

    fn wire_enum<T>(&mut self, what: &str) -> Result<T>
    where
        T: TryFrom<u8, Error = u8>,
    {
        let raw = self.u8(what)?;
        T::try_from(raw)
            .map_err(|raw| LauncherError::malformed(format!("{} has invalid value {}", what, raw)))
    }

    fn bytes(&mut self, what: &str) -> Result<Bytes> {
        let len = self.u32(what)? as usize;
        self.need(len, what)?;
        Ok(self.buf.split_to(len))
    }

    fn string(&mut self, what: &str) -> Result<String> {
        let raw = self.bytes(what)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| LauncherError::malformed(format!("{} is not valid UTF-8", what)))
    }

    /// Reads a `u32` element count, refusing counts the payload cannot hold.
    fn count(&mut self, what: &str, min_element_size: usize) -> Result<usize> {
        let count = self.u32(what)? as usize;
        self.need(count.saturating_mul(min_element_size), what)?;
        Ok(count)
    }

    fn string_list(&mut self, what: &str) -> Result<Vec<String>> {
        let count = self.count(what, 4)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.string(what)?);
        }
        Ok(items)
    }

    fn env(&mut self) -> Result<BTreeMap<String, String>> {
        let count = self.count("environment", 8)?;
        let mut env = BTreeMap::new();
        for _ in 0..count {
            let key = self.string("environment key")?;
            let value = self.string("environment value")?;
            env.insert(key, value);
        }
        Ok(env)
    }

    fn finish(self, packet_type: PacketType) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(LauncherError::malformed(format!(
                "{} trailing bytes after {:?} payload",
                self.buf.remaining(),
                packet_type
            )));
        }
        Ok(())
    }
}

/// Incremental packet reader over an async byte stream.
///
/// Packets that arrived in the same read are handed out one at a time before
/// the stream is read again.
pub struct PacketReader<R> {
    reader: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(PacketConfig::READ_CHUNK_SIZE),
        }
    }

    /// Next complete packet, or `None` on a clean end of stream.
    ///
    /// Cancel safe: if the future is dropped while waiting for data, no bytes
    /// are lost.
    pub async fn next_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            if let Some(packet) = decode(&mut self.buffer)? {
                return Ok(Some(packet));
            }

            self.buffer.reserve(PacketConfig::READ_CHUNK_SIZE);
            let read = self.reader.read_buf(&mut self.buffer).await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(LauncherError::malformed(format!(
                    "stream closed inside a packet ({} bytes pending)",
                    self.buffer.len()
                )));
            }
        }
    }
}

/// Write one packet and flush.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    let bytes = serialize(packet)?;
    write_frame(writer, &bytes).await
}

/// Write an already serialized packet and flush.
///
/// Callers that must tell an encoding failure apart from a broken stream
/// serialize first and only hand the frame over once it is known to be valid.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{ChannelMode, ExitStatus, ProcessError, ProcessMode};

    fn start_packet() -> Packet {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        env.insert("LANG".to_string(), "C".to_string());
        Packet::new(
            Token::from_raw(7),
            PacketBody::StartProcess(StartProcessPacket {
                command: "/bin/sh".to_string(),
                arguments: vec!["-c".to_string(), "echo ü".to_string(), String::new()],
                working_directory: "/tmp".to_string(),
                env,
                channel_mode: ChannelMode::MergedChannels,
                standard_input_file: String::new(),
                process_mode: ProcessMode::Writer,
                write_data: Bytes::from_static(b"\x00\xffinput"),
                below_normal_priority: true,
                native_arguments: "/q".to_string(),
                low_priority: false,
                unix_terminal_disabled: true,
            }),
        )
    }

    fn sample_packets() -> Vec<Packet> {
        let token = Token::from_raw(u64::MAX);
        vec![
            start_packet(),
            Packet::new(token, PacketBody::WriteIntoProcess(Bytes::from_static(b"abc"))),
            Packet::new(token, PacketBody::StopProcess),
            Packet::shutdown(),
            Packet::new(
                token,
                PacketBody::ProcessError {
                    error: ProcessError::FailedToStart,
                    error_string: "No such file or directory".to_string(),
                },
            ),
            Packet::new(token, PacketBody::ProcessStarted { pid: 4242 }),
            Packet::new(token, PacketBody::ReadyReadStandardOutput(Bytes::new())),
            Packet::new(token, PacketBody::ReadyReadStandardError(Bytes::from_static(b"warn\n"))),
            Packet::new(
                token,
                PacketBody::ProcessFinished(ProcessFinishedPacket {
                    error: ProcessError::Crashed,
                    error_string: "killed".to_string(),
                    exit_code: -1,
                    exit_status: ExitStatus::CrashExit,
                    standard_output: Bytes::from_static(b"tail"),
                    standard_error: Bytes::new(),
                }),
            ),
        ]
    }

    #[test]
    fn test_roundtrip_all_packet_types() {
        for packet in sample_packets() {
            let bytes = serialize(&packet).unwrap();
            let mut buf = BytesMut::from(&bytes[..]);
            let decoded = decode(&mut buf).unwrap().expect("complete packet");
            assert_eq!(decoded, packet);
            assert!(buf.is_empty());

            let reencoded = serialize(&decoded).unwrap();
            assert_eq!(reencoded, bytes, "{:?} is not byte-stable", packet.packet_type());
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = serialize(&Packet::new(Token::from_raw(0x0102), PacketBody::ProcessStarted { pid: 9 }))
            .unwrap();
        assert_eq!(bytes.len(), PacketConfig::HEADER_SIZE + 8);
        assert_eq!(&bytes[0..4], &8u32.to_le_bytes());
        assert_eq!(bytes[4], PacketType::ProcessStarted.as_u8());
        assert_eq!(&bytes[5..13], &0x0102u64.to_le_bytes());
    }

    #[test]
    fn test_environment_is_deterministic() {
        let mut a = BTreeMap::new();
        a.insert("B".to_string(), "2".to_string());
        a.insert("A".to_string(), "1".to_string());
        let mut b = BTreeMap::new();
        b.insert("A".to_string(), "1".to_string());
        b.insert("B".to_string(), "2".to_string());

        let make = |env| {
            Packet::new(
                Token::from_raw(1),
                PacketBody::StartProcess(StartProcessPacket {
                    command: "env".to_string(),
                    env,
                    ..StartProcessPacket::default()
                }),
            )
        };
        assert_eq!(serialize(&make(a)).unwrap(), serialize(&make(b)).unwrap());
    }

    #[test]
    fn test_byte_at_a_time_feeding() {
        let packets = sample_packets();
        let mut stream = BytesMut::new();
        for packet in &packets {
            encode(packet, &mut stream).unwrap();
        }

        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in stream.iter() {
            buf.put_u8(*byte);
            let before = buf.clone();
            match decode(&mut buf).unwrap() {
                Some(packet) => decoded.push(packet),
                None => assert_eq!(buf, before, "incomplete decode must not consume"),
            }
        }

        assert_eq!(decoded, packets);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_batched_packets_decode_in_order() {
        let mut buf = BytesMut::new();
        encode(&Packet::new(Token::from_raw(1), PacketBody::StopProcess), &mut buf).unwrap();
        encode(&Packet::shutdown(), &mut buf).unwrap();

        assert_eq!(decode(&mut buf).unwrap().unwrap().packet_type(), PacketType::StopProcess);
        assert_eq!(decode(&mut buf).unwrap().unwrap().packet_type(), PacketType::Shutdown);
        assert!(decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_rejected_from_header_alone() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((PacketConfig::MAX_PACKET_SIZE + 1) as u32);
        buf.put_u8(PacketType::WriteIntoProcess.as_u8());
        buf.put_u64_le(1);

        let err = decode(&mut buf).unwrap_err();
        assert!(matches!(err, LauncherError::InvalidPacketSize { .. }));
        assert!(buf.capacity() < PacketConfig::MAX_PACKET_SIZE);
    }

    #[test]
    fn test_oversized_payload_not_encoded() {
        let data = Bytes::from(vec![0u8; PacketConfig::MAX_PACKET_SIZE]);
        let packet = Packet::new(Token::from_raw(1), PacketBody::WriteIntoProcess(data));
        let mut buf = BytesMut::from(&b"keep"[..]);

        let err = encode(&packet, &mut buf).unwrap_err();
        assert!(matches!(err, LauncherError::InvalidPacketSize { .. }));
        assert_eq!(&buf[..], b"keep");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0);
        buf.put_u8(99);
        buf.put_u64_le(1);
        assert!(matches!(
            decode(&mut buf),
            Err(LauncherError::UnknownPacketType(99))
        ));
    }

    #[test]
    fn test_inner_length_beyond_payload_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(4);
        buf.put_u8(PacketType::WriteIntoProcess.as_u8());
        buf.put_u64_le(1);
        buf.put_u32_le(1000);

        let err = decode(&mut buf).unwrap_err();
        assert!(matches!(err, LauncherError::MalformedPacket(_)));
    }

    #[test]
    fn test_huge_list_count_rejected() {
        let mut payload = BytesMut::new();
        put_string(&mut payload, "ls");
        payload.put_u32_le(u32::MAX);

        let mut buf = BytesMut::new();
        buf.put_u32_le(payload.len() as u32);
        buf.put_u8(PacketType::StartProcess.as_u8());
        buf.put_u64_le(1);
        buf.put_slice(&payload);

        assert!(matches!(decode(&mut buf), Err(LauncherError::MalformedPacket(_))));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(2);
        buf.put_u8(PacketType::StopProcess.as_u8());
        buf.put_u64_le(1);
        buf.put_u16_le(0);

        assert!(matches!(decode(&mut buf), Err(LauncherError::MalformedPacket(_))));
    }

    #[test]
    fn test_invalid_enum_value_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(5);
        buf.put_u8(PacketType::ProcessError.as_u8());
        buf.put_u64_le(1);
        buf.put_u8(77);
        buf.put_u32_le(0);

        assert!(matches!(decode(&mut buf), Err(LauncherError::MalformedPacket(_))));
    }

    #[tokio::test]
    async fn test_reader_over_stream() {
        let (mut client, server) = tokio::io::duplex(16);
        let mut reader = PacketReader::new(server);

        let writer = tokio::spawn(async move {
            for packet in sample_packets() {
                write_packet(&mut client, &packet).await.unwrap();
            }
        });

        let mut received = Vec::new();
        while let Some(packet) = reader.next_packet().await.unwrap() {
            received.push(packet);
        }
        writer.await.unwrap();

        assert_eq!(received, sample_packets());
    }

    #[tokio::test]
    async fn test_reader_rejects_eof_inside_packet() {
        let (mut client, server) = tokio::io::duplex(4096);
        let bytes = serialize(&start_packet()).unwrap();
        client.write_all(&bytes[..bytes.len() - 1]).await.unwrap();
        drop(client);

        let mut reader = PacketReader::new(server);
        assert!(matches!(
            reader.next_packet().await,
            Err(LauncherError::MalformedPacket(_))
        ));
    }
}
