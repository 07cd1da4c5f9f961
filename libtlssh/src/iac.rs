// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The IAC (Interpret As Command) sub-protocol.
//!
//! Once a session is live the only in-band control channel is a small
//! escape scheme borrowed from telnet: `0xff` introduces a command, and a
//! doubled `0xff` stands for a literal `0xff` data byte. The one real
//! command carries window-size updates from the client terminal to the
//! server PTY.

use byteorder::{BigEndian, ByteOrder};

pub const IAC: u8 = 0xff;
pub const CMD_WINDOW_SIZE: u8 = 0x01;

const WINDOW_SIZE_FRAME_LEN: usize = 6;

/// Where decoded commands land. The server points this at the PTY master;
/// tests record the calls.
pub trait CommandSink {
    fn set_window_size(&mut self, rows: u16, cols: u16) -> anyhow::Result<()>;
}

/// The decoder met an opcode outside the command table. This is fatal for
/// the session; the peer is not speaking our protocol.
#[derive(Debug, thiserror::Error)]
#[error("invalid IAC command 0x{command:02x}")]
pub struct InvalidCommand {
    pub command: u8,
}

/// Escape terminal input for the wire: every `0xff` becomes `0xff 0xff`.
/// Buffers without any `0xff` pass through as a plain copy.
pub fn encode(input: &[u8]) -> Vec<u8> {
    if !input.contains(&IAC) {
        return input.to_vec();
    }

    let mut out = Vec::with_capacity(input.len() + 8);
    for &b in input {
        out.push(b);
        if b == IAC {
            out.push(IAC);
        }
    }
    out
}

/// Build the 6-byte window-size command frame, fields in network byte
/// order.
pub fn window_size_frame(rows: u16, cols: u16) -> [u8; WINDOW_SIZE_FRAME_LEN] {
    let mut frame = [0u8; WINDOW_SIZE_FRAME_LEN];
    frame[0] = IAC;
    frame[1] = CMD_WINDOW_SIZE;
    BigEndian::write_u16(&mut frame[2..4], rows);
    BigEndian::write_u16(&mut frame[4..6], cols);
    frame
}

/// Incremental IAC decoder.
///
/// TLS records are framed independently of IAC frames, so a command can
/// straddle reads; the decoder consumes as much of its input as it can and
/// leaves a partial frame in place for the next call. The length table is
/// precomputed so "incomplete, buffer more" is detectable without
/// per-opcode code.
pub struct Decoder {
    frame_len: [usize; 256],
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        let mut frame_len = [2usize; 256];
        frame_len[CMD_WINDOW_SIZE as usize] = WINDOW_SIZE_FRAME_LEN;
        Decoder { frame_len }
    }

    /// Drain the longest decodable prefix of `buf`: user data is appended
    /// to `out`, complete commands are dispatched to `sink`. Anything left
    /// in `buf` afterwards is the start of an incomplete frame.
    pub fn decode(
        &self,
        buf: &mut Vec<u8>,
        out: &mut Vec<u8>,
        sink: &mut dyn CommandSink,
    ) -> anyhow::Result<()> {
        loop {
            if buf.is_empty() {
                return Ok(());
            }

            match buf.iter().position(|&b| b == IAC) {
                // only user data
                None => {
                    out.append(buf);
                    return Ok(());
                }
                // user data first, then the frame at the front
                Some(pos) if pos > 0 => {
                    out.extend_from_slice(&buf[..pos]);
                    buf.drain(..pos);
                }
                Some(_) => {
                    if buf.len() < 2 {
                        return Ok(());
                    }
                    let command = buf[1];
                    let frame_len = self.frame_len[command as usize];
                    if buf.len() < frame_len {
                        return Ok(());
                    }

                    match command {
                        IAC => out.push(IAC),
                        CMD_WINDOW_SIZE => {
                            let rows = BigEndian::read_u16(&buf[2..4]);
                            let cols = BigEndian::read_u16(&buf[4..6]);
                            sink.set_window_size(rows, cols)?;
                        }
                        command => return Err(InvalidCommand { command }.into()),
                    }
                    buf.drain(..frame_len);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        resizes: Vec<(u16, u16)>,
    }

    impl CommandSink for RecordingSink {
        fn set_window_size(&mut self, rows: u16, cols: u16) -> anyhow::Result<()> {
            self.resizes.push((rows, cols));
            Ok(())
        }
    }

    fn decode_all(input: &[u8]) -> (Vec<u8>, Vec<(u16, u16)>) {
        let decoder = Decoder::new();
        let mut buf = input.to_vec();
        let mut out = Vec::new();
        let mut sink = RecordingSink::default();
        decoder.decode(&mut buf, &mut out, &mut sink).expect("decode");
        assert!(buf.is_empty(), "decoder left {} bytes", buf.len());
        (out, sink.resizes)
    }

    #[test]
    fn encode_is_identity_without_iac() {
        assert_eq!(encode(b"hello world"), b"hello world");
        assert_eq!(encode(&[]), Vec::<u8>::new());
    }

    #[test]
    fn encode_doubles_iac() {
        assert_eq!(encode(&[0xff]), vec![0xff, 0xff]);
        assert_eq!(encode(&[0x01, 0xff, 0x02]), vec![0x01, 0xff, 0xff, 0x02]);
        assert_eq!(encode(&[0xff, 0xff]), vec![0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn round_trip_emits_no_commands() {
        let cases: Vec<Vec<u8>> = vec![
            b"plain ascii".to_vec(),
            vec![0xff],
            vec![0xff, 0x00, 0xff, 0xff],
            (0u8..=255).collect(),
        ];
        for data in cases {
            let (out, resizes) = decode_all(&encode(&data));
            assert_eq!(out, data);
            assert!(resizes.is_empty());
        }
    }

    #[test]
    fn window_size_is_network_byte_order() {
        let frame = window_size_frame(40, 132);
        assert_eq!(frame, [0xff, 0x01, 0x00, 40, 0x00, 132]);

        let (out, resizes) = decode_all(&frame);
        assert!(out.is_empty());
        assert_eq!(resizes, vec![(40, 132)]);
    }

    #[test]
    fn data_around_a_frame_stays_ordered() {
        let mut input = b"before".to_vec();
        input.extend_from_slice(&window_size_frame(24, 80));
        input.extend_from_slice(b"after");

        let (out, resizes) = decode_all(&input);
        assert_eq!(out, b"beforeafter");
        assert_eq!(resizes, vec![(24, 80)]);
    }

    #[test]
    fn frames_survive_arbitrary_splits() {
        // encode("ab\xff") followed by a window-size frame, delivered in
        // every possible two-chunk split. The decoder must never dispatch
        // a partial frame and must dispatch the full one exactly once.
        let mut stream = encode(&[b'a', b'b', 0xff]);
        stream.extend_from_slice(&window_size_frame(50, 100));

        for split in 0..=stream.len() {
            let decoder = Decoder::new();
            let mut buf = Vec::new();
            let mut out = Vec::new();
            let mut sink = RecordingSink::default();

            buf.extend_from_slice(&stream[..split]);
            decoder.decode(&mut buf, &mut out, &mut sink).expect("first chunk");
            let resizes_before_tail = sink.resizes.len();
            assert!(resizes_before_tail <= 1);

            buf.extend_from_slice(&stream[split..]);
            decoder.decode(&mut buf, &mut out, &mut sink).expect("second chunk");

            assert_eq!(out, vec![b'a', b'b', 0xff], "split at {split}");
            assert_eq!(sink.resizes, vec![(50, 100)], "split at {split}");
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn incomplete_frame_is_left_in_the_buffer() {
        let decoder = Decoder::new();
        let mut buf = vec![0xff, 0x01, 0x00];
        let mut out = Vec::new();
        let mut sink = RecordingSink::default();

        decoder.decode(&mut buf, &mut out, &mut sink).expect("decode");
        assert_eq!(buf, vec![0xff, 0x01, 0x00]);
        assert!(out.is_empty());
        assert!(sink.resizes.is_empty());
    }

    #[test]
    fn lone_iac_waits_for_its_second_byte() {
        let decoder = Decoder::new();
        let mut buf = vec![b'x', 0xff];
        let mut out = Vec::new();
        let mut sink = RecordingSink::default();

        decoder.decode(&mut buf, &mut out, &mut sink).expect("decode");
        assert_eq!(out, b"x");
        assert_eq!(buf, vec![0xff]);
    }

    #[test]
    fn unknown_opcode_is_fatal() {
        let decoder = Decoder::new();
        let mut buf = vec![0xff, 0x02];
        let mut out = Vec::new();
        let mut sink = RecordingSink::default();

        let err = decoder.decode(&mut buf, &mut out, &mut sink).expect_err("must fail");
        let invalid = err.downcast::<InvalidCommand>().expect("typed error");
        assert_eq!(invalid.command, 0x02);
    }
}
