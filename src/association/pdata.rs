//! P-DATA-TF fragmentation and reassembly.
//!
//! [`PDataWriter`] splits an outgoing byte stream
//! into presentation data values that fit the negotiated maximum PDU length,
//! writing each one as its own P-DATA-TF PDU.
//! [`MessageAssembler`] is its pure counterpart on the receive side:
//! it is fed presentation data values in arrival order
//! and accumulates the command and data streams of one DIMSE message.

use std::io::Write;

use bytes::{Bytes, BytesMut};
use snafu::{ensure, Backtrace, Snafu};

use crate::pdu::{PDataValue, PDataValueType};

/// In-PDU overhead of one presentation data value:
/// item length (4), presentation context id (1)
/// and message control header (1).
pub(crate) const PDV_HEADER_SIZE: u32 = 6;

/// A writer of presentation data
/// over one stream (command or data) of one DIMSE message.
///
/// Bytes written to it are buffered
/// and dispatched as full-size P-DATA-TF PDUs;
/// [`finish`](PDataWriter::finish) (or dropping the writer)
/// flushes the remainder with the last-fragment bit set.
/// The last-fragment bit always rides on a data-carrying fragment,
/// except for the degenerate case of an empty stream.
#[must_use]
pub struct PDataWriter<W: Write> {
    buffer: Vec<u8>,
    stream: W,
    presentation_context_id: u8,
    value_type: PDataValueType,
    max_data_length: u32,
    sent_any: bool,
    finished: bool,
}

impl<W> PDataWriter<W>
where
    W: Write,
{
    /// Construct a new P-Data writer.
    ///
    /// `max_pdu_length` bounds the P-DATA-TF PDU body;
    /// each fragment payload is that minus the PDV header.
    pub(crate) fn new(
        stream: W,
        presentation_context_id: u8,
        value_type: PDataValueType,
        max_pdu_length: u32,
    ) -> Self {
        let max_data_length = max_pdu_length - PDV_HEADER_SIZE;
        PDataWriter {
            buffer: Vec::with_capacity(max_data_length as usize),
            stream,
            presentation_context_id,
            value_type,
            max_data_length,
            sent_any: false,
            finished: false,
        }
    }

    /// Flush everything still buffered,
    /// marking the final fragment as the last of its stream.
    pub fn finish(&mut self) -> std::io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.dispatch_full_fragments()?;
        // the remainder (possibly of full size) becomes the last fragment;
        // an empty stream still announces itself with one empty fragment
        if !self.buffer.is_empty() || !self.sent_any {
            self.send_fragment(self.buffer.len() as u32, true)?;
            let buffer = std::mem::take(&mut self.buffer);
            self.stream.write_all(&buffer)?;
        }
        self.finished = true;
        self.stream.flush()
    }

    /// Write the P-DATA-TF and PDV headers for a single fragment.
    fn send_fragment(&mut self, data_len: u32, is_last: bool) -> std::io::Result<()> {
        let mut message_header = 0x00;
        if self.value_type == PDataValueType::Command {
            message_header |= 0x01;
        }
        if is_last {
            message_header |= 0x02;
        }

        let pdu_len = (data_len + PDV_HEADER_SIZE).to_be_bytes();
        let pdv_len = (data_len + 2).to_be_bytes();
        let header = [
            // PDU type + reserved
            0x04,
            0x00,
            pdu_len[0],
            pdu_len[1],
            pdu_len[2],
            pdu_len[3],
            pdv_len[0],
            pdv_len[1],
            pdv_len[2],
            pdv_len[3],
            self.presentation_context_id,
            message_header,
        ];
        self.sent_any = true;
        self.stream.write_all(&header)
    }

    /// Send every full-size fragment currently buffered,
    /// without the last-fragment bit,
    /// keeping at least one byte (or the exact final chunk) behind
    /// so that the bit can ride on real data.
    fn dispatch_full_fragments(&mut self) -> std::io::Result<()> {
        let max = self.max_data_length as usize;
        while self.buffer.len() > max {
            self.send_fragment(max as u32, false)?;
            self.stream.write_all(&self.buffer[..max])?;
            self.buffer.copy_within(max.., 0);
            self.buffer.truncate(self.buffer.len() - max);
        }
        Ok(())
    }
}

impl<W> Write for PDataWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        self.dispatch_full_fragments()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // fragments are only cut on finish or overflow
        Ok(())
    }
}

impl<W> Drop for PDataWriter<W>
where
    W: Write,
{
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum AssemblyError {
    #[snafu(display(
        "presentation context mismatch within one message: expected {}, got {}",
        expected,
        got
    ))]
    MismatchedPresentationContext {
        expected: u8,
        got: u8,
        backtrace: Backtrace,
    },

    /// command fragment arrived after the start of the data stream
    CommandAfterData { backtrace: Backtrace },

    #[snafu(display("fragment arrived after the last fragment of the {:?} stream", kind))]
    FragmentAfterLast {
        kind: PDataValueType,
        backtrace: Backtrace,
    },
}

/// Reassembly state for one DIMSE message.
///
/// Fragments are pushed in arrival order;
/// the assembler enforces that all fragments travel
/// through the same presentation context
/// and that no command fragment follows data.
/// The caller decides when the message is complete,
/// since only the decoded command set says
/// whether a data set is expected at all.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    presentation_context_id: Option<u8>,
    command: BytesMut,
    data: BytesMut,
    command_complete: bool,
    data_complete: bool,
    data_started: bool,
}

impl MessageAssembler {
    /// Feed one presentation data value into the assembler.
    pub fn push(&mut self, pdv: &PDataValue) -> Result<(), AssemblyError> {
        match self.presentation_context_id {
            Some(expected) => {
                ensure!(
                    expected == pdv.presentation_context_id,
                    MismatchedPresentationContextSnafu {
                        expected,
                        got: pdv.presentation_context_id,
                    }
                );
            }
            None => self.presentation_context_id = Some(pdv.presentation_context_id),
        }

        match pdv.value_type {
            PDataValueType::Command => {
                ensure!(!self.data_started, CommandAfterDataSnafu);
                ensure!(
                    !self.command_complete,
                    FragmentAfterLastSnafu {
                        kind: PDataValueType::Command,
                    }
                );
                self.command.extend_from_slice(&pdv.data);
                if pdv.is_last {
                    self.command_complete = true;
                }
            }
            PDataValueType::Data => {
                ensure!(
                    !self.data_complete,
                    FragmentAfterLastSnafu {
                        kind: PDataValueType::Data,
                    }
                );
                self.data_started = true;
                self.data.extend_from_slice(&pdv.data);
                if pdv.is_last {
                    self.data_complete = true;
                }
            }
        }
        Ok(())
    }

    /// The presentation context through which this message travels,
    /// known after the first fragment.
    pub fn presentation_context_id(&self) -> Option<u8> {
        self.presentation_context_id
    }

    /// Whether the command stream has seen its last fragment.
    pub fn command_complete(&self) -> bool {
        self.command_complete
    }

    /// Whether the data stream has seen its last fragment.
    pub fn data_complete(&self) -> bool {
        self.data_complete
    }

    /// Take the reassembled command set bytes.
    pub fn take_command(&mut self) -> Bytes {
        self.command.split().freeze()
    }

    /// Take the reassembled data set bytes.
    pub fn take_data(&mut self) -> Bytes {
        self.data.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use crate::pdu::{read_pdu, Pdu, PDataValue, PDataValueType, MINIMUM_PDU_SIZE};

    use super::{MessageAssembler, PDataWriter};

    #[test]
    fn small_payload_is_one_last_fragment() {
        let presentation_context_id = 12;

        let mut out = Vec::new();
        {
            let mut writer = PDataWriter::new(
                &mut out,
                presentation_context_id,
                PDataValueType::Data,
                MINIMUM_PDU_SIZE,
            );
            writer.write_all(&(0..64).collect::<Vec<u8>>()).unwrap();
            writer.finish().unwrap();
        }

        let mut cursor = &out[..];
        let pdu = read_pdu(&mut cursor, MINIMUM_PDU_SIZE, true).unwrap().unwrap();
        match pdu {
            Pdu::PData { data } => {
                assert_eq!(data.len(), 1);
                assert_eq!(data[0].value_type, PDataValueType::Data);
                assert_eq!(data[0].presentation_context_id, presentation_context_id);
                assert!(data[0].is_last);
                assert_eq!(data[0].data, (0..64).collect::<Vec<u8>>());
            }
            pdu => panic!("expected P-DATA-TF, got {:?}", pdu),
        }
        assert_eq!(cursor.len(), 0);
    }

    #[test]
    fn large_payload_is_split_and_reassembles() {
        let presentation_context_id = 32;
        let payload: Vec<u8> = (0..6000).map(|x| x as u8).collect();

        let mut out = Vec::new();
        {
            let mut writer = PDataWriter::new(
                &mut out,
                presentation_context_id,
                PDataValueType::Command,
                MINIMUM_PDU_SIZE,
            );
            writer.write_all(&payload).unwrap();
            writer.finish().unwrap();
        }

        let mut cursor = &out[..];
        let mut assembler = MessageAssembler::default();
        let mut pdus = 0;
        while !assembler.command_complete() {
            let pdu = read_pdu(&mut cursor, MINIMUM_PDU_SIZE, true).unwrap().unwrap();
            pdus += 1;
            match pdu {
                Pdu::PData { data } => {
                    for pdv in &data {
                        assembler.push(pdv).unwrap();
                    }
                }
                pdu => panic!("expected P-DATA-TF, got {:?}", pdu),
            }
        }

        assert_eq!(pdus, 2);
        assert_eq!(cursor.len(), 0);
        assert_eq!(
            assembler.presentation_context_id(),
            Some(presentation_context_id)
        );
        assert_eq!(assembler.take_command().as_ref(), &payload[..]);
    }

    #[test]
    fn exact_multiple_has_no_empty_trailer() {
        let max_data = MINIMUM_PDU_SIZE - 6;
        let payload = vec![0xABu8; (max_data * 2) as usize];

        let mut out = Vec::new();
        {
            let mut writer =
                PDataWriter::new(&mut out, 1, PDataValueType::Data, MINIMUM_PDU_SIZE);
            writer.write_all(&payload).unwrap();
            writer.finish().unwrap();
        }

        let mut cursor = &out[..];
        let mut fragments = Vec::new();
        while !cursor.is_empty() {
            match read_pdu(&mut cursor, MINIMUM_PDU_SIZE, true).unwrap().unwrap() {
                Pdu::PData { mut data } => fragments.append(&mut data),
                pdu => panic!("expected P-DATA-TF, got {:?}", pdu),
            }
        }

        // two full-size fragments, the second carries the last-fragment bit
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].data.len(), max_data as usize);
        assert_eq!(fragments[1].data.len(), max_data as usize);
        assert!(!fragments[0].is_last);
        assert!(fragments[1].is_last);
    }

    #[test]
    fn assembler_keeps_streams_apart() {
        let mut assembler = MessageAssembler::default();
        assembler
            .push(&PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![1, 2, 3],
            })
            .unwrap();
        assembler
            .push(&PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![4, 5],
            })
            .unwrap();
        assembler
            .push(&PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Data,
                is_last: true,
                data: vec![6],
            })
            .unwrap();

        assert!(assembler.command_complete());
        assert!(assembler.data_complete());
        assert_eq!(assembler.take_command().as_ref(), &[1, 2, 3]);
        assert_eq!(assembler.take_data().as_ref(), &[4, 5, 6]);
    }

    #[test]
    fn assembler_rejects_command_after_data() {
        let mut assembler = MessageAssembler::default();
        assembler
            .push(&PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![0],
            })
            .unwrap();
        let err = assembler.push(&PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Command,
            is_last: true,
            data: vec![0],
        });
        assert!(err.is_err());
    }

    #[test]
    fn assembler_rejects_context_hopping() {
        let mut assembler = MessageAssembler::default();
        assembler
            .push(&PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: false,
                data: vec![0],
            })
            .unwrap();
        let err = assembler.push(&PDataValue {
            presentation_context_id: 3,
            value_type: PDataValueType::Command,
            is_last: true,
            data: vec![0],
        });
        assert!(err.is_err());
    }
}
