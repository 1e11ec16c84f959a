//! Support for encoding PDUs into a byte stream.
use std::io::Write;

use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{Backtrace, ResultExt, Snafu};

use crate::pdu::*;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not write PDU field `{}`", field))]
    WriteField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not write {} reserved bytes", bytes))]
    WriteReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not encode text field `{}`", field))]
    EncodeField {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::EncodeTextError,
    },

    #[snafu(display("could not write chunk `{}`", name))]
    WriteChunk {
        name: &'static str,
        #[snafu(source(from(WriteChunkError, Box::new)))]
        source: Box<WriteChunkError>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum WriteChunkError {
    #[snafu(display("failed to build chunk"))]
    BuildChunk {
        #[snafu(source(from(Error, Box::new)))]
        #[snafu(backtrace)]
        source: Box<Error>,
    },
    #[snafu(display("failed to write chunk length"))]
    WriteLength {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("failed to write chunk data"))]
    WriteData {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

/// Run `build` against a scratch buffer,
/// then emit the accumulated bytes
/// prefixed with their length as a big-endian u32.
fn write_chunk_u32<F>(writer: &mut dyn Write, build: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = Vec::new();
    build(&mut data).context(BuildChunkSnafu)?;

    writer
        .write_u32::<BigEndian>(data.len() as u32)
        .context(WriteLengthSnafu)?;
    writer.write_all(&data).context(WriteDataSnafu)?;
    Ok(())
}

/// Same as [`write_chunk_u32`], with a u16 length prefix.
fn write_chunk_u16<F>(writer: &mut dyn Write, build: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = Vec::new();
    build(&mut data).context(BuildChunkSnafu)?;

    writer
        .write_u16::<BigEndian>(data.len() as u16)
        .context(WriteLengthSnafu)?;
    writer.write_all(&data).context(WriteDataSnafu)?;
    Ok(())
}

/// Write one PDU to the given stream.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    let codec = DefaultCharacterSetCodec;
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            write_pdu_header(writer, 0x01)?;
            write_chunk_u32(writer, |writer| {
                write_association_header(
                    writer,
                    *protocol_version,
                    called_ae_title,
                    calling_ae_title,
                    &codec,
                )?;
                write_application_context(writer, application_context_name, &codec)?;
                for presentation_context in presentation_contexts {
                    write_presentation_context_proposed(writer, presentation_context, &codec)?;
                }
                write_user_information(writer, user_variables, &codec)
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RQ",
            })
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            write_pdu_header(writer, 0x02)?;
            write_chunk_u32(writer, |writer| {
                write_association_header(
                    writer,
                    *protocol_version,
                    called_ae_title,
                    calling_ae_title,
                    &codec,
                )?;
                write_application_context(writer, application_context_name, &codec)?;
                for presentation_context in presentation_contexts {
                    write_presentation_context_result(writer, presentation_context, &codec)?;
                }
                write_user_information(writer, user_variables, &codec)
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-AC",
            })
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            write_pdu_header(writer, 0x03)?;
            write_chunk_u32(writer, |writer| {
                writer.push(0x00);
                writer.push(result.code());
                let (source, reason) = source.codes();
                writer.push(source);
                writer.push(reason);
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RJ",
            })
        }
        Pdu::PData { data } => {
            write_pdu_header(writer, 0x04)?;
            write_chunk_u32(writer, |writer| {
                for pdv in data {
                    write_chunk_u32(writer, |writer| {
                        writer.push(pdv.presentation_context_id);

                        // message control header:
                        // bit 0 set for command stream,
                        // bit 1 set on the last fragment of a stream
                        let mut header = 0x00;
                        if pdv.value_type == PDataValueType::Command {
                            header |= 0x01;
                        }
                        if pdv.is_last {
                            header |= 0x02;
                        }
                        writer.push(header);
                        writer.extend_from_slice(&pdv.data);
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Presentation-data-value item",
                    })?;
                }
                Ok(())
            })
            .context(WriteChunkSnafu { name: "P-DATA-TF" })
        }
        Pdu::ReleaseRQ => {
            write_pdu_header(writer, 0x05)?;
            write_chunk_u32(writer, |writer| {
                writer.extend_from_slice(&[0u8; 4]);
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-RELEASE-RQ",
            })
        }
        Pdu::ReleaseRP => {
            write_pdu_header(writer, 0x06)?;
            write_chunk_u32(writer, |writer| {
                writer.extend_from_slice(&[0u8; 4]);
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-RELEASE-RP",
            })
        }
        Pdu::AbortRQ { source } => {
            write_pdu_header(writer, 0x07)?;
            write_chunk_u32(writer, |writer| {
                writer.extend_from_slice(&[0u8; 2]);
                let (source, reason) = source.codes();
                writer.push(source);
                writer.push(reason);
                Ok(())
            })
            .context(WriteChunkSnafu { name: "A-ABORT" })
        }
        Pdu::Unknown { pdu_type, data } => {
            write_pdu_header(writer, *pdu_type)?;
            write_chunk_u32(writer, |writer| {
                writer.extend_from_slice(data);
                Ok(())
            })
            .context(WriteChunkSnafu { name: "unknown" })
        }
    }
}

/// PDU type byte plus the reserved byte.
fn write_pdu_header<W>(writer: &mut W, pdu_type: u8) -> Result<()>
where
    W: Write,
{
    writer
        .write_u8(pdu_type)
        .context(WriteFieldSnafu { field: "PDU-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;
    Ok(())
}

/// The fixed leading block shared by A-ASSOCIATE-RQ and -AC:
/// protocol version, 2 reserved bytes,
/// both AE titles space-padded to 16 bytes,
/// and 32 reserved bytes.
fn write_association_header(
    writer: &mut Vec<u8>,
    protocol_version: u16,
    called_ae_title: &str,
    calling_ae_title: &str,
    codec: &dyn TextCodec,
) -> Result<()> {
    writer
        .write_u16::<BigEndian>(protocol_version)
        .context(WriteFieldSnafu {
            field: "Protocol-version",
        })?;
    writer.extend_from_slice(&[0u8; 2]);

    write_ae_title(writer, called_ae_title, codec, "Called-AE-title")?;
    write_ae_title(writer, calling_ae_title, codec, "Calling-AE-title")?;

    writer.extend_from_slice(&[0u8; 32]);
    Ok(())
}

/// AE titles occupy exactly 16 bytes on the wire,
/// right-padded with spaces (and truncated if over-long).
fn write_ae_title(
    writer: &mut Vec<u8>,
    ae_title: &str,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<()> {
    let mut bytes = codec.encode(ae_title).context(EncodeFieldSnafu { field })?;
    bytes.resize(16, b' ');
    writer.extend_from_slice(&bytes);
    Ok(())
}

fn write_application_context(
    writer: &mut dyn Write,
    application_context_name: &str,
    codec: &dyn TextCodec,
) -> Result<()> {
    write_item_header(writer, ITEM_APPLICATION_CONTEXT)?;
    write_chunk_u16(writer, |writer| {
        write_text(writer, application_context_name, codec, "Application-context-name")
    })
    .context(WriteChunkSnafu {
        name: "Application Context Item",
    })
}

fn write_presentation_context_proposed(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextProposed,
    codec: &dyn TextCodec,
) -> Result<()> {
    write_item_header(writer, ITEM_PRESENTATION_CONTEXT_RQ)?;
    write_chunk_u16(writer, |writer| {
        writer.push(presentation_context.id);
        writer.extend_from_slice(&[0u8; 3]);

        // one abstract syntax sub-item,
        // then one sub-item per proposed transfer syntax
        write_item_header(writer, ITEM_ABSTRACT_SYNTAX)?;
        write_chunk_u16(writer, |writer| {
            write_text(
                writer,
                &presentation_context.abstract_syntax,
                codec,
                "Abstract-syntax-name",
            )
        })
        .context(WriteChunkSnafu {
            name: "Abstract Syntax sub-item",
        })?;

        for transfer_syntax in &presentation_context.transfer_syntaxes {
            write_item_header(writer, ITEM_TRANSFER_SYNTAX)?;
            write_chunk_u16(writer, |writer| {
                write_text(writer, transfer_syntax, codec, "Transfer-syntax-name")
            })
            .context(WriteChunkSnafu {
                name: "Transfer Syntax sub-item",
            })?;
        }
        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item (proposed)",
    })
}

fn write_presentation_context_result(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextResult,
    codec: &dyn TextCodec,
) -> Result<()> {
    write_item_header(writer, ITEM_PRESENTATION_CONTEXT_AC)?;
    write_chunk_u16(writer, |writer| {
        writer.push(presentation_context.id);
        writer.push(0x00);
        writer.push(presentation_context.reason as u8);
        writer.push(0x00);

        // the transfer syntax sub-item is always present;
        // on rejection the UID is empty and not significant
        write_item_header(writer, ITEM_TRANSFER_SYNTAX)?;
        write_chunk_u16(writer, |writer| {
            write_text(
                writer,
                &presentation_context.transfer_syntax,
                codec,
                "Transfer-syntax-name",
            )
        })
        .context(WriteChunkSnafu {
            name: "Transfer Syntax sub-item",
        })?;
        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item (result)",
    })
}

fn write_user_information(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
    codec: &dyn TextCodec,
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    write_item_header(writer, ITEM_USER_INFORMATION)?;
    write_chunk_u16(writer, |writer| {
        for user_variable in user_variables {
            match user_variable {
                UserVariableItem::MaxLength(max_length) => {
                    write_item_header(writer, ITEM_MAXIMUM_LENGTH)?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u32::<BigEndian>(*max_length)
                            .context(WriteFieldSnafu {
                                field: "Maximum-length-received",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Maximum Length sub-item",
                    })?;
                }
                UserVariableItem::ImplementationClassUID(uid) => {
                    write_item_header(writer, ITEM_IMPLEMENTATION_CLASS_UID)?;
                    write_chunk_u16(writer, |writer| {
                        write_text(writer, uid, codec, "Implementation-class-uid")
                    })
                    .context(WriteChunkSnafu {
                        name: "Implementation Class UID sub-item",
                    })?;
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    write_item_header(writer, ITEM_IMPLEMENTATION_VERSION_NAME)?;
                    write_chunk_u16(writer, |writer| {
                        write_text(writer, name, codec, "Implementation-version-name")
                    })
                    .context(WriteChunkSnafu {
                        name: "Implementation Version Name sub-item",
                    })?;
                }
                UserVariableItem::AsyncOperationsWindow {
                    max_operations_invoked,
                    max_operations_performed,
                } => {
                    write_item_header(writer, ITEM_ASYNC_OPERATIONS_WINDOW)?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u16::<BigEndian>(*max_operations_invoked)
                            .context(WriteFieldSnafu {
                                field: "Maximum-number-operations-invoked",
                            })?;
                        writer
                            .write_u16::<BigEndian>(*max_operations_performed)
                            .context(WriteFieldSnafu {
                                field: "Maximum-number-operations-performed",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Asynchronous Operations Window sub-item",
                    })?;
                }
                UserVariableItem::RoleSelection {
                    sop_class_uid,
                    scu_role,
                    scp_role,
                } => {
                    write_item_header(writer, ITEM_ROLE_SELECTION)?;
                    write_chunk_u16(writer, |writer| {
                        write_chunk_u16(writer, |writer| {
                            write_text(writer, sop_class_uid, codec, "SOP-class-uid")
                        })
                        .context(WriteChunkSnafu {
                            name: "SOP-class-uid",
                        })?;
                        writer.push(u8::from(*scu_role));
                        writer.push(u8::from(*scp_role));
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Role Selection sub-item",
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    write_item_header(writer, *item_type)?;
                    write_chunk_u16(writer, |writer| {
                        writer.extend_from_slice(data);
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "unknown sub-item",
                    })?;
                }
            }
        }
        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "User Information Item",
    })
}

/// Item type byte plus the reserved byte.
fn write_item_header(writer: &mut dyn Write, item_type: u8) -> Result<()> {
    writer
        .write_u8(item_type)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;
    Ok(())
}

fn write_text(
    writer: &mut Vec<u8>,
    text: &str,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<()> {
    let bytes = codec.encode(text).context(EncodeFieldSnafu { field })?;
    writer.extend_from_slice(&bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_with_u32_length_prefix() {
        let mut bytes: Vec<u8> = Vec::new();
        write_chunk_u32(&mut bytes, |writer| {
            writer.push(0x02);
            write_chunk_u32(writer, |writer| {
                writer.push(0x03);
                Ok(())
            })
            .context(WriteChunkSnafu { name: "inner" })?;
            Ok(())
        })
        .unwrap();

        assert_eq!(bytes, &[0, 0, 0, 6, 2, 0, 0, 0, 1, 3]);
    }

    #[test]
    fn chunks_with_u16_length_prefix() {
        let mut bytes: Vec<u8> = Vec::new();
        write_chunk_u16(&mut bytes, |writer| {
            writer.push(0x02);
            write_chunk_u16(writer, |writer| {
                writer.push(0x03);
                Ok(())
            })
            .context(WriteChunkSnafu { name: "inner" })?;
            Ok(())
        })
        .unwrap();

        assert_eq!(bytes, &[0, 4, 2, 0, 1, 3]);
    }

    #[test]
    fn abort_layout() {
        let mut out = Vec::new();
        write_pdu(
            &mut out,
            &Pdu::AbortRQ {
                source: AbortRQSource::ServiceUser,
            },
        )
        .unwrap();
        assert_eq!(
            &out,
            &[
                // type + reserved
                0x07, 0x00, //
                // length: 4
                0x00, 0x00, 0x00, 0x04, //
                // 2 reserved + source (service user) + reason
                0x00, 0x00, 0x00, 0x00,
            ]
        );

        out.clear();
        write_pdu(
            &mut out,
            &Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::InvalidPduParameter,
                ),
            },
        )
        .unwrap();
        assert_eq!(
            &out,
            &[
                0x07, 0x00, //
                0x00, 0x00, 0x00, 0x04, //
                // 2 reserved + source (service provider) + reason (invalid parameter)
                0x00, 0x00, 0x02, 0x06,
            ]
        );
    }

    #[test]
    fn release_layout() {
        let mut out = Vec::new();
        write_pdu(&mut out, &Pdu::ReleaseRQ).unwrap();
        assert_eq!(&out, &[0x05, 0x00, 0x00, 0x00, 0x00, 0x04, 0, 0, 0, 0]);

        out.clear();
        write_pdu(&mut out, &Pdu::ReleaseRP).unwrap();
        assert_eq!(&out, &[0x06, 0x00, 0x00, 0x00, 0x00, 0x04, 0, 0, 0, 0]);
    }

    #[test]
    fn rejection_layout() {
        let mut out = Vec::new();
        write_pdu(
            &mut out,
            &Pdu::AssociationRJ(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized,
                ),
            }),
        )
        .unwrap();
        assert_eq!(
            &out,
            &[
                0x03, 0x00, //
                0x00, 0x00, 0x00, 0x04, //
                // reserved + result (permanent) + source (service user) + reason (7)
                0x00, 0x01, 0x01, 0x07,
            ]
        );
    }
}
