use crate::error::GatewayError;
use anyhow::{anyhow, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FCGI_VERSION_1: u8 = 1;
pub const FCGI_HEADER_LEN: usize = 8;
/// Largest content a single record can carry.
pub const FCGI_MAX_CONTENT_LEN: usize = 65535;
/// Request id reserved for management records.
pub const FCGI_NULL_REQUEST_ID: u16 = 0;

pub const FCGI_RESPONDER: u16 = 1;

pub const FCGI_REQUEST_COMPLETE: u8 = 0;

pub const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";
pub const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl TryFrom<u8> for RecordType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        Ok(match value {
            1 => Self::BeginRequest,
            2 => Self::AbortRequest,
            3 => Self::EndRequest,
            4 => Self::Params,
            5 => Self::Stdin,
            6 => Self::Stdout,
            7 => Self::Stderr,
            8 => Self::Data,
            9 => Self::GetValues,
            10 => Self::GetValuesResult,
            11 => Self::UnknownType,
            other => return Err(other),
        })
    }
}

/// Fixed 8-byte record header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    pub fn new(record_type: RecordType, request_id: u16, content_length: usize) -> Self {
        let padding = (8 - (content_length % 8)) % 8;
        Self {
            version: FCGI_VERSION_1,
            record_type: record_type as u8,
            request_id,
            content_length: content_length as u16,
            padding_length: padding as u8,
        }
    }

    pub fn encode(&self) -> [u8; FCGI_HEADER_LEN] {
        let id = self.request_id.to_be_bytes();
        let len = self.content_length.to_be_bytes();
        [
            self.version,
            self.record_type,
            id[0],
            id[1],
            len[0],
            len[1],
            self.padding_length,
            0,
        ]
    }

    pub fn decode(buf: &[u8; FCGI_HEADER_LEN]) -> Self {
        Self {
            version: buf[0],
            record_type: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        }
    }
}

/// A record with its padding stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub record_type: RecordType,
    pub request_id: u16,
    pub content: Bytes,
}

/// Body of an `FCGI_END_REQUEST` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequestBody {
    pub app_status: u32,
    pub protocol_status: u8,
}

impl EndRequestBody {
    pub fn decode(content: &[u8]) -> Result<Self> {
        if content.len() < 5 {
            return Err(GatewayError::ProtocolCorruption(format!(
                "END_REQUEST body too short: {} bytes",
                content.len()
            ))
            .into());
        }
        Ok(Self {
            app_status: u32::from_be_bytes([content[0], content[1], content[2], content[3]]),
            protocol_status: content[4],
        })
    }
}

pub fn begin_request_body(role: u16, flags: u8) -> [u8; 8] {
    let role = role.to_be_bytes();
    [role[0], role[1], flags, 0, 0, 0, 0, 0]
}

fn put_nv_len(buf: &mut BytesMut, len: usize) {
    if len < 128 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u32((len as u32) | 0x8000_0000);
    }
}

/// Encode name-value pairs for PARAMS and GET_VALUES records.
pub fn encode_params<'a, I>(pairs: I) -> BytesMut
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut buf = BytesMut::new();
    for (name, value) in pairs {
        put_nv_len(&mut buf, name.len());
        put_nv_len(&mut buf, value.len());
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(value.as_bytes());
    }
    buf
}

pub fn decode_params(mut data: &[u8]) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    while !data.is_empty() {
        let name_len = read_nv_len(&mut data)?;
        let value_len = read_nv_len(&mut data)?;
        if data.len() < name_len + value_len {
            return Err(anyhow!("truncated name-value pair"));
        }
        let name = String::from_utf8_lossy(&data[..name_len]).into_owned();
        let value = String::from_utf8_lossy(&data[name_len..name_len + value_len]).into_owned();
        data = &data[name_len + value_len..];
        map.insert(name, value);
    }
    Ok(map)
}

fn read_nv_len(data: &mut &[u8]) -> Result<usize> {
    let Some(&first) = data.first() else {
        return Err(anyhow!("unexpected end of name-value data"));
    };
    if first < 128 {
        *data = &data[1..];
        return Ok(first as usize);
    }
    if data.len() < 4 {
        return Err(anyhow!("truncated 4-byte name-value length"));
    }
    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x7fff_ffff;
    *data = &data[4..];
    Ok(len as usize)
}

/// Read one record. Returns `None` on a clean end of stream before a header.
///
/// A header with the wrong version is reported as
/// [`GatewayError::ProtocolCorruption`] and its content is left unread. A
/// record of an unknown type is consumed in full before it is reported, so
/// the next call starts on a record boundary.
pub async fn read_record<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Record>> {
    let mut hdr_buf = [0u8; FCGI_HEADER_LEN];
    let mut filled = 0;
    while filled < FCGI_HEADER_LEN {
        let n = reader.read(&mut hdr_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(GatewayError::ProtocolCorruption(format!(
                "stream ended inside a record header ({filled} of {FCGI_HEADER_LEN} bytes)"
            ))
            .into());
        }
        filled += n;
    }
    let header = RecordHeader::decode(&hdr_buf);

    if header.version != FCGI_VERSION_1 {
        return Err(GatewayError::ProtocolCorruption(format!(
            "unsupported FastCGI version: {} (expected {})",
            header.version, FCGI_VERSION_1
        ))
        .into());
    }

    let content_len = header.content_length as usize;
    let total = content_len + header.padding_length as usize;
    let mut buf = BytesMut::zeroed(total);
    if total > 0 {
        reader.read_exact(&mut buf).await?;
    }
    buf.truncate(content_len);

    let record_type = RecordType::try_from(header.record_type).map_err(|t| {
        GatewayError::ProtocolCorruption(format!(
            "unknown record type {t} ({content_len} bytes skipped)"
        ))
    })?;

    Ok(Some(Record {
        record_type,
        request_id: header.request_id,
        content: buf.freeze(),
    }))
}

/// Write one record, padded to a multiple of 8 bytes.
pub async fn write_record<W: AsyncWrite + Unpin>(
    writer: &mut W,
    record_type: RecordType,
    request_id: u16,
    content: &[u8],
) -> Result<()> {
    if content.len() > FCGI_MAX_CONTENT_LEN {
        return Err(anyhow!("FastCGI record too large: {}", content.len()));
    }
    let header = RecordHeader::new(record_type, request_id, content.len());
    writer.write_all(&header.encode()).await?;
    if !content.is_empty() {
        writer.write_all(content).await?;
    }
    if header.padding_length > 0 {
        const PAD: [u8; 8] = [0u8; 8];
        writer
            .write_all(&PAD[..header.padding_length as usize])
            .await?;
    }
    Ok(())
}

/// Write `data` as records of at most 65535 bytes. Does not terminate the
/// stream.
pub async fn write_chunks<W: AsyncWrite + Unpin>(
    writer: &mut W,
    record_type: RecordType,
    request_id: u16,
    data: &[u8],
) -> Result<()> {
    for chunk in data.chunks(FCGI_MAX_CONTENT_LEN) {
        write_record(writer, record_type, request_id, chunk).await?;
    }
    Ok(())
}

/// Write `data` as a complete stream: chunked records, then an empty record.
pub async fn write_stream<W: AsyncWrite + Unpin>(
    writer: &mut W,
    record_type: RecordType,
    request_id: u16,
    data: &[u8],
) -> Result<()> {
    write_chunks(writer, record_type, request_id, data).await?;
    write_record(writer, record_type, request_id, &[]).await
}
