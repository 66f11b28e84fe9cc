use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use super::{HostSniffer, ParseError};

// TLS record content type (RFC 8446 Section 5.1)
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
// Handshake message type (RFC 8446 Section 4)
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
// server_name extension (RFC 6066 Section 3)
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

const HANDSHAKE_HEADER_LEN: usize = 4;
/// Protocol version (2) + random (32)
const VERSION_AND_RANDOM_LEN: usize = 34;

type Reader<'a> = Cursor<&'a [u8]>;

/// Extracts the host_name from the SNI extension of a TLS ClientHello.
///
/// `data` must start at the record header and hold the whole record. Every
/// length read from the wire is checked against what is left before it is
/// used, so arbitrary input yields an error and never a panic.
pub fn parse_sni(data: &[u8]) -> Result<String, ParseError> {
    let record = parse_record(data)?;
    let mut hello = parse_handshake(record)?;

    // session id
    take_u8_prefixed(&mut hello, "session id")?;
    // cipher suites
    take_u16_prefixed(&mut hello, "cipher suites")?;
    // compression methods
    take_u8_prefixed(&mut hello, "compression methods")?;

    let extensions = take_u16_prefixed(&mut hello, "extensions")?;
    find_server_name(extensions)
}

/// Strips the record header and returns the record body.
fn parse_record(data: &[u8]) -> Result<&[u8], ParseError> {
    let mut r = Cursor::new(data);

    let content_type = read_u8(&mut r, "record header")?;
    if content_type != CONTENT_TYPE_HANDSHAKE {
        return Err(ParseError::NotHandshake);
    }
    // legacy_record_version
    take(&mut r, 2, "record header")?;
    let len = read_u16(&mut r, "record header")? as usize;

    take(&mut r, len, "record").map_err(|_| ParseError::IncompleteRecord)
}

/// Checks the handshake header and positions a reader after version + random.
fn parse_handshake(record: &[u8]) -> Result<Reader<'_>, ParseError> {
    if record.len() < HANDSHAKE_HEADER_LEN {
        return Err(ParseError::Truncated("handshake header"));
    }

    let mut r = Cursor::new(record);
    if read_u8(&mut r, "handshake header")? != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(ParseError::NotClientHello);
    }
    // 24-bit handshake length
    take(&mut r, 3, "handshake header")?;
    take(&mut r, VERSION_AND_RANDOM_LEN, "random")?;

    Ok(r)
}

fn find_server_name(extensions: &[u8]) -> Result<String, ParseError> {
    let mut r = Cursor::new(extensions);

    while remaining(&r) >= 4 {
        let ext_type = read_u16(&mut r, "extension")?;
        let body = take_u16_prefixed(&mut r, "extension")?;

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(body);
        }
    }

    Err(ParseError::ServerNameNotFound)
}

fn parse_server_name(ext: &[u8]) -> Result<String, ParseError> {
    let mut r = Cursor::new(ext);
    let list = take_u16_prefixed(&mut r, "server name list")?;

    let mut r = Cursor::new(list);
    while remaining(&r) >= 3 {
        let name_type = read_u8(&mut r, "server name")?;
        let name = take_u16_prefixed(&mut r, "server name")?;

        if name_type == NAME_TYPE_HOST_NAME {
            return std::str::from_utf8(name)
                .map(|s| s.to_string())
                .map_err(|_| ParseError::InvalidHostName);
        }
    }

    Err(ParseError::NoHostName)
}

fn remaining(r: &Reader<'_>) -> usize {
    r.get_ref().len().saturating_sub(r.position() as usize)
}

fn read_u8(r: &mut Reader<'_>, field: &'static str) -> Result<u8, ParseError> {
    r.read_u8().map_err(|_| ParseError::Truncated(field))
}

fn read_u16(r: &mut Reader<'_>, field: &'static str) -> Result<u16, ParseError> {
    r.read_u16::<BigEndian>()
        .map_err(|_| ParseError::Truncated(field))
}

/// Borrows the next `len` bytes and moves the cursor past them.
fn take<'a>(r: &mut Reader<'a>, len: usize, field: &'static str) -> Result<&'a [u8], ParseError> {
    let data: &'a [u8] = *r.get_ref();
    let start = r.position() as usize;
    let end = start
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or(ParseError::Truncated(field))?;

    r.set_position(end as u64);
    Ok(&data[start..end])
}

fn take_u8_prefixed<'a>(r: &mut Reader<'a>, field: &'static str) -> Result<&'a [u8], ParseError> {
    let len = read_u8(r, field)? as usize;
    take(r, len, field)
}

fn take_u16_prefixed<'a>(r: &mut Reader<'a>, field: &'static str) -> Result<&'a [u8], ParseError> {
    let len = read_u16(r, field)? as usize;
    take(r, len, field)
}

/// ClientHello SNI strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsSniffer;

impl HostSniffer for TlsSniffer {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn attempt(&self, data: &[u8]) -> Result<String, ParseError> {
        parse_sni(data)
    }
}
