//! DNS wire format codec restricted to what the gateway speaks: single
//! question messages and address type answer records.

use core::net::{Ipv4Addr, Ipv6Addr};

use std::net::IpAddr;

use crate::error::Error;

/// Inbound query datagrams are read from a buffer of this size.
pub const MAX_QUERY_LEN: usize = 512;

/// Outbound answers must fit this buffer or the reply is dropped.
pub const MAX_RESPONSE_LEN: usize = 1500;

/// RFC 1035 limit on a full domain name.
pub const MAX_NAME_LEN: usize = 253;

/// Applied when the upstream payload carries no ttl of its own.
pub const DEFAULT_TTL: u32 = 120;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_AAAA: u16 = 28;
pub const CLASS_IN: u16 = 1;

const MAX_COMPRESSION_JUMPS: usize = 5;

/// Bounded cursor over a caller supplied slice. Every read and write is
/// checked against the slice length so a hostile datagram can not run the
/// cursor out of bounds.
pub struct Buf<'a> {
    buf: &'a mut [u8],
    pub pos: usize,
}

impl<'a> Buf<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Buf { buf, pos: 0 }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    fn step(&mut self, steps: usize) -> Result<(), Error> {
        if self.pos + steps > self.buf.len() {
            return Err(Error::Malformed("rdata runs past end of message"));
        }
        self.pos += steps;
        Ok(())
    }

    fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    fn read(&mut self) -> Result<u8, Error> {
        if self.pos >= self.buf.len() {
            return Err(Error::Malformed("truncated message"));
        }

        let res = self.buf[self.pos];
        self.pos += 1;

        Ok(res)
    }

    fn get(&self, pos: usize) -> Result<u8, Error> {
        if pos >= self.buf.len() {
            return Err(Error::Malformed("truncated message"));
        }
        Ok(self.buf[pos])
    }

    fn get_range(&self, start: usize, len: usize) -> Result<&[u8], Error> {
        if start + len > self.buf.len() {
            return Err(Error::Malformed("truncated message"));
        }
        Ok(&self.buf[start..start + len])
    }

    fn read_u16(&mut self) -> Result<u16, Error> {
        Ok(((self.read()? as u16) << 8) | (self.read()? as u16))
    }

    fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(((self.read()? as u32) << 24)
            | ((self.read()? as u32) << 16)
            | ((self.read()? as u32) << 8)
            | self.read()? as u32)
    }

    fn read_qname(&mut self, outstr: &mut String) -> Result<(), Error> {
        let mut pos = self.pos;
        let mut jumped = false;
        let mut jumps = 0;

        let mut delim = "";
        loop {
            let len = self.get(pos)?;

            // A two byte sequence with the two highest bits of the first
            // byte set is a pointer relative to the start of the message.
            // Only the shared cursor position before the first jump is kept.
            if (len & 0xC0) == 0xC0 {
                if jumps >= MAX_COMPRESSION_JUMPS {
                    return Err(Error::Malformed("compression pointer loop"));
                }

                if !jumped {
                    self.seek(pos + 2);
                }

                let b2 = self.get(pos + 1)? as u16;
                let offset = (((len as u16) ^ 0xC0) << 8) | b2;
                pos = offset as usize;
                jumped = true;
                jumps += 1;
                continue;
            }

            pos += 1;

            // Names are terminated by an empty label of length 0.
            if len == 0 {
                break;
            }

            outstr.push_str(delim);

            let str_buffer = self.get_range(pos, len as usize)?;
            outstr.push_str(&String::from_utf8_lossy(str_buffer).to_lowercase());

            if outstr.len() > MAX_NAME_LEN {
                return Err(Error::Malformed("name exceeds 253 bytes"));
            }

            delim = ".";

            pos += len as usize;
        }

        if !jumped {
            self.seek(pos);
        }

        Ok(())
    }

    fn write(&mut self, val: u8) -> Result<(), Error> {
        if self.pos >= self.buf.len() {
            return Err(Error::BufOverflow);
        }
        self.buf[self.pos] = val;
        self.pos += 1;
        Ok(())
    }

    fn write_u8(&mut self, val: u8) -> Result<(), Error> {
        self.write(val)
    }

    fn write_u16(&mut self, val: u16) -> Result<(), Error> {
        self.write((val >> 8) as u8)?;
        self.write((val & 0xFF) as u8)
    }

    fn write_u32(&mut self, val: u32) -> Result<(), Error> {
        self.write(((val >> 24) & 0xFF) as u8)?;
        self.write(((val >> 16) & 0xFF) as u8)?;
        self.write(((val >> 8) & 0xFF) as u8)?;
        self.write((val & 0xFF) as u8)
    }

    fn write_qname(&mut self, qname: &str) -> Result<(), Error> {
        for label in qname.split('.') {
            let len = label.len();

            label_len_check(len)?;

            self.write_u8(len as u8)?;
            for b in label.as_bytes() {
                self.write_u8(*b)?;
            }
        }

        self.write_u8(0)
    }
}

#[cold]
#[inline(never)]
fn label_len_check(len: usize) -> Result<(), Error> {
    if len > 63 {
        return Err(Error::Malformed(
            "single label exceeds 63 characters of length",
        ));
    }

    Ok(())
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub id: u16,                    // 16 bits
    pub recursion_desired: bool,    // 1 bit
    pub truncated_message: bool,    // 1 bit
    pub authoritative_answer: bool, // 1 bit
    pub opcode: u8,                 // 4 bits
    pub response: bool,             // 1 bit
    pub rescode: u8,                // 4 bits
    pub checking_disabled: bool,    // 1 bit
    pub authed_data: bool,          // 1 bit
    pub z: bool,                    // 1 bit
    pub recursion_available: bool,  // 1 bit
    pub questions: u16,             // 16 bits
    pub answers: u16,               // 16 bits
    pub authoritative_entries: u16, // 16 bits
    pub resource_entries: u16,      // 16 bits
}

impl Header {
    pub const fn new() -> Header {
        Header {
            id: 0,
            recursion_desired: false,
            truncated_message: false,
            authoritative_answer: false,
            opcode: 0,
            response: false,
            rescode: 0,
            checking_disabled: false,
            authed_data: false,
            z: false,
            recursion_available: false,
            questions: 0,
            answers: 0,
            authoritative_entries: 0,
            resource_entries: 0,
        }
    }

    fn read(&mut self, buf: &mut Buf<'_>) -> Result<(), Error> {
        self.id = buf.read_u16()?;

        let flags = buf.read_u16()?;
        let a = (flags >> 8) as u8;
        let b = (flags & 0xFF) as u8;
        self.recursion_desired = (a & (1 << 0)) > 0;
        self.truncated_message = (a & (1 << 1)) > 0;
        self.authoritative_answer = (a & (1 << 2)) > 0;
        self.opcode = (a >> 3) & 0x0F;
        self.response = (a & (1 << 7)) > 0;

        self.rescode = b & 0x0F;
        self.checking_disabled = (b & (1 << 4)) > 0;
        self.authed_data = (b & (1 << 5)) > 0;
        self.z = (b & (1 << 6)) > 0;
        self.recursion_available = (b & (1 << 7)) > 0;

        self.questions = buf.read_u16()?;
        self.answers = buf.read_u16()?;
        self.authoritative_entries = buf.read_u16()?;
        self.resource_entries = buf.read_u16()?;

        Ok(())
    }

    fn write(&self, buf: &mut Buf<'_>) -> Result<(), Error> {
        buf.write_u16(self.id)?;

        buf.write_u8(
            (self.recursion_desired as u8)
                | ((self.truncated_message as u8) << 1)
                | ((self.authoritative_answer as u8) << 2)
                | (self.opcode << 3)
                | ((self.response as u8) << 7),
        )?;

        buf.write_u8(
            self.rescode
                | ((self.checking_disabled as u8) << 4)
                | ((self.authed_data as u8) << 5)
                | ((self.z as u8) << 6)
                | ((self.recursion_available as u8) << 7),
        )?;

        buf.write_u16(self.questions)?;
        buf.write_u16(self.answers)?;
        buf.write_u16(self.authoritative_entries)?;
        buf.write_u16(self.resource_entries)
    }
}

/// The fields of an inbound query the gateway acts on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    pub id: u16,
    pub checking_disabled: bool,
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// One address answer value. The owner name is always the queried name and
/// is supplied separately at encode time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub addr: IpAddr,
    pub ttl: u32,
}

/// Parses an inbound datagram into a [Query].
///
/// Messages that are truncated, do not carry exactly one question or carry
/// a name longer than 253 bytes are rejected. The caller drops rejected
/// datagrams silently, standard dns semantics for garbage input.
pub fn decode_query(datagram: &mut [u8]) -> Result<Query, Error> {
    let mut buf = Buf::new(datagram);

    let mut header = Header::new();
    header.read(&mut buf)?;

    if header.response {
        return Err(Error::Malformed("response bit set on query"));
    }

    if header.questions != 1 {
        return Err(Error::Malformed("message must carry exactly one question"));
    }

    let mut name = String::new();
    buf.read_qname(&mut name)?;
    let qtype = buf.read_u16()?;
    let qclass = buf.read_u16()?;

    Ok(Query {
        id: header.id,
        checking_disabled: header.checking_disabled,
        name,
        qtype,
        qclass,
    })
}

/// Serializes an answer packet: echoed question plus one address record per
/// entry in `records`, transaction id copied from the originating query.
///
/// Fails with [Error::BufOverflow] when the packet does not fit
/// [MAX_RESPONSE_LEN] bytes. The caller then drops the reply rather than
/// sending a truncated packet.
pub fn encode_answer(id: u16, name: &str, records: &[Record]) -> Result<Vec<u8>, Error> {
    let mut out = [0; MAX_RESPONSE_LEN];
    let mut buf = Buf::new(&mut out);

    let mut header = Header::new();
    header.id = id;
    header.response = true;
    header.authoritative_answer = true;
    header.recursion_desired = true;
    header.recursion_available = true;
    header.questions = 1;
    header.answers = records.len() as u16;
    header.write(&mut buf)?;

    buf.write_qname(name)?;
    buf.write_u16(QTYPE_A)?;
    buf.write_u16(CLASS_IN)?;

    for record in records {
        buf.write_qname(name)?;
        match record.addr {
            IpAddr::V4(addr) => {
                buf.write_u16(QTYPE_A)?;
                buf.write_u16(CLASS_IN)?;
                buf.write_u32(record.ttl)?;
                buf.write_u16(4)?;
                for octet in addr.octets() {
                    buf.write_u8(octet)?;
                }
            }
            IpAddr::V6(addr) => {
                buf.write_u16(QTYPE_AAAA)?;
                buf.write_u16(CLASS_IN)?;
                buf.write_u32(record.ttl)?;
                buf.write_u16(16)?;
                for segment in addr.segments() {
                    buf.write_u16(segment)?;
                }
            }
        }
    }

    Ok(buf.as_slice().to_vec())
}

/// Serializes an A lookup for `hostname`, used by the bootstrap poller to
/// query bootstrap dns servers directly over udp.
pub fn encode_lookup(id: u16, hostname: &str) -> Result<Vec<u8>, Error> {
    let mut out = [0; MAX_QUERY_LEN];
    let mut buf = Buf::new(&mut out);

    let mut header = Header::new();
    header.id = id;
    header.recursion_desired = true;
    header.questions = 1;
    header.write(&mut buf)?;

    buf.write_qname(hostname)?;
    buf.write_u16(QTYPE_A)?;
    buf.write_u16(CLASS_IN)?;

    Ok(buf.as_slice().to_vec())
}

/// Parses a lookup response, collecting the address records of the answer
/// section and skipping everything else by its rdata length.
pub fn decode_lookup_answer(datagram: &mut [u8], expect_id: u16) -> Result<Vec<Record>, Error> {
    let mut buf = Buf::new(datagram);

    let mut header = Header::new();
    header.read(&mut buf)?;

    if header.id != expect_id {
        return Err(Error::Malformed("unexpected transaction id"));
    }

    if !header.response {
        return Err(Error::Malformed("response bit not set"));
    }

    let mut scratch = String::new();
    for _ in 0..header.questions {
        scratch.clear();
        buf.read_qname(&mut scratch)?;
        let _ = buf.read_u16()?; // qtype
        let _ = buf.read_u16()?; // qclass
    }

    let mut records = Vec::new();

    for _ in 0..header.answers {
        scratch.clear();
        buf.read_qname(&mut scratch)?;

        let qtype = buf.read_u16()?;
        let _ = buf.read_u16()?; // class
        let ttl = buf.read_u32()?;
        let data_len = buf.read_u16()?;

        match (qtype, data_len) {
            (QTYPE_A, 4) => {
                let raw = buf.read_u32()?;
                let addr = Ipv4Addr::from(raw);
                records.push(Record {
                    addr: addr.into(),
                    ttl,
                });
            }
            (QTYPE_AAAA, 16) => {
                let mut segments = [0u16; 8];
                for segment in segments.iter_mut() {
                    *segment = buf.read_u16()?;
                }
                let addr = Ipv6Addr::from(segments);
                records.push(Record {
                    addr: addr.into(),
                    ttl,
                });
            }
            // Cname glue and anything else the server saw fit to include.
            _ => buf.step(data_len as usize)?,
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_round_trip() {
        let mut datagram = encode_lookup(0x1234, "example.com").unwrap();

        let query = decode_query(&mut datagram).unwrap();
        assert_eq!(query.id, 0x1234);
        assert_eq!(query.name, "example.com");
        assert_eq!(query.qtype, QTYPE_A);
        assert_eq!(query.qclass, CLASS_IN);
        assert!(!query.checking_disabled);
    }

    #[test]
    fn answer_echoes_transaction_id() {
        let records = [
            Record {
                addr: "93.184.216.34".parse().unwrap(),
                ttl: 60,
            },
            Record {
                addr: "2606:2800:220:1:248:1893:25c8:1946".parse().unwrap(),
                ttl: 60,
            },
        ];

        let mut packet = encode_answer(0xBEEF, "example.com", &records).unwrap();

        let parsed = decode_lookup_answer(&mut packet, 0xBEEF).unwrap();
        assert_eq!(parsed, records);

        // Wrong id must not pass the correlation check.
        let err = decode_lookup_answer(&mut packet, 0xDEAD).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn truncated_datagram_rejected() {
        let datagram = encode_lookup(1, "example.com").unwrap();

        for len in 0..datagram.len() {
            let mut short = datagram[..len].to_vec();
            assert!(decode_query(&mut short).is_err(), "len {len} accepted");
        }
    }

    #[test]
    fn multi_question_rejected() {
        let mut datagram = encode_lookup(7, "example.com").unwrap();
        // Bump the question count without supplying a second question.
        datagram[5] = 2;
        assert!(matches!(
            decode_query(&mut datagram),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn oversized_name_rejected() {
        // Four 63 byte labels: 255 bytes of name, over the 253 limit.
        let label = "a".repeat(63);
        let name = [
            label.as_str(),
            label.as_str(),
            label.as_str(),
            label.as_str(),
        ]
        .join(".");

        let mut datagram = encode_lookup(7, &name).unwrap();
        assert!(matches!(
            decode_query(&mut datagram),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn oversized_label_rejected() {
        let name = "a".repeat(64);
        assert!(matches!(
            encode_lookup(7, &name),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn compression_pointer_loop_rejected() {
        #[rustfmt::skip]
        let mut datagram = vec![
            0x00, 0x01, // id
            0x00, 0x00, // flags
            0x00, 0x01, // one question
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0xC0, 0x0C, // pointer to itself
            0x00, 0x01, 0x00, 0x01,
        ];
        assert!(matches!(
            decode_query(&mut datagram),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn answer_overflow_detected() {
        // Enough records to blow through the 1500 byte output buffer.
        let record = Record {
            addr: "10.0.0.1".parse().unwrap(),
            ttl: 1,
        };
        let records = vec![record; 60];

        assert!(matches!(
            encode_answer(1, "a-rather-long-name.example.com", &records),
            Err(Error::BufOverflow)
        ));
    }
}
