//! Upstream payload decoders.
//!
//! The wire shape of the DoH endpoint's body is a configuration level
//! choice made once at startup, never sniffed per response.

use std::{net::IpAddr, str::FromStr};

use serde::Deserialize;

use crate::{
    dns::{Record, DEFAULT_TTL, QTYPE_A, QTYPE_AAAA},
    error::Error,
};

/// Delimiter between the echoed name and the address list in text payloads.
const TEXT_DELIMITER: u8 = b':';

/// Marks end of relevant data inside a larger text buffer.
const TEXT_TERMINATOR: u8 = b';';

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Format {
    /// `name:addr1,addr2,...;`
    Text,
    /// Google style json resolver output.
    Json,
}

impl Format {
    /// Query parameter carrying the name in the upstream url.
    pub const fn name_param(self) -> &'static str {
        match self {
            Self::Text => "dn",
            Self::Json => "name",
        }
    }

    pub fn decode(self, payload: &[u8], queried_name: &str) -> Result<Vec<Record>, Error> {
        match self {
            Self::Text => decode_text(payload, queried_name),
            Self::Json => decode_json(payload),
        }
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown payload format: {other}")),
        }
    }
}

fn decode_text(payload: &[u8], queried_name: &str) -> Result<Vec<Record>, Error> {
    let end = payload
        .iter()
        .position(|&b| b == TEXT_TERMINATOR)
        .unwrap_or(payload.len());

    let relevant =
        core::str::from_utf8(&payload[..end]).map_err(|_| Error::Payload("not utf-8"))?;

    let (echoed_name, addrs) = relevant
        .split_once(TEXT_DELIMITER as char)
        .ok_or(Error::Payload("missing name delimiter"))?;

    if !echoed_name.eq_ignore_ascii_case(queried_name) {
        return Err(Error::Payload("echoed name does not match query"));
    }

    let mut records = Vec::new();

    for addr in addrs.split(',') {
        let addr = addr
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| Error::Payload("unparseable address"))?;
        records.push(Record {
            addr,
            ttl: DEFAULT_TTL,
        });
    }

    if records.is_empty() {
        return Err(Error::Payload("empty address list"));
    }

    Ok(records)
}

#[derive(Deserialize)]
struct JsonResponse {
    #[serde(rename = "Status")]
    status: i32,
    #[serde(rename = "Answer", default)]
    answer: Vec<JsonAnswer>,
}

// The answer owner name is deliberately not deserialized: after a cname
// chain the address records belong to the canonical name, not the queried
// one, so matching it against the query would reject valid answers.
#[derive(Deserialize)]
struct JsonAnswer {
    #[serde(rename = "type")]
    qtype: u16,
    #[serde(rename = "TTL", default)]
    ttl: Option<u32>,
    data: String,
}

fn decode_json(payload: &[u8]) -> Result<Vec<Record>, Error> {
    let res: JsonResponse =
        serde_json::from_slice(payload).map_err(|_| Error::Payload("invalid json"))?;

    if res.status != 0 {
        return Err(Error::Payload("upstream reported non-zero status"));
    }

    let mut records = Vec::new();

    for answer in res.answer {
        // Answer sections routinely interleave cname glue with the
        // addresses resolved for the queried name.
        if answer.qtype != QTYPE_A && answer.qtype != QTYPE_AAAA {
            continue;
        }

        let addr = answer
            .data
            .parse::<IpAddr>()
            .map_err(|_| Error::Payload("unparseable address"))?;

        records.push(Record {
            addr,
            ttl: answer.ttl.unwrap_or(DEFAULT_TTL),
        });
    }

    if records.is_empty() {
        return Err(Error::Payload("no address records for queried name"));
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_text(name: &str, addrs: &[&str]) -> Vec<u8> {
        format!("{name}:{};trailing-garbage", addrs.join(",")).into_bytes()
    }

    #[test]
    fn text_round_trip() {
        let payload = encode_text("example.com", &["93.184.216.34", "93.184.216.35"]);

        let records = Format::Text.decode(&payload, "example.com").unwrap();

        let addrs: Vec<IpAddr> = records.iter().map(|r| r.addr).collect();
        assert_eq!(
            addrs,
            vec![
                "93.184.216.34".parse::<IpAddr>().unwrap(),
                "93.184.216.35".parse::<IpAddr>().unwrap(),
            ]
        );
        assert!(records.iter().all(|r| r.ttl == DEFAULT_TTL));
    }

    #[test]
    fn text_decode_is_idempotent() {
        let payload = b"example.com:93.184.216.34,2606:2800:220:1:248:1893:25c8:1946;";

        let first = Format::Text.decode(payload, "example.com").unwrap();
        let second = Format::Text.decode(payload, "example.com").unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn text_without_terminator_reads_to_end() {
        let payload = b"example.com:10.0.0.1";
        let records = Format::Text.decode(payload, "example.com").unwrap();
        assert_eq!(records[0].addr, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn text_missing_delimiter_rejected() {
        assert!(matches!(
            Format::Text.decode(b"93.184.216.34;", "example.com"),
            Err(Error::Payload(_))
        ));
    }

    #[test]
    fn text_garbage_address_rejected() {
        assert!(matches!(
            Format::Text.decode(b"example.com:not-an-address;", "example.com"),
            Err(Error::Payload(_))
        ));
    }

    #[test]
    fn json_decode() {
        let payload = br#"{
            "Status": 0,
            "Answer": [
                {"name": "www.example.com.", "type": 5, "TTL": 300, "data": "example.com."},
                {"name": "example.com.", "type": 1, "TTL": 60, "data": "93.184.216.34"}
            ]
        }"#;

        let records = Format::Json.decode(payload, "www.example.com").unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].addr, "93.184.216.34".parse::<IpAddr>().unwrap());
        assert_eq!(records[0].ttl, 60);
    }

    #[test]
    fn json_failure_status_rejected() {
        let payload = br#"{"Status": 2, "Answer": []}"#;
        assert!(matches!(
            Format::Json.decode(payload, "example.com"),
            Err(Error::Payload(_))
        ));
    }

    #[test]
    fn json_without_addresses_rejected() {
        let payload = br#"{"Status": 0}"#;
        assert!(matches!(
            Format::Json.decode(payload, "example.com"),
            Err(Error::Payload(_))
        ));
    }

    #[test]
    fn format_parsing() {
        assert_eq!("text".parse::<Format>().unwrap(), Format::Text);
        assert_eq!("json".parse::<Format>().unwrap(), Format::Json);
        assert!("auto".parse::<Format>().is_err());
    }
}
