//! Identity-introduction codec.
//!
//! The solution payload of an introduction puzzle: the solver reveals its
//! request URI to the puzzle publisher, who responds with a zero-value
//! trust edge. At most 1 KiB.

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

use weft_core::constants::{MAX_INTRODUCTION_FILE_BYTES, XML_FORMAT_VERSION};
use weft_core::error::WotError;
use weft_core::uri::RequestUri;

use crate::common::{required_attr, xml_err};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityIntroduction {
    pub request_uri: RequestUri,
}

pub fn encode_introduction(intro: &IdentityIntroduction) -> Result<Vec<u8>, WotError> {
    let mut writer = Writer::new(Vec::new());

    let mut root = BytesStart::new("IdentityIntroduction");
    root.push_attribute(("Version", XML_FORMAT_VERSION.to_string().as_str()));
    writer.write_event(Event::Start(root)).map_err(xml_err)?;

    let mut identity = BytesStart::new("Identity");
    identity.push_attribute(("URI", intro.request_uri.to_string().as_str()));
    writer.write_event(Event::Empty(identity)).map_err(xml_err)?;

    writer
        .write_event(Event::End(BytesEnd::new("IdentityIntroduction")))
        .map_err(xml_err)?;

    let bytes = writer.into_inner();
    if bytes.len() > MAX_INTRODUCTION_FILE_BYTES {
        return Err(WotError::FileTooLarge {
            got: bytes.len(),
            max: MAX_INTRODUCTION_FILE_BYTES,
        });
    }
    Ok(bytes)
}

/// `Ok(None)` for a well-formed file of a newer protocol version.
pub fn decode_introduction(bytes: &[u8]) -> Result<Option<IdentityIntroduction>, WotError> {
    if bytes.len() > MAX_INTRODUCTION_FILE_BYTES {
        return Err(WotError::FileTooLarge {
            got: bytes.len(),
            max: MAX_INTRODUCTION_FILE_BYTES,
        });
    }

    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut uri = None;
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) | Event::Empty(e) => match e.name().as_ref() {
                b"IdentityIntroduction" => {
                    let version: u32 = required_attr(&e, "Version")?
                        .parse()
                        .map_err(|_| WotError::Xml("non-integer Version".to_string()))?;
                    if version != XML_FORMAT_VERSION {
                        return Ok(None);
                    }
                }
                b"Identity" => {
                    uri = Some(RequestUri::parse(&required_attr(&e, "URI")?)?);
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    uri.map(|request_uri| Some(IdentityIntroduction { request_uri }))
        .ok_or_else(|| WotError::Xml("missing Identity element".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let intro = IdentityIntroduction {
            request_uri: RequestUri {
                routing_key: [5u8; 32],
                crypto_key: [6u8; 32],
                settings: "AQACAAE".into(),
                edition: 3,
            },
        };
        let bytes = encode_introduction(&intro).unwrap();
        assert!(bytes.len() <= MAX_INTRODUCTION_FILE_BYTES);
        assert_eq!(decode_introduction(&bytes).unwrap().unwrap(), intro);
    }

    #[test]
    fn unknown_version_discarded() {
        let xml = br#"<IdentityIntroduction Version="7"/>"#;
        assert_eq!(decode_introduction(xml).unwrap(), None);
    }
}
