//! Introduction-puzzle codec.
//!
//! A CAPTCHA published by an own identity. The payload is opaque to the
//! engine (image bytes, Base64 inside the XML); solving one earns the
//! solver a zero-value trust edge. At most 16 KiB.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

use weft_core::constants::{MAX_PUZZLE_FILE_BYTES, XML_FORMAT_VERSION};
use weft_core::error::WotError;
use weft_core::types::Timestamp;

use crate::common::{required_attr, xml_err};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntroductionPuzzle {
    /// Publisher-unique puzzle id.
    pub id: String,
    /// Puzzle family, e.g. `Captcha`.
    pub puzzle_type: String,
    pub mime_type: String,
    /// Expiry (UTC seconds); solutions after this are ignored.
    pub valid_until: Timestamp,
    /// Raw puzzle payload.
    pub data: Vec<u8>,
}

pub fn encode_puzzle(puzzle: &IntroductionPuzzle) -> Result<Vec<u8>, WotError> {
    let mut writer = Writer::new(Vec::new());

    let mut root = BytesStart::new("IntroductionPuzzle");
    root.push_attribute(("Version", XML_FORMAT_VERSION.to_string().as_str()));
    root.push_attribute(("ID", puzzle.id.as_str()));
    root.push_attribute(("Type", puzzle.puzzle_type.as_str()));
    root.push_attribute(("MimeType", puzzle.mime_type.as_str()));
    root.push_attribute(("ValidUntil", puzzle.valid_until.to_string().as_str()));
    writer.write_event(Event::Start(root)).map_err(xml_err)?;

    let mut data = BytesStart::new("Data");
    data.push_attribute(("Value", STANDARD.encode(&puzzle.data).as_str()));
    writer.write_event(Event::Empty(data)).map_err(xml_err)?;

    writer
        .write_event(Event::End(BytesEnd::new("IntroductionPuzzle")))
        .map_err(xml_err)?;

    let bytes = writer.into_inner();
    if bytes.len() > MAX_PUZZLE_FILE_BYTES {
        return Err(WotError::FileTooLarge {
            got: bytes.len(),
            max: MAX_PUZZLE_FILE_BYTES,
        });
    }
    Ok(bytes)
}

/// `Ok(None)` for a well-formed file of a newer protocol version.
pub fn decode_puzzle(bytes: &[u8]) -> Result<Option<IntroductionPuzzle>, WotError> {
    if bytes.len() > MAX_PUZZLE_FILE_BYTES {
        return Err(WotError::FileTooLarge {
            got: bytes.len(),
            max: MAX_PUZZLE_FILE_BYTES,
        });
    }

    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut puzzle: Option<IntroductionPuzzle> = None;
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) | Event::Empty(e) => match e.name().as_ref() {
                b"IntroductionPuzzle" => {
                    let version: u32 = required_attr(&e, "Version")?
                        .parse()
                        .map_err(|_| WotError::Xml("non-integer Version".to_string()))?;
                    if version != XML_FORMAT_VERSION {
                        return Ok(None);
                    }
                    puzzle = Some(IntroductionPuzzle {
                        id: required_attr(&e, "ID")?,
                        puzzle_type: required_attr(&e, "Type")?,
                        mime_type: required_attr(&e, "MimeType")?,
                        valid_until: required_attr(&e, "ValidUntil")?
                            .parse()
                            .map_err(|_| WotError::Xml("non-integer ValidUntil".to_string()))?,
                        data: Vec::new(),
                    });
                }
                b"Data" => {
                    let puzzle = puzzle
                        .as_mut()
                        .ok_or_else(|| WotError::Xml("Data outside puzzle".to_string()))?;
                    puzzle.data = STANDARD
                        .decode(required_attr(&e, "Value")?)
                        .map_err(|e| WotError::Xml(format!("bad Base64 payload: {e}")))?;
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    puzzle
        .map(Some)
        .ok_or_else(|| WotError::Xml("missing IntroductionPuzzle element".to_string()))
}
