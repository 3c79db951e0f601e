//! Identity file codec (format v1).
//!
//! ```xml
//! <WebOfTrust Version="1">
//!   <Identity Name="nick" PublishesTrustList="true">
//!     <Context Name="Chat"/>
//!     <Property Name="IntroductionPuzzleCount" Value="10"/>
//!     <TrustList>
//!       <Trust Identity="K@…/WebOfTrust/4" Value="75" Comment="met at…"/>
//!     </TrustList>
//!   </Identity>
//! </WebOfTrust>
//! ```
//!
//! Hard limits: 1 MiB per file, 512 trust entries, attribute constraints of
//! the data model. Files claiming an unknown future version are discarded
//! silently (`Ok(None)`), never treated as a parse failure.

use std::collections::BTreeMap;

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

use weft_core::constants::{
    MAX_IDENTITY_FILE_BYTES, MAX_TRUST_LIST_ENTRIES, XML_FORMAT_VERSION,
};
use weft_core::error::WotError;
use weft_core::identity::{validate_context_name, validate_nickname, validate_property};
use weft_core::trust::validate_trust_value;
use weft_core::types::TrustValue;
use weft_core::uri::RequestUri;

use crate::common::{attr, required_attr, xml_err};

/// Decoded contents of one published identity file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityFile {
    pub nickname: String,
    pub publishes_trust_list: bool,
    pub contexts: Vec<String>,
    pub properties: BTreeMap<String, String>,
    pub trust_list: Vec<TrustListEntry>,
}

/// One trust opinion inside a published trust list. The trustee is
/// identified by request URI; the edition inside it is the edition hint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustListEntry {
    pub trustee_uri: RequestUri,
    pub value: TrustValue,
    pub comment: String,
}

// ── Encode ───────────────────────────────────────────────────────────────────

pub fn encode_identity_file(file: &IdentityFile) -> Result<Vec<u8>, WotError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    let mut root = BytesStart::new("WebOfTrust");
    root.push_attribute(("Version", XML_FORMAT_VERSION.to_string().as_str()));
    writer.write_event(Event::Start(root)).map_err(xml_err)?;

    let mut identity = BytesStart::new("Identity");
    identity.push_attribute(("Name", file.nickname.as_str()));
    identity.push_attribute((
        "PublishesTrustList",
        if file.publishes_trust_list { "true" } else { "false" },
    ));
    writer.write_event(Event::Start(identity)).map_err(xml_err)?;

    for context in &file.contexts {
        let mut e = BytesStart::new("Context");
        e.push_attribute(("Name", context.as_str()));
        writer.write_event(Event::Empty(e)).map_err(xml_err)?;
    }

    for (key, value) in &file.properties {
        let mut e = BytesStart::new("Property");
        e.push_attribute(("Name", key.as_str()));
        e.push_attribute(("Value", value.as_str()));
        writer.write_event(Event::Empty(e)).map_err(xml_err)?;
    }

    if !file.trust_list.is_empty() {
        writer
            .write_event(Event::Start(BytesStart::new("TrustList")))
            .map_err(xml_err)?;
        for entry in &file.trust_list {
            let mut e = BytesStart::new("Trust");
            e.push_attribute(("Identity", entry.trustee_uri.to_string().as_str()));
            e.push_attribute(("Value", entry.value.to_string().as_str()));
            e.push_attribute(("Comment", entry.comment.as_str()));
            writer.write_event(Event::Empty(e)).map_err(xml_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("TrustList")))
            .map_err(xml_err)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("Identity")))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("WebOfTrust")))
        .map_err(xml_err)?;

    let bytes = writer.into_inner();
    if bytes.len() > MAX_IDENTITY_FILE_BYTES {
        return Err(WotError::FileTooLarge {
            got: bytes.len(),
            max: MAX_IDENTITY_FILE_BYTES,
        });
    }
    Ok(bytes)
}

// ── Decode ───────────────────────────────────────────────────────────────────

/// Decode an identity file. `Ok(None)` means a well-formed file of a newer
/// protocol version, which callers must discard without error.
pub fn decode_identity_file(bytes: &[u8]) -> Result<Option<IdentityFile>, WotError> {
    if bytes.len() > MAX_IDENTITY_FILE_BYTES {
        return Err(WotError::FileTooLarge {
            got: bytes.len(),
            max: MAX_IDENTITY_FILE_BYTES,
        });
    }

    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut file: Option<IdentityFile> = None;
    let mut saw_root = false;
    let mut in_trust_list = false;

    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) | Event::Empty(e) => match e.name().as_ref() {
                b"WebOfTrust" => {
                    saw_root = true;
                    let version: u32 = required_attr(&e, "Version")?
                        .parse()
                        .map_err(|_| WotError::Xml("non-integer Version".to_string()))?;
                    if version != XML_FORMAT_VERSION {
                        // Newer webs are invisible to us, by contract.
                        return Ok(None);
                    }
                }
                b"Identity" => {
                    if !saw_root {
                        return Err(WotError::Xml("Identity outside WebOfTrust".to_string()));
                    }
                    let nickname = required_attr(&e, "Name")?;
                    validate_nickname(&nickname)?;
                    let publishes = required_attr(&e, "PublishesTrustList")? == "true";
                    file = Some(IdentityFile {
                        nickname,
                        publishes_trust_list: publishes,
                        contexts: Vec::new(),
                        properties: BTreeMap::new(),
                        trust_list: Vec::new(),
                    });
                }
                b"Context" => {
                    let file = file
                        .as_mut()
                        .ok_or_else(|| WotError::Xml("Context outside Identity".to_string()))?;
                    let name = required_attr(&e, "Name")?;
                    validate_context_name(&name)?;
                    if !file.contexts.contains(&name) {
                        file.contexts.push(name);
                    }
                }
                b"Property" => {
                    let file = file
                        .as_mut()
                        .ok_or_else(|| WotError::Xml("Property outside Identity".to_string()))?;
                    let name = required_attr(&e, "Name")?;
                    let value = required_attr(&e, "Value")?;
                    validate_property(&name, &value)?;
                    file.properties.insert(name, value);
                }
                b"TrustList" => {
                    if file.is_none() {
                        return Err(WotError::Xml("TrustList outside Identity".to_string()));
                    }
                    in_trust_list = true;
                }
                b"Trust" => {
                    if !in_trust_list {
                        return Err(WotError::Xml("Trust outside TrustList".to_string()));
                    }
                    let file = file.as_mut().expect("TrustList implies Identity");
                    if file.trust_list.len() >= MAX_TRUST_LIST_ENTRIES {
                        return Err(WotError::TooManyTrustEntries {
                            max: MAX_TRUST_LIST_ENTRIES,
                        });
                    }
                    let uri = RequestUri::parse(&required_attr(&e, "Identity")?)?;
                    let value: i16 = required_attr(&e, "Value")?
                        .parse()
                        .map_err(|_| WotError::Xml("non-integer trust Value".to_string()))?;
                    validate_trust_value(value)?;
                    let comment = attr(&e, "Comment")?.unwrap_or_default();
                    file.trust_list.push(TrustListEntry {
                        trustee_uri: uri,
                        value: value as TrustValue,
                        comment,
                    });
                }
                other => {
                    // Forward compatibility: skip unknown elements.
                    let _ = other;
                }
            },
            Event::End(e) => {
                if e.name().as_ref() == b"TrustList" {
                    in_trust_list = false;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    file.map(Some)
        .ok_or_else(|| WotError::Xml("missing Identity element".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_uri(b: u8, edition: u64) -> RequestUri {
        RequestUri {
            routing_key: [b; 32],
            crypto_key: [b.wrapping_mul(3); 32],
            settings: "AQACAAE".into(),
            edition,
        }
    }

    fn sample_file() -> IdentityFile {
        let mut properties = BTreeMap::new();
        properties.insert("Introduction.Puzzles".to_string(), "10".to_string());
        IdentityFile {
            nickname: "alice".into(),
            publishes_trust_list: true,
            contexts: vec!["Chat".into(), "Introduction".into()],
            properties,
            trust_list: vec![
                TrustListEntry {
                    trustee_uri: sample_uri(2, 7),
                    value: 75,
                    comment: "met at the market".into(),
                },
                TrustListEntry {
                    trustee_uri: sample_uri(3, 0),
                    value: -100,
                    comment: String::new(),
                },
            ],
        }
    }

    #[test]
    fn round_trip_preserves_semantics() {
        let file = sample_file();
        let bytes = encode_identity_file(&file).unwrap();
        let decoded = decode_identity_file(&bytes).unwrap().unwrap();
        assert_eq!(decoded, file);
    }

    #[test]
    fn unknown_version_is_discarded_silently() {
        let xml = br#"<WebOfTrust Version="99"><Identity Name="x" PublishesTrustList="true"/></WebOfTrust>"#;
        assert_eq!(decode_identity_file(xml).unwrap(), None);
    }

    #[test]
    fn malformed_xml_is_a_parse_failure() {
        let err = decode_identity_file(b"<WebOfTrust Version=\"1\"><Identity").unwrap_err();
        assert!(err.is_parse_failure(), "{err}");
    }

    #[test]
    fn out_of_range_trust_value_rejected() {
        let mut file = sample_file();
        file.trust_list[0].value = 100;
        let bytes = encode_identity_file(&file).unwrap();
        let patched = String::from_utf8(bytes).unwrap().replace("\"100\"", "\"101\"");
        assert!(decode_identity_file(patched.as_bytes()).is_err());
    }

    #[test]
    fn trust_entry_limit_enforced() {
        let mut file = sample_file();
        file.trust_list.clear();
        for i in 0..=MAX_TRUST_LIST_ENTRIES {
            let mut key = [0u8; 32];
            key[0] = (i % 251) as u8;
            key[1] = (i / 251) as u8;
            file.trust_list.push(TrustListEntry {
                trustee_uri: RequestUri {
                    routing_key: key,
                    crypto_key: key,
                    settings: "AQACAAE".into(),
                    edition: 0,
                },
                value: 0,
                comment: String::new(),
            });
        }
        let bytes = encode_identity_file(&file).unwrap();
        assert!(matches!(
            decode_identity_file(&bytes),
            Err(WotError::TooManyTrustEntries { .. })
        ));
    }

    #[test]
    fn oversized_file_rejected() {
        let huge = vec![b'x'; MAX_IDENTITY_FILE_BYTES + 1];
        assert!(matches!(
            decode_identity_file(&huge),
            Err(WotError::FileTooLarge { .. })
        ));
    }
}
