use quick_xml::events::BytesStart;

use weft_core::error::WotError;

pub(crate) fn xml_err<E: std::fmt::Display>(e: E) -> WotError {
    WotError::Xml(e.to_string())
}

/// Fetch an attribute by name, unescaped.
pub(crate) fn attr(e: &BytesStart<'_>, name: &str) -> Result<Option<String>, WotError> {
    for a in e.attributes() {
        let a = a.map_err(xml_err)?;
        if a.key.as_ref() == name.as_bytes() {
            return Ok(Some(a.unescape_value().map_err(xml_err)?.into_owned()));
        }
    }
    Ok(None)
}

pub(crate) fn required_attr(e: &BytesStart<'_>, name: &str) -> Result<String, WotError> {
    attr(e, name)?.ok_or_else(|| WotError::Xml(format!("missing attribute {name}")))
}
