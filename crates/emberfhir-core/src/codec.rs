use crate::error::{CoreError, Result};
use crate::resource::Resource;

/// Wire encodings the server can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFormat {
    Json,
    Xml,
}

impl WireFormat {
    /// Match a media type or `_format` shorthand. Accepts the `fhir+`
    /// prefixed forms and their plain aliases.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or(mime).trim();
        match essence {
            "application/fhir+json" | "application/json" | "text/json" | "json" => {
                Some(Self::Json)
            }
            "application/fhir+xml" | "application/xml" | "text/xml" | "xml" => Some(Self::Xml),
            _ => None,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Self::Json => "application/fhir+json",
            Self::Xml => "application/fhir+xml",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Xml => "xml",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "xml" => Some(Self::Xml),
            _ => None,
        }
    }
}

/// Parser/serializer pair for the wire formats.
///
/// The engine stays format-agnostic; it hands blobs to a codec at the two
/// places bytes enter or leave the core (startup load, HTTP edge).
pub trait WireCodec: Send + Sync {
    fn parse(&self, format: WireFormat, bytes: &[u8]) -> Result<Resource>;

    fn serialize(&self, format: WireFormat, resource: &Resource, pretty: bool) -> Result<String>;
}

/// JSON-only codec; enough for the core crates and their tests. The server
/// layers XML on top.
#[derive(Debug, Default)]
pub struct JsonCodec;

impl WireCodec for JsonCodec {
    fn parse(&self, format: WireFormat, bytes: &[u8]) -> Result<Resource> {
        match format {
            WireFormat::Json => {
                let value = serde_json::from_slice(bytes)?;
                Resource::new(value)
            }
            WireFormat::Xml => Err(CoreError::UnsupportedFormat(
                "XML is not supported by the JSON codec".into(),
            )),
        }
    }

    fn serialize(&self, format: WireFormat, resource: &Resource, pretty: bool) -> Result<String> {
        match format {
            WireFormat::Json => {
                let out = if pretty {
                    serde_json::to_string_pretty(resource.as_json())?
                } else {
                    serde_json::to_string(resource.as_json())?
                };
                Ok(out)
            }
            WireFormat::Xml => Err(CoreError::UnsupportedFormat(
                "XML is not supported by the JSON codec".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_matching_accepts_aliases() {
        assert_eq!(
            WireFormat::from_mime("application/fhir+json"),
            Some(WireFormat::Json)
        );
        assert_eq!(
            WireFormat::from_mime("application/json; charset=utf-8"),
            Some(WireFormat::Json)
        );
        assert_eq!(WireFormat::from_mime("xml"), Some(WireFormat::Xml));
        assert_eq!(WireFormat::from_mime("text/html"), None);
    }

    #[test]
    fn json_codec_round_trip() {
        let codec = JsonCodec;
        let blob = br#"{"resourceType":"Patient","id":"p1"}"#;
        let parsed = codec.parse(WireFormat::Json, blob).unwrap();
        assert_eq!(parsed.type_name(), "Patient");
        let out = codec.serialize(WireFormat::Json, &parsed, false).unwrap();
        let reparsed = codec.parse(WireFormat::Json, out.as_bytes()).unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn json_codec_rejects_xml() {
        let codec = JsonCodec;
        assert!(codec.parse(WireFormat::Xml, b"<Patient/>").is_err());
    }
}
