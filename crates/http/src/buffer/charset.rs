use bytes::{BufMut, BytesMut};
use serde::Deserialize;

/// Character sets the engine can encode text bodies with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Charset {
    #[default]
    #[serde(rename = "utf-8", alias = "UTF-8", alias = "utf8")]
    Utf8,
    #[serde(rename = "iso-8859-1", alias = "ISO-8859-1", alias = "latin1")]
    Latin1,
}

impl Charset {
    /// Looks a charset up by its IANA label.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().trim_matches('"');
        if label.eq_ignore_ascii_case("utf-8") || label.eq_ignore_ascii_case("utf8") {
            Some(Charset::Utf8)
        } else if ["iso-8859-1", "iso8859-1", "latin1", "us-ascii"].iter().any(|l| label.eq_ignore_ascii_case(l)) {
            Some(Charset::Latin1)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Charset::Utf8 => "utf-8",
            Charset::Latin1 => "iso-8859-1",
        }
    }

    /// Encodes `text` onto `dst`. Characters outside Latin-1 become `?`.
    pub fn encode_into(&self, text: &str, dst: &mut BytesMut) {
        match self {
            Charset::Utf8 => dst.put_slice(text.as_bytes()),
            Charset::Latin1 => {
                dst.reserve(text.len());
                for c in text.chars() {
                    let code = u32::from(c);
                    dst.put_u8(u8::try_from(code).unwrap_or(b'?'));
                }
            }
        }
    }
}
