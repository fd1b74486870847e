//! The data dictionary: a compressed JSON catalog of every message the MCU's
//! firmware build understands, fetched over the wire at connect time.
//!
//! Grounded on `examples/original_source/scripts/buildcommands.py`, which
//! produces the blob this module reads: `json.dumps(...)` compressed with
//! `zlib`. Message format strings (e.g. `"queue_step oid=%c interval=%u
//! count=%hu add=%hi"`) are parsed once at load time into [`MessageFormat`]
//! so the hot path never re-tokenizes a string.

use std::collections::HashMap;
use std::io::Read;

use flate2::read::ZlibDecoder;
use serde::Deserialize;

use crate::Error;

/// One parameter's wire representation, as printf-style format letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// `%c` — a single byte.
    U8,
    /// `%u` — unsigned VLQ.
    U32,
    /// `%i` — signed VLQ (zig-zag).
    I32,
    /// `%hu` — unsigned VLQ, narrow (fits u16 once decoded).
    U16,
    /// `%hi` — signed VLQ, narrow (fits i16 once decoded).
    I16,
    /// `%s` — length-prefixed byte buffer.
    Buffer,
    /// `%#s` — id into the static string table (`static_strings`).
    StaticString,
}

impl ParamType {
    fn from_token(tok: &str) -> Option<Self> {
        match tok {
            "%c" => Some(ParamType::U8),
            "%u" => Some(ParamType::U32),
            "%i" => Some(ParamType::I32),
            "%hu" => Some(ParamType::U16),
            "%hi" => Some(ParamType::I16),
            "%s" => Some(ParamType::Buffer),
            "%#s" => Some(ParamType::StaticString),
            _ => None,
        }
    }

    /// Worst-case encoded length, used to compute a message's `max_size`.
    fn max_len(self) -> usize {
        match self {
            ParamType::U8 => 1,
            ParamType::U32 | ParamType::I32 => 5,
            ParamType::U16 | ParamType::I16 => 3,
            ParamType::Buffer => 1 + crate::frame::MESSAGE_MAX,
            ParamType::StaticString => 2,
        }
    }
}

/// A parsed `"name %type %type ..."` format string.
#[derive(Debug, Clone)]
pub struct MessageFormat {
    pub msgid: u16,
    pub name: String,
    pub params: Vec<ParamType>,
}

impl MessageFormat {
    fn parse(msgid: u16, format: &str) -> Self {
        let mut tokens = format.split_whitespace();
        let name = tokens.next().unwrap_or_default().to_string();
        let params = tokens.filter_map(ParamType::from_token).collect();
        MessageFormat { msgid, name, params }
    }

    /// `MESSAGE_MIN + 1 (msgid byte, best case) + sum of each param's worst case`,
    /// clamped to `MESSAGE_MAX` per spec's message-size rule.
    pub fn max_size(&self) -> usize {
        let params_total: usize = self.params.iter().map(|p| p.max_len()).sum();
        (crate::frame::MESSAGE_MIN + 1 + params_total).min(crate::frame::MESSAGE_MAX)
    }
}

/// The decoded contents of a connect-time data dictionary blob.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    pub messages: HashMap<u16, MessageFormat>,
    pub name_to_id: HashMap<String, u16>,
    pub commands: Vec<u16>,
    pub responses: Vec<u16>,
    pub static_strings: HashMap<u16, String>,
    pub config: HashMap<String, serde_json::Value>,
    pub version: String,
    pub build_versions: String,
}

#[derive(Deserialize)]
struct RawDictionary {
    messages: HashMap<String, String>,
    #[serde(default)]
    commands: Vec<u16>,
    #[serde(default)]
    responses: Vec<u16>,
    #[serde(default)]
    static_strings: HashMap<String, String>,
    #[serde(default)]
    config: HashMap<String, serde_json::Value>,
    #[serde(default)]
    version: String,
    #[serde(default)]
    build_versions: String,
}

impl Dictionary {
    /// Decompresses and parses a data-dictionary blob as served by the MCU's
    /// `identify` response stream.
    pub fn from_compressed_json(blob: &[u8]) -> Result<Self, Error> {
        let mut decoder = ZlibDecoder::new(blob);
        let mut json = String::new();
        decoder
            .read_to_string(&mut json)
            .map_err(|_| Error::InvalidPayload)?;
        let raw: RawDictionary =
            serde_json::from_str(&json).map_err(|_| Error::InvalidPayload)?;

        let mut messages = HashMap::with_capacity(raw.messages.len());
        let mut name_to_id = HashMap::with_capacity(raw.messages.len());
        for (id_str, format) in raw.messages {
            let id: u16 = id_str.parse().map_err(|_| Error::InvalidPayload)?;
            let parsed = MessageFormat::parse(id, &format);
            name_to_id.insert(parsed.name.clone(), id);
            messages.insert(id, parsed);
        }
        let static_strings = raw
            .static_strings
            .into_iter()
            .map(|(id_str, s)| -> Result<(u16, String), Error> {
                Ok((id_str.parse().map_err(|_| Error::InvalidPayload)?, s))
            })
            .collect::<Result<_, _>>()?;

        Ok(Dictionary {
            messages,
            name_to_id,
            commands: raw.commands,
            responses: raw.responses,
            static_strings,
            config: raw.config,
            version: raw.version,
            build_versions: raw.build_versions,
        })
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<&MessageFormat> {
        self.name_to_id.get(name).and_then(|id| self.messages.get(id))
    }

    pub fn lookup_by_id(&self, id: u16) -> Result<&MessageFormat, Error> {
        self.messages.get(&id).ok_or(Error::UnknownMessage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn compress(json: &str) -> Vec<u8> {
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(json.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn parses_format_string_into_params() {
        let fmt = MessageFormat::parse(7, "queue_step oid=%c interval=%u count=%hu add=%hi");
        assert_eq!(fmt.name, "queue_step");
        assert_eq!(
            fmt.params,
            vec![ParamType::U8, ParamType::U32, ParamType::U16, ParamType::I16]
        );
    }

    #[test]
    fn max_size_is_clamped_to_message_max() {
        let fmt = MessageFormat::parse(1, "identify offset=%u count=%u");
        assert!(fmt.max_size() <= crate::frame::MESSAGE_MAX);
    }

    #[test]
    fn loads_compressed_dictionary() {
        let json = r#"{
            "messages": {"7": "queue_step oid=%c interval=%u count=%hu add=%hi"},
            "commands": [7],
            "responses": [],
            "static_strings": {"1": "shutdown"},
            "config": {"CLOCK_FREQ": 16000000},
            "version": "v0.12.0",
            "build_versions": "gcc-12"
        }"#;
        let blob = compress(json);
        let dict = Dictionary::from_compressed_json(&blob).unwrap();
        assert_eq!(dict.lookup_by_name("queue_step").unwrap().msgid, 7);
        assert_eq!(dict.static_strings.get(&1).unwrap(), "shutdown");
        assert_eq!(dict.version, "v0.12.0");
    }

    #[test]
    fn unknown_message_id_is_reported() {
        let dict = Dictionary::default();
        assert_eq!(dict.lookup_by_id(99), Err(Error::UnknownMessage));
    }
}
