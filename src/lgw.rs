//! LGW 9528 application-layer codec.
//!
//! The gateway's command channel exchanges ASCII frames of the form
//! `#:{"cmd": "<name>", "<attr>": "<value>", ...}:#`. A device may interleave
//! unsolicited frames (telemetry, replies addressed to another target) with the reply
//! to the command just sent, so a single read can carry several concatenated frames.
//!
//! This module provides:
//!
//! - [`CommandFrame`] / [`encode`] - outbound frame construction with wire-key translation
//! - [`decode`] / [`LgwResponse`] - splitting and strict decoding of response blobs
//! - [`TargetId`] / [`make_target_id`] - device addressing from MAC and channel
//! - [`check_response`] - request/response correlation on top of a successful send

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::str::FromStr;

use log::{trace, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EngineError;
use crate::session::{ErrorCode, Payload, ResponseEnvelope};

/// Opening token of a frame.
pub const FRAME_START: &str = "#:";

/// Closing token of a frame.
pub const FRAME_END: &str = ":#";

/// Identifier-style keys and their hyphenated wire names.
static WIRE_KEYS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("target_id", "target-id"),
        ("timeout_ms", "timeout-ms"),
        ("raw_data", "raw-data"),
        ("slave_addr", "slave-addr"),
        ("start_addr", "start-addr"),
        ("write_data", "write-data"),
        ("model_id", "model-id"),
    ])
});

static TARGET_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| match Regex::new(r"^0000([0-9a-fA-F]{12}):([0-9]+)$") {
        Ok(re) => re,
        Err(err) => panic!("invalid TARGET_ID_PATTERN regex: {err}"),
    });

static MAC_PATTERN: Lazy<Regex> =
    Lazy::new(|| match Regex::new(r"^([0-9a-fA-F]{2}:){5}[0-9a-fA-F]{2}$") {
        Ok(re) => re,
        Err(err) => panic!("invalid MAC_PATTERN regex: {err}"),
    });

static FRAME_PATTERN: Lazy<Regex> = Lazy::new(|| match Regex::new(r"^#:.*:#$") {
    Ok(re) => re,
    Err(err) => panic!("invalid FRAME_PATTERN regex: {err}"),
});

/// Translates an identifier-style key to its wire name; unknown keys pass through.
pub fn wire_key(key: &str) -> &str {
    WIRE_KEYS.get(key).copied().unwrap_or(key)
}

/// An outbound LGW command.
///
/// The `cmd` entry always comes first, the remaining attributes keep insertion order
/// and are stored under their wire names.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandFrame {
    fields: Map<String, Value>,
}

impl CommandFrame {
    pub fn new(cmd: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("cmd".to_string(), Value::String(cmd.into()));
        Self { fields }
    }

    /// Adds an attribute, translating the key to its wire name.
    pub fn attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Inserts or replaces an attribute in place.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let key = wire_key(key);
        if key == "cmd" {
            // `cmd` must stay a string
            let value = value.into();
            if let Value::String(cmd) = value {
                self.fields.insert("cmd".to_string(), Value::String(cmd));
            }
            return;
        }
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn cmd(&self) -> &str {
        self.fields
            .get("cmd")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Looks up a field by identifier-style or wire key (`cmd` included).
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(wire_key(key))
    }

    pub fn target_id(&self) -> Option<&str> {
        self.get("target-id").and_then(Value::as_str)
    }

    /// Attributes other than `cmd`, in wire order.
    pub fn attrs(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter().filter(|(k, _)| k.as_str() != "cmd")
    }

    /// Renders the wire frame.
    pub fn encode(&self) -> String {
        let body = to_wire_json(&self.fields);
        format!("{FRAME_START}{body}{FRAME_END}")
    }

    /// Parses a single frame such as a command template.
    ///
    /// The surrounding `#:`/`:#` tokens are optional; the body must be a JSON object with
    /// a string `cmd`.
    pub fn parse(text: &str) -> Result<Self, EngineError> {
        let body = text.trim();
        let body = body.strip_prefix(FRAME_START).unwrap_or(body);
        let body = body.strip_suffix(FRAME_END).unwrap_or(body);
        let object = parse_object(body)?;
        if !object.get("cmd").is_some_and(Value::is_string) {
            return Err(EngineError::InvalidFrame(format!(
                "command frame without cmd: {body}"
            )));
        }
        let mut frame = CommandFrame::new(String::new());
        for (key, value) in object {
            frame.set(&key, value);
        }
        Ok(frame)
    }
}

impl fmt::Display for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Encodes a command name and attributes into a wire frame.
///
/// ```
/// let wire = lgwire::lgw::encode(
///     "read-attr",
///     [("target_id", "0000d0141110c8:1"), ("attr", "model-id")],
/// );
/// assert_eq!(
///     wire,
///     r#"#:{"cmd": "read-attr", "target-id": "0000d0141110c8:1", "attr": "model-id"}:#"#
/// );
/// ```
pub fn encode<K, V, I>(cmd: &str, attrs: I) -> String
where
    K: AsRef<str>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    attrs
        .into_iter()
        .fold(CommandFrame::new(cmd), |frame, (k, v)| frame.attr(k.as_ref(), v))
        .encode()
}

/// `json.dumps`-compatible layout: `", "` / `": "` separators, ASCII-only output.
struct WireFormatter;

impl serde_json::ser::Formatter for WireFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if fragment.is_ascii() {
            return writer.write_all(fragment.as_bytes());
        }
        let mut units = [0u16; 2];
        for ch in fragment.chars() {
            if ch.is_ascii() {
                writer.write_all(&[ch as u8])?;
            } else {
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}

fn to_wire_json(fields: &Map<String, Value>) -> String {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, WireFormatter);
    if let Err(err) = fields.serialize(&mut ser) {
        warn!("wire json serialization failed, falling back to compact form: {err}");
        return Value::Object(fields.clone()).to_string();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Expected JSON type of an allow-listed response key.
#[derive(Clone, Copy)]
enum FieldKind {
    Str,
    IntOrNull,
}

/// Keys whose type is enforced; everything else is carried through as-is.
const KNOWN_FIELDS: &[(&str, FieldKind)] = &[
    ("cmd", FieldKind::Str),
    ("code", FieldKind::IntOrNull),
    ("target-id", FieldKind::Str),
    ("attr", FieldKind::Str),
    ("reason", FieldKind::Str),
];

fn parse_object(token: &str) -> Result<Map<String, Value>, EngineError> {
    let value: Value = serde_json::from_str(token)
        .map_err(|e| EngineError::InvalidFrame(format!("{e}: {token}")))?;
    let Value::Object(object) = value else {
        return Err(EngineError::InvalidFrame(format!("not an object: {token}")));
    };
    for (key, kind) in KNOWN_FIELDS {
        let Some(field) = object.get(*key) else {
            continue;
        };
        let valid = match kind {
            FieldKind::Str => field.is_string(),
            FieldKind::IntOrNull => field.is_null() || field.is_i64() || field.is_u64(),
        };
        if !valid {
            return Err(EngineError::InvalidFrame(format!(
                "field '{key}' has unexpected type: {field}"
            )));
        }
    }
    Ok(object)
}

/// Splits a raw blob on the framing tokens, dropping empty pieces.
fn split_frames(blob: &str) -> impl Iterator<Item = &str> {
    blob.split(FRAME_END)
        .flat_map(|piece| piece.split(FRAME_START))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Decoded reply to one LGW command.
///
/// `fields` holds the merged addressed frames (those carrying a non-null `code`),
/// `other` every remaining frame in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LgwResponse {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub other: Vec<Map<String, Value>>,
}

impl LgwResponse {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(wire_key(key))
    }

    pub fn code(&self) -> Option<i64> {
        self.fields.get("code").and_then(Value::as_i64)
    }

    pub fn cmd(&self) -> Option<&str> {
        self.fields.get("cmd").and_then(Value::as_str)
    }

    pub fn target_id(&self) -> Option<&str> {
        self.fields.get("target-id").and_then(Value::as_str)
    }

    pub fn attr(&self) -> Option<&str> {
        self.fields.get("attr").and_then(Value::as_str)
    }

    pub fn value(&self) -> Option<&Value> {
        self.fields.get("value")
    }

    pub fn other(&self) -> &[Map<String, Value>] {
        &self.other
    }

    /// The merged map with `other` attached, as delivered to result consumers.
    pub fn to_value(&self) -> Value {
        let mut merged = self.fields.clone();
        merged.insert(
            "other".to_string(),
            Value::Array(self.other.iter().cloned().map(Value::Object).collect()),
        );
        Value::Object(merged)
    }
}

/// Decodes a response blob made of one or more concatenated frames.
///
/// Tokens that fail strict decoding are dropped; the blob is rejected only when no
/// frame survives. When several addressed frames appear, their keys are merged and the
/// later frame wins on collision.
pub fn decode(blob: &str) -> Result<LgwResponse, EngineError> {
    let mut frames = Vec::new();
    for token in split_frames(blob) {
        match parse_object(token) {
            Ok(frame) => frames.push(frame),
            Err(err) => trace!("skip lgw token: {err}"),
        }
    }
    if frames.is_empty() {
        return Err(EngineError::InvalidFrame(format!(
            "no lgw frame in response: {blob:?}"
        )));
    }

    let mut response = LgwResponse::default();
    let mut addressed = 0usize;
    for frame in frames {
        if frame.get("code").is_some_and(|code| !code.is_null()) {
            addressed += 1;
            response.fields.extend(frame);
        } else {
            response.other.push(frame);
        }
    }
    if addressed > 1 {
        warn!("{addressed} addressed lgw frames merged into one reply, later keys win");
    }
    Ok(response)
}

/// True when `content` is a single well-formed frame.
pub fn is_lgw_frame(content: &str) -> bool {
    FRAME_PATTERN.is_match(content) && CommandFrame::parse(content).is_ok()
}

/// A 48-bit hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Lowercase hex without separators.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 12 || !hex.is_ascii() {
            return None;
        }
        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(octets))
    }
}

impl FromStr for MacAddress {
    type Err = EngineError;

    /// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff`, `aabb.ccdd.eeff` and bare hex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = match s.len() {
            17 if s.matches(':').count() == 5 => s.replace(':', ""),
            17 if s.matches('-').count() == 5 => s.replace('-', ""),
            14 if s.matches('.').count() == 2 => s.replace('.', ""),
            12 => s.to_string(),
            _ => return Err(EngineError::InvalidMac(s.to_string())),
        };
        Self::from_hex(&hex).ok_or_else(|| EngineError::InvalidMac(s.to_string()))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// True for colon-separated MAC text.
pub fn is_valid_mac(mac: &str) -> bool {
    MAC_PATTERN.is_match(mac)
}

/// Addressing string of one logical channel behind a device.
///
/// Rendered as `"0000" + 12 lowercase hex digits + ":" + channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId {
    pub mac: MacAddress,
    pub channel: u32,
}

impl TargetId {
    pub fn new(mac: MacAddress, channel: u32) -> Self {
        Self { mac, channel }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0000{}:{}", self.mac.to_hex(), self.channel)
    }
}

impl FromStr for TargetId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EngineError::InvalidTargetId(s.to_string());
        let caps = TARGET_ID_PATTERN.captures(s).ok_or_else(invalid)?;
        let mac = MacAddress::from_hex(&caps[1].to_ascii_lowercase()).ok_or_else(invalid)?;
        let channel = caps[2].parse::<u32>().map_err(|_| invalid())?;
        Ok(Self { mac, channel })
    }
}

/// Builds the target id for `mac` and `channel`.
///
/// `mac` may use any notation [`MacAddress`] accepts; anything else is refused rather
/// than producing an id the device cannot route.
pub fn make_target_id(mac: &str, channel: u32) -> Result<String, EngineError> {
    let mac = mac.parse::<MacAddress>()?;
    Ok(TargetId::new(mac, channel).to_string())
}

/// Recovers `(mac, channel)` from a target id.
pub fn decode_target_id(target_id: &str) -> Result<(MacAddress, u32), EngineError> {
    let id = target_id.parse::<TargetId>()?;
    Ok((id.mac, id.channel))
}

/// Expands command templates for one device.
///
/// A template whose frame carries `target-id` is emitted once per channel, addressed to
/// `mac`; any other template is passed through verbatim. Fails with
/// [`EngineError::InvalidMac`] when an addressed template meets an unusable `mac`.
pub fn expand_for_host(
    templates: &[String],
    mac: &str,
    channels: &[u32],
) -> Result<Vec<String>, EngineError> {
    let parsed = mac.parse::<MacAddress>();
    let mut commands = Vec::new();
    for template in templates {
        match CommandFrame::parse(template) {
            Ok(mut frame) if frame.target_id().is_some() => {
                let mac = parsed
                    .as_ref()
                    .map_err(|_| EngineError::InvalidMac(mac.to_string()))?;
                for channel in channels {
                    frame.set("target-id", TargetId::new(*mac, *channel).to_string());
                    commands.push(frame.encode());
                }
            }
            _ => commands.push(template.clone()),
        }
    }
    Ok(commands)
}

/// Correlates a decoded reply with the request that produced it.
///
/// A reply counts only when `target-id`, `cmd` and `attr` match the request and the
/// device reported `code == 0`; anything else turns a successful send into a failure.
pub fn check_response(request: &CommandFrame, envelope: ResponseEnvelope) -> ResponseEnvelope {
    if !envelope.ok {
        return envelope;
    }
    let Payload::Lgw(response) = &envelope.payload else {
        return envelope.into_failure(ErrorCode::ExpectMissing, "reply is not an lgw frame");
    };

    let in_sync = ["target-id", "cmd", "attr"]
        .iter()
        .all(|key| response.get(key) == request.get(key));
    if !in_sync {
        warn!(
            "lgw reply out of sync, in: {request}, out: {}",
            response.to_value()
        );
        let reason = format!(
            "reply belongs to another request (target-id={:?}, cmd={:?}, attr={:?})",
            response.target_id(),
            response.cmd(),
            response.attr()
        );
        return envelope.into_failure(ErrorCode::OutOfSync, reason);
    }

    match response.code() {
        Some(0) => envelope,
        code => {
            let reason = response
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("device returned code {code:?}"));
            warn!("lgw reply rejected, in: {request}, code: {code:?}, reason: {reason}");
            envelope.into_failure(ErrorCode::Rejected, reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TWO_FRAMES: &str = r#"#:{"cmd":"read-attr","target-id":"x","attr":"model-id","code":0,"value":"POC"}:##:{"cmd":"telemetry","code":null,"temp":42}:#"#;

    fn ok_lgw(response: LgwResponse) -> ResponseEnvelope {
        ResponseEnvelope::success(Payload::Lgw(response))
    }

    #[test]
    fn encode_translates_keys_and_keeps_order() {
        let wire = encode(
            "read-attr",
            [("target_id", "0000d0141110c8:1"), ("attr", "model-id")],
        );
        assert_eq!(
            wire,
            r#"#:{"cmd": "read-attr", "target-id": "0000d0141110c8:1", "attr": "model-id"}:#"#
        );
    }

    #[test]
    fn encode_passes_unknown_keys_and_all_translations() {
        let frame = CommandFrame::new("modbus")
            .attr("slave_addr", 1)
            .attr("start_addr", 16)
            .attr("write_data", json!([1, 2]))
            .attr("timeout_ms", 500)
            .attr("raw_data", "00ff")
            .attr("custom_key", "kept");
        assert_eq!(
            frame.encode(),
            r#"#:{"cmd": "modbus", "slave-addr": 1, "start-addr": 16, "write-data": [1, 2], "timeout-ms": 500, "raw-data": "00ff", "custom_key": "kept"}:#"#
        );
    }

    #[test]
    fn encode_escapes_non_ascii() {
        let wire = encode("set-name", [("value", "caf\u{e9} \u{1f600}")]);
        assert_eq!(
            wire,
            r#"#:{"cmd": "set-name", "value": "caf\u00e9 \ud83d\ude00"}:#"#
        );
        assert!(wire.is_ascii());
    }

    #[test]
    fn parse_inverts_encode() {
        let frame = CommandFrame::new("write-attr")
            .attr("target_id", make_target_id("D0:14:11:B0:02:19", 2).expect("mac"))
            .attr("attr", "on-off")
            .attr("value", "1");
        let parsed = CommandFrame::parse(&frame.encode()).expect("parse");
        assert_eq!(parsed, frame);
        assert_eq!(parsed.cmd(), "write-attr");
        assert_eq!(parsed.target_id(), Some("0000d01411b00219:2"));
    }

    #[test]
    fn decode_of_encoded_frame_reproduces_fields() {
        let frame = CommandFrame::new("read-attr")
            .attr("target_id", "0000d01411b00219:1")
            .attr("attr", "model-id");
        let response = decode(&frame.encode()).expect("decode");
        assert!(response.fields.is_empty());
        assert_eq!(response.other.len(), 1);
        let echoed = &response.other[0];
        assert_eq!(echoed.get("cmd"), frame.get("cmd"));
        for (key, value) in frame.attrs() {
            assert_eq!(echoed.get(key), Some(value));
        }
    }

    #[test]
    fn decode_merges_addressed_and_collects_other() {
        let response = decode(TWO_FRAMES).expect("decode");
        assert_eq!(
            response.to_value(),
            json!({
                "cmd": "read-attr",
                "target-id": "x",
                "attr": "model-id",
                "code": 0,
                "value": "POC",
                "other": [{"cmd": "telemetry", "code": null, "temp": 42}]
            })
        );
        assert_eq!(response.code(), Some(0));
        assert_eq!(response.value(), Some(&json!("POC")));
    }

    #[test]
    fn decode_serializes_other_after_fields() {
        let response = decode(TWO_FRAMES).expect("decode");
        let text = serde_json::to_string(&response).expect("serialize");
        assert!(text.starts_with(r#"{"cmd":"read-attr""#));
        assert!(text.ends_with(r#""other":[{"cmd":"telemetry","code":null,"temp":42}]}"#));
    }

    #[test]
    fn later_addressed_frame_wins_on_collision() {
        let blob = r#"#:{"cmd":"a","code":0,"value":1}:##:{"cmd":"a","code":0,"value":2}:#"#;
        let response = decode(blob).expect("decode");
        assert_eq!(response.value(), Some(&json!(2)));
        assert!(response.other.is_empty());
    }

    #[test]
    fn decode_skips_garbage_between_frames() {
        let blob = "noise#:{\"cmd\":\"ping\",\"code\":0}:#\n";
        let response = decode(blob).expect("decode");
        assert_eq!(response.cmd(), Some("ping"));
    }

    #[test]
    fn decode_rejects_non_lgw_text() {
        let err = decode("BusyBox v1.13.4 built-in shell\n# ").unwrap_err();
        assert!(matches!(err, EngineError::InvalidFrame(_)));
        assert!(decode("").is_err());
    }

    #[test]
    fn decode_rejects_wrongly_typed_known_fields() {
        assert!(decode(r#"#:{"cmd":"x","code":"0"}:#"#).is_err());
        assert!(decode(r#"#:{"cmd":7,"code":0}:#"#).is_err());
        assert!(decode(r#"#:[1,2]:#"#).is_err());
    }

    #[test]
    fn target_id_has_fixed_layout() {
        assert_eq!(make_target_id("D0:14:11:B0:02:19", 1).unwrap(), "0000d01411b00219:1");
        assert_eq!(make_target_id("D0:14:11:B0:02:19", 12).unwrap(), "0000d01411b00219:12");
    }

    #[test]
    fn target_id_normalizes_any_mac_notation() {
        for mac in ["D0-14-11-B0-02-19", "D01411B00219", "d014.11b0.0219"] {
            let id = make_target_id(mac, 1).expect(mac);
            assert_eq!(id, "0000d01411b00219:1");
            assert!(decode_target_id(&id).is_ok());
        }
    }

    #[test]
    fn target_id_refuses_unusable_mac() {
        for mac in ["", "D0:14:11:B0:02", "not-a-mac"] {
            assert!(matches!(
                make_target_id(mac, 1),
                Err(EngineError::InvalidMac(_))
            ));
        }
    }

    #[test]
    fn target_id_round_trips_mac_and_channel() {
        for (mac, channel) in [
            ("D0:14:11:B0:02:19", 1u32),
            ("00:00:00:00:00:00", 3),
            ("ff:ee:dd:cc:bb:aa", 255),
        ] {
            let (decoded_mac, decoded_channel) =
                decode_target_id(&make_target_id(mac, channel).expect("mac")).expect("decode");
            assert_eq!(decoded_mac.to_string(), mac.to_lowercase());
            assert_eq!(decoded_channel, channel);
        }
    }

    #[test]
    fn target_id_display_matches_make() {
        let mac: MacAddress = "D0-14-11-B0-02-19".parse().expect("mac");
        assert_eq!(
            TargetId::new(mac, 4).to_string(),
            make_target_id("D0:14:11:B0:02:19", 4).unwrap()
        );
    }

    #[test]
    fn target_id_rejects_malformed_input() {
        assert!("0000d0141110c8:1".parse::<TargetId>().is_err());
        assert!("1111d01411b00219:1".parse::<TargetId>().is_err());
        assert!("0000d01411b00219".parse::<TargetId>().is_err());
        assert!("0000d01411b00219:x".parse::<TargetId>().is_err());
    }

    #[test]
    fn mac_accepts_common_notations() {
        let expected = "d0:14:11:b0:02:19";
        for text in ["D0:14:11:B0:02:19", "D0-14-11-B0-02-19", "d014.11b0.0219", "D01411B00219"] {
            let mac: MacAddress = text.parse().expect(text);
            assert_eq!(mac.to_string(), expected);
        }
        assert!("D0:14:11:B0:02".parse::<MacAddress>().is_err());
        assert!("zz:14:11:b0:02:19".parse::<MacAddress>().is_err());
        assert!(is_valid_mac("D0:14:11:B0:02:19"));
        assert!(!is_valid_mac("D01411B00219"));
    }

    #[test]
    fn lgw_frame_format_check() {
        assert!(is_lgw_frame(r#"#:{"cmd": "bye"}:#"#));
        assert!(!is_lgw_frame(r#"{"cmd": "bye"}"#));
        assert!(!is_lgw_frame(r#"#:{"cmd": "bye":#"#));
        assert!(!is_lgw_frame("ls -al"));
    }

    #[test]
    fn expand_addresses_every_channel() {
        let templates = vec![
            encode("read-attr", [("target_id", "placeholder"), ("attr", "model-id")]),
            encode("bye", Vec::<(&str, &str)>::new()),
        ];
        let commands = expand_for_host(&templates, "D0-14-11-B0-02-19", &[1, 2]).expect("expand");
        assert_eq!(commands.len(), 3);
        assert!(commands[0].contains(r#""target-id": "0000d01411b00219:1""#));
        assert!(commands[1].contains(r#""target-id": "0000d01411b00219:2""#));
        assert_eq!(commands[2], templates[1]);
    }

    #[test]
    fn expand_keeps_unparseable_templates() {
        let templates = vec!["not a frame".to_string()];
        assert_eq!(
            expand_for_host(&templates, "aa:bb:cc:dd:ee:ff", &[1]).expect("expand"),
            templates
        );
    }

    #[test]
    fn expand_refuses_addressed_templates_without_usable_mac() {
        let addressed = vec![encode("read-attr", [("target_id", ""), ("attr", "model-id")])];
        for mac in ["", "D0:14:11:B0:02"] {
            assert!(matches!(
                expand_for_host(&addressed, mac, &[1]),
                Err(EngineError::InvalidMac(_))
            ));
        }

        let unaddressed = vec![encode("version", Vec::<(&str, &str)>::new())];
        assert_eq!(expand_for_host(&unaddressed, "", &[1]).expect("expand"), unaddressed);
    }

    #[test]
    fn check_accepts_matching_reply() {
        let request = CommandFrame::new("read-attr")
            .attr("target_id", "x")
            .attr("attr", "model-id");
        let checked = check_response(&request, ok_lgw(decode(TWO_FRAMES).expect("decode")));
        assert!(checked.ok);
        assert_eq!(checked.error_code, None);
    }

    #[test]
    fn check_flags_reply_for_other_target() {
        let request = CommandFrame::new("read-attr")
            .attr("target_id", "y")
            .attr("attr", "model-id");
        let checked = check_response(&request, ok_lgw(decode(TWO_FRAMES).expect("decode")));
        assert!(!checked.ok);
        assert_eq!(checked.error_code, Some(ErrorCode::OutOfSync));
        assert!(checked.lgw().is_some());
    }

    #[test]
    fn check_flags_non_zero_code() {
        let request = CommandFrame::new("read-attr").attr("attr", "model-id");
        let reply = decode(r#"#:{"cmd":"read-attr","attr":"model-id","code":-3,"reason":"busy"}:#"#)
            .expect("decode");
        let checked = check_response(&request, ok_lgw(reply));
        assert!(!checked.ok);
        assert_eq!(checked.error_code, Some(ErrorCode::Rejected));
        assert_eq!(checked.reason.as_deref(), Some("busy"));
    }

    #[test]
    fn check_passes_failures_through() {
        let request = CommandFrame::new("bye");
        let failed = ResponseEnvelope::failure(ErrorCode::NoData, "nothing", Payload::None);
        let checked = check_response(&request, failed.clone());
        assert_eq!(checked, failed);
    }
}
