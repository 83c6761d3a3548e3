//! Declarative appliance descriptions
//!
//! A [`DeviceProfile`] describes one appliance model: how telemetry frames are
//! laid out, which commands exist and what bytes they produce, and how a
//! session with the appliance is opened and kept alive. Profiles are plain
//! JSON documents; loading validates the whole document and either returns a
//! complete, immutable profile or a [`ProfileError`] naming the offending
//! descriptor.

use crate::error::ProfileError;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Upper bound on any frame the codec will build or accept
pub const MAX_FRAME_SIZE: usize = 1024;

/// Widest decimal raw that converts to `f64` exactly
pub const MAX_DECIMAL_WIDTH: u8 = 53;

/// Where a profile document comes from
#[derive(Debug, Clone, Copy)]
pub enum ProfileSource<'a> {
    /// JSON file on disk
    Path(&'a Path),
    /// JSON text already in memory
    Json(&'a str),
    /// Profile compiled into the crate, by model identifier
    Builtin(&'a str),
}

/// Load and validate a profile
pub fn load(source: ProfileSource<'_>) -> Result<DeviceProfile, ProfileError> {
    match source {
        ProfileSource::Path(path) => {
            let text = std::fs::read_to_string(path).map_err(|source| ProfileError::Read {
                path: path.display().to_string(),
                source,
            })?;
            DeviceProfile::from_json(&text)
        }
        ProfileSource::Json(text) => DeviceProfile::from_json(text),
        ProfileSource::Builtin(id) => {
            let text = crate::registry::builtin(id)
                .ok_or_else(|| ProfileError::UnknownBuiltin(id.to_string()))?;
            DeviceProfile::from_json(text)
        }
    }
}

/// Validated description of one appliance model
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub model: String,
    pub name: String,
    pub description: Option<String>,
    pub framing: Framing,
    pub telemetry: Telemetry,
    pub commands: Vec<CommandDescriptor>,
    pub session: SessionSettings,
    /// Friendly property name -> field name
    pub aliases: BTreeMap<String, String>,
}

impl DeviceProfile {
    /// Parse and validate a JSON profile document
    pub fn from_json(text: &str) -> Result<Self, ProfileError> {
        let doc: ProfileDoc = serde_json::from_str(text)?;
        doc.build()
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.telemetry.fields.iter().find(|f| f.name == name)
    }

    /// Look up a field by name, falling back to the alias table
    pub fn resolve(&self, name_or_alias: &str) -> Option<&FieldDescriptor> {
        self.field(name_or_alias).or_else(|| {
            self.aliases
                .get(name_or_alias)
                .and_then(|target| self.field(target))
        })
    }

    pub fn command(&self, name: &str) -> Option<&CommandDescriptor> {
        self.commands.iter().find(|c| c.name == name)
    }

    pub fn command_names(&self) -> Vec<&str> {
        self.commands.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Byte conventions shared by telemetry and command frames
#[derive(Debug, Clone, Default)]
pub struct Framing {
    pub checksum: Option<Checksum>,
    pub terminator: Option<Vec<u8>>,
    pub length: Option<LengthByte>,
    /// Byte carrying the correlation id in commands and their acknowledgements
    pub sequence_offset: Option<usize>,
}

impl Framing {
    /// Bytes appended after the payload: checksum then terminator
    pub fn trailer_len(&self) -> usize {
        self.checksum.map_or(0, |c| c.algorithm.width())
            + self.terminator.as_ref().map_or(0, Vec::len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumAlgorithm {
    /// CRC-16/CCITT-FALSE, init 0xFFFF
    Crc16CcittFalse,
    /// CRC-16/AUG-CCITT, init 0x1D0F
    Crc16AugCcitt,
    Sum8,
    Xor8,
}

impl ChecksumAlgorithm {
    pub fn width(self) -> usize {
        match self {
            Self::Crc16CcittFalse | Self::Crc16AugCcitt => 2,
            Self::Sum8 | Self::Xor8 => 1,
        }
    }

    pub fn compute(self, bytes: &[u8]) -> u32 {
        match self {
            Self::Crc16CcittFalse => u32::from(crc16_ccitt(0xFFFF, bytes)),
            Self::Crc16AugCcitt => u32::from(crc16_ccitt(0x1D0F, bytes)),
            Self::Sum8 => u32::from(bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))),
            Self::Xor8 => u32::from(bytes.iter().fold(0u8, |acc, b| acc ^ b)),
        }
    }

    /// Append `value` in wire order (big-endian)
    pub fn write(self, value: u32, out: &mut Vec<u8>) {
        match self.width() {
            2 => out.extend_from_slice(&(value as u16).to_be_bytes()),
            _ => out.push(value as u8),
        }
    }

    pub fn read(self, bytes: &[u8]) -> u32 {
        bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
    }
}

fn crc16_ccitt(init: u16, bytes: &[u8]) -> u16 {
    let mut crc = init;
    for &b in bytes {
        crc ^= u16::from(b) << 8;
        for _ in 0..8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    /// First byte covered; coverage runs to the end of the payload
    #[serde(default)]
    pub start: usize,
}

/// Single byte holding the total frame length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct LengthByte {
    pub offset: usize,
    /// Added to the total length before it is written
    #[serde(default)]
    pub adjust: i16,
}

impl LengthByte {
    pub fn encode(&self, total: usize) -> Option<u8> {
        u8::try_from(total as i64 + i64::from(self.adjust)).ok()
    }

    pub fn total(&self, value: u8) -> Option<usize> {
        usize::try_from(i64::from(value) - i64::from(self.adjust)).ok()
    }
}

#[derive(Debug, Clone)]
pub struct Telemetry {
    /// Exact size of every telemetry frame, trailer included
    pub frame_size: usize,
    pub prefix: Option<Vec<u8>>,
    pub fields: Vec<FieldDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Big,
    Little,
}

/// Position of a value inside a frame
///
/// `span()` bytes starting at `offset` are read as one integer in `endian`
/// order, shifted right by `bit` and masked to `width` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitLayout {
    pub offset: usize,
    pub bit: u8,
    pub width: u8,
    pub endian: Endian,
    pub signed: bool,
}

impl BitLayout {
    pub fn span(&self) -> usize {
        (usize::from(self.bit) + usize::from(self.width)).div_ceil(8)
    }

    pub fn end(&self) -> usize {
        self.offset + self.span()
    }

    pub fn mask(&self) -> u64 {
        if self.width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        }
    }

    /// Smallest and largest value the layout can carry
    pub fn range(&self) -> (i128, i128) {
        if self.signed {
            let half = 1i128 << (self.width - 1);
            (-half, half - 1)
        } else {
            (0, i128::from(self.mask()))
        }
    }

    pub fn read(&self, bytes: &[u8]) -> Option<u64> {
        self.read_word(bytes)
            .map(|word| (word >> self.bit) & self.mask())
    }

    /// Overwrite the layout's bits, leaving neighbouring bits untouched
    pub fn write(&self, bytes: &mut [u8], raw: u64) -> bool {
        let Some(current) = self.read_word(bytes) else {
            return false;
        };
        let mask = self.mask() << self.bit;
        let mut word = (current & !mask) | ((raw << self.bit) & mask);
        let span = self.span();
        let Some(window) = bytes.get_mut(self.offset..self.offset + span) else {
            return false;
        };
        match self.endian {
            Endian::Big => {
                for byte in window.iter_mut().rev() {
                    *byte = (word & 0xFF) as u8;
                    word >>= 8;
                }
            }
            Endian::Little => {
                for byte in window.iter_mut() {
                    *byte = (word & 0xFF) as u8;
                    word >>= 8;
                }
            }
        }
        true
    }

    fn read_word(&self, bytes: &[u8]) -> Option<u64> {
        let window = bytes.get(self.offset..self.end())?;
        Some(match self.endian {
            Endian::Big => window.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
            Endian::Little => window
                .iter()
                .rev()
                .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
        })
    }

    /// Interpret raw bits, sign-extending when the layout is signed
    pub fn to_value(&self, raw: u64) -> i128 {
        if self.signed && self.width < 64 {
            let shift = 64 - u32::from(self.width);
            i128::from(((raw << shift) as i64) >> shift)
        } else if self.signed {
            i128::from(raw as i64)
        } else {
            i128::from(raw)
        }
    }

    /// Inverse of [`to_value`](Self::to_value); `None` when out of range
    pub fn to_raw(&self, value: i128) -> Option<u64> {
        let (min, max) = self.range();
        if value < min || value > max {
            return None;
        }
        Some((value as u64) & self.mask())
    }
}

/// Semantic type of a field or parameter
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Integer,
    Boolean,
    Enumeration(Enumeration),
    /// Bit index -> label
    Flags(BTreeMap<u8, String>),
    Decimal(Transform),
}

impl FieldKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Integer => "an integer",
            Self::Boolean => "a boolean",
            Self::Enumeration(_) => "an enumeration label",
            Self::Flags(_) => "a set of flag labels",
            Self::Decimal(_) => "a number",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Enumeration {
    pub labels: BTreeMap<u64, String>,
    /// Raw values without a label are expected and decode as unrecognized
    pub open: bool,
}

impl Enumeration {
    pub fn label(&self, raw: u64) -> Option<&str> {
        self.labels.get(&raw).map(String::as_str)
    }

    pub fn raw_for(&self, label: &str) -> Option<u64> {
        self.labels
            .iter()
            .find(|(_, l)| l.as_str() == label)
            .map(|(raw, _)| *raw)
    }
}

/// Linear `value = raw * scale + offset` mapping
///
/// Decoded values are rounded to the decimal precision of `scale` and
/// `offset`, so decoding yields the same number a caller would type and
/// encode/decode cycles never drift.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub scale: f64,
    pub offset: f64,
    precision: i32,
}

impl Transform {
    pub fn new(scale: f64, offset: f64) -> Self {
        let precision = decimal_places(scale).max(decimal_places(offset));
        Self {
            scale,
            offset,
            precision,
        }
    }

    pub fn decode(&self, raw: i128) -> f64 {
        let value = raw as f64 * self.scale + self.offset;
        let factor = 10f64.powi(self.precision);
        let scaled = value * factor;
        // Past 2^52 (or an infinite factor) rounding is a no-op at best
        if scaled.is_finite() && scaled.abs() < 4.5e15 {
            scaled.round() / factor
        } else {
            value
        }
    }

    /// Nearest raw value, `None` for non-finite input
    pub fn encode(&self, value: f64) -> Option<i128> {
        let raw = ((value - self.offset) / self.scale).round();
        raw.is_finite().then_some(raw as i128)
    }
}

/// Digits after the point in the shortest form of `v`
///
/// Never capped: the rounding step must stay at or below `scale`, however
/// small, or distinct raws would decode to the same value.
fn decimal_places(v: f64) -> i32 {
    let text = format!("{v}");
    text.split_once('.')
        .map_or(0, |(_, frac)| i32::try_from(frac.len()).unwrap_or(i32::MAX))
}

/// Optional value bounds, in decoded units
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Bounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Bounds {
    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

/// One telemetry field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    pub layout: BitLayout,
    pub bounds: Bounds,
    pub unit: Option<String>,
}

/// One controllable action
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDescriptor {
    pub name: String,
    pub description: Option<String>,
    /// Fields this command changes; at most one command per field is in flight
    pub targets: Vec<String>,
    pub params: Vec<ParamDescriptor>,
    /// Frame body before parameters, length, sequence and trailer are applied
    pub template: Vec<u8>,
    pub ack: Option<AckPattern>,
}

impl CommandDescriptor {
    pub fn param(&self, name: &str) -> Option<&ParamDescriptor> {
        self.params.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDescriptor {
    pub name: String,
    /// Field this parameter was typed from, if any
    pub field: Option<String>,
    pub kind: FieldKind,
    /// Position inside the command template
    pub layout: BitLayout,
    pub bounds: Bounds,
    /// Optional parameters keep the template's bytes when omitted
    pub required: bool,
}

/// Shape of the frame that acknowledges a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPattern {
    pub prefix: Vec<u8>,
    pub length: Option<usize>,
}

impl AckPattern {
    pub fn matches(&self, frame: &[u8]) -> bool {
        frame.starts_with(&self.prefix) && self.length.map_or(true, |len| frame.len() == len)
    }
}

/// Session conventions for the local transport
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub port: Option<u16>,
    pub handshake: Option<Handshake>,
    /// Keepalive frame; any inbound traffic counts as the answer
    pub probe: Option<Vec<u8>>,
    /// Frame asking the appliance for a fresh telemetry frame
    pub refresh: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub request: Vec<u8>,
    /// Prefix of the frame that completes the handshake
    pub response: Vec<u8>,
}

// ========== Document shape ==========

#[derive(Deserialize)]
struct ProfileDoc {
    model: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    framing: FramingDoc,
    telemetry: TelemetryDoc,
    #[serde(default)]
    commands: Vec<CommandDoc>,
    #[serde(default)]
    session: SessionDoc,
    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

#[derive(Deserialize, Default)]
struct FramingDoc {
    #[serde(default)]
    checksum: Option<Checksum>,
    #[serde(default)]
    terminator: Option<String>,
    #[serde(default)]
    length: Option<LengthByte>,
    #[serde(default)]
    sequence_offset: Option<usize>,
}

#[derive(Deserialize)]
struct TelemetryDoc {
    frame_size: usize,
    #[serde(default)]
    prefix: Option<String>,
    fields: Vec<SlotDoc>,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum FieldType {
    Integer,
    Boolean,
    Enumeration,
    Flags,
    Decimal,
}

#[derive(Deserialize)]
struct TransformDoc {
    scale: f64,
    #[serde(default)]
    offset: f64,
}

/// A field or a command parameter
#[derive(Deserialize)]
struct SlotDoc {
    name: String,
    #[serde(rename = "type", default)]
    kind: Option<FieldType>,
    #[serde(default)]
    field: Option<String>,
    offset: usize,
    #[serde(default)]
    bit: u8,
    #[serde(default)]
    width: Option<u8>,
    #[serde(default)]
    endian: Option<Endian>,
    #[serde(default)]
    signed: Option<bool>,
    #[serde(default)]
    transform: Option<TransformDoc>,
    #[serde(default)]
    values: BTreeMap<String, String>,
    #[serde(default)]
    open: bool,
    #[serde(default)]
    flags: BTreeMap<String, String>,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default = "default_required")]
    required: bool,
}

fn default_required() -> bool {
    true
}

#[derive(Deserialize)]
struct CommandDoc {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    targets: Vec<String>,
    template: String,
    #[serde(default)]
    params: Vec<SlotDoc>,
    #[serde(default)]
    ack: Option<AckDoc>,
}

#[derive(Deserialize)]
struct AckDoc {
    prefix: String,
    #[serde(default)]
    length: Option<usize>,
}

#[derive(Deserialize, Default)]
struct SessionDoc {
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    handshake: Option<HandshakeDoc>,
    #[serde(default)]
    probe: Option<String>,
    #[serde(default)]
    refresh: Option<String>,
}

#[derive(Deserialize)]
struct HandshakeDoc {
    request: String,
    response: String,
}

impl ProfileDoc {
    fn build(self) -> Result<DeviceProfile, ProfileError> {
        if self.model.trim().is_empty() {
            return Err(ProfileError::invalid("model", "model identifier is empty"));
        }

        let framing = Framing {
            checksum: self.framing.checksum,
            terminator: self
                .framing
                .terminator
                .as_deref()
                .map(|t| decode_hex("framing.terminator", t))
                .transpose()?,
            length: self.framing.length,
            sequence_offset: self.framing.sequence_offset,
        };
        if framing.terminator.as_ref().is_some_and(Vec::is_empty) {
            return Err(ProfileError::invalid("framing.terminator", "terminator is empty"));
        }

        let telemetry = build_telemetry(self.telemetry, &framing)?;

        let mut seen = HashSet::new();
        let mut commands = Vec::with_capacity(self.commands.len());
        for doc in self.commands {
            if !seen.insert(doc.name.clone()) {
                return Err(ProfileError::DuplicateCommand(doc.name));
            }
            commands.push(build_command(doc, &telemetry, &framing)?);
        }

        for (alias, field) in &self.aliases {
            if !telemetry.fields.iter().any(|f| &f.name == field) {
                return Err(ProfileError::UnknownAlias {
                    alias: alias.clone(),
                    field: field.clone(),
                });
            }
        }

        let session = SessionSettings {
            port: self.session.port,
            handshake: self
                .session
                .handshake
                .map(|h| -> Result<Handshake, ProfileError> {
                    Ok(Handshake {
                        request: decode_hex("session.handshake.request", &h.request)?,
                        response: decode_hex("session.handshake.response", &h.response)?,
                    })
                })
                .transpose()?,
            probe: self
                .session
                .probe
                .as_deref()
                .map(|p| decode_hex("session.probe", p))
                .transpose()?,
            refresh: self
                .session
                .refresh
                .as_deref()
                .map(|r| decode_hex("session.refresh", r))
                .transpose()?,
        };

        Ok(DeviceProfile {
            name: self.name.unwrap_or_else(|| self.model.clone()),
            model: self.model,
            description: self.description,
            framing,
            telemetry,
            commands,
            session,
            aliases: self.aliases,
        })
    }
}

fn build_telemetry(doc: TelemetryDoc, framing: &Framing) -> Result<Telemetry, ProfileError> {
    let trailer = framing.trailer_len();
    if doc.frame_size <= trailer || doc.frame_size > MAX_FRAME_SIZE {
        return Err(ProfileError::invalid(
            "telemetry.frame_size",
            format!("{} bytes cannot hold a payload and a {trailer}-byte trailer", doc.frame_size),
        ));
    }
    let payload_end = doc.frame_size - trailer;
    check_framing_offsets("telemetry", framing, payload_end)?;
    check_length_byte("telemetry", framing, doc.frame_size)?;

    let prefix = doc
        .prefix
        .as_deref()
        .map(|p| decode_hex("telemetry.prefix", p))
        .transpose()?;
    if let Some(prefix) = &prefix {
        check_bounds("telemetry.prefix", 0, prefix.len(), payload_end)?;
    }

    let mut seen = HashSet::new();
    let mut fields = Vec::with_capacity(doc.fields.len());
    for slot in doc.fields {
        if !seen.insert(slot.name.clone()) {
            return Err(ProfileError::DuplicateField(slot.name));
        }
        let (kind, layout, bounds) = build_slot(&slot, None, true)?;
        check_bounds(&slot.name, layout.offset, layout.end(), payload_end)?;
        fields.push(FieldDescriptor {
            name: slot.name,
            kind,
            layout,
            bounds,
            unit: slot.unit,
        });
    }

    Ok(Telemetry {
        frame_size: doc.frame_size,
        prefix,
        fields,
    })
}

fn build_command(
    doc: CommandDoc,
    telemetry: &Telemetry,
    framing: &Framing,
) -> Result<CommandDescriptor, ProfileError> {
    let template = decode_hex(&doc.name, &doc.template)?;
    if template.is_empty() {
        return Err(ProfileError::invalid(&doc.name, "command template is empty"));
    }
    if template.len() + framing.trailer_len() > MAX_FRAME_SIZE {
        return Err(ProfileError::invalid(&doc.name, "command frame is too large"));
    }
    check_framing_offsets(&doc.name, framing, template.len())?;
    check_length_byte(&doc.name, framing, template.len() + framing.trailer_len())?;
    if let Some(start) = framing.checksum.map(|c| c.start) {
        check_bounds(&doc.name, start, start, template.len())?;
    }

    for target in &doc.targets {
        if !telemetry.fields.iter().any(|f| &f.name == target) {
            return Err(ProfileError::UnknownTarget {
                command: doc.name.clone(),
                field: target.clone(),
            });
        }
    }

    let mut seen = HashSet::new();
    let mut params = Vec::with_capacity(doc.params.len());
    for slot in &doc.params {
        if !seen.insert(slot.name.clone()) {
            return Err(ProfileError::DuplicateParam {
                command: doc.name.clone(),
                param: slot.name.clone(),
            });
        }
        let base = match &slot.field {
            Some(field) => Some(
                telemetry
                    .fields
                    .iter()
                    .find(|f| &f.name == field)
                    .ok_or_else(|| ProfileError::UnknownTarget {
                        command: doc.name.clone(),
                        field: field.clone(),
                    })?,
            ),
            None => None,
        };
        let (kind, layout, bounds) = build_slot(slot, base, false)?;
        check_bounds(
            &format!("{}.{}", doc.name, slot.name),
            layout.offset,
            layout.end(),
            template.len(),
        )?;
        params.push(ParamDescriptor {
            name: slot.name.clone(),
            field: slot.field.clone(),
            kind,
            layout,
            bounds,
            required: slot.required,
        });
    }

    let ack = doc
        .ack
        .map(|a| -> Result<AckPattern, ProfileError> {
            let prefix = decode_hex(&format!("{}.ack", doc.name), &a.prefix)?;
            if prefix.is_empty() {
                return Err(ProfileError::invalid(&doc.name, "ack prefix is empty"));
            }
            Ok(AckPattern {
                prefix,
                length: a.length,
            })
        })
        .transpose()?;

    Ok(CommandDescriptor {
        name: doc.name,
        description: doc.description,
        targets: doc.targets,
        params,
        template,
        ack,
    })
}

fn build_slot(
    doc: &SlotDoc,
    base: Option<&FieldDescriptor>,
    require_complete: bool,
) -> Result<(FieldKind, BitLayout, Bounds), ProfileError> {
    let declared = doc.kind;
    let default_width = match declared {
        Some(FieldType::Boolean) => 1,
        Some(_) => 8,
        None => base.map_or(8, |b| b.layout.width),
    };
    let width = doc.width.unwrap_or(default_width);
    if width == 0 || width > 64 || u32::from(doc.bit) + u32::from(width) > 64 {
        return Err(ProfileError::invalid(
            &doc.name,
            format!("bit {} width {width} does not fit a 64-bit window", doc.bit),
        ));
    }

    let layout = BitLayout {
        offset: doc.offset,
        bit: doc.bit,
        width,
        endian: doc
            .endian
            .or(base.map(|b| b.layout.endian))
            .unwrap_or_default(),
        signed: doc
            .signed
            .or(base.map(|b| b.layout.signed))
            .unwrap_or(false),
    };

    let kind = match (declared, base) {
        (Some(kind), _) => build_kind(doc, kind, &layout, require_complete)?,
        (None, Some(base)) => base.kind.clone(),
        (None, None) => return Err(ProfileError::invalid(&doc.name, "missing 'type'")),
    };

    let bounds = Bounds {
        min: doc.min.or(base.and_then(|b| b.bounds.min)),
        max: doc.max.or(base.and_then(|b| b.bounds.max)),
    };
    if let (Some(min), Some(max)) = (bounds.min, bounds.max) {
        if min > max {
            return Err(ProfileError::invalid(&doc.name, "min is greater than max"));
        }
    }

    Ok((kind, layout, bounds))
}

fn build_kind(
    doc: &SlotDoc,
    kind: FieldType,
    layout: &BitLayout,
    require_complete: bool,
) -> Result<FieldKind, ProfileError> {
    Ok(match kind {
        FieldType::Integer => {
            if layout.width == 64 && !layout.signed {
                return Err(ProfileError::invalid(
                    &doc.name,
                    "unsigned 64-bit integers do not fit a signed value; use a narrower width or 'signed'",
                ));
            }
            FieldKind::Integer
        }
        FieldType::Boolean => FieldKind::Boolean,
        FieldType::Enumeration => {
            if doc.values.is_empty() {
                return Err(ProfileError::invalid(&doc.name, "enumeration has no values"));
            }
            let mut labels = BTreeMap::new();
            let mut seen = HashSet::new();
            for (key, label) in &doc.values {
                let raw = parse_raw(&doc.name, key)?;
                if raw > layout.mask() {
                    return Err(ProfileError::invalid(
                        &doc.name,
                        format!("value {raw} does not fit in {} bits", layout.width),
                    ));
                }
                if !seen.insert(label.as_str()) {
                    return Err(ProfileError::invalid(
                        &doc.name,
                        format!("label '{label}' is used twice"),
                    ));
                }
                labels.insert(raw, label.clone());
            }
            if require_complete && !doc.open {
                let capacity = 1u128 << layout.width;
                if labels.len() as u128 != capacity {
                    return Err(ProfileError::IncompleteEnumeration(doc.name.clone()));
                }
            }
            FieldKind::Enumeration(Enumeration {
                labels,
                open: doc.open,
            })
        }
        FieldType::Flags => {
            if doc.flags.is_empty() {
                return Err(ProfileError::invalid(&doc.name, "flag set has no flags"));
            }
            let mut flags = BTreeMap::new();
            for (key, label) in &doc.flags {
                let bit = parse_raw(&doc.name, key)?;
                if bit >= u64::from(layout.width) {
                    return Err(ProfileError::invalid(
                        &doc.name,
                        format!("flag bit {bit} is outside the {}-bit field", layout.width),
                    ));
                }
                flags.insert(bit as u8, label.clone());
            }
            FieldKind::Flags(flags)
        }
        FieldType::Decimal => {
            let (scale, offset) = doc
                .transform
                .as_ref()
                .map_or((1.0, 0.0), |t| (t.scale, t.offset));
            if layout.width > MAX_DECIMAL_WIDTH {
                return Err(ProfileError::invalid(
                    &doc.name,
                    format!("decimal fields hold at most {MAX_DECIMAL_WIDTH} bits"),
                ));
            }
            if !scale.is_finite() || scale == 0.0 || !offset.is_finite() {
                return Err(ProfileError::invalid(
                    &doc.name,
                    "transform needs a finite, non-zero scale and a finite offset",
                ));
            }
            FieldKind::Decimal(Transform::new(scale, offset))
        }
    })
}

fn check_framing_offsets(name: &str, framing: &Framing, limit: usize) -> Result<(), ProfileError> {
    if let Some(length) = framing.length {
        check_bounds(&format!("{name}: length byte"), length.offset, length.offset + 1, limit)?;
    }
    if let Some(offset) = framing.sequence_offset {
        check_bounds(&format!("{name}: sequence byte"), offset, offset + 1, limit)?;
    }
    Ok(())
}

fn check_length_byte(name: &str, framing: &Framing, total: usize) -> Result<(), ProfileError> {
    match framing.length {
        Some(length) if length.encode(total).is_none() => Err(ProfileError::invalid(
            name,
            format!("a {total}-byte frame does not fit the length byte"),
        )),
        _ => Ok(()),
    }
}

fn check_bounds(name: &str, start: usize, end: usize, limit: usize) -> Result<(), ProfileError> {
    if end > limit || start > end {
        return Err(ProfileError::OutOfBounds {
            name: name.to_string(),
            start,
            end,
            limit,
        });
    }
    Ok(())
}

fn parse_raw(name: &str, key: &str) -> Result<u64, ProfileError> {
    let key = key.trim();
    let parsed = match key.strip_prefix("0x").or_else(|| key.strip_prefix("0X")) {
        Some(digits) => u64::from_str_radix(digits, 16),
        None => key.parse::<u64>(),
    };
    parsed.map_err(|_| ProfileError::invalid(name, format!("'{key}' is not a raw value")))
}

fn decode_hex(name: &str, text: &str) -> Result<Vec<u8>, ProfileError> {
    let compact: String = text.split_whitespace().collect();
    hex::decode(compact).map_err(|source| ProfileError::Hex {
        name: name.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_with_fields(fields: &str) -> String {
        format!(
            r#"{{
                "model": "test",
                "telemetry": {{ "frame_size": 8, "fields": [{fields}] }}
            }}"#
        )
    }

    #[test]
    fn test_bit_layout_big_endian_window() {
        let layout = BitLayout {
            offset: 1,
            bit: 4,
            width: 8,
            endian: Endian::Big,
            signed: false,
        };
        let bytes = [0x00, 0x0A, 0xB0, 0x00];
        assert_eq!(layout.span(), 2);
        assert_eq!(layout.read(&bytes), Some(0xAB));

        let mut out = [0xFF; 4];
        assert!(layout.write(&mut out, 0x12));
        assert_eq!(out, [0xFF, 0xF1, 0x2F, 0xFF]);
    }

    #[test]
    fn test_bit_layout_little_endian_signed() {
        let layout = BitLayout {
            offset: 0,
            bit: 0,
            width: 16,
            endian: Endian::Little,
            signed: true,
        };
        let bytes = [0xFE, 0xFF];
        let raw = layout.read(&bytes).unwrap();
        assert_eq!(layout.to_value(raw), -2);
        assert_eq!(layout.to_raw(-2), Some(0xFFFE));
        assert_eq!(layout.to_raw(40_000), None);
    }

    #[test]
    fn test_transform_has_no_drift() {
        let t = Transform::new(0.1, 0.0);
        assert_eq!(t.decode(925), 92.5);
        for raw in 0..=u16::MAX as i128 {
            assert_eq!(t.encode(t.decode(raw)), Some(raw));
        }
    }

    #[test]
    fn test_tiny_scale_keeps_every_raw() {
        let t = Transform::new(1e-13, 0.0);
        assert!((t.decode(3) - 3e-13).abs() < 1e-25);
        for raw in 0..=1000 {
            assert_eq!(t.encode(t.decode(raw)), Some(raw));
        }

        let t = Transform::new(2.5e-20, 0.0);
        for raw in [0, 1, 7, 255] {
            assert_eq!(t.encode(t.decode(raw)), Some(raw));
        }
    }

    #[test]
    fn test_rejects_lossy_numeric_widths() {
        let unsigned = profile_with_fields(r#"{ "name": "odometer", "type": "integer", "offset": 0, "width": 64 }"#);
        assert!(matches!(
            DeviceProfile::from_json(&unsigned),
            Err(ProfileError::InvalidDescriptor { name, .. }) if name == "odometer"
        ));
        let signed = profile_with_fields(
            r#"{ "name": "odometer", "type": "integer", "offset": 0, "width": 64, "signed": true }"#,
        );
        assert!(DeviceProfile::from_json(&signed).is_ok());
        let narrower = profile_with_fields(r#"{ "name": "odometer", "type": "integer", "offset": 0, "width": 63 }"#);
        assert!(DeviceProfile::from_json(&narrower).is_ok());

        let decimal = profile_with_fields(
            r#"{ "name": "energy", "type": "decimal", "offset": 0, "width": 56,
                 "transform": { "scale": 0.01 } }"#,
        );
        assert!(matches!(
            DeviceProfile::from_json(&decimal),
            Err(ProfileError::InvalidDescriptor { name, .. }) if name == "energy"
        ));
    }

    #[test]
    fn test_crc16_variants() {
        // Standard check value for "123456789"
        assert_eq!(ChecksumAlgorithm::Crc16CcittFalse.compute(b"123456789"), 0x29B1);
        assert_eq!(ChecksumAlgorithm::Crc16AugCcitt.compute(b"123456789"), 0xE5CC);
    }

    #[test]
    fn test_rejects_duplicate_field() {
        let json = profile_with_fields(
            r#"{ "name": "a", "type": "integer", "offset": 0 },
               { "name": "a", "type": "integer", "offset": 1 }"#,
        );
        assert!(matches!(
            DeviceProfile::from_json(&json),
            Err(ProfileError::DuplicateField(name)) if name == "a"
        ));
    }

    #[test]
    fn test_rejects_field_past_frame_end() {
        let json = profile_with_fields(r#"{ "name": "wide", "type": "integer", "offset": 7, "width": 16 }"#);
        assert!(matches!(
            DeviceProfile::from_json(&json),
            Err(ProfileError::OutOfBounds { name, .. }) if name == "wide"
        ));
    }

    #[test]
    fn test_closed_enumeration_must_be_complete() {
        let json = profile_with_fields(
            r#"{ "name": "mode", "type": "enumeration", "offset": 0, "width": 2,
                 "values": { "0": "off", "1": "on" } }"#,
        );
        assert!(matches!(
            DeviceProfile::from_json(&json),
            Err(ProfileError::IncompleteEnumeration(name)) if name == "mode"
        ));

        let open = profile_with_fields(
            r#"{ "name": "mode", "type": "enumeration", "offset": 0, "width": 2, "open": true,
                 "values": { "0": "off", "1": "on" } }"#,
        );
        assert!(DeviceProfile::from_json(&open).is_ok());
    }

    #[test]
    fn test_parse_raw_accepts_hex() {
        assert_eq!(parse_raw("x", "0x1F").unwrap(), 31);
        assert_eq!(parse_raw("x", " 7 ").unwrap(), 7);
        assert!(parse_raw("x", "seven").is_err());
    }
}
