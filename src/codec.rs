//! Schema-driven frame codec
//!
//! Decoding and encoding are pure functions of a [`DeviceProfile`] and the
//! input; no per-model code exists anywhere in the crate.

use crate::error::{EncodeError, FrameError};
use crate::profile::{
    BitLayout, Bounds, CommandDescriptor, DeviceProfile, FieldKind, Framing, LengthByte,
    MAX_FRAME_SIZE,
};
use crate::types::{FieldMap, FieldValue, Params};
use std::sync::Arc;

/// Decode a telemetry frame into field values
///
/// Every field is extracted independently, so an unrecognized enumeration
/// value only affects its own field.
pub fn decode(profile: &DeviceProfile, frame: &[u8]) -> Result<FieldMap, FrameError> {
    let telemetry = &profile.telemetry;
    if frame.len() != telemetry.frame_size {
        return Err(FrameError::Length {
            expected: telemetry.frame_size,
            actual: frame.len(),
        });
    }
    verify_trailer(&profile.framing, frame)?;
    if let Some(prefix) = &telemetry.prefix {
        if !frame.starts_with(prefix) {
            return Err(FrameError::Prefix);
        }
    }

    let mut values = FieldMap::new();
    for field in &telemetry.fields {
        if let Some(raw) = field.layout.read(frame) {
            values.insert(field.name.clone(), decode_value(&field.kind, &field.layout, raw));
        }
    }
    Ok(values)
}

/// Build a complete command frame, trailer included
pub fn encode(
    profile: &DeviceProfile,
    command: &CommandDescriptor,
    params: &Params,
) -> Result<Vec<u8>, EncodeError> {
    encode_sequenced(profile, command, params, None)
}

/// [`encode`] with a correlation byte written at the profile's sequence offset
pub fn encode_sequenced(
    profile: &DeviceProfile,
    command: &CommandDescriptor,
    params: &Params,
    sequence: Option<u8>,
) -> Result<Vec<u8>, EncodeError> {
    if let Some(unknown) = params.keys().find(|name| command.param(name).is_none()) {
        return Err(EncodeError::UnexpectedParameter {
            command: command.name.clone(),
            param: unknown.clone(),
        });
    }

    let mut body = command.template.clone();
    for param in &command.params {
        match params.get(&param.name) {
            Some(value) => {
                let raw = encode_value(&param.name, &param.kind, &param.layout, &param.bounds, value)?;
                param.layout.write(&mut body, raw);
            }
            None if param.required => {
                return Err(EncodeError::MissingParameter {
                    command: command.name.clone(),
                    param: param.name.clone(),
                });
            }
            None => {}
        }
    }

    Ok(finish_frame(&profile.framing, body, sequence))
}

/// Read the parameters back out of a command frame
pub fn decode_params(
    profile: &DeviceProfile,
    command: &CommandDescriptor,
    frame: &[u8],
) -> Result<Params, FrameError> {
    let expected = command.template.len() + profile.framing.trailer_len();
    if frame.len() != expected {
        return Err(FrameError::Length {
            expected,
            actual: frame.len(),
        });
    }
    verify_trailer(&profile.framing, frame)?;

    let mut params = Params::new();
    for param in &command.params {
        if let Some(raw) = param.layout.read(frame) {
            params.insert(param.name.clone(), decode_value(&param.kind, &param.layout, raw));
        }
    }
    Ok(params)
}

/// Complete a raw payload with the profile's length byte and trailer
///
/// Used for the session probe and refresh requests, which the profile
/// declares as bare payloads.
pub fn frame(profile: &DeviceProfile, body: &[u8]) -> Vec<u8> {
    finish_frame(&profile.framing, body.to_vec(), None)
}

/// Correlation byte of a command or acknowledgement frame
pub fn sequence_of(profile: &DeviceProfile, frame: &[u8]) -> Option<u8> {
    profile
        .framing
        .sequence_offset
        .and_then(|offset| frame.get(offset).copied())
}

fn finish_frame(framing: &Framing, mut body: Vec<u8>, sequence: Option<u8>) -> Vec<u8> {
    if let (Some(offset), Some(seq)) = (framing.sequence_offset, sequence) {
        if let Some(byte) = body.get_mut(offset) {
            *byte = seq;
        }
    }

    let total = body.len() + framing.trailer_len();
    if let Some(length) = framing.length {
        if let (Some(value), Some(byte)) = (length.encode(total), body.get_mut(length.offset)) {
            *byte = value;
        }
    }

    if let Some(checksum) = framing.checksum {
        let value = checksum
            .algorithm
            .compute(body.get(checksum.start..).unwrap_or_default());
        checksum.algorithm.write(value, &mut body);
    }
    if let Some(terminator) = &framing.terminator {
        body.extend_from_slice(terminator);
    }
    body
}

/// Check terminator and checksum; returns the payload length
fn verify_trailer(framing: &Framing, frame: &[u8]) -> Result<usize, FrameError> {
    let mut end = frame.len();

    if let Some(terminator) = &framing.terminator {
        if !frame.ends_with(terminator) {
            return Err(FrameError::Terminator);
        }
        end -= terminator.len();
    }

    if let Some(checksum) = framing.checksum {
        let width = checksum.algorithm.width();
        let (Some(covered), Some(carried)) = (
            end.checked_sub(width)
                .and_then(|stop| frame.get(checksum.start..stop)),
            end.checked_sub(width).and_then(|stop| frame.get(stop..end)),
        ) else {
            return Err(FrameError::Length {
                expected: checksum.start + width,
                actual: end,
            });
        };
        let found = checksum.algorithm.read(carried);
        let computed = checksum.algorithm.compute(covered);
        if found != computed {
            return Err(FrameError::Checksum { found, computed });
        }
        end -= width;
    }

    Ok(end)
}

fn decode_value(kind: &FieldKind, layout: &BitLayout, raw: u64) -> FieldValue {
    match kind {
        FieldKind::Integer => {
            FieldValue::Integer(i64::try_from(layout.to_value(raw)).unwrap_or(i64::MAX))
        }
        FieldKind::Boolean => FieldValue::Boolean(raw != 0),
        FieldKind::Enumeration(enumeration) => match enumeration.label(raw) {
            Some(label) => FieldValue::Enum(label.to_string()),
            None => FieldValue::Unrecognized(raw),
        },
        FieldKind::Flags(flags) => FieldValue::Flags(
            flags
                .iter()
                .filter(|(bit, _)| raw & (1u64 << **bit) != 0)
                .map(|(_, label)| label.clone())
                .collect(),
        ),
        FieldKind::Decimal(transform) => FieldValue::Decimal(transform.decode(layout.to_value(raw))),
    }
}

fn encode_value(
    param: &str,
    kind: &FieldKind,
    layout: &BitLayout,
    bounds: &Bounds,
    value: &FieldValue,
) -> Result<u64, EncodeError> {
    let mismatch = || EncodeError::TypeMismatch {
        param: param.to_string(),
        expected: kind.type_name(),
    };
    let out_of_range = |shown: String| EncodeError::OutOfRange {
        param: param.to_string(),
        value: shown,
    };

    match kind {
        FieldKind::Integer => {
            let v = value.as_i64().ok_or_else(mismatch)?;
            if !bounds.contains(v as f64) {
                return Err(out_of_range(v.to_string()));
            }
            layout
                .to_raw(i128::from(v))
                .ok_or_else(|| out_of_range(v.to_string()))
        }
        FieldKind::Boolean => value.as_bool().map(u64::from).ok_or_else(mismatch),
        FieldKind::Enumeration(enumeration) => match value {
            FieldValue::Enum(label) => {
                enumeration
                    .raw_for(label)
                    .ok_or_else(|| EncodeError::NotInEnumeration {
                        param: param.to_string(),
                        value: label.clone(),
                    })
            }
            FieldValue::Unrecognized(raw) if enumeration.open && *raw <= layout.mask() => Ok(*raw),
            FieldValue::Unrecognized(raw) => Err(EncodeError::NotInEnumeration {
                param: param.to_string(),
                value: raw.to_string(),
            }),
            _ => Err(mismatch()),
        },
        FieldKind::Flags(flags) => {
            let FieldValue::Flags(set) = value else {
                return Err(mismatch());
            };
            set.iter().try_fold(0u64, |raw, label| {
                flags
                    .iter()
                    .find(|(_, l)| *l == label)
                    .map(|(bit, _)| raw | (1u64 << *bit))
                    .ok_or_else(|| EncodeError::NotInEnumeration {
                        param: param.to_string(),
                        value: label.clone(),
                    })
            })
        }
        FieldKind::Decimal(transform) => {
            let v = value.as_f64().ok_or_else(mismatch)?;
            if !v.is_finite() || !bounds.contains(v) {
                return Err(out_of_range(v.to_string()));
            }
            transform
                .encode(v)
                .and_then(|raw| layout.to_raw(raw))
                .ok_or_else(|| out_of_range(v.to_string()))
        }
    }
}

/// Profile-bound codec shared by the dispatcher and the inbound router
#[derive(Debug, Clone)]
pub struct Codec {
    profile: Arc<DeviceProfile>,
}

impl Codec {
    pub fn new(profile: Arc<DeviceProfile>) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &Arc<DeviceProfile> {
        &self.profile
    }

    pub fn decode(&self, frame: &[u8]) -> Result<FieldMap, FrameError> {
        decode(&self.profile, frame)
    }

    /// Encode a command by name
    pub fn encode(&self, command: &str, params: &Params) -> Result<Vec<u8>, EncodeError> {
        let descriptor = self
            .profile
            .command(command)
            .ok_or_else(|| EncodeError::UnknownCommand(command.to_string()))?;
        encode(&self.profile, descriptor, params)
    }

    pub fn encode_sequenced(
        &self,
        command: &CommandDescriptor,
        params: &Params,
        sequence: Option<u8>,
    ) -> Result<Vec<u8>, EncodeError> {
        encode_sequenced(&self.profile, command, params, sequence)
    }

    pub fn frame(&self, body: &[u8]) -> Vec<u8> {
        frame(&self.profile, body)
    }

    pub fn sequence_of(&self, frame: &[u8]) -> Option<u8> {
        sequence_of(&self.profile, frame)
    }
}

/// How frame boundaries are found in a byte stream
#[derive(Debug, Clone)]
enum Boundary {
    Terminator(Vec<u8>),
    /// Length byte, with the largest frame the profile can produce
    Length(LengthByte, usize),
    /// Fixed size, plus the prefixes a frame may start with when every
    /// frame is known to carry one
    Fixed(usize, Vec<Vec<u8>>),
}

/// Cuts a byte stream into frames
///
/// Terminator framing wins over a length byte, which wins over the fixed
/// telemetry size. Bytes that cannot start a valid frame are discarded.
#[derive(Debug, Clone)]
pub struct FrameSplitter {
    boundary: Boundary,
    buf: Vec<u8>,
}

impl FrameSplitter {
    pub fn new(profile: &DeviceProfile) -> Self {
        let framing = &profile.framing;
        let boundary = match (&framing.terminator, framing.length) {
            (Some(terminator), _) => Boundary::Terminator(terminator.clone()),
            (None, Some(length)) => {
                let trailer = framing.trailer_len();
                let largest = profile
                    .commands
                    .iter()
                    .flat_map(|c| {
                        let ack = c.ack.as_ref().and_then(|a| a.length).unwrap_or(0);
                        [c.template.len() + trailer, ack]
                    })
                    .fold(profile.telemetry.frame_size, usize::max);
                Boundary::Length(length, largest.min(MAX_FRAME_SIZE))
            }
            (None, None) => {
                let starts = match &profile.telemetry.prefix {
                    Some(prefix) if !prefix.is_empty() => std::iter::once(prefix.clone())
                        .chain(
                            profile
                                .commands
                                .iter()
                                .filter_map(|c| c.ack.as_ref().map(|a| a.prefix.clone())),
                        )
                        .collect(),
                    _ => Vec::new(),
                };
                Boundary::Fixed(profile.telemetry.frame_size, starts)
            }
        };
        Self {
            boundary,
            buf: Vec::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet part of a complete frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        match &self.boundary {
            Boundary::Terminator(terminator) => {
                let found = self
                    .buf
                    .windows(terminator.len())
                    .position(|w| w == terminator.as_slice());
                match found {
                    Some(pos) => Some(self.buf.drain(..pos + terminator.len()).collect()),
                    None => {
                        if self.buf.len() > MAX_FRAME_SIZE {
                            tracing::debug!(dropped = self.buf.len(), "no terminator in buffer, resyncing");
                            self.buf.clear();
                        }
                        None
                    }
                }
            }
            Boundary::Length(length, largest) => loop {
                let value = *self.buf.get(length.offset)?;
                match length.total(value) {
                    Some(total) if total > length.offset && total <= *largest => {
                        if self.buf.len() < total {
                            return None;
                        }
                        return Some(self.buf.drain(..total).collect());
                    }
                    _ => {
                        self.buf.remove(0);
                    }
                }
            },
            Boundary::Fixed(size, starts) => {
                let size = *size;
                if !starts.is_empty() {
                    // A partial prefix at the tail is kept for the next push
                    let skip = (0..self.buf.len())
                        .find(|&i| {
                            let tail = &self.buf[i..];
                            starts.iter().any(|start| {
                                let n = tail.len().min(start.len());
                                tail[..n] == start[..n]
                            })
                        })
                        .unwrap_or(self.buf.len());
                    if skip > 0 {
                        tracing::debug!(dropped = skip, "Bytes ahead of a frame prefix, resyncing");
                        self.buf.drain(..skip);
                    }
                }
                (self.buf.len() >= size).then(|| self.buf.drain(..size).collect())
            }
        }
    }
}
