//! Codec tests against hand-built frames.

use cremalink::{
    decode, decode_params, encode, frame, DeviceProfile, EncodeError, FieldValue, FrameError,
    Params, ProfileError, ProfileRepository,
};
use std::collections::BTreeSet;
use std::sync::Arc;

const BREWER: &str = r#"{
    "model": "brewer-12",
    "telemetry": {
        "frame_size": 12,
        "fields": [
            { "name": "brewing", "type": "boolean", "offset": 0, "bit": 0 },
            { "name": "steam", "type": "boolean", "offset": 0, "bit": 1 },
            { "name": "profile", "type": "enumeration", "offset": 1, "open": true,
              "values": { "0": "ESPRESSO", "1": "LUNGO" } },
            { "name": "temperature", "type": "decimal", "offset": 4, "width": 16,
              "transform": { "scale": 0.1 }, "min": 0, "max": 150, "unit": "°C" },
            { "name": "pressure", "type": "decimal", "offset": 6, "signed": true,
              "transform": { "scale": 0.5, "offset": 9 } },
            { "name": "shots", "type": "integer", "offset": 8, "width": 16, "endian": "little" }
        ]
    },
    "commands": [
        { "name": "start_brew", "targets": ["brewing", "profile"], "template": "B0 00 00",
          "params": [ { "name": "profile", "field": "profile", "offset": 1 } ] },
        { "name": "set_temperature", "targets": ["temperature"], "template": "C0 00 00",
          "params": [ { "name": "target", "field": "temperature", "offset": 1 } ] },
        { "name": "set_pressure", "targets": ["pressure"], "template": "C1 00",
          "params": [ { "name": "bar", "field": "pressure", "offset": 1 } ] }
    ]
}"#;

fn brewer() -> DeviceProfile {
    DeviceProfile::from_json(BREWER).unwrap()
}

fn espresso_machine() -> Arc<DeviceProfile> {
    ProfileRepository::with_builtin()
        .unwrap()
        .get("ecam-espresso")
        .unwrap()
}

fn params(pairs: &[(&str, FieldValue)]) -> Params {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

#[test]
fn test_decode_brewing_temperature_frame() {
    let profile = brewer();
    let mut bytes = [0u8; 12];
    bytes[0] = 0x01;
    bytes[4..6].copy_from_slice(&925u16.to_be_bytes());
    bytes[8..10].copy_from_slice(&300u16.to_le_bytes());

    let values = decode(&profile, &bytes).unwrap();
    assert_eq!(values["brewing"], FieldValue::Boolean(true));
    assert_eq!(values["steam"], FieldValue::Boolean(false));
    assert_eq!(values["temperature"], FieldValue::Decimal(92.5));
    assert_eq!(values["profile"], FieldValue::Enum("ESPRESSO".into()));
    assert_eq!(values["pressure"], FieldValue::Decimal(9.0));
    assert_eq!(values["shots"], FieldValue::Integer(300));
}

#[test]
fn test_wrong_length_is_rejected() {
    let profile = brewer();
    for len in [0, 11, 13, 24] {
        let bytes = vec![0u8; len];
        assert_eq!(
            decode(&profile, &bytes),
            Err(FrameError::Length {
                expected: 12,
                actual: len
            })
        );
    }
}

#[test]
fn test_unrecognized_enum_keeps_other_fields() {
    let profile = brewer();
    let mut bytes = [0u8; 12];
    bytes[0] = 0x03;
    bytes[1] = 0x07;
    bytes[4..6].copy_from_slice(&880u16.to_be_bytes());

    let values = decode(&profile, &bytes).unwrap();
    assert_eq!(values["profile"], FieldValue::Unrecognized(7));
    assert!(values["profile"].is_unrecognized());
    assert_eq!(values["brewing"], FieldValue::Boolean(true));
    assert_eq!(values["steam"], FieldValue::Boolean(true));
    assert_eq!(values["temperature"], FieldValue::Decimal(88.0));
}

#[test]
fn test_negative_scaled_decimal() {
    let profile = brewer();
    let mut bytes = [0u8; 12];
    bytes[6] = (-20i8) as u8;
    let values = decode(&profile, &bytes).unwrap();
    assert_eq!(values["pressure"], FieldValue::Decimal(-1.0));
}

#[test]
fn test_rejects_value_outside_enumeration() {
    let profile = brewer();
    let brew = profile.command("start_brew").unwrap();
    let err = encode(&profile, brew, &params(&[("profile", "MACCHIATO".into())])).unwrap_err();
    assert_eq!(
        err,
        EncodeError::NotInEnumeration {
            param: "profile".into(),
            value: "MACCHIATO".into()
        }
    );
}

#[test]
fn test_encode_parameter_errors() {
    let profile = brewer();
    let brew = profile.command("start_brew").unwrap();
    let heat = profile.command("set_temperature").unwrap();

    assert!(matches!(
        encode(&profile, brew, &Params::new()),
        Err(EncodeError::MissingParameter { param, .. }) if param == "profile"
    ));
    assert!(matches!(
        encode(&profile, heat, &params(&[("target", FieldValue::Decimal(150.5))])),
        Err(EncodeError::OutOfRange { param, .. }) if param == "target"
    ));
    assert!(matches!(
        encode(&profile, heat, &params(&[("target", "hot".into())])),
        Err(EncodeError::TypeMismatch { expected: "a number", .. })
    ));
}

#[test]
fn test_encode_accepts_integer_for_decimal() {
    let profile = brewer();
    let heat = profile.command("set_temperature").unwrap();
    let bytes = encode(&profile, heat, &params(&[("target", FieldValue::Integer(93))])).unwrap();
    assert_eq!(bytes, vec![0xC0, 0x03, 0xA2]);
}

#[test]
fn test_temperature_has_no_drift() {
    let profile = brewer();
    let heat = profile.command("set_temperature").unwrap();

    for raw in 0u16..=1500 {
        let mut bytes = [0u8; 12];
        bytes[4..6].copy_from_slice(&raw.to_be_bytes());
        let value = decode(&profile, &bytes).unwrap()["temperature"].clone();

        let encoded = encode(&profile, heat, &params(&[("target", value.clone())])).unwrap();
        assert_eq!(encoded[1..3], raw.to_be_bytes(), "raw {raw} drifted via {value}");
    }
}

#[test]
fn test_signed_offset_decimal_round_trips() {
    let profile = brewer();
    let set = profile.command("set_pressure").unwrap();

    for raw in i8::MIN..=i8::MAX {
        let mut bytes = [0u8; 12];
        bytes[6] = raw as u8;
        let value = decode(&profile, &bytes).unwrap()["pressure"].clone();

        let sent = params(&[("bar", value)]);
        let encoded = encode(&profile, set, &sent).unwrap();
        assert_eq!(encoded[1], raw as u8);
        assert_eq!(decode_params(&profile, set, &encoded).unwrap(), sent);
    }
}

#[test]
fn test_tiny_scale_decimal_round_trips() {
    let profile = DeviceProfile::from_json(
        r#"{
            "model": "flow-meter",
            "telemetry": { "frame_size": 1, "fields": [
                { "name": "flow", "type": "decimal", "offset": 0, "transform": { "scale": 1e-13 } }
            ] },
            "commands": [
                { "name": "set_flow", "targets": ["flow"], "template": "F0 00",
                  "params": [ { "name": "flow", "field": "flow", "offset": 1 } ] }
            ]
        }"#,
    )
    .unwrap();
    let set = profile.command("set_flow").unwrap();

    for raw in 0u8..=u8::MAX {
        let value = decode(&profile, &[raw]).unwrap()["flow"].clone();
        if raw > 0 {
            assert_ne!(value, FieldValue::Decimal(0.0), "raw {raw} collapsed to zero");
        }
        let encoded = encode(&profile, set, &params(&[("flow", value)])).unwrap();
        assert_eq!(encoded[1], raw);
    }
}

#[test]
fn test_wide_unsigned_integer_is_refused() {
    let json = r#"{
        "model": "odometer",
        "telemetry": { "frame_size": 8, "fields": [
            { "name": "total", "type": "integer", "offset": 0, "width": 64 }
        ] }
    }"#;
    assert!(matches!(
        DeviceProfile::from_json(json),
        Err(ProfileError::InvalidDescriptor { name, .. }) if name == "total"
    ));

    // Signed keeps every raw distinct
    let signed = json.replace(r#""width": 64"#, r#""width": 64, "signed": true"#);
    let profile = DeviceProfile::from_json(&signed).unwrap();
    let high = decode(&profile, &[0xFF; 8]).unwrap()["total"].clone();
    let low = decode(&profile, &[0x80, 0, 0, 0, 0, 0, 0, 0]).unwrap()["total"].clone();
    assert_eq!(high, FieldValue::Integer(-1));
    assert_eq!(low, FieldValue::Integer(i64::MIN));
}

#[test]
fn test_builtin_commands_round_trip() {
    let profile = espresso_machine();
    let brew = profile.command("start_brew").unwrap();

    for beverage in ["none", "espresso", "lungo", "cappuccino", "latte_macchiato", "hot_water"] {
        for strength in 1..=5 {
            let sent = params(&[
                ("beverage", beverage.into()),
                ("strength", FieldValue::Integer(strength)),
            ]);
            let bytes = encode(&profile, brew, &sent).unwrap();
            assert_eq!(bytes.len(), 9);
            assert_eq!(bytes[1], 9, "length byte");
            assert_eq!(decode_params(&profile, brew, &bytes).unwrap(), sent);
        }
    }

    let light = profile.command("set_cup_light").unwrap();
    for enabled in [true, false] {
        let sent = params(&[("enabled", FieldValue::Boolean(enabled))]);
        let bytes = encode(&profile, light, &sent).unwrap();
        assert_eq!(decode_params(&profile, light, &bytes).unwrap(), sent);
    }
}

#[test]
fn test_optional_param_keeps_template_byte() {
    let profile = espresso_machine();
    let brew = profile.command("start_brew").unwrap();
    let bytes = encode(&profile, brew, &params(&[("beverage", "lungo".into())])).unwrap();
    assert_eq!(bytes[5], 2);
    assert_eq!(bytes[6], 0x03);
}

#[test]
fn test_builtin_telemetry() {
    let profile = espresso_machine();
    let body = [
        0xD0, 0x00, 0x00, 0x03, 0b11, 0b101, 0x03, 0x9D, 80, 1, 3, 0x01, 0x2C, 0x02, 0x00, 0x00,
    ];
    let bytes = frame(&profile, &body);
    assert_eq!(bytes.len(), 18);

    let values = decode(&profile, &bytes).unwrap();
    assert_eq!(values["machine_state"], FieldValue::Enum("brewing".into()));
    assert_eq!(values["power"], FieldValue::Boolean(true));
    assert_eq!(values["cup_light"], FieldValue::Boolean(true));
    assert_eq!(
        values["alarms"],
        FieldValue::Flags(BTreeSet::from([
            "water_tank_empty".to_string(),
            "descale_needed".to_string()
        ]))
    );
    assert_eq!(values["boiler_temperature"], FieldValue::Decimal(92.5));
    assert_eq!(values["water_level"], FieldValue::Integer(80));
    assert_eq!(values["beverage"], FieldValue::Enum("espresso".into()));
    assert_eq!(values["strength"], FieldValue::Integer(3));
    assert_eq!(values["cups_brewed"], FieldValue::Integer(300));
    assert_eq!(values["temperature_setting"], FieldValue::Enum("high".into()));
}

#[test]
fn test_checksum_and_prefix_are_enforced() {
    let profile = espresso_machine();
    let body = [0xD0, 0, 0, 1, 1, 0, 0x03, 0x84, 60, 0, 1, 0, 0, 1, 0, 0];
    let good = frame(&profile, &body);
    assert!(decode(&profile, &good).is_ok());

    let mut corrupted = good.clone();
    corrupted[8] ^= 0x40;
    assert!(matches!(
        decode(&profile, &corrupted),
        Err(FrameError::Checksum { .. })
    ));

    let mut wrong_prefix = body;
    wrong_prefix[0] = 0x0E;
    assert_eq!(
        decode(&profile, &frame(&profile, &wrong_prefix)),
        Err(FrameError::Prefix)
    );
}
