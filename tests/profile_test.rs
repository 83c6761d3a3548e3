//! Profile loading and validation tests.

use cremalink::{
    load, FieldKind, ProfileError, ProfileRepository, ProfileSource, MAX_FRAME_SIZE,
};
use std::fs;

const BREWER: &str = r#"{
    "model": "brewer-12",
    "framing": { "checksum": { "algorithm": "xor8" } },
    "telemetry": {
        "frame_size": 12,
        "fields": [
            { "name": "brewing", "type": "boolean", "offset": 0, "bit": 0 },
            { "name": "temperature", "type": "decimal", "offset": 4, "width": 16,
              "transform": { "scale": 0.1 }, "unit": "°C" }
        ]
    },
    "commands": [
        { "name": "start_brew", "targets": ["brewing"], "template": "A1 00" }
    ]
}"#;

fn with_commands(commands: &str) -> String {
    format!(
        r#"{{
            "model": "brewer-12",
            "telemetry": {{ "frame_size": 12, "fields": [
                {{ "name": "brewing", "type": "boolean", "offset": 0 }}
            ] }},
            "commands": [{commands}]
        }}"#
    )
}

#[test]
fn test_load_from_json() {
    let profile = load(ProfileSource::Json(BREWER)).unwrap();

    assert_eq!(profile.model, "brewer-12");
    assert_eq!(profile.name, "brewer-12");
    assert_eq!(profile.telemetry.frame_size, 12);
    assert_eq!(profile.framing.trailer_len(), 1);

    let temperature = profile.field("temperature").unwrap();
    assert_eq!(temperature.layout.offset, 4);
    assert_eq!(temperature.layout.width, 16);
    assert_eq!(temperature.unit.as_deref(), Some("°C"));
    assert!(matches!(temperature.kind, FieldKind::Decimal(_)));

    assert_eq!(profile.command_names(), vec!["start_brew"]);
}

#[test]
fn test_load_from_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("brewer.json");
    fs::write(&path, BREWER).unwrap();

    let profile = load(ProfileSource::Path(&path)).unwrap();
    assert_eq!(profile.model, "brewer-12");

    let missing = dir.path().join("missing.json");
    assert!(matches!(
        load(ProfileSource::Path(&missing)),
        Err(ProfileError::Read { .. })
    ));
}

#[test]
fn test_rejects_duplicate_command() {
    let json = with_commands(
        r#"{ "name": "go", "template": "01" }, { "name": "go", "template": "02" }"#,
    );
    assert!(matches!(
        load(ProfileSource::Json(&json)),
        Err(ProfileError::DuplicateCommand(name)) if name == "go"
    ));
}

#[test]
fn test_rejects_unknown_target() {
    let json = with_commands(r#"{ "name": "heat", "targets": ["boiler"], "template": "01" }"#);
    let err = load(ProfileSource::Json(&json)).unwrap_err();
    assert!(matches!(
        &err,
        ProfileError::UnknownTarget { command, field } if command == "heat" && field == "boiler"
    ));
    // Error names the offending descriptor
    assert!(err.to_string().contains("heat"));
}

#[test]
fn test_rejects_param_outside_template() {
    let json = with_commands(
        r#"{ "name": "set", "template": "01 00",
             "params": [ { "name": "level", "type": "integer", "offset": 2 } ] }"#,
    );
    assert!(matches!(
        load(ProfileSource::Json(&json)),
        Err(ProfileError::OutOfBounds { name, .. }) if name == "set.level"
    ));
}

#[test]
fn test_rejects_unknown_alias() {
    let json = r#"{
        "model": "m",
        "telemetry": { "frame_size": 2, "fields": [
            { "name": "power", "type": "boolean", "offset": 0 }
        ] },
        "aliases": { "on": "powered" }
    }"#;
    assert!(matches!(
        load(ProfileSource::Json(json)),
        Err(ProfileError::UnknownAlias { alias, .. }) if alias == "on"
    ));
}

#[test]
fn test_rejects_bad_hex_template() {
    let json = with_commands(r#"{ "name": "go", "template": "0G" }"#);
    assert!(matches!(
        load(ProfileSource::Json(&json)),
        Err(ProfileError::Hex { name, .. }) if name == "go"
    ));
}

#[test]
fn test_rejects_oversized_frame() {
    let json = format!(
        r#"{{ "model": "m", "telemetry": {{ "frame_size": {}, "fields": [] }} }}"#,
        MAX_FRAME_SIZE + 1
    );
    assert!(matches!(
        load(ProfileSource::Json(&json)),
        Err(ProfileError::InvalidDescriptor { .. })
    ));
}

#[test]
fn test_open_enumeration_may_be_partial() {
    let json = r#"{
        "model": "m",
        "telemetry": { "frame_size": 1, "fields": [
            { "name": "mode", "type": "enumeration", "offset": 0, "open": true,
              "values": { "0": "off", "0x10": "eco" } }
        ] }
    }"#;
    let profile = load(ProfileSource::Json(json)).unwrap();
    let FieldKind::Enumeration(mode) = &profile.field("mode").unwrap().kind else {
        panic!("expected enumeration");
    };
    assert_eq!(mode.label(16), Some("eco"));
    assert_eq!(mode.raw_for("off"), Some(0));
    assert!(mode.open);
}

#[test]
fn test_param_inherits_field_type() {
    let profile = ProfileRepository::with_builtin()
        .unwrap()
        .get("ecam-espresso")
        .unwrap();
    let brew = profile.command("start_brew").unwrap();

    let beverage = brew.param("beverage").unwrap();
    assert!(matches!(beverage.kind, FieldKind::Enumeration(_)));
    assert_eq!(beverage.layout.offset, 5);
    assert!(beverage.required);

    let strength = brew.param("strength").unwrap();
    assert_eq!(strength.bounds.min, Some(1.0));
    assert_eq!(strength.bounds.max, Some(5.0));
    assert!(!strength.required);
}

#[test]
fn test_repository_load_dir() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("brewer.json"), BREWER).unwrap();
    fs::write(dir.path().join("notes.txt"), "not a profile").unwrap();

    let mut repo = ProfileRepository::new();
    assert!(repo.is_empty());
    assert_eq!(repo.load_dir(dir.path()).unwrap(), 1);
    assert_eq!(repo.models(), vec!["brewer-12".to_string()]);

    fs::write(dir.path().join("broken.json"), "{ \"model\": ").unwrap();
    assert!(matches!(
        repo.load_dir(dir.path()),
        Err(ProfileError::Parse(_))
    ));
}
