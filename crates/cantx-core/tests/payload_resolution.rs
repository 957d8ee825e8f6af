//! Integration tests for payload resolution
//!
//! Manual payloads, Lua and CSV plugins, sliders over a real DBC

use cantx_core::catalog::FrameCatalog;
use cantx_core::frame::FrameSpec;
use cantx_core::overrides::SignalOverride;
use cantx_core::plugin::{PluginCache, PluginError};
use cantx_core::resolver::resolve;
use pretty_assertions::assert_eq;
use std::path::{Path, PathBuf};

const DBC: &str = r#"
VERSION ""

BU_: ECU

BO_ 256 Engine: 8 ECU
 SG_ Rpm : 0|16@1+ (0.25,0) [0|16383.75] "rpm" Vector__XXX
 SG_ Temp : 16|8@1- (1,-40) [-168|87] "degC" Vector__XXX
 SG_ Gear : 24|4@1+ (-1,0) [-15|0] "" Vector__XXX

BO_ 512 Status: 2 ECU
 SG_ Mode : 0|8@1+ (1,0) [0|255] "" Vector__XXX

BA_ "GenMsgCycleTime" BO_ 256 100;
"#;

const COUNTER_SCRIPT: &str = r#"
counter = 0
function get_payload(dlc, frame_id)
    counter = counter + 1
    local t = {}
    for i = 1, dlc do
        t[i] = (counter + i) % 256
    end
    return t
end
"#;

fn catalog() -> FrameCatalog {
    FrameCatalog::from_str(DBC).expect("fixture DBC parses")
}

fn slider(catalog: &FrameCatalog, message: &str, signal: &str, index: u64) -> SignalOverride {
    let msg = catalog.message_by_name(message).unwrap();
    let mut s = SignalOverride::from_signal(msg, msg.signal(signal).unwrap());
    s.set_index(index);
    s
}

fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_slider_bounds_follow_bit_layout() {
    let catalog = catalog();

    let rpm = slider(&catalog, "Engine", "Rpm", 0);
    assert_eq!((rpm.min_val, rpm.max_val, rpm.step), (0.0, 65535.0 * 0.25, 0.25));
    assert_eq!(rpm.unit, "rpm");

    // Signed 8 bit: [-128, 127] shifted by the offset
    let temp = slider(&catalog, "Engine", "Temp", 0);
    assert_eq!((temp.min_val, temp.max_val), (-128.0 - 40.0, 127.0 - 40.0));

    // Negative factor keeps min below max
    let gear = slider(&catalog, "Engine", "Gear", 0);
    assert_eq!((gear.min_val, gear.max_val, gear.step), (-15.0, 0.0, 1.0));
    assert_eq!(gear.steps(), 15);
}

#[test]
fn test_sliders_compose_in_registration_order() {
    let catalog = catalog();
    let frame = FrameSpec::from_message(catalog.message_by_id(0x100).unwrap());
    let sliders = vec![
        slider(&catalog, "Engine", "Rpm", 4000),
        slider(&catalog, "Engine", "Temp", 0),
    ];
    let mut plugins = PluginCache::new();

    let out = resolve(&frame, &sliders, &mut plugins, None, Some(&catalog)).unwrap();
    // Rpm 1000 -> raw 4000 little endian, Temp -168 -> raw -128
    assert_eq!(out, vec![0xA0, 0x0F, 0x80, 0, 0, 0, 0, 0]);
}

#[test]
fn test_undecodable_payload_resets_other_signals() {
    let catalog = catalog();
    // Shorter than the message: decode fails, every signal restarts at physical zero
    let mut frame = FrameSpec::new(0x100, "Engine", 4, 100, false);
    frame.set_manual_payload(&[0xFF; 4]);
    let sliders = vec![slider(&catalog, "Engine", "Rpm", 4000)];
    let mut plugins = PluginCache::new();

    let out = resolve(&frame, &sliders, &mut plugins, None, Some(&catalog)).unwrap();
    // Temp at 0 degC is raw 40; the 0xFF bytes are gone
    assert_eq!(out, vec![0xA0, 0x0F, 0x28, 0x00]);
}

#[test]
fn test_failed_slider_leaves_payload_alone() {
    let catalog = catalog();
    let mut frame = FrameSpec::new(0x100, "Engine", 8, 100, false);
    frame.set_manual_payload(&[1, 2, 3, 4, 5, 6, 7, 8]);
    let ghost = SignalOverride::from_parts(0x100, "Engine", "Ghost", 0.0, 10.0, 1.0, 5);
    let orphan = SignalOverride::from_parts(0x100, "Other", "X", 0.0, 10.0, 1.0, 5);
    let mut plugins = PluginCache::new();

    let out = resolve(&frame, [&ghost, &orphan], &mut plugins, None, Some(&catalog)).unwrap();
    assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 7, 8]);

    // No catalog at all: sliders are skipped
    let out = resolve(&frame, [&ghost], &mut plugins, None, None).unwrap();
    assert_eq!(out.len(), 8);
}

#[test]
fn test_manual_resolution_is_idempotent() {
    let catalog = catalog();
    let mut frame = FrameSpec::new(0x200, "Status", 2, 10, false);
    frame.set_payload_text("12 34").unwrap();
    let sliders = vec![slider(&catalog, "Status", "Mode", 7)];
    let mut plugins = PluginCache::new();

    let first = resolve(&frame, &sliders, &mut plugins, None, Some(&catalog)).unwrap();
    let second = resolve(&frame, &sliders, &mut plugins, None, Some(&catalog)).unwrap();
    // Bits outside every signal are rebuilt as zero
    assert_eq!(first, vec![7, 0]);
    assert_eq!(first, second);
}

#[test]
fn test_frame_script_state_survives_between_ticks() {
    let dir = tempfile::tempdir().unwrap();
    let script = write(dir.path(), "counter.lua", COUNTER_SCRIPT);
    let mut frame = FrameSpec::new(0x100, "Engine", 3, 10, false);
    frame.script_path = Some(script.clone());
    let mut plugins = PluginCache::new();

    let none = std::iter::empty();
    assert_eq!(resolve(&frame, none, &mut plugins, None, None).unwrap(), vec![2, 3, 4]);
    let none = std::iter::empty();
    assert_eq!(resolve(&frame, none, &mut plugins, None, None).unwrap(), vec![3, 4, 5]);
    assert!(plugins.contains(&script));

    // Invalidation reloads the file and resets its state
    assert!(plugins.invalidate(&script));
    let none = std::iter::empty();
    assert_eq!(resolve(&frame, none, &mut plugins, None, None).unwrap(), vec![2, 3, 4]);
}

#[test]
fn test_global_script_used_when_frame_script_missing() {
    let dir = tempfile::tempdir().unwrap();
    let global = write(
        dir.path(),
        "global.lua",
        "function get_payload(dlc, frame_id) return string.rep(string.char(frame_id % 256), dlc) end",
    );
    let mut frame = FrameSpec::new(0x1AB, "x", 5, 10, false);
    frame.script_path = Some(dir.path().join("deleted.lua"));
    let mut plugins = PluginCache::new();

    let out = resolve(&frame, std::iter::empty(), &mut plugins, Some(&global), None).unwrap();
    assert_eq!(out, vec![0xAB; 5]);
}

#[test]
fn test_wrong_script_length_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let script = write(
        dir.path(),
        "short.lua",
        "function get_payload(dlc, frame_id) return {1, 2} end",
    );
    let mut frame = FrameSpec::new(0x10, "x", 4, 10, false);
    frame.script_path = Some(script);
    let mut plugins = PluginCache::new();

    assert_eq!(
        resolve(&frame, std::iter::empty(), &mut plugins, None, None),
        Err(PluginError::WrongLength {
            expected: 4,
            actual: 2
        })
    );
}

#[test]
fn test_csv_sources_fit_the_dlc() {
    let dir = tempfile::tempdir().unwrap();
    let single = write(dir.path(), "seq.csv", "b0,b1,b2,b3\n1,2,3,4\n5,6,7,8\n");
    let per_id = dir.path().join("captures");
    std::fs::create_dir(&per_id).unwrap();
    write(&per_id, "payload_sequence_ID_123.csv", "b0,b1\n0x11,0x22\n");

    let mut plugins = PluginCache::new();

    let mut frame = FrameSpec::new(0x123, "x", 2, 10, false);
    frame.script_path = Some(single);
    let none = std::iter::empty();
    assert_eq!(resolve(&frame, none, &mut plugins, None, None).unwrap(), vec![1, 2]);
    let none = std::iter::empty();
    assert_eq!(resolve(&frame, none, &mut plugins, None, None).unwrap(), vec![5, 6]);

    frame.script_path = None;
    let none = std::iter::empty();
    assert_eq!(
        resolve(&frame, none, &mut plugins, Some(&per_id), None).unwrap(),
        vec![0x11, 0x22]
    );

    let other = FrameSpec::new(0x124, "y", 2, 10, false);
    assert!(matches!(
        resolve(&other, std::iter::empty(), &mut plugins, Some(&per_id), None),
        Err(PluginError::NoSequence(_))
    ));
}

#[test]
fn test_every_path_returns_exactly_dlc_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let script = write(dir.path(), "counter.lua", COUNTER_SCRIPT);
    let catalog = catalog();
    let mut plugins = PluginCache::new();

    for dlc in [1u8, 4, 8] {
        let mut frame = FrameSpec::new(0x100, "Engine", dlc, 10, false);
        frame.set_manual_payload(&[0xEE; 12]);
        let sliders = vec![slider(&catalog, "Engine", "Rpm", 9)];

        let manual = resolve(&frame, &sliders, &mut plugins, None, Some(&catalog)).unwrap();
        assert_eq!(manual.len(), dlc as usize);

        frame.script_path = Some(script.clone());
        let scripted = resolve(&frame, &sliders, &mut plugins, None, Some(&catalog)).unwrap();
        assert_eq!(scripted.len(), dlc as usize);
    }
}
