use super::apk_builder::*;
use crate::android::binary_xml::{AndroidManifest, ManifestValue};
use crate::android::manifest_patch::is_rank_ordered;
use crate::android::ranks::AttributeRanks;
use crate::error::PatchError;
use std::io::{Cursor, Write};
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

const PAYLOAD_V1: &[u8] = b"dex\n035\0stub payload v1";
const PAYLOAD_V2: &[u8] = b"dex\n035\0stub payload v2, larger";

#[test]
fn first_patch_injects_next_unit_and_marker() {
    let apk = build_apk(&[
        entry("AndroidManifest.xml", &manifest_bytes(), CompressionMethod::Deflated),
        entry("classes1.dex", b"unit one", CompressionMethod::Stored),
        entry("assets/data.bin", b"opaque", CompressionMethod::Deflated),
    ]);
    let (out, report) = patch_in_memory(&apk, PAYLOAD_V1, "f00d").unwrap();
    let entries = read_entries(&out);

    assert_eq!(
        names(&entries),
        ["AndroidManifest.xml", "assets/data.bin", "classes1.dex", "classes2.dex", MARKER]
    );
    assert_eq!(find(&entries, "classes1.dex").unwrap().data, b"unit one");
    let payload = find(&entries, "classes2.dex").unwrap();
    assert_eq!(payload.data, PAYLOAD_V1);
    assert_eq!(payload.method, CompressionMethod::Stored);
    assert_eq!(find(&entries, MARKER).unwrap().data, b"f00d");

    assert!(!report.already_patched);
    assert_eq!(report.fingerprint.as_str(), "f00d");
    assert_eq!(report.payload_entry, "classes2.dex");
    assert_eq!(report.unit_count, 2);
    assert_eq!(report.passthrough_entries, 1);
    assert_eq!(report.dropped_payload, None);

    let manifest =
        AndroidManifest::from_bytes(&find(&entries, "AndroidManifest.xml").unwrap().data).unwrap();
    assert_eq!(manifest.root().attributes[0].name, "sharedUserId");
    let ranks = AttributeRanks::builtin().unwrap();
    assert!(is_rank_ordered(ranks, manifest.root()).unwrap());
    assert!(is_rank_ordered(ranks, manifest.application().unwrap()).unwrap());
}

#[test]
fn repatch_replaces_payload_and_keeps_fingerprint() {
    let apk = build_apk(&sample_entries());
    let (first, _) = patch_in_memory(&apk, PAYLOAD_V1, "cafe").unwrap();
    let (second, report) = patch_in_memory(&first, PAYLOAD_V2, "beef").unwrap();
    let entries = read_entries(&second);

    assert!(report.already_patched);
    assert_eq!(report.dropped_payload.as_deref(), Some("classes2.dex"));
    assert_eq!(report.payload_entry, "classes2.dex");
    assert_eq!(find(&entries, "classes.dex").unwrap().data, b"dex\n035\0original unit one");
    assert_eq!(find(&entries, "classes2.dex").unwrap().data, PAYLOAD_V2);
    assert_eq!(find(&entries, MARKER).unwrap().data, b"cafe");
    assert!(find(&entries, "classes3.dex").is_none());
    assert_eq!(
        entries.iter().filter(|entry| entry.name == MARKER).count(),
        1
    );
}

#[test]
fn repeated_cycles_converge() {
    let apk = build_apk(&sample_entries());
    let (first, first_report) = patch_in_memory(&apk, PAYLOAD_V1, "0a0b").unwrap();
    let mut current = first.clone();
    for cycle in 0..4 {
        let fresh = format!("ffff{cycle}");
        let (next, report) = patch_in_memory(&current, PAYLOAD_V1, &fresh).unwrap();
        assert_eq!(report.fingerprint.as_str(), "0a0b");
        assert_eq!(report.unit_count, first_report.unit_count);
        current = next;
    }
    assert_eq!(read_entries(&current), read_entries(&first));
}

#[test]
fn multi_unit_archive_keeps_unit_order() {
    let apk = build_apk(&[
        entry("classes3.dex", b"three", CompressionMethod::Stored),
        entry("AndroidManifest.xml", &manifest_bytes(), CompressionMethod::Deflated),
        entry("classes.dex", b"one", CompressionMethod::Stored),
        entry("classes2.dex", b"two", CompressionMethod::Deflated),
    ]);
    let (out, report) = patch_in_memory(&apk, PAYLOAD_V1, "ab").unwrap();
    let entries = read_entries(&out);
    assert_eq!(
        names(&entries),
        ["AndroidManifest.xml", "classes3.dex", "classes.dex", "classes2.dex", "classes4.dex", MARKER]
    );
    assert_eq!(find(&entries, "classes2.dex").unwrap().method, CompressionMethod::Deflated);
    assert_eq!(report.unit_count, 4);

    let (again, report) = patch_in_memory(&out, PAYLOAD_V2, "cd").unwrap();
    assert_eq!(report.dropped_payload.as_deref(), Some("classes4.dex"));
    let entries = read_entries(&again);
    assert_eq!(find(&entries, "classes4.dex").unwrap().data, PAYLOAD_V2);
    assert_eq!(find(&entries, "classes3.dex").unwrap().data, b"three");
}

#[test]
fn passthrough_entries_are_byte_identical() {
    let apk = build_apk(&sample_entries());
    let (out, _) = patch_in_memory(&apk, PAYLOAD_V1, "01").unwrap();
    let before = read_entries(&apk);
    let after = read_entries(&out);
    for name in ["res/", "res/layout/main.xml", "resources.arsc", "META-INF/CERT.RSA", "classes.dex"] {
        assert_eq!(find(&after, name), find(&before, name), "{name}");
        assert_eq!(raw_bytes(&out, name), raw_bytes(&apk, name), "{name}");
    }
}

#[test]
fn manifest_keeps_compression_method() {
    let mut entries = sample_entries();
    entries[0].method = CompressionMethod::Stored;
    let apk = build_apk(&entries);
    let (out, _) = patch_in_memory(&apk, PAYLOAD_V1, "01").unwrap();
    let manifest = find(&read_entries(&out), "AndroidManifest.xml").cloned().unwrap();
    assert_eq!(manifest.method, CompressionMethod::Stored);
    let decoded = AndroidManifest::from_bytes(&manifest.data).unwrap();
    assert!(matches!(
        decoded.root().attribute_value("android:sharedUserId"),
        Some(ManifestValue::String(_))
    ));
}

#[test]
fn manifest_keeps_timestamp_and_mode() {
    let stamp = DateTime::from_date_and_time(2019, 7, 14, 9, 30, 42).unwrap();
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file(
            "AndroidManifest.xml",
            FileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .last_modified_time(stamp)
                .unix_permissions(0o640),
        )
        .unwrap();
    writer.write_all(&manifest_bytes()).unwrap();
    writer
        .start_file(
            "classes.dex",
            FileOptions::default().compression_method(CompressionMethod::Stored),
        )
        .unwrap();
    writer.write_all(b"one").unwrap();
    let apk = writer.finish().unwrap().into_inner();

    let (out, _) = patch_in_memory(&apk, PAYLOAD_V1, "01").unwrap();
    let mut archive = ZipArchive::new(Cursor::new(out)).unwrap();
    let manifest = archive.by_name("AndroidManifest.xml").unwrap();
    assert_eq!(manifest.compression(), CompressionMethod::Deflated);
    let modified = manifest.last_modified();
    assert_eq!(
        (modified.year(), modified.month(), modified.day()),
        (2019, 7, 14)
    );
    assert_eq!(
        (modified.hour(), modified.minute(), modified.second()),
        (9, 30, 42)
    );
    assert_eq!(manifest.unix_mode().map(|mode| mode & 0o777), Some(0o640));
}

#[test]
fn unusual_unit_names_pass_through() {
    let apk = build_apk(&[
        entry("AndroidManifest.xml", &manifest_bytes(), CompressionMethod::Deflated),
        entry("classes.dex", b"one", CompressionMethod::Stored),
        entry("classes0.dex", b"zero", CompressionMethod::Stored),
        entry("classes02.dex", b"padded", CompressionMethod::Stored),
        entry("assets/classes2.dex", b"nested", CompressionMethod::Stored),
    ]);
    let (out, report) = patch_in_memory(&apk, PAYLOAD_V1, "01").unwrap();
    assert_eq!(report.passthrough_entries, 3);
    assert_eq!(report.payload_entry, "classes2.dex");
    let entries = read_entries(&out);
    assert_eq!(find(&entries, "assets/classes2.dex").unwrap().data, b"nested");
    assert_eq!(find(&entries, "classes2.dex").unwrap().data, PAYLOAD_V1);
}

#[test]
fn missing_manifest_is_structural() {
    let apk = build_apk(&[entry("classes.dex", b"one", CompressionMethod::Stored)]);
    let err = rewrite_raw(&apk, &manifest_bytes(), PAYLOAD_V1, "01").unwrap_err();
    assert!(matches!(err, PatchError::Structural(_)), "{err}");
    assert!(matches!(
        patch_in_memory(&apk, PAYLOAD_V1, "01"),
        Err(PatchError::Structural(_))
    ));
}

#[test]
fn archive_without_units_is_structural() {
    let apk = build_apk(&[
        entry("AndroidManifest.xml", &manifest_bytes(), CompressionMethod::Deflated),
        entry("assets/x", b"x", CompressionMethod::Deflated),
    ]);
    assert!(matches!(
        patch_in_memory(&apk, PAYLOAD_V1, "01"),
        Err(PatchError::Structural(_))
    ));
}

#[test]
fn gaps_and_duplicates_are_structural() {
    let gap = build_apk(&[
        entry("AndroidManifest.xml", &manifest_bytes(), CompressionMethod::Deflated),
        entry("classes.dex", b"one", CompressionMethod::Stored),
        entry("classes3.dex", b"three", CompressionMethod::Stored),
    ]);
    assert!(matches!(
        rewrite_raw(&gap, &manifest_bytes(), PAYLOAD_V1, "01"),
        Err(PatchError::Structural(_))
    ));

    let duplicate = build_apk(&[
        entry("AndroidManifest.xml", &manifest_bytes(), CompressionMethod::Deflated),
        entry("classes.dex", b"one", CompressionMethod::Stored),
        entry("classes1.dex", b"also one", CompressionMethod::Stored),
    ]);
    assert!(matches!(
        rewrite_raw(&duplicate, &manifest_bytes(), PAYLOAD_V1, "01"),
        Err(PatchError::Structural(_))
    ));
}

#[test]
fn bad_markers_are_structural() {
    let base = |marker: &[u8]| {
        build_apk(&[
            entry("AndroidManifest.xml", &manifest_bytes(), CompressionMethod::Deflated),
            entry("classes.dex", b"one", CompressionMethod::Stored),
            entry("classes2.dex", b"old payload", CompressionMethod::Stored),
            entry(MARKER, marker, CompressionMethod::Deflated),
        ])
    };
    for marker in [&b""[..], &[0xff, 0xfe, 0x00][..]] {
        assert!(matches!(
            rewrite_raw(&base(marker), &manifest_bytes(), PAYLOAD_V1, "01"),
            Err(PatchError::Structural(_))
        ));
    }

    let lone_payload = build_apk(&[
        entry("AndroidManifest.xml", &manifest_bytes(), CompressionMethod::Deflated),
        entry("classes.dex", b"previous payload", CompressionMethod::Stored),
        entry(MARKER, b"abcd", CompressionMethod::Deflated),
    ]);
    assert!(matches!(
        rewrite_raw(&lone_payload, &manifest_bytes(), PAYLOAD_V1, "01"),
        Err(PatchError::Structural(_))
    ));
}
