//! Streaming rewrite of an APK that injects the stub payload as the next `classes<N>.dex`.
//!
//! Entries are visited once in source order. Most are raw-copied (compressed bytes and method
//! untouched), the manifest is replaced, a previous marker is consumed, and executable units are
//! deferred until the whole archive has been scanned. Only then is it known whether the archive
//! was patched before, which decides what happens to the highest unit.

use crate::android::signature::Fingerprint;
use crate::error::{PatchError, PatchResult};
use log::{debug, info};
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const MANIFEST_ENTRY: &str = "AndroidManifest.xml";

/// How the rewrite routes a source entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryClass {
    Manifest,
    Marker,
    Unit(u32),
    Other,
}

pub fn classify_entry(name: &str, marker_name: &str) -> EntryClass {
    if name == MANIFEST_ENTRY {
        EntryClass::Manifest
    } else if name == marker_name {
        EntryClass::Marker
    } else {
        unit_number(name).map_or(EntryClass::Other, EntryClass::Unit)
    }
}

/// Number of a top-level executable unit: `classes.dex` is 1, `classes<N>.dex` is N.
///
/// `N` must be written in canonical decimal and be at least 1; anything else (`classes0.dex`,
/// `classes02.dex`, `lib/classes2.dex`) is an ordinary entry.
pub fn unit_number(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("classes")?.strip_suffix(".dex")?;
    if digits.is_empty() {
        return Some(1);
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) || digits.starts_with('0') {
        return None;
    }
    digits.parse().ok().filter(|n| *n >= 1)
}

pub fn unit_entry_name(number: u32) -> String {
    if number == 1 {
        "classes.dex".to_string()
    } else {
        format!("classes{number}.dex")
    }
}

/// Everything the rewrite needs besides the source archive.
#[derive(Clone, Copy, Debug)]
pub struct RewriteInput<'a> {
    /// Encoded, already patched `AndroidManifest.xml`.
    pub manifest: &'a [u8],
    /// Fingerprint to record when the source was never patched.
    pub fingerprint: &'a Fingerprint,
    /// Contents of the injected unit.
    pub payload: &'a [u8],
    pub marker_name: &'a str,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RewriteReport {
    pub already_patched: bool,
    /// Fingerprint written to the marker entry.
    pub fingerprint: Fingerprint,
    pub payload_entry: String,
    /// Units in the output, payload included.
    pub unit_count: u32,
    pub passthrough_entries: usize,
    pub dropped_payload: Option<String>,
}

struct DeferredUnit {
    number: u32,
    index: usize,
    name: String,
}

#[derive(Default)]
struct ScanState {
    manifest_written: bool,
    carried: Option<Fingerprint>,
    units: Vec<DeferredUnit>,
    passthrough: usize,
}

impl ScanState {
    fn max_unit(&self) -> u32 {
        self.units.iter().map(|unit| unit.number).max().unwrap_or(0)
    }

    fn defer(&mut self, number: u32, index: usize, name: String) -> PatchResult<()> {
        if let Some(existing) = self.units.iter().find(|unit| unit.number == number) {
            return Err(PatchError::structural(format!(
                "entries '{}' and '{name}' both claim executable unit {number}",
                existing.name
            )));
        }
        self.units.push(DeferredUnit {
            number,
            index,
            name,
        });
        Ok(())
    }
}

/// Rewrite `source` into `writer` and finish the archive.
///
/// The manifest is written back with its original compression method, modification time and
/// unix mode. Only stored and deflated manifests can be rewritten; any other method is a
/// [`PatchError::Structural`] error.
pub fn rewrite_archive<R, W>(
    source: &mut ZipArchive<R>,
    writer: W,
    input: &RewriteInput<'_>,
) -> PatchResult<(W, RewriteReport)>
where
    R: Read + Seek,
    W: Write + Seek,
{
    let mut out = ZipWriter::new(writer);
    let mut state = ScanState::default();

    for index in 0..source.len() {
        let entry = source.by_index_raw(index)?;
        let name = entry.name().to_string();
        match classify_entry(&name, input.marker_name) {
            EntryClass::Marker => {
                if state.carried.is_some() {
                    return Err(PatchError::structural(format!(
                        "marker entry '{name}' appears more than once"
                    )));
                }
                drop(entry);
                state.carried = Some(read_marker(source, index, &name)?);
                debug!("{name}: previous patch marker, suppressed");
            }
            EntryClass::Manifest => {
                let options = FileOptions::default()
                    .compression_method(writable_method(&name, entry.compression())?)
                    .last_modified_time(entry.last_modified());
                let options = match entry.unix_mode() {
                    Some(mode) => options.unix_permissions(mode),
                    None => options,
                };
                drop(entry);
                out.start_file(name.as_str(), options)?;
                out.write_all(input.manifest)?;
                state.manifest_written = true;
                debug!("{name}: replaced with patched manifest");
            }
            EntryClass::Unit(number) => {
                drop(entry);
                debug!("{name}: executable unit {number}, deferred");
                state.defer(number, index, name)?;
            }
            EntryClass::Other => {
                out.raw_copy_file(entry)?;
                state.passthrough += 1;
            }
        }
    }

    let report = finalize(source, &mut out, state, input)?;
    let writer = out.finish()?;
    info!(
        "rewrote archive: {} units, payload {}, {} entries copied, marker {}",
        report.unit_count,
        report.payload_entry,
        report.passthrough_entries,
        if report.already_patched { "carried" } else { "created" }
    );
    Ok((writer, report))
}

fn finalize<R, W>(
    source: &mut ZipArchive<R>,
    out: &mut ZipWriter<W>,
    mut state: ScanState,
    input: &RewriteInput<'_>,
) -> PatchResult<RewriteReport>
where
    R: Read + Seek,
    W: Write + Seek,
{
    if !state.manifest_written {
        return Err(PatchError::structural(format!(
            "archive has no {MANIFEST_ENTRY}"
        )));
    }
    if state.units.is_empty() {
        return Err(PatchError::structural("archive contains no classes.dex"));
    }
    let mut max_unit = state.max_unit();
    if state.units.len() as u32 != max_unit {
        let mut present: Vec<u32> = state.units.iter().map(|unit| unit.number).collect();
        present.sort_unstable();
        return Err(PatchError::structural(format!(
            "executable units are not numbered 1..{max_unit}: found {present:?}"
        )));
    }

    let already_patched = state.carried.is_some();
    let fingerprint = state
        .carried
        .take()
        .unwrap_or_else(|| input.fingerprint.clone());

    let mut dropped_payload = None;
    if already_patched {
        if max_unit == 1 {
            return Err(PatchError::structural(
                "archive is marked as patched but holds no unit besides the previous payload",
            ));
        }
        if let Some(pos) = state.units.iter().position(|unit| unit.number == max_unit) {
            let previous = state.units.remove(pos);
            info!("dropping previous payload {}", previous.name);
            dropped_payload = Some(previous.name);
        }
        max_unit -= 1;
    }

    for unit in &state.units {
        out.raw_copy_file(source.by_index_raw(unit.index)?)?;
    }

    let payload_entry = unit_entry_name(max_unit + 1);
    out.start_file(
        payload_entry.as_str(),
        FileOptions::default().compression_method(CompressionMethod::Stored),
    )?;
    out.write_all(input.payload)?;

    out.start_file(
        input.marker_name,
        FileOptions::default().compression_method(marker_method(input.marker_name)),
    )?;
    out.write_all(fingerprint.as_bytes())?;

    Ok(RewriteReport {
        already_patched,
        fingerprint,
        payload_entry,
        unit_count: max_unit + 1,
        passthrough_entries: state.passthrough,
        dropped_payload,
    })
}

fn read_marker<R: Read + Seek>(
    source: &mut ZipArchive<R>,
    index: usize,
    name: &str,
) -> PatchResult<Fingerprint> {
    let mut bytes = Vec::new();
    source.by_index(index)?.read_to_end(&mut bytes)?;
    let text = String::from_utf8(bytes)
        .map_err(|_| PatchError::structural(format!("marker entry '{name}' is not UTF-8")))?;
    if text.is_empty() {
        return Err(PatchError::structural(format!("marker entry '{name}' is empty")));
    }
    Ok(Fingerprint::new(text))
}

// The writer only supports the methods the `deflate` feature provides.
fn writable_method(name: &str, method: CompressionMethod) -> PatchResult<CompressionMethod> {
    match method {
        CompressionMethod::Stored | CompressionMethod::Deflated => Ok(method),
        other => Err(PatchError::structural(format!(
            "cannot rewrite '{name}' compressed with {other:?}"
        ))),
    }
}

fn marker_method(name: &str) -> CompressionMethod {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".dex") || lower.ends_with(".arsc") || lower.ends_with(".so") {
        CompressionMethod::Stored
    } else {
        CompressionMethod::Deflated
    }
}

/// Read the raw `AndroidManifest.xml` bytes from an archive.
pub fn read_manifest<R: Read + Seek>(source: &mut ZipArchive<R>) -> PatchResult<Vec<u8>> {
    let mut entry = match source.by_name(MANIFEST_ENTRY) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(PatchError::structural(format!(
                "archive has no {MANIFEST_ENTRY}"
            )))
        }
        Err(err) => return Err(err.into()),
    };
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

pub fn read_manifest_file(path: impl AsRef<Path>) -> PatchResult<Vec<u8>> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    read_manifest(&mut archive)
}

/// Rewrite the APK at `source` into `dest`.
///
/// The output is assembled in a temporary file next to `dest` and only renamed into place once
/// the archive is complete.
pub fn rewrite_apk_file(
    source: impl AsRef<Path>,
    dest: impl AsRef<Path>,
    input: &RewriteInput<'_>,
) -> PatchResult<RewriteReport> {
    let (source, dest) = (source.as_ref(), dest.as_ref());
    let mut archive = ZipArchive::new(File::open(source)?)?;
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    let (_, report) = rewrite_archive(&mut archive, temp.as_file_mut(), input)?;
    temp.persist(dest).map_err(|err| PatchError::Io(err.error))?;
    info!("wrote {} from {}", dest.display(), source.display());
    Ok(report)
}
