//! Archive probing, safe extraction, and canonical-ZIP repacking.
//!
//! ZIP and the tar-family formats are handled in-process (`zip`, `tar` +
//! `flate2`/`bzip2`); anything else is delegated to the configured external
//! archiver binary, the same way the reference server shells out to `df` for
//! disk usage rather than re-implementing it. Either way, entry paths are
//! re-validated here before extraction — the archiver tool's own traversal
//! checks are not trusted.

use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::AppError;
use crate::guard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    TarBz2,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Lzma,
    BZip2,
    Ppmd,
    Other,
}

#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub method: CompressionMethod,
    pub encrypted: bool,
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub kind: Option<ArchiveKind>,
    pub encrypted: bool,
    pub entries: Vec<ArchiveEntry>,
}

/// Inspect `path`; `kind == None` means "not recognized as an archive".
pub async fn probe(path: &Path, archiver_bin: &str) -> Result<ProbeResult, AppError> {
    let path = path.to_path_buf();
    let archiver_bin = archiver_bin.to_string();
    tokio::task::spawn_blocking(move || probe_blocking(&path, &archiver_bin))
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("archive probe task failed: {e}")))?
}

fn probe_blocking(path: &Path, archiver_bin: &str) -> Result<ProbeResult, AppError> {
    if let Some(entries) = try_probe_zip(path)? {
        // A non-directory entry classified `Other` means this reader couldn't
        // place its on-disk method tag into our known set (LZMA/PPMd aren't
        // decodable without extra `zip` crate features). Trusting that
        // classification would wrongly reject a spec-canonical archive using
        // one of those methods, so defer to the external archiver instead of
        // returning a partial in-process listing.
        if entries.iter().any(|e| !e.is_dir && matches!(e.method, CompressionMethod::Other)) {
            return probe_via_external(path, archiver_bin);
        }
        let encrypted = entries.iter().any(|e| e.encrypted);
        return Ok(ProbeResult { kind: Some(ArchiveKind::Zip), encrypted, entries });
    }

    if let Some((kind, entries)) = try_probe_tar(path)? {
        return Ok(ProbeResult { kind: Some(kind), encrypted: false, entries });
    }

    probe_via_external(path, archiver_bin)
}

fn try_probe_zip(path: &Path) -> Result<Option<Vec<ArchiveEntry>>, AppError> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return Ok(None),
    };
    let archive = match zip::ZipArchive::new(file) {
        Ok(a) => a,
        Err(_) => return Ok(None),
    };

    let mut entries = Vec::with_capacity(archive.len());
    let mut archive = archive;
    for i in 0..archive.len() {
        let entry = archive
            .by_index_raw(i)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("zip listing failed: {e}")))?;
        entries.push(ArchiveEntry {
            path: entry.name().to_string(),
            size: entry.size(),
            is_dir: entry.is_dir(),
            method: classify_zip_method(entry.compression()),
            encrypted: entry.encrypted(),
        });
    }
    Ok(Some(entries))
}

fn classify_zip_method(method: zip::CompressionMethod) -> CompressionMethod {
    // This repo only enables the `zip` crate's "deflate"/"bzip2" decode
    // features, so LZMA/PPMd (both spec-canonical) and anything else fall
    // through to `Other` here. `probe_blocking` treats any non-directory
    // `Other` entry as "this listing is incomplete" and re-probes via the
    // external archiver rather than trusting a partial classification.
    use zip::CompressionMethod as M;
    match method {
        M::Stored => CompressionMethod::Stored,
        M::Deflated => CompressionMethod::Deflate,
        M::Bzip2 => CompressionMethod::BZip2,
        #[allow(unreachable_patterns)]
        _ => CompressionMethod::Other,
    }
}

fn try_probe_tar(path: &Path) -> Result<Option<(ArchiveKind, Vec<ArchiveEntry>)>, AppError> {
    let mut magic = [0u8; 3];
    {
        let mut f = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(_) => return Ok(None),
        };
        if f.read_exact(&mut magic).is_err() {
            return Ok(None);
        }
    }

    if magic[0] == 0x1f && magic[1] == 0x8b {
        let file = std::fs::File::open(path)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("open failed: {e}")))?;
        let decoder = flate2::read::GzDecoder::new(file);
        return Ok(Some((ArchiveKind::TarGz, list_tar_entries(decoder)?)));
    }

    if &magic == b"BZh" {
        let file = std::fs::File::open(path)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("open failed: {e}")))?;
        let decoder = bzip2::read::BzDecoder::new(file);
        return Ok(Some((ArchiveKind::TarBz2, list_tar_entries(decoder)?)));
    }

    Ok(None)
}

fn list_tar_entries<R: Read>(reader: R) -> Result<Vec<ArchiveEntry>, AppError> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("tar listing failed: {e}")))?;

    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| AppError::Internal(anyhow::anyhow!("tar entry failed: {e}")))?;
        let path = entry.path().map(|p| p.to_string_lossy().to_string()).unwrap_or_default();
        out.push(ArchiveEntry {
            path,
            size: entry.size(),
            is_dir: entry.header().entry_type().is_dir(),
            method: CompressionMethod::Deflate,
            encrypted: false,
        });
    }
    Ok(out)
}

/// Probe via the external archiver binary for formats we don't read
/// in-process (7z, rar, ...). A listing failure whose message mentions
/// `password`/`encrypted` is treated as "valid archive, encrypted"; any
/// other failure means "not an archive".
fn probe_via_external(path: &Path, archiver_bin: &str) -> Result<ProbeResult, AppError> {
    let output = std::process::Command::new(archiver_bin)
        .arg("l")
        .arg(path)
        .output();

    let output = match output {
        Ok(o) => o,
        Err(_) => return Ok(ProbeResult { kind: None, encrypted: false, entries: Vec::new() }),
    };

    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
    .to_lowercase();

    if output.status.success() {
        Ok(ProbeResult {
            kind: Some(ArchiveKind::Other),
            encrypted: combined.contains("password") || combined.contains("encrypted"),
            entries: Vec::new(),
        })
    } else if combined.contains("password") || combined.contains("encrypted") {
        Ok(ProbeResult { kind: Some(ArchiveKind::Other), encrypted: true, entries: Vec::new() })
    } else {
        Ok(ProbeResult { kind: None, encrypted: false, entries: Vec::new() })
    }
}

/// True iff every non-directory entry is unencrypted and compressed with
/// Deflate/LZMA/BZip2/PPMd, tolerating zero-byte Stored entries.
pub fn is_canonical_zip(entries: &[ArchiveEntry]) -> bool {
    entries.iter().all(|e| {
        if e.is_dir {
            return true;
        }
        if e.encrypted {
            return false;
        }
        match e.method {
            CompressionMethod::Deflate | CompressionMethod::Lzma | CompressionMethod::BZip2 | CompressionMethod::Ppmd => true,
            CompressionMethod::Stored => e.size == 0,
            CompressionMethod::Other => false,
        }
    })
}

/// Extract `src` (a ZIP, recognized in-process) into `dest`, rejecting any
/// entry whose resolved path escapes `dest` and any encrypted entry.
pub async fn extract_zip(src: &Path, dest: &Path) -> Result<(), AppError> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_zip_blocking(&src, &dest))
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("extract task failed: {e}")))?
}

fn extract_zip_blocking(src: &Path, dest: &Path) -> Result<(), AppError> {
    std::fs::create_dir_all(dest)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("mkdir failed: {e}")))?;

    let file = std::fs::File::open(src)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("open failed: {e}")))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| AppError::RepackFailed(format!("not a zip: {e}")))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| AppError::RepackFailed(format!("zip entry read failed: {e}")))?;

        if entry.encrypted() {
            return Err(AppError::EncryptedZip);
        }

        let name = entry.name().to_string();
        let out_path = guard::safe_join(dest, &name)?;

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)
                .map_err(|e| AppError::Internal(anyhow::anyhow!("mkdir failed: {e}")))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AppError::Internal(anyhow::anyhow!("mkdir failed: {e}")))?;
        }

        let mut out_file = std::fs::File::create(&out_path)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("create failed: {e}")))?;
        std::io::copy(&mut entry, &mut out_file)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("copy failed: {e}")))?;
    }

    Ok(())
}

/// Extract a tar-family archive (already known-good via `probe`) into `dest`,
/// re-validating every member path.
pub async fn extract_tar(src: &Path, dest: &Path, kind: ArchiveKind) -> Result<(), AppError> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_tar_blocking(&src, &dest, kind))
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("extract task failed: {e}")))?
}

fn extract_tar_blocking(src: &Path, dest: &Path, kind: ArchiveKind) -> Result<(), AppError> {
    std::fs::create_dir_all(dest)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("mkdir failed: {e}")))?;

    let file = std::fs::File::open(src)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("open failed: {e}")))?;

    match kind {
        ArchiveKind::TarGz => extract_tar_entries(tar::Archive::new(flate2::read::GzDecoder::new(file)), dest),
        ArchiveKind::TarBz2 => extract_tar_entries(tar::Archive::new(bzip2::read::BzDecoder::new(file)), dest),
        _ => Err(AppError::RepackFailed("unsupported tar variant".into())),
    }
}

fn extract_tar_entries<R: Read>(mut archive: tar::Archive<R>, dest: &Path) -> Result<(), AppError> {
    let entries = archive
        .entries()
        .map_err(|e| AppError::RepackFailed(format!("tar read failed: {e}")))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| AppError::RepackFailed(format!("tar entry failed: {e}")))?;
        let rel = entry
            .path()
            .map_err(|e| AppError::RepackFailed(format!("tar path failed: {e}")))?
            .to_string_lossy()
            .to_string();

        let out_path = guard::safe_join(dest, &rel)?;

        if entry.header().entry_type().is_dir() {
            std::fs::create_dir_all(&out_path)
                .map_err(|e| AppError::Internal(anyhow::anyhow!("mkdir failed: {e}")))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AppError::Internal(anyhow::anyhow!("mkdir failed: {e}")))?;
        }

        let mut out_file = std::fs::File::create(&out_path)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("create failed: {e}")))?;
        std::io::copy(&mut entry, &mut out_file)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("copy failed: {e}")))?;
    }

    Ok(())
}

/// Extract an archive recognized only via the external archiver (e.g. 7z,
/// rar) into `dest`. The archiver writes directly into `dest`; every
/// resulting file is still walked and re-validated against `dest` afterward,
/// since the archiver's own traversal protection isn't trusted.
pub async fn extract_external(src: &Path, dest: &Path, archiver_bin: &str) -> Result<(), AppError> {
    tokio::fs::create_dir_all(dest)
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("mkdir failed: {e}")))?;

    let output = tokio::process::Command::new(archiver_bin)
        .arg("x")
        .arg(format!("-o{}", dest.display()))
        .arg("-y")
        .arg(src)
        .output()
        .await
        .map_err(|e| AppError::RepackFailed(format!("archiver spawn failed: {e}")))?;

    if !output.status.success() {
        return Err(AppError::RepackFailed(format!(
            "archiver exited with {}",
            output.status
        )));
    }

    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || verify_contained(&dest))
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("verify task failed: {e}")))?
}

fn verify_contained(dest: &Path) -> Result<(), AppError> {
    let dest_canonical = dest
        .canonicalize()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("canonicalize failed: {e}")))?;
    let mut files = Vec::new();
    collect_files(&dest_canonical, &dest_canonical, &mut files)?;
    for (abs_path, _) in &files {
        let resolved = abs_path
            .canonicalize()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("canonicalize failed: {e}")))?;
        if !resolved.starts_with(&dest_canonical) {
            return Err(AppError::UnsafePath(resolved.display().to_string()));
        }
    }
    Ok(())
}

/// Build a Deflate ZIP from `src_dir` at `dest_zip`, preserving relative paths.
pub async fn zip_dir(src_dir: &Path, dest_zip: &Path, level: i64) -> Result<u64, AppError> {
    let src_dir = src_dir.to_path_buf();
    let dest_zip = dest_zip.to_path_buf();
    tokio::task::spawn_blocking(move || zip_dir_blocking(&src_dir, &dest_zip, level))
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("zip task failed: {e}")))?
}

fn zip_dir_blocking(src_dir: &Path, dest_zip: &Path, level: i64) -> Result<u64, AppError> {
    let file = std::fs::File::create(dest_zip)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("create failed: {e}")))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(level.clamp(0, 9) as i64));

    let mut files = Vec::new();
    collect_files(src_dir, src_dir, &mut files)?;

    for (abs_path, rel_path) in &files {
        writer
            .start_file(rel_path, options)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("zip start_file failed: {e}")))?;
        let mut f = std::fs::File::open(abs_path)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("open failed: {e}")))?;
        std::io::copy(&mut f, &mut writer)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("zip write failed: {e}")))?;
    }

    writer
        .finish()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("zip finish failed: {e}")))?;

    let size = std::fs::metadata(dest_zip)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("stat failed: {e}")))?
        .len();
    Ok(size)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(PathBuf, String)>) -> Result<(), AppError> {
    let read_dir = std::fs::read_dir(dir)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("read_dir failed: {e}")))?;
    for entry in read_dir.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .map_err(|e| AppError::Internal(anyhow::anyhow!("strip_prefix failed: {e}")))?
                .to_string_lossy()
                .replace('\\', "/");
            out.push((path, rel));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(method: CompressionMethod, size: u64, encrypted: bool) -> ArchiveEntry {
        ArchiveEntry { path: "f".into(), size, is_dir: false, method, encrypted }
    }

    #[test]
    fn canonical_zip_accepts_allowed_methods() {
        let entries = vec![
            entry(CompressionMethod::Deflate, 10, false),
            entry(CompressionMethod::BZip2, 10, false),
            entry(CompressionMethod::Lzma, 10, false),
            entry(CompressionMethod::Ppmd, 10, false),
        ];
        assert!(is_canonical_zip(&entries));
    }

    #[test]
    fn canonical_zip_allows_zero_byte_stored() {
        let entries = vec![entry(CompressionMethod::Stored, 0, false)];
        assert!(is_canonical_zip(&entries));
    }

    #[test]
    fn canonical_zip_rejects_nonzero_stored() {
        let entries = vec![entry(CompressionMethod::Stored, 1, false)];
        assert!(!is_canonical_zip(&entries));
    }

    #[test]
    fn canonical_zip_rejects_encrypted() {
        let entries = vec![entry(CompressionMethod::Deflate, 10, true)];
        assert!(!is_canonical_zip(&entries));
    }

    #[test]
    fn canonical_zip_rejects_other_methods() {
        let entries = vec![entry(CompressionMethod::Other, 10, false)];
        assert!(!is_canonical_zip(&entries));
    }

    #[tokio::test]
    async fn zip_dir_then_probe_round_trip() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub/b.txt"), b"world").unwrap();

        let dest = tempfile::tempdir().unwrap();
        let zip_path = dest.path().join("packed.zip");
        let size = zip_dir(src.path(), &zip_path, 6).await.unwrap();
        assert!(size > 0);

        let probed = probe(&zip_path, "7z").await.unwrap();
        assert_eq!(probed.kind, Some(ArchiveKind::Zip));
        assert!(!probed.encrypted);
        assert!(is_canonical_zip(&probed.entries));
    }
}
