//! Fetching and unpacking task context bundles.
//!
//! A payload may name a context URL: a bundle downloaded into the task's
//! working folder before the command starts. Bundles must be archives
//! recognized by their extension (`.zip`, `.tar`, `.gz`, `.tar.gz`, `.tgz`);
//! they are unpacked in place and handed over to the task user.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::system::{User, change_owner, change_owner_recursive};

/// Errors from fetching a context bundle.
///
/// All of these are the task's fault; the sandbox reports them as malformed
/// payloads.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid context URL '{0}'")]
    InvalidUrl(String),

    #[error("unsupported URL scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("unrecognized context format '{0}', expected .zip, .tar, .gz, .tar.gz or .tgz")]
    UnsupportedFormat(String),

    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("archive entry '{0}' escapes the destination folder")]
    UnsafePath(String),

    #[error("invalid zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Archive formats understood by [`fetch_context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    /// A gzipped file; if it decompresses to a `.tar` that is unpacked too.
    Gzip,
    /// `.tgz`, unpacked as a gzipped tarball.
    TarGz,
}

impl ArchiveFormat {
    /// Determine the format from a file name.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "zip" => Some(Self::Zip),
            "tar" => Some(Self::Tar),
            "gz" => Some(Self::Gzip),
            "tgz" => Some(Self::TarGz),
            _ => None,
        }
    }
}

/// Download `context` into `destination`, unpack it and give everything to
/// `user`.
pub async fn fetch_context(context: &str, destination: &Path, user: &User) -> Result<(), FetchError> {
    let url = Url::parse(context).map_err(|_| FetchError::InvalidUrl(context.to_string()))?;
    let file_name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| FetchError::InvalidUrl(context.to_string()))?;
    // Check the format before spending bandwidth on it.
    let format = ArchiveFormat::from_file_name(&file_name)
        .ok_or_else(|| FetchError::UnsupportedFormat(file_name.clone()))?;

    let target = destination.join(&file_name);
    download(&url, &target).await?;
    tracing::debug!(url = %url, target = %target.display(), ?format, "context downloaded");

    fs::set_permissions(&target, fs::Permissions::from_mode(0o700))
        .map_err(|e| FetchError::io(format!("setting permissions on '{}'", file_name), e))?;
    change_owner(&target, user)
        .map_err(|e| FetchError::io(format!("changing owner of '{}'", file_name), e))?;

    let dest = destination.to_path_buf();
    tokio::task::spawn_blocking(move || unpack(&target, &dest, format))
        .await
        .map_err(|e| FetchError::io("unpacking context", io::Error::other(e)))??;

    change_owner_recursive(destination, user)
        .map_err(|e| FetchError::io("changing owner of unpacked context", e))?;
    Ok(())
}

async fn download(url: &Url, target: &Path) -> Result<(), FetchError> {
    match url.scheme() {
        "http" | "https" => {
            let mut response = reqwest::get(url.clone()).await?.error_for_status()?;
            let mut file = tokio::fs::File::create(target)
                .await
                .map_err(|e| FetchError::io(format!("creating '{}'", target.display()), e))?;
            while let Some(chunk) = response.chunk().await? {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| FetchError::io(format!("writing '{}'", target.display()), e))?;
            }
            file.flush()
                .await
                .map_err(|e| FetchError::io(format!("writing '{}'", target.display()), e))?;
            Ok(())
        }
        "file" => {
            let source = url
                .to_file_path()
                .map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
            tokio::fs::copy(&source, target)
                .await
                .map_err(|e| FetchError::io(format!("copying '{}'", source.display()), e))?;
            Ok(())
        }
        other => Err(FetchError::UnsupportedScheme(other.to_string())),
    }
}

/// Unpack `archive` into `dest`. Blocking.
pub fn unpack(archive: &Path, dest: &Path, format: ArchiveFormat) -> Result<(), FetchError> {
    match format {
        ArchiveFormat::Zip => unzip(archive, dest),
        ArchiveFormat::Tar => untar(File::open(archive).map_err(|e| open_err(archive, e))?, dest),
        ArchiveFormat::TarGz => {
            let file = File::open(archive).map_err(|e| open_err(archive, e))?;
            untar(GzDecoder::new(file), dest)
        }
        ArchiveFormat::Gzip => {
            let unpacked = gunzip(archive)?;
            if unpacked.extension().is_some_and(|ext| ext == "tar") {
                untar(File::open(&unpacked).map_err(|e| open_err(&unpacked, e))?, dest)?;
            }
            Ok(())
        }
    }
}

fn open_err(path: &Path, e: io::Error) -> FetchError {
    FetchError::io(format!("opening '{}'", path.display()), e)
}

/// Decompress `foo.gz` next to itself as `foo`, returning the new path.
fn gunzip(archive: &Path) -> Result<PathBuf, FetchError> {
    let target = archive.with_extension("");
    let mut decoder = GzDecoder::new(File::open(archive).map_err(|e| open_err(archive, e))?);
    let mut out = File::create(&target)
        .map_err(|e| FetchError::io(format!("creating '{}'", target.display()), e))?;
    io::copy(&mut decoder, &mut out)
        .map_err(|e| FetchError::io(format!("decompressing '{}'", archive.display()), e))?;
    Ok(target)
}

fn untar<R: io::Read>(reader: R, dest: &Path) -> Result<(), FetchError> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    for entry in archive
        .entries()
        .map_err(|e| FetchError::io("reading tar archive", e))?
    {
        let mut entry = entry.map_err(|e| FetchError::io("reading tar entry", e))?;
        let name = entry
            .path()
            .map_err(|e| FetchError::io("reading tar entry path", e))?
            .into_owned();
        // unpack_in refuses paths escaping dest and reports it as `false`.
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| FetchError::io(format!("unpacking '{}'", name.display()), e))?;
        if !unpacked {
            return Err(FetchError::UnsafePath(name.display().to_string()));
        }
    }
    Ok(())
}

fn unzip(archive: &Path, dest: &Path) -> Result<(), FetchError> {
    let file = File::open(archive).map_err(|e| open_err(archive, e))?;
    let mut zip = zip::ZipArchive::new(file)?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| FetchError::UnsafePath(entry.name().to_string()))?;
        let target = dest.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| FetchError::io(format!("creating '{}'", relative.display()), e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| FetchError::io(format!("creating '{}'", parent.display()), e))?;
        }
        let mut out = File::create(&target)
            .map_err(|e| FetchError::io(format!("creating '{}'", relative.display()), e))?;
        io::copy(&mut entry, &mut out)
            .map_err(|e| FetchError::io(format!("extracting '{}'", relative.display()), e))?;
        if let Some(mode) = entry.unix_mode() {
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|e| FetchError::io(format!("setting mode of '{}'", relative.display()), e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file_url(path: &Path) -> String {
        Url::from_file_path(path).unwrap().to_string()
    }

    fn make_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(ArchiveFormat::from_file_name("ctx.zip"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_file_name("ctx.tar"), Some(ArchiveFormat::Tar));
        assert_eq!(ArchiveFormat::from_file_name("ctx.tar.gz"), Some(ArchiveFormat::Gzip));
        assert_eq!(ArchiveFormat::from_file_name("ctx.TGZ"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_file_name("ctx.rar"), None);
        assert_eq!(ArchiveFormat::from_file_name("ctx"), None);
    }

    #[tokio::test]
    async fn test_unrecognized_extension_is_rejected_before_download() {
        let dest = tempfile::tempdir().unwrap();
        let user = User::current().unwrap();

        // The source does not exist: rejection must happen before fetching.
        let err = fetch_context("file:///nonexistent/context.rar", dest.path(), &user)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedFormat(ref name) if name == "context.rar"));
        assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let dest = tempfile::tempdir().unwrap();
        let user = User::current().unwrap();

        let err = fetch_context("ftp://example.com/context.zip", dest.path(), &user)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedScheme(ref s) if s == "ftp"));
    }

    #[tokio::test]
    async fn test_fetch_tar_gz_from_file_url() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let user = User::current().unwrap();

        let bundle = source.path().join("bundle.tar.gz");
        let tarball = make_tar(&[("bin/run.sh", b"#!/bin/sh\necho hi\n"), ("data.txt", b"42")]);
        fs::write(&bundle, gzip(&tarball)).unwrap();

        fetch_context(&file_url(&bundle), dest.path(), &user)
            .await
            .unwrap();

        assert_eq!(fs::read(dest.path().join("data.txt")).unwrap(), b"42");
        let script = dest.path().join("bin/run.sh");
        assert!(script.is_file());
        assert_eq!(fs::metadata(&script).unwrap().permissions().mode() & 0o777, 0o755);
        // The downloaded bundle itself is left in place, executable.
        let mode = fs::metadata(dest.path().join("bundle.tar.gz")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn test_fetch_zip_from_file_url() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let user = User::current().unwrap();

        let bundle = source.path().join("bundle.zip");
        {
            let mut zip = zip::ZipWriter::new(File::create(&bundle).unwrap());
            let options = zip::write::SimpleFileOptions::default();
            zip.add_directory("nested/", options).unwrap();
            zip.start_file("nested/hello.txt", options).unwrap();
            zip.write_all(b"hello").unwrap();
            zip.finish().unwrap();
        }

        fetch_context(&file_url(&bundle), dest.path(), &user)
            .await
            .unwrap();

        assert_eq!(fs::read(dest.path().join("nested/hello.txt")).unwrap(), b"hello");
    }

    #[test]
    fn test_corrupt_zip_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        fs::write(&archive, b"not a zip file").unwrap();

        let err = unpack(&archive, dir.path(), ArchiveFormat::Zip).unwrap_err();
        assert!(matches!(err, FetchError::Zip(_)));
    }

    #[test]
    fn test_plain_gzip_is_only_decompressed() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("notes.txt.gz");
        fs::write(&archive, gzip(b"plain text")).unwrap();

        unpack(&archive, dir.path(), ArchiveFormat::Gzip).unwrap();
        assert_eq!(fs::read(dir.path().join("notes.txt")).unwrap(), b"plain text");
    }
}
