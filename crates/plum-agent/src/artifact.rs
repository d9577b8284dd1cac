use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tracing::info;

use crate::http::{DOWNLOAD_TIMEOUT, HttpClient};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("download failed: status={status} url={url}")]
    Download { url: String, status: u16 },

    #[error("artifact truncated: wrote {written} of {expected} bytes to {}", .path.display())]
    WriteTruncated {
        path: PathBuf,
        written: u64,
        expected: u64,
    },

    #[error("unpack failed for {}: {source}", .zip.display())]
    Unpack {
        zip: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Content-addressed on-disk layout, one directory per instance:
/// `<base>/<instanceId>/pkg.zip` plus its extracted `app/` tree. Every step
/// is idempotent; partially-completed layouts are finished on the next call.
pub struct ArtifactStore {
    base_dir: PathBuf,
    http: Arc<HttpClient>,
}

impl ArtifactStore {
    pub fn new(base_dir: PathBuf, http: Arc<HttpClient>) -> Self {
        Self { base_dir, http }
    }

    pub fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.base_dir.join(instance_id)
    }

    pub fn app_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("app")
    }

    /// Make the instance's app directory ready: download `pkg.zip` if absent,
    /// unpack it if `app/start.sh` is absent, and mark the entry point
    /// executable. Returns the app directory.
    pub async fn ensure_artifact(
        &self,
        instance_id: &str,
        artifact_url: &str,
    ) -> Result<PathBuf, ArtifactError> {
        let inst_dir = self.instance_dir(instance_id);
        fs::create_dir_all(&inst_dir)?;

        let zip_path = inst_dir.join("pkg.zip");
        if !zip_path.is_file() {
            let resp = self.http.get(artifact_url, DOWNLOAD_TIMEOUT).await;
            if !resp.is_ok() || resp.body.is_empty() {
                return Err(ArtifactError::Download {
                    url: artifact_url.to_string(),
                    status: resp.status,
                });
            }
            write_verified(&zip_path, &resp.body)?;
            info!(
                instance_id,
                path = %zip_path.display(),
                size = resp.body.len(),
                "saved artifact"
            );
        }

        let app_dir = inst_dir.join("app");
        fs::create_dir_all(&app_dir)?;

        let start_sh = app_dir.join("start.sh");
        if !start_sh.is_file() {
            unpack_zip(&zip_path, &app_dir)?;
            info!(instance_id, app_dir = %app_dir.display(), "unpacked artifact");
        }

        if start_sh.is_file() {
            make_executable(&start_sh)?;
        }

        Ok(app_dir)
    }
}

/// Write the full body, then confirm the on-disk length matches. A short
/// write is removed so the next tick re-downloads instead of trusting a
/// truncated archive.
fn write_verified(path: &Path, body: &[u8]) -> Result<(), ArtifactError> {
    fs::write(path, body)?;
    let written = fs::metadata(path)?.len();
    if written != body.len() as u64 {
        let _ = fs::remove_file(path);
        return Err(ArtifactError::WriteTruncated {
            path: path.to_path_buf(),
            written,
            expected: body.len() as u64,
        });
    }
    Ok(())
}

/// Extract all entries into `out_dir`, preserving relative paths and Unix
/// permission bits; `*.sh` entries are forced executable. Entries that would
/// escape `out_dir` are skipped.
fn unpack_zip(zip_path: &Path, out_dir: &Path) -> Result<(), ArtifactError> {
    let file = fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|source| ArtifactError::Unpack {
        zip: zip_path.to_path_buf(),
        source,
    })?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|source| ArtifactError::Unpack {
                zip: zip_path.to_path_buf(),
                source,
            })?;
        let rel: PathBuf = match entry.enclosed_name() {
            Some(p) => p.to_owned(),
            None => continue,
        };

        let out_path = out_dir.join(&rel);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let is_script = out_path.extension().is_some_and(|e| e == "sh");
            let mode = entry.unix_mode().map(|m| m & 0o7777).unwrap_or(0);
            let mode = if is_script { mode | 0o755 } else { mode };
            if mode != 0 {
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode))?;
            }
        }
    }

    Ok(())
}

fn make_executable(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_zip(entries: &[(&str, &str, Option<u32>)]) -> Vec<u8> {
        let mut buf = io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            for (name, contents, mode) in entries {
                let mut options = zip::write::SimpleFileOptions::default();
                if let Some(mode) = mode {
                    options = options.unix_permissions(*mode);
                }
                writer.start_file(*name, options).unwrap();
                writer.write_all(contents.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn unpack_preserves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("pkg.zip");
        let app_dir = dir.path().join("app");
        fs::create_dir_all(&app_dir).unwrap();
        fs::write(
            &zip_path,
            build_zip(&[
                ("start.sh", "#!/bin/sh\necho hello\n", None),
                ("bin/worker", "binary", Some(0o755)),
                ("meta.ini", "service=echo:http:8000\n", None),
            ]),
        )
        .unwrap();

        unpack_zip(&zip_path, &app_dir).unwrap();

        assert!(app_dir.join("start.sh").is_file());
        assert!(app_dir.join("bin/worker").is_file());
        assert!(app_dir.join("meta.ini").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn unpack_marks_scripts_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("pkg.zip");
        let app_dir = dir.path().join("app");
        fs::create_dir_all(&app_dir).unwrap();
        fs::write(
            &zip_path,
            build_zip(&[("start.sh", "#!/bin/sh\n", Some(0o644))]),
        )
        .unwrap();

        unpack_zip(&zip_path, &app_dir).unwrap();

        let mode = fs::metadata(app_dir.join("start.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn unpack_skips_entries_escaping_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("pkg.zip");
        let app_dir = dir.path().join("app");
        fs::create_dir_all(&app_dir).unwrap();
        fs::write(
            &zip_path,
            build_zip(&[("../escape.txt", "nope", None), ("start.sh", "ok", None)]),
        )
        .unwrap();

        unpack_zip(&zip_path, &app_dir).unwrap();

        assert!(!dir.path().join("escape.txt").exists());
        assert!(app_dir.join("start.sh").is_file());
    }

    #[test]
    fn write_verified_keeps_complete_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        write_verified(&path, b"payload").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"payload");
    }
}
