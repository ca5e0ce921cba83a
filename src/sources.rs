//! Source archive streaming.
//!
//! Walks a function root honoring `.gitignore` and explicit excludes, and
//! produces a TAR whose entries live under a configurable prefix
//! (`source/` for pipeline uploads). Symlinks are validated lexically —
//! never resolved against the host filesystem — and any entry pointing
//! outside the root aborts the stream with an error.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use ignore::gitignore::GitignoreBuilder;
use tar::{EntryType, Header};
use tokio_util::io::SyncIoBridge;
use walkdir::WalkDir;

/// UID/GID stamped on every archive entry.
pub const NOBODY: u64 = 65534;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("symlink '{link}' escapes the source root (target '{target}')")]
    SymlinkEscapes { link: String, target: String },
    #[error("archive entry '{0}' has an unsafe name")]
    UnsafeEntryName(String),
    #[error("archive symlink '{0}' has an absolute target")]
    AbsoluteLinkTarget(String),
    #[error("walking source tree: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("ignore rules: {0}")]
    Ignore(#[from] ignore::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How an archive is assembled from a source root.
#[derive(Debug, Clone, Default)]
pub struct ArchiveOptions {
    /// Prefix prepended to every walked entry, e.g. `source`.
    pub prefix: String,
    /// Extra ignore patterns (gitignore syntax), applied after `.gitignore`.
    pub excludes: Vec<String>,
    /// Entries injected verbatim (full archive name, contents).
    pub extra_entries: Vec<(String, Vec<u8>)>,
}

impl ArchiveOptions {
    pub fn with_prefix(prefix: &str) -> Self {
        ArchiveOptions {
            prefix: prefix.to_string(),
            ..Default::default()
        }
    }
}

/// Write a TAR of `root` into `w`.
///
/// Entries are emitted in sorted order. Paths whose root-relative form
/// starts with `.git` are skipped, as is anything matched by the root's
/// `.gitignore` or the options' exclude patterns.
pub fn write_archive<W: Write>(
    root: &Path,
    opts: &ArchiveOptions,
    w: W,
) -> Result<(), SourceError> {
    let mut ignore = GitignoreBuilder::new(root);
    let gitignore_file = root.join(".gitignore");
    if gitignore_file.exists() {
        if let Some(err) = ignore.add(&gitignore_file) {
            return Err(err.into());
        }
    }
    for pattern in &opts.excludes {
        // Comment and blank lines are inert, matching gitignore semantics.
        ignore.add_line(None, pattern)?;
    }
    let ignore = ignore.build()?;

    let mut builder = tar::Builder::new(w);
    builder.follow_symlinks(false);

    for entry in WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
    {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walked path is under root");
        let name = slash_path(rel);

        if name.starts_with(".git") {
            continue;
        }
        if ignore
            .matched_path_or_any_parents(rel, entry.file_type().is_dir())
            .is_ignore()
        {
            continue;
        }

        let archive_name = if opts.prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", opts.prefix, name)
        };

        let meta = entry.metadata()?;
        let mut header = Header::new_gnu();
        header.set_uid(NOBODY);
        header.set_gid(NOBODY);
        header.set_mtime(
            meta.modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0),
        );

        if entry.file_type().is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            let target = validate_link_target(root, rel, &target, &name)?;
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            builder.append_link(&mut header, &archive_name, &target)?;
        } else if entry.file_type().is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o777);
            builder.append_data(&mut header, format!("{archive_name}/"), std::io::empty())?;
        } else {
            header.set_entry_type(EntryType::Regular);
            header.set_size(meta.len());
            header.set_mode(file_mode(&meta));
            let file = std::fs::File::open(entry.path())?;
            builder.append_data(&mut header, &archive_name, file)?;
        }
    }

    for (name, contents) in &opts.extra_entries {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_uid(NOBODY);
        header.set_gid(NOBODY);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_size(contents.len() as u64);
        builder.append_data(&mut header, name, contents.as_slice())?;
    }

    builder.into_inner()?.flush()?;
    Ok(())
}

/// Convenience: archive into memory. Used by the local build path, where
/// the engine upload API takes the body whole.
pub fn archive_to_vec(root: &Path, opts: &ArchiveOptions) -> Result<Vec<u8>, SourceError> {
    let mut buf = Vec::new();
    write_archive(root, opts, &mut buf)?;
    Ok(buf)
}

/// A TAR of a function root, streamed through an in-memory pipe.
///
/// The producer runs on a blocking thread; any walk or validation error
/// closes the pipe, and [`SourceStream::finish`] surfaces it. Consumers
/// must read `reader` to EOF and then call `finish` — a truncated stream
/// with an unchecked producer result would otherwise look like success.
pub struct SourceStream {
    pub reader: tokio::io::DuplexStream,
    handle: tokio::task::JoinHandle<Result<(), SourceError>>,
}

impl SourceStream {
    pub fn open(root: PathBuf, opts: ArchiveOptions) -> SourceStream {
        let (writer, reader) = tokio::io::duplex(64 * 1024);
        let bridge = SyncIoBridge::new(writer);
        let handle =
            tokio::task::spawn_blocking(move || write_archive(&root, &opts, bridge));
        SourceStream { reader, handle }
    }

    /// Await the producer and surface its error, if any.
    pub async fn finish(self) -> Result<(), SourceError> {
        drop(self.reader);
        match self.handle.await {
            Ok(result) => result,
            Err(join) => Err(SourceError::Io(std::io::Error::other(join))),
        }
    }
}

/// Validate a symlink target lexically and return the target to store in
/// the archive header.
///
/// An absolute target is first rebased to be relative to the source root;
/// in all cases the target resolved against the link's parent directory
/// must stay under the root.
fn validate_link_target(
    root: &Path,
    link_rel: &Path,
    target: &Path,
    link_name: &str,
) -> Result<PathBuf, SourceError> {
    let escape = || SourceError::SymlinkEscapes {
        link: link_name.to_string(),
        target: target.display().to_string(),
    };

    let parent = link_rel.parent().unwrap_or(Path::new(""));

    let relative_target = if target.is_absolute() {
        let under_root = target.strip_prefix(root).map_err(|_| escape())?;
        // Rewrite as a path relative to the link's own directory.
        let mut rebased = PathBuf::new();
        for _ in parent.components() {
            rebased.push("..");
        }
        rebased.push(under_root);
        rebased
    } else {
        target.to_path_buf()
    };

    normalize_within(parent, &relative_target).ok_or_else(escape)?;
    Ok(relative_target)
}

/// Lexically resolve `target` against `base` (both relative), folding `.`
/// and `..`. Returns `None` when the result would climb above the root.
fn normalize_within(base: &Path, target: &Path) -> Option<PathBuf> {
    let mut stack: Vec<std::ffi::OsString> = base
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_os_string()),
            _ => None,
        })
        .collect();
    for component in target.components() {
        match component {
            Component::Normal(s) => stack.push(s.to_os_string()),
            Component::ParentDir => {
                stack.pop()?;
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(stack.iter().collect())
}

fn slash_path(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

/// Mirror of the producer: extract an archive under `dest` with the same
/// safety rules consumers of the stream are expected to apply.
pub fn extract<R: Read>(reader: R, dest: &Path) -> Result<(), SourceError> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.into_owned();
        if name
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(SourceError::UnsafeEntryName(
                name.display().to_string(),
            ));
        }
        let out = dest.join(&name);
        match entry.header().entry_type() {
            EntryType::Directory => {
                std::fs::create_dir_all(&out)?;
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| SourceError::UnsafeEntryName(name.display().to_string()))?
                    .into_owned();
                if target.is_absolute() {
                    return Err(SourceError::AbsoluteLinkTarget(name.display().to_string()));
                }
                let parent = name.parent().unwrap_or(Path::new(""));
                normalize_within(parent, &target).ok_or_else(|| SourceError::SymlinkEscapes {
                    link: name.display().to_string(),
                    target: target.display().to_string(),
                })?;
                if let Some(dir) = out.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                #[cfg(unix)]
                std::os::unix::fs::symlink(&target, &out)?;
                #[cfg(not(unix))]
                return Err(SourceError::UnsafeEntryName(name.display().to_string()));
            }
            _ => {
                if let Some(dir) = out.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                let mut file = std::fs::File::create(&out)?;
                std::io::copy(&mut entry, &mut file)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let mode = entry.header().mode().unwrap_or(0o644) & 0o777;
                    std::fs::set_permissions(&out, std::fs::Permissions::from_mode(mode))?;
                }
            }
        }
    }
    Ok(())
}

/// List the entry names of an archive, mapped to their link targets for
/// symlinks. Test and diagnostic helper.
pub fn list_entries<R: Read>(reader: R) -> Result<BTreeMap<String, Option<String>>, SourceError> {
    let mut archive = tar::Archive::new(reader);
    let mut out = BTreeMap::new();
    for entry in archive.entries()? {
        let entry = entry?;
        let name = entry.path()?.display().to_string();
        let link = entry.link_name()?.map(|l| l.display().to_string());
        out.insert(name, link);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path, contents: &str) {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn entries_live_under_source_prefix() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("main.go"), "package main");
        touch(&dir.path().join("pkg/util.go"), "package pkg");

        let tar = archive_to_vec(dir.path(), &ArchiveOptions::with_prefix("source")).unwrap();
        let entries = list_entries(tar.as_slice()).unwrap();
        assert!(entries.contains_key("source/main.go"));
        assert!(entries.contains_key("source/pkg/"));
        assert!(entries.contains_key("source/pkg/util.go"));
    }

    #[test]
    fn git_metadata_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join(".git/HEAD"), "ref: refs/heads/main");
        touch(&dir.path().join(".gitignore"), "ignored.txt\n");
        touch(&dir.path().join("ignored.txt"), "x");
        touch(&dir.path().join("kept.txt"), "y");

        let tar = archive_to_vec(dir.path(), &ArchiveOptions::with_prefix("source")).unwrap();
        let entries = list_entries(tar.as_slice()).unwrap();
        assert!(entries.contains_key("source/kept.txt"));
        assert!(!entries.keys().any(|k| k.contains(".git")));
        assert!(!entries.contains_key("source/ignored.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn sibling_symlink_is_kept_relative() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("target.txt"), "data");
        std::os::unix::fs::symlink("target.txt", dir.path().join("link.txt")).unwrap();

        let tar = archive_to_vec(dir.path(), &ArchiveOptions::with_prefix("source")).unwrap();
        let entries = list_entries(tar.as_slice()).unwrap();
        assert_eq!(
            entries["source/link.txt"],
            Some("target.txt".to_string())
        );
    }

    #[cfg(unix)]
    #[test]
    fn absolute_symlink_inside_root_is_rebased() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        touch(&root.join("data/file.txt"), "data");
        fs::create_dir_all(root.join("sub")).unwrap();
        std::os::unix::fs::symlink(root.join("data/file.txt"), root.join("sub/link")).unwrap();

        let tar = archive_to_vec(&root, &ArchiveOptions::with_prefix("source")).unwrap();
        let entries = list_entries(tar.as_slice()).unwrap();
        assert_eq!(
            entries["source/sub/link"],
            Some("../data/file.txt".to_string())
        );
    }

    #[cfg(unix)]
    #[test]
    fn escaping_relative_symlink_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("../outside", dir.path().join("bad")).unwrap();

        let err =
            archive_to_vec(dir.path(), &ArchiveOptions::with_prefix("source")).unwrap_err();
        assert!(matches!(err, SourceError::SymlinkEscapes { .. }), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn escaping_absolute_symlink_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/etc/passwd", dir.path().join("bad")).unwrap();

        let err =
            archive_to_vec(dir.path(), &ArchiveOptions::with_prefix("source")).unwrap_err();
        assert!(matches!(err, SourceError::SymlinkEscapes { .. }), "{err}");
    }

    #[test]
    fn exclude_patterns_apply() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("hello.txt"), "hello");
        touch(&dir.path().join("kept.rs"), "fn main() {}");

        let opts = ArchiveOptions {
            prefix: "source".into(),
            excludes: vec!["# comment".into(), "hello.txt".into()],
            ..Default::default()
        };
        let tar = archive_to_vec(dir.path(), &opts).unwrap();
        let entries = list_entries(tar.as_slice()).unwrap();
        assert!(!entries.contains_key("source/hello.txt"));
        assert!(entries.contains_key("source/kept.rs"));
    }

    #[test]
    fn extra_entries_are_emitted_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("app.py"), "print('hi')");

        let opts = ArchiveOptions {
            prefix: "workspace".into(),
            extra_entries: vec![("workspace/Procfile".into(), b"web: python app.py".to_vec())],
            ..Default::default()
        };
        let tar = archive_to_vec(dir.path(), &opts).unwrap();
        let entries = list_entries(tar.as_slice()).unwrap();
        assert!(entries.contains_key("workspace/Procfile"));
    }

    #[test]
    fn extraction_rejects_parent_dir_names() {
        let mut buf = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut buf);
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_size(2);
            header.set_mode(0o644);
            let name = b"../evil";
            header.as_old_mut().name[..name.len()].copy_from_slice(name);
            header.set_cksum();
            builder.append(&header, b"hi".as_slice()).unwrap();
            builder.finish().unwrap();
        }
        let dest = tempfile::tempdir().unwrap();
        let err = extract(buf.as_slice(), dest.path()).unwrap_err();
        assert!(matches!(err, SourceError::UnsafeEntryName(_)), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn extraction_rejects_absolute_link_targets() {
        let mut buf = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut buf);
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            builder
                .append_link(&mut header, "link", "/etc/passwd")
                .unwrap();
            builder.finish().unwrap();
        }
        let dest = tempfile::tempdir().unwrap();
        let err = extract(buf.as_slice(), dest.path()).unwrap_err();
        assert!(matches!(err, SourceError::AbsoluteLinkTarget(_)), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn round_trip_preserves_permission_bits() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("run.sh");
        touch(&script, "#!/bin/sh\n");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let tar = archive_to_vec(dir.path(), &ArchiveOptions::default()).unwrap();
        let dest = tempfile::tempdir().unwrap();
        extract(tar.as_slice(), dest.path()).unwrap();
        let mode = fs::metadata(dest.path().join("run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn stream_surfaces_producer_errors() {
        let dir = tempfile::tempdir().unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("../outside", dir.path().join("bad")).unwrap();
        #[cfg(not(unix))]
        return;

        let mut stream = SourceStream::open(
            dir.path().to_path_buf(),
            ArchiveOptions::with_prefix("source"),
        );
        let mut sink = Vec::new();
        // Producer error closes the pipe; reading to EOF must not hang.
        let _ = tokio::io::copy(&mut stream.reader, &mut sink).await;
        let err = stream.finish().await.unwrap_err();
        assert!(matches!(err, SourceError::SymlinkEscapes { .. }), "{err}");
    }
}
