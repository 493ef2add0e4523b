use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs::{self, File},
    io::{self, BufReader},
    path::Path,
};

pub mod error {
    use std::{io, path::PathBuf};

    pub type Result<T> = std::result::Result<T, self::Error>;

    type Msg = &'static str;

    #[derive(Debug, thiserror::Error)]
    pub enum Error {
        #[error("{0} ({1}): {2}")]
        SingleIO(Msg, PathBuf, #[source] io::Error),

        #[error("{0} (from='{1}', to='{2}'): {3}")]
        FromToIO(Msg, PathBuf, PathBuf, #[source] io::Error),

        #[error("Cannot create symlink (orig='{0}', link='{1}'): {2}")]
        Symlink(PathBuf, PathBuf, #[source] io::Error),

        #[error("Cannot serialize to JSON (dest='{0}'): {1}")]
        SerializeToJson(PathBuf, #[source] serde_json::Error),

        #[error("Cannot deserialize from JSON (src='{0}'): {1}")]
        DeserializeFromJson(PathBuf, #[source] serde_json::Error),
    }

    impl Error {
        pub fn path(&self) -> &std::path::Path {
            match self {
                Self::SingleIO(_, p, _)
                | Self::FromToIO(_, p, _, _)
                | Self::Symlink(_, p, _)
                | Self::SerializeToJson(p, _)
                | Self::DeserializeFromJson(p, _) => p,
            }
        }

        pub fn is_not_found(&self) -> bool {
            match self {
                Self::SingleIO(_, _, e) | Self::FromToIO(_, _, _, e) | Self::Symlink(_, _, e) => {
                    e.kind() == io::ErrorKind::NotFound
                }
                _ => false,
            }
        }
    }
}
pub use error::{Error, Result};

#[must_use]
pub fn mkdir_all(path: impl AsRef<Path>) -> Result<()> {
    let dir = path.as_ref();
    fs::create_dir_all(dir).map_err(|e| Error::SingleIO("Cannot create dir", dir.to_owned(), e))
}

#[must_use]
pub fn write<P, C>(filepath: P, contents: C) -> Result<()>
where
    P: AsRef<Path>,
    C: AsRef<[u8]>,
{
    fs::write(&filepath, contents)
        .map_err(|e| Error::SingleIO("Cannot write file", filepath.as_ref().to_owned(), e))
}

#[must_use]
pub fn write_with_mkdir<P, C>(filepath: P, contents: C) -> Result<()>
where
    P: AsRef<Path>,
    C: AsRef<[u8]>,
{
    if let Some(dir) = filepath.as_ref().parent() {
        self::mkdir_all(dir)?;
    }
    self::write(filepath, contents)
}

#[must_use]
pub fn read(filepath: impl AsRef<Path>) -> Result<Vec<u8>> {
    fs::read(&filepath)
        .map_err(|e| Error::SingleIO("Cannot read file", filepath.as_ref().to_owned(), e))
}

#[must_use]
pub fn read_to_string(filepath: impl AsRef<Path>) -> Result<String> {
    fs::read_to_string(&filepath)
        .map_err(|e| Error::SingleIO("Cannot read file", filepath.as_ref().to_owned(), e))
}

#[must_use]
pub fn remove_file(filepath: impl AsRef<Path>) -> Result<()> {
    fs::remove_file(&filepath)
        .map_err(|e| Error::SingleIO("Cannot remove file", filepath.as_ref().to_owned(), e))
}

/// Removes the file, treating an already-missing file as success.
/// Returns whether something was actually removed.
#[must_use]
pub fn remove_file_if_exists(filepath: impl AsRef<Path>) -> Result<bool> {
    match fs::remove_file(&filepath) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::SingleIO(
            "Cannot remove file",
            filepath.as_ref().to_owned(),
            e,
        )),
    }
}

#[must_use]
pub fn remove_dir_all_if_exists(dir: impl AsRef<Path>) -> Result<()> {
    match fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::SingleIO(
            "Cannot remove dir",
            dir.as_ref().to_owned(),
            e,
        )),
    }
}

/// Recreates `dir` as an empty directory.
#[must_use]
pub fn reset_dir(dir: impl AsRef<Path>) -> Result<()> {
    self::remove_dir_all_if_exists(&dir)?;
    self::mkdir_all(dir)
}

#[must_use]
pub fn write_json_with_mkdir<P, T>(filepath: P, data: &T) -> Result<()>
where
    P: AsRef<Path>,
    T: Serialize,
{
    let s = serde_json::to_string_pretty(data)
        .map_err(|e| Error::SerializeToJson(filepath.as_ref().to_owned(), e))?;
    write_with_mkdir(filepath, &s)
}

#[must_use]
pub fn read_json_with_deserialize<P, T>(filepath: P) -> Result<T>
where
    P: AsRef<Path>,
    T: DeserializeOwned,
{
    let filepath = filepath.as_ref();
    let f = File::open(filepath)
        .map_err(|e| Error::SingleIO("Cannot read file", filepath.to_owned(), e))?;
    serde_json::from_reader(BufReader::new(f))
        .map_err(|e| Error::DeserializeFromJson(filepath.to_owned(), e))
}

#[must_use]
pub fn copy_file(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<u64> {
    fs::copy(&from, &to).map_err(|e| {
        Error::FromToIO(
            "Cannot copy file",
            from.as_ref().to_owned(),
            to.as_ref().to_owned(),
            e,
        )
    })
}

#[must_use]
pub fn copy_file_with_mkdir(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<u64> {
    if let Some(dir) = to.as_ref().parent() {
        self::mkdir_all(dir)?;
    }
    self::copy_file(from, to)
}

/// Creates `link` pointing at `orig`, replacing whatever `link` was before.
#[must_use]
#[cfg(unix)]
pub fn symlink(orig: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<()> {
    let link = link.as_ref();
    if link.is_symlink() || link.is_file() {
        fs::remove_file(link).map_err(|e| {
            Error::SingleIO(
                "Cannot create symlink: failed to remove existing entry",
                link.to_owned(),
                e,
            )
        })?;
    }
    std::os::unix::fs::symlink(&orig, link)
        .map_err(|e| Error::Symlink(orig.as_ref().to_owned(), link.to_owned(), e))
}

#[must_use]
#[cfg(unix)]
pub fn set_executable(filepath: impl AsRef<Path>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let filepath = filepath.as_ref();
    let meta = fs::metadata(filepath)
        .map_err(|e| Error::SingleIO("Cannot stat file", filepath.to_owned(), e))?;
    let mut perm = meta.permissions();
    perm.set_mode(perm.mode() | 0o755);
    fs::set_permissions(filepath, perm)
        .map_err(|e| Error::SingleIO("Cannot chmod file", filepath.to_owned(), e))
}
