//! Directory-backed hierarchical container. Groups and datasets map to
//! flat files under `<prefix>.store/`; the group separator `/` becomes a
//! dot in file names. Intermediate stage files live in the same directory
//! under a `tmp.` prefix so a failed run leaves them inspectable.

use crate::error::Error;
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};

pub struct Container {
    root: PathBuf,
}

impl Container {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| Error::fs(&root, e))?;
        Ok(Container { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset_path(&self, name: &str) -> PathBuf {
        self.root.join(name.replace('/', "."))
    }

    pub fn has_dataset(&self, name: &str) -> bool {
        self.dataset_path(name).is_file()
    }

    pub fn write_dataset(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.dataset_path(name);
        fs::write(&path, bytes).map_err(|e| Error::fs(&path, e))
    }

    pub fn read_dataset(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.dataset_path(name);
        fs::read(&path).map_err(|e| Error::fs(&path, e))
    }

    pub fn remove_dataset(&self, name: &str) -> Result<()> {
        let path = self.dataset_path(name);
        if path.is_file() {
            fs::remove_file(&path).map_err(|e| Error::fs(&path, e))?;
        }
        Ok(())
    }

    /// Flat key=value properties, used for the configuration record.
    pub fn write_properties(&self, name: &str, props: &[(String, String)]) -> Result<()> {
        let mut out = String::new();
        for (k, v) in props {
            out.push_str(&format!("{k}={v}\n"));
        }
        self.write_dataset(name, out.as_bytes())
    }

    pub fn read_properties(&self, name: &str) -> Result<Vec<(String, String)>> {
        let bytes = self.read_dataset(name)?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(text
            .lines()
            .filter_map(|l| {
                l.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datasets_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let c = Container::open(dir.path().join("x.store")).unwrap();
        c.write_dataset("dsk/solid.0", b"abc").unwrap();
        assert!(c.has_dataset("dsk/solid.0"));
        assert_eq!(c.read_dataset("dsk/solid.0").unwrap(), b"abc");
        c.remove_dataset("dsk/solid.0").unwrap();
        assert!(!c.has_dataset("dsk/solid.0"));
    }

    #[test]
    fn properties_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let c = Container::open(dir.path().join("y.store")).unwrap();
        c.write_properties(
            "configuration/xml",
            &[("kmer_size".into(), "31".into()), ("nb_passes".into(), "1".into())],
        )
        .unwrap();
        let props = c.read_properties("configuration/xml").unwrap();
        assert!(props.contains(&("kmer_size".to_string(), "31".to_string())));
    }
}
