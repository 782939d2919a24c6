// kiln-aio/src/json_io.rs
use std::path::Path;

use kiln_common::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Writes pretty-printed JSON atomically, creating parent directories.
pub fn write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    debug!("Writing JSON to: {}", path.display());
    let mut bytes = serde_json::to_vec_pretty(data)?;
    bytes.push(b'\n');
    crate::fs::atomic_write_file(path, &bytes)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    debug!("Reading JSON from: {}", path.display());
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn json_survives_a_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receipt").join("INSTALL_RECEIPT.json");
        let data = BTreeMap::from([("name".to_string(), "xz".to_string())]);
        write_json(&path, &data).unwrap();
        let back: BTreeMap<String, String> = read_json(&path).unwrap();
        assert_eq!(back, data);
        assert!(std::fs::read_to_string(&path).unwrap().ends_with("}\n"));
    }
}
