// kiln-core/tests/common/mod.rs
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use kiln_common::error::Result;
use kiln_common::model::formula::FormulaSpec;
use kiln_core::build::{CommandOutcome, CommandRunner, Invocation};

/// Writes `<dir>/<name>.tar.gz` holding `files` below a single `<name>/` directory and returns
/// its `file://` URL and SHA-256.
pub fn tarball(dir: &Path, name: &str, files: &[(&str, &str)]) -> (String, String) {
    let path = dir.join(format!("{name}.tar.gz"));
    let encoder = GzEncoder::new(std::fs::File::create(&path).unwrap(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (file, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{name}/{file}"), content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
    let sha = kiln_aio::checksum::sha256_file(&path).unwrap();
    (file_url(&path), sha)
}

pub fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

pub fn formula(value: serde_json::Value) -> FormulaSpec {
    serde_json::from_value(value).unwrap()
}

/// Records every invocation and answers from a closure.
pub struct RecordingRunner {
    calls: Mutex<Vec<Invocation>>,
    respond: Box<dyn Fn(&Invocation) -> CommandOutcome + Send + Sync>,
}

impl RecordingRunner {
    pub fn new(respond: impl Fn(&Invocation) -> CommandOutcome + Send + Sync + 'static) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(|_| exit(0))
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, invocation: &Invocation, _timeout: Option<Duration>) -> Result<CommandOutcome> {
        self.calls.lock().unwrap().push(invocation.clone());
        Ok((self.respond)(invocation))
    }
}

pub fn exit(code: i32) -> CommandOutcome {
    CommandOutcome {
        exit_code: Some(code),
        timed_out: false,
        stdout: String::new(),
        stderr: String::new(),
    }
}

/// The build tree a formula's commands run in has the formula's name in its path.
pub fn building(invocation: &Invocation, name: &str) -> bool {
    invocation
        .cwd
        .components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with(&format!("{name}-")))
}

pub fn downloads(root: &Path) -> PathBuf {
    root.join("cache").join("downloads")
}
