use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::{
    codec::{decode_update, sanitize_filename, CodecError},
    config::DeviceConfig,
    script::{DeviceHost, DeviceScript, ScriptError, ScriptLimits},
};

#[derive(Debug, Error)]
pub enum OtaError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("update payload is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("storage error on {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Directory holding scripts received over the air.
#[derive(Debug, Clone)]
pub struct ScriptStorage {
    root: PathBuf,
}

impl ScriptStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, filename: &str) -> Result<PathBuf, OtaError> {
        Ok(self.root.join(sanitize_filename(filename)?))
    }

    pub fn write(&self, filename: &str, code: &str) -> Result<PathBuf, OtaError> {
        let path = self.path_for(filename)?;
        std::fs::create_dir_all(&self.root).map_err(|source| OtaError::Storage {
            path: self.root.clone(),
            source,
        })?;
        std::fs::write(&path, code).map_err(|source| OtaError::Storage {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn read(&self, filename: &str) -> Result<String, OtaError> {
        let path = self.path_for(filename)?;
        std::fs::read_to_string(&path).map_err(|source| OtaError::Storage { path, source })
    }

    /// First saved script (lexical order) whose name matches `prefix` and
    /// `suffix`. A missing directory means nothing was saved yet.
    pub fn find_saved_script(
        &self,
        prefix: &str,
        suffix: &str,
    ) -> Result<Option<String>, OtaError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(OtaError::Storage {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| OtaError::Storage {
                path: self.root.clone(),
                source,
            })?;
            if !entry.file_type().map(|kind| kind.is_file()).unwrap_or(false) {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with(prefix) && name.ends_with(suffix) {
                names.push(name);
            }
        }

        names.sort();
        Ok(names.into_iter().next())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateReport {
    pub filename: String,
    pub path: PathBuf,
    pub commands_run: usize,
}

/// Applies OTA updates on the device: store, then run against the
/// device's capabilities. Every outcome is reported on the debug channel
/// of the supplied host.
#[derive(Debug, Clone)]
pub struct OtaAgent {
    storage: ScriptStorage,
    limits: ScriptLimits,
    max_payload_bytes: usize,
    script_prefix: String,
    script_suffix: String,
}

impl OtaAgent {
    pub fn new(storage: ScriptStorage, config: &DeviceConfig) -> Self {
        Self {
            storage,
            limits: config.script_limits(),
            max_payload_bytes: config.max_payload_bytes,
            script_prefix: config.script_prefix.clone(),
            script_suffix: config.script_suffix.clone(),
        }
    }

    pub fn storage(&self) -> &ScriptStorage {
        &self.storage
    }

    /// Handles one raw message from the code-update topic. Failures are
    /// published as `OTA exec error: ...` and also returned.
    pub fn handle_update<H: DeviceHost + ?Sized>(
        &self,
        raw: &[u8],
        host: &mut H,
    ) -> Result<UpdateReport, OtaError> {
        self.apply_update(raw, host).inspect_err(|err| {
            host.publish_debug(&format!("OTA exec error: {err}"));
        })
    }

    fn apply_update<H: DeviceHost + ?Sized>(
        &self,
        raw: &[u8],
        host: &mut H,
    ) -> Result<UpdateReport, OtaError> {
        if raw.len() > self.max_payload_bytes {
            return Err(OtaError::TooLarge {
                size: raw.len(),
                limit: self.max_payload_bytes,
            });
        }

        let payload = decode_update(raw)?;
        payload.verify_digest()?;
        let filename = sanitize_filename(&payload.filename)?;

        let path = self.storage.write(&filename, &payload.code)?;
        host.publish_debug(&format!("OTA: Saved {filename}. Running..."));

        let script = DeviceScript::parse(&payload.code, &self.limits)?;
        script.run(host)?;
        host.publish_debug(&format!("Execution of {filename} complete."));

        Ok(UpdateReport {
            filename,
            path,
            commands_run: script.commands().len(),
        })
    }

    /// Runs the first saved user script, if any. Called once at startup
    /// before the sensing loop.
    pub fn run_saved_script<H: DeviceHost + ?Sized>(
        &self,
        host: &mut H,
    ) -> Result<Option<String>, OtaError> {
        let Some(filename) = self
            .storage
            .find_saved_script(&self.script_prefix, &self.script_suffix)?
        else {
            return Ok(None);
        };

        match self.run_stored(&filename, host) {
            Ok(()) => {
                host.publish_debug("Running user script after reboot");
                Ok(Some(filename))
            }
            Err(err) => {
                host.publish_debug(&format!("Script error: {err}"));
                Err(err)
            }
        }
    }

    fn run_stored<H: DeviceHost + ?Sized>(
        &self,
        filename: &str,
        host: &mut H,
    ) -> Result<(), OtaError> {
        let code = self.storage.read(filename)?;
        let script = DeviceScript::parse(&code, &self.limits)?;
        script.run(host)?;
        Ok(())
    }
}
