//! Engine discovery using `gpgconf`.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use lazy_static::lazy_static;
use log::{debug, warn};

use super::{
    default_home_dir, EngineData, CMS_REQ_VERSION, GPGCONF_REQ_VERSION,
    OPENPGP_REQ_VERSION,
};
use crate::Protocol;

/// Errors during engine discovery.
#[derive(thiserror::Error, Debug)]
enum Error {
    /// Errors reported by gpgconf.
    #[error("gpgconf: {0}")]
    GPGConf(String),
    /// The engine's version could not be determined.
    #[error("cannot determine the version of {0:?}")]
    Version(PathBuf),
}

lazy_static! {
    static ref ENGINES: Mutex<Option<Arc<Vec<EngineData>>>> = Mutex::new(None);
}

/// Returns the installed engines.
///
/// Discovery runs once per process, the result is cached.  Engines
/// that cannot be found are listed without a file name or version.
pub(crate) fn discover() -> Arc<Vec<EngineData>> {
    let mut engines = match ENGINES.lock() {
        Ok(e) => e,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(e) = engines.as_ref() {
        return e.clone();
    }

    let gpgconf_path = which("gpgconf");
    let components = match components(
        gpgconf_path.as_deref().unwrap_or_else(|| Path::new("gpgconf")))
    {
        Ok(c) => c,
        Err(e) => {
            debug!("falling back to searching PATH: {:#}", e);
            Vec::new()
        },
    };
    let lookup = |name: &str, fallbacks: &[&str]| -> Option<PathBuf> {
        components.iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.clone())
            .or_else(|| fallbacks.iter().filter_map(|f| which(f)).next())
    };

    let home_dir = default_home_dir();
    let list = vec![
        (Protocol::OpenPgp, lookup("gpg", &["gpg", "gpg2"]),
         OPENPGP_REQ_VERSION),
        (Protocol::Cms, lookup("gpgsm", &["gpgsm"]), CMS_REQ_VERSION),
        (Protocol::GpgConf, gpgconf_path.clone(), GPGCONF_REQ_VERSION),
    ].into_iter().map(|(protocol, file_name, req_version)| {
        let version = file_name.as_ref().and_then(|f| match version(f) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("{:#}", e);
                None
            },
        });
        EngineData {
            protocol,
            file_name,
            version,
            req_version: Some(req_version),
            home_dir: home_dir.clone(),
        }
    }).collect::<Vec<_>>();

    for e in list.iter() {
        debug!("engine {}: {:?} version {:?}",
               e.protocol, e.file_name, e.version);
    }

    let list = Arc::new(list);
    *engines = Some(list.clone());
    list
}

/// Lists the components known to `gpgconf` as (name, executable).
fn components(program: &Path) -> anyhow::Result<Vec<(String, PathBuf)>> {
    Ok(gpgconf(program, None, &["--list-components"], 3)?.into_iter()
       .map(|mut record| (std::mem::take(&mut record[0]),
                          PathBuf::from(std::mem::take(&mut record[2]))))
       .collect())
}

/// Runs the `gpgconf` at `program`.
///
/// Each line of output is a record, split into `nfields`
/// colon-separated fields, the last one taking the rest of the line.
/// Lines with fewer fields are an error.
pub(crate) fn gpgconf(program: &Path, homedir: Option<&Path>,
                      arguments: &[&str], nfields: usize)
                      -> anyhow::Result<Vec<Vec<String>>> {
    let mut cmd = Command::new(program);
    if let Some(homedir) = homedir {
        // gpgconf ignores --homedir for some commands, see
        // https://dev.gnupg.org/T4496
        cmd.arg("--homedir").arg(homedir).env("GNUPGHOME", homedir);
    }
    let output = cmd.args(arguments).output()
        .map_err(|e| Error::GPGConf(
            format!("running {}: {}", program.display(), e)))?;
    if ! output.status.success() {
        return Err(Error::GPGConf(
            String::from_utf8_lossy(&output.stderr).trim_end().into()).into());
    }

    String::from_utf8_lossy(&output.stdout).lines()
        .filter(|line| ! line.is_empty())
        .map(|line| {
            let record = line.splitn(nfields, ':')
                .map(String::from)
                .collect::<Vec<_>>();
            if record.len() == nfields {
                Ok(record)
            } else {
                Err(Error::GPGConf(format!(
                    "expected {} fields, got {:?}", nfields, line)).into())
            }
        })
        .collect()
}

/// Returns the version of the engine at `path`.
///
/// This is the last word of the first line printed by `--version`.
pub(crate) fn version(path: &Path) -> anyhow::Result<String> {
    let output = Command::new(path).arg("--version").output()
        .with_context(|| format!("running {:?}", path))?;
    if ! output.status.success() {
        return Err(Error::Version(path.into()).into());
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .and_then(|l| l.split_whitespace().last())
        .map(String::from)
        .ok_or_else(|| Error::Version(path.into()).into())
}

/// Searches `PATH` for an executable.
fn which(name: &str) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths)
            .map(|d| d.join(name))
            .find(|p| p.metadata()
                  .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                  .unwrap_or(false))
    })
}

/// Stops the agent and the other daemons serving `homedir`.
pub(crate) fn kill_all(program: &Path, homedir: &Path) -> anyhow::Result<()> {
    gpgconf(program, Some(homedir), &["--kill", "all"], 1)?;
    Ok(())
}
