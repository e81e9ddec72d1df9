//! The supervisor → worker contract, carried in the worker's environment.

use std::{env, path::PathBuf};

use crate::utils::{
    ENV_BIN_ID, ENV_BIN_PATH, ENV_IS_WORKER, ENV_NUM_FDS, ENV_WORKER_ID, WORKER_TRUE_VAL,
};

#[derive(Debug, derive_more::Display)]
#[display("{_variant}")]
pub enum HandshakeError {
    #[display("invalid environment: {}", _0)]
    BadEnvironment(String),

    #[display("missing env var {}", _0)]
    Missing(&'static str),
}

impl std::error::Error for HandshakeError {}

/// Identifies a running worker: which binary it runs, which spawn it is, and how many listeners
/// it inherited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDescriptor {
    pub bin_id: String,
    pub worker_id: u64,
    pub num_fds: usize,
    pub bin_path: PathBuf,
}

impl ProcessDescriptor {
    /// Variables the supervisor sets on the worker command, marker included.
    pub(crate) fn to_env(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENV_IS_WORKER, WORKER_TRUE_VAL.to_owned()),
            (ENV_WORKER_ID, self.worker_id.to_string()),
            (ENV_NUM_FDS, self.num_fds.to_string()),
            (ENV_BIN_ID, self.bin_id.clone()),
            (ENV_BIN_PATH, self.bin_path.to_string_lossy().into_owned()),
        ]
    }

    pub(crate) fn from_env() -> Result<Option<Self>, HandshakeError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// `Ok(None)` when the worker marker is absent, i.e. this process is a supervisor.
    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Option<Self>, HandshakeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(ENV_IS_WORKER) {
            None => return Ok(None),
            Some(ref s) if s == WORKER_TRUE_VAL => (),
            Some(s) => {
                return Err(HandshakeError::BadEnvironment(format!(
                    "value {s:?} of env var {ENV_IS_WORKER} is not valid"
                )))
            }
        }

        let required = |key: &'static str| lookup(key).ok_or(HandshakeError::Missing(key));

        let worker_id = parse(ENV_WORKER_ID, &required(ENV_WORKER_ID)?)?;
        let num_fds = parse(ENV_NUM_FDS, &required(ENV_NUM_FDS)?)?;
        let bin_id = required(ENV_BIN_ID)?;
        let bin_path = PathBuf::from(required(ENV_BIN_PATH)?);

        Ok(Some(Self {
            bin_id,
            worker_id,
            num_fds,
            bin_path,
        }))
    }
}

/// Listener count a supervisor was handed by whoever exec'd it, if any.
pub(crate) fn inherited_fd_count() -> Result<Option<usize>, HandshakeError> {
    match env::var(ENV_NUM_FDS) {
        Ok(v) => parse(ENV_NUM_FDS, &v).map(Some),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(_) => Err(HandshakeError::BadEnvironment(format!(
            "{ENV_NUM_FDS} is not unicode"
        ))),
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, HandshakeError> {
    value
        .parse()
        .map_err(|_| HandshakeError::BadEnvironment(format!("{key} is not an integer: {value:?}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_in(vars: &[(&'static str, String)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn descriptor_survives_the_environment() {
        let desc = ProcessDescriptor {
            bin_id: "ab12".into(),
            worker_id: 7,
            num_fds: 3,
            bin_path: "/usr/local/bin/daemon".into(),
        };
        let decoded = ProcessDescriptor::from_lookup(lookup_in(&desc.to_env()))
            .unwrap()
            .unwrap();
        assert_eq!(decoded, desc);
    }

    #[test]
    fn no_marker_means_supervisor() {
        let vars = [(ENV_NUM_FDS, "2".to_owned())];
        assert!(ProcessDescriptor::from_lookup(lookup_in(&vars))
            .unwrap()
            .is_none());
    }

    #[test]
    fn bad_marker_is_rejected() {
        let vars = [(ENV_IS_WORKER, "yes".to_owned())];
        assert!(matches!(
            ProcessDescriptor::from_lookup(lookup_in(&vars)),
            Err(HandshakeError::BadEnvironment(_))
        ));
    }

    #[test]
    fn missing_and_malformed_fields() {
        let vars = [
            (ENV_IS_WORKER, "1".to_owned()),
            (ENV_WORKER_ID, "1".to_owned()),
            (ENV_NUM_FDS, "two".to_owned()),
        ];
        assert!(matches!(
            ProcessDescriptor::from_lookup(lookup_in(&vars)),
            Err(HandshakeError::BadEnvironment(_))
        ));

        let vars = [
            (ENV_IS_WORKER, "1".to_owned()),
            (ENV_WORKER_ID, "1".to_owned()),
            (ENV_NUM_FDS, "2".to_owned()),
            (ENV_BIN_ID, "ab".to_owned()),
        ];
        assert!(matches!(
            ProcessDescriptor::from_lookup(lookup_in(&vars)),
            Err(HandshakeError::Missing(ENV_BIN_PATH))
        ));
    }
}
