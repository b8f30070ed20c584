// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::info;
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

/// Config files may carry `//` or `#` comment lines. Comments are blanked
/// out of the body so that serde_json error positions still match the file.
fn read_json<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut f = fs::OpenOptions::new().read(true).open(path)?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;

    let mut body = String::new();
    for line in buf.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with("//") && !trimmed.starts_with('#') {
            body += line;
        }
        body += "\n";
    }
    Ok(body)
}

pub trait JsonLoad
where
    Self: DeserializeOwned,
{
    fn loaded(&mut self) -> Result<()> {
        Ok(())
    }

    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let body = read_json(path)?;
        serde_json::from_str::<Self>(&body).with_context(|| format!("parsing {:?}", path))
    }
}

pub trait JsonSave
where
    Self: Default + Serialize,
{
    fn preamble() -> Option<String> {
        None
    }

    fn maybe_create_dfl<P: AsRef<Path>>(path_in: P) -> Result<bool> {
        let path = path_in.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut f) => {
                let data: Self = Default::default();
                f.write_all(data.as_json()?.as_ref())?;
                Ok(true)
            }
            Err(e) => match e.kind() {
                io::ErrorKind::AlreadyExists => Ok(false),
                _ => Err(e.into()),
            },
        }
    }

    fn as_json(&self) -> Result<String> {
        let mut serialized = serde_json::to_string_pretty(&self)?;
        if !serialized.ends_with('\n') {
            serialized += "\n";
        }
        match Self::preamble() {
            Some(pre) => Ok(pre + &serialized),
            None => Ok(serialized),
        }
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        f.write_all(self.as_json()?.as_ref())?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct JsonConfigFile<T: JsonLoad + JsonSave> {
    pub path: Option<PathBuf>,
    pub data: T,
}

impl<T: JsonLoad + JsonSave> JsonConfigFile<T> {
    pub fn load<P: AsRef<Path>>(path_in: P) -> Result<Self> {
        let path = path_in.as_ref();
        let mut data = T::load(path)?;
        data.loaded()?;

        Ok(Self {
            path: Some(PathBuf::from(path)),
            data,
        })
    }

    /// Without a path, the defaults are used. With one, a default file is
    /// written out first if it doesn't exist yet.
    pub fn load_or_create<P: AsRef<Path>>(path_opt: Option<P>) -> Result<Self> {
        match path_opt {
            Some(path_in) => {
                let path = path_in.as_ref();
                if T::maybe_create_dfl(path)? {
                    info!("cfg: Created {:?}", path);
                }
                Self::load(path)
            }
            None => {
                let mut data: T = Default::default();
                data.loaded()?;
                Ok(Self { path: None, data })
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        match self.path.as_deref() {
            Some(path) => self.data.save(path),
            None => Ok(()),
        }
    }
}

pub trait JsonArgs
where
    Self: JsonLoad + JsonSave,
{
    fn match_cmdline(argv: &[String]) -> clap::ArgMatches<'static>;
    fn verbosity(matches: &clap::ArgMatches) -> u32;
    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> bool;
}

pub trait JsonArgsHelper
where
    Self: JsonArgs,
{
    fn init_args_and_logging(argv: &[String]) -> Result<JsonConfigFile<Self>>;
}

impl<T> JsonArgsHelper for T
where
    T: JsonArgs,
{
    fn init_args_and_logging(argv: &[String]) -> Result<JsonConfigFile<T>> {
        let matches = T::match_cmdline(argv);
        super::init_logging(T::verbosity(&matches));

        let mut args_file = JsonConfigFile::<T>::load_or_create(matches.value_of("args"))?;
        if args_file.data.process_cmdline(&matches) && args_file.path.is_some() {
            info!(
                "Updating command line arguments file {:?}",
                args_file.path.as_deref().unwrap_or_else(|| Path::new(""))
            );
            args_file.save()?;
        }
        Ok(args_file)
    }
}

#[cfg(test)]
mod tests {
    use super::{JsonConfigFile, JsonLoad, JsonSave};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Knobs {
        repeat: u32,
        tolerance: f64,
    }

    impl Default for Knobs {
        fn default() -> Self {
            Self {
                repeat: 5,
                tolerance: 0.05,
            }
        }
    }

    impl JsonLoad for Knobs {}

    impl JsonSave for Knobs {
        fn preamble() -> Option<String> {
            Some("//\n// test knobs\n//\n".into())
        }
    }

    #[test]
    fn test_create_and_reload_with_preamble() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/knobs.json");

        let cfg = JsonConfigFile::<Knobs>::load_or_create(Some(&path)).unwrap();
        assert_eq!(cfg.data, Knobs::default());
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("//\n// test knobs"));

        std::fs::write(&path, "// edited\n{\n  \"repeat\": 9\n}\n").unwrap();
        let cfg = JsonConfigFile::<Knobs>::load(&path).unwrap();
        assert_eq!(cfg.data.repeat, 9);
        assert_eq!(cfg.data.tolerance, 0.05);
    }
}
