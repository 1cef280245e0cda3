pub mod azure;
pub mod ec2;
pub mod errors;
pub mod gce;
mod http;
pub mod instance;
pub mod packet;
pub mod provider;
pub mod retry;
pub mod ssh;
pub mod userdata;

use std::{collections::HashMap, fs, time::Duration};

use log::info;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Fixed wait between fulfillment/state polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Named image definitions from the `--images` JSON file. Definitions stay
/// raw JSON objects until a provider-typed extraction, so load-time
/// overrides can mutate any field.
#[derive(Debug, Clone)]
pub struct ImageSet {
    images: HashMap<String, serde_json::Value>,
}

impl ImageSet {
    pub fn load(file_path: &str) -> Result<Self> {
        info!("loading image definitions from '{}'", file_path);
        let contents = fs::read_to_string(file_path).map_err(|e| Error::Other {
            message: format!("failed to read '{}' ({})", file_path, e),
            is_retryable: false,
        })?;
        let images: HashMap<String, serde_json::Value> =
            serde_json::from_str(&contents).map_err(|e| Error::Other {
                message: format!("failed to parse '{}' ({})", file_path, e),
                is_retryable: false,
            })?;
        Ok(Self { images })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.images.keys().cloned().collect();
        names.sort();
        names
    }

    /// Applies `k=v` overrides to the named raw definition. Values are
    /// coerced before insertion: "true"/"false" become booleans, numeric
    /// strings become numbers, everything else stays a string.
    pub fn apply_args(&mut self, name: &str, overrides: &[(String, String)]) -> Result<()> {
        if overrides.is_empty() {
            return Ok(());
        }
        let obj = self.image_object(name)?;
        for (k, v) in overrides {
            obj.insert(k.clone(), coerce_value(v));
        }
        Ok(())
    }

    /// Overwrites one field of the named definition.
    pub fn set_field(&mut self, name: &str, field: &str, value: serde_json::Value) -> Result<()> {
        let obj = self.image_object(name)?;
        obj.insert(field.to_string(), value);
        Ok(())
    }

    /// Writes the preprocessed UserData blob into the definition.
    pub fn set_user_data(&mut self, name: &str, user_data: &str) -> Result<()> {
        self.set_field(
            name,
            "user_data",
            serde_json::Value::String(user_data.to_string()),
        )
    }

    /// Deserializes the named definition into the provider's typed form.
    pub fn extract<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T> {
        let image = self.images.get(name).ok_or_else(|| Error::Other {
            message: format!("image definition '{}' not found", name),
            is_retryable: false,
        })?;
        serde_json::from_value(image.clone()).map_err(|e| Error::Other {
            message: format!("malformed image definition '{}' ({})", name, e),
            is_retryable: false,
        })
    }

    fn image_object(
        &mut self,
        name: &str,
    ) -> Result<&mut serde_json::Map<String, serde_json::Value>> {
        let image = self.images.get_mut(name).ok_or_else(|| Error::Other {
            message: format!("image definition '{}' not found", name),
            is_retryable: false,
        })?;
        image.as_object_mut().ok_or_else(|| Error::Other {
            message: format!("image definition '{}' is not an object", name),
            is_retryable: false,
        })
    }
}

fn coerce_value(raw: &str) -> serde_json::Value {
    if raw == "true" {
        return serde_json::Value::Bool(true);
    }
    if raw == "false" {
        return serde_json::Value::Bool(false);
    }
    if let Ok(n) = raw.parse::<i64>() {
        return serde_json::Value::Number(serde_json::Number::from(n));
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return serde_json::Value::Number(n);
        }
    }
    serde_json::Value::String(raw.to_string())
}

/// Operator settings from the `--settings` JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<ssh::SshSettings>,
}

impl Settings {
    pub fn load(file_path: &str) -> Result<Self> {
        info!("loading settings from '{}'", file_path);
        let contents = fs::read_to_string(file_path).map_err(|e| Error::Other {
            message: format!("failed to read '{}' ({})", file_path, e),
            is_retryable: false,
        })?;
        serde_json::from_str(&contents).map_err(|e| Error::Other {
            message: format!("failed to parse '{}' ({})", file_path, e),
            is_retryable: false,
        })
    }

    /// The validated `ssh` section, required by `--run`.
    pub fn ssh(&self) -> Result<&ssh::SshSettings> {
        match &self.ssh {
            Some(s) if !s.identity.is_empty() && !s.username.is_empty() => Ok(s),
            Some(_) => Err(Error::Other {
                message: String::from("settings 'ssh' section requires 'identity' and 'username'"),
                is_retryable: false,
            }),
            None => Err(Error::Other {
                message: String::from("settings file has no 'ssh' section"),
                is_retryable: false,
            }),
        }
    }
}

/// Parses repeated "k=v" arguments, preserving argument order. Values may
/// themselves contain '=' (only the first one splits).
pub fn parse_key_value_pairs(args: &[String]) -> Result<Vec<(String, String)>> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    for arg in args {
        match arg.split_once('=') {
            Some((k, v)) if !k.is_empty() => pairs.push((k.to_string(), v.to_string())),
            _ => {
                return Err(Error::Other {
                    message: format!("invalid key=value argument '{}'", arg),
                    is_retryable: false,
                })
            }
        }
    }
    Ok(pairs)
}

/// Map variant for filter criteria whose order does not matter.
pub fn parse_key_value_map(args: &[String]) -> Result<HashMap<String, String>> {
    Ok(parse_key_value_pairs(args)?.into_iter().collect())
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- test_image_set --exact --show-output
#[test]
fn test_image_set() {
    use std::io::Write;

    let _ = env_logger::builder().is_test(true).try_init();

    let mut f = tempfile::NamedTempFile::new().unwrap();
    write!(
        f,
        r#"{{
            "default": {{
                "image_id": "ami-0abcdef1234567890",
                "instance_type": "t3.large",
                "count": 1
            }},
            "bigmem": {{
                "image_id": "ami-0abcdef1234567890",
                "instance_type": "r5.4xlarge"
            }}
        }}"#
    )
    .unwrap();
    let path = f.path().to_str().unwrap().to_string();

    let mut images = ImageSet::load(&path).unwrap();
    assert_eq!(images.names(), vec!["bigmem", "default"]);

    let overrides = parse_key_value_pairs(&[
        String::from("count=3"),
        String::from("root_size_gb=100"),
        String::from("root_delete_on_termination=true"),
        String::from("key_name=fuzzing"),
    ])
    .unwrap();
    images.apply_args("default", &overrides).unwrap();
    images.set_user_data("default", "#!/bin/sh\necho hi").unwrap();

    let def: ec2::Ec2ImageDef = images.extract("default").unwrap();
    assert_eq!(def.count, 3);
    assert_eq!(def.root_size_gb, Some(100));
    assert_eq!(def.root_delete_on_termination, Some(true));
    assert_eq!(def.key_name.as_deref(), Some("fuzzing"));
    assert_eq!(def.user_data.as_deref(), Some("#!/bin/sh\necho hi"));

    assert!(images.extract::<ec2::Ec2ImageDef>("nope").is_err());
    assert!(images
        .apply_args("nope", &[(String::from("a"), String::from("b"))])
        .is_err());
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- test_coerce_value --exact --show-output
#[test]
fn test_coerce_value() {
    let _ = env_logger::builder().is_test(true).try_init();

    assert_eq!(coerce_value("true"), serde_json::Value::Bool(true));
    assert_eq!(coerce_value("false"), serde_json::Value::Bool(false));
    assert_eq!(coerce_value("42"), serde_json::json!(42));
    assert_eq!(coerce_value("0.05"), serde_json::json!(0.05));
    assert_eq!(coerce_value("c5.xlarge"), serde_json::json!("c5.xlarge"));
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- test_parse_key_value_pairs --exact --show-output
#[test]
fn test_parse_key_value_pairs() {
    let _ = env_logger::builder().is_test(true).try_init();

    let pairs = parse_key_value_pairs(&[
        String::from("FOO=1"),
        String::from("BAR=2"),
        String::from("tags=pool=fuzzer"),
    ])
    .unwrap();
    assert_eq!(
        pairs,
        vec![
            (String::from("FOO"), String::from("1")),
            (String::from("BAR"), String::from("2")),
            (String::from("tags"), String::from("pool=fuzzer")),
        ]
    );

    assert!(parse_key_value_pairs(&[String::from("no-equals")]).is_err());
    assert!(parse_key_value_pairs(&[String::from("=value")]).is_err());

    let map = parse_key_value_map(&[String::from("a=1"), String::from("b=2")]).unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map.get("a").unwrap(), "1");
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- test_settings --exact --show-output
#[test]
fn test_settings() {
    use std::io::Write;

    let _ = env_logger::builder().is_test(true).try_init();

    let mut f = tempfile::NamedTempFile::new().unwrap();
    write!(
        f,
        r#"{{"ssh": {{"identity": "/home/op/.ssh/id_ed25519", "username": "op"}}}}"#
    )
    .unwrap();
    let settings = Settings::load(f.path().to_str().unwrap()).unwrap();
    let ssh = settings.ssh().unwrap();
    assert_eq!(ssh.username, "op");

    let empty: Settings = serde_json::from_str("{}").unwrap();
    assert!(empty.ssh().is_err());

    let blank: Settings =
        serde_json::from_str(r#"{"ssh": {"identity": "", "username": "op"}}"#).unwrap();
    assert!(blank.ssh().is_err());
}
