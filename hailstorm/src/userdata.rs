//! Preprocessing for instance bootstrap scripts.
//!
//! A UserData document goes through two passes before launch: `@import(path)@`
//! tokens are spliced with the referenced file contents, then `@NAME@` macros
//! are substituted from a caller-supplied mapping. Two reserved aggregate
//! macros expand the whole mapping at once ("!all_macros_export" and
//! "!all_macros_docker").

use std::{
    fs,
    path::{Path, PathBuf},
};

use lazy_static::lazy_static;
use log::info;
use regex::Regex;
use thiserror::Error;

/// Expands the entire mapping into `export K="V"` lines.
pub const MACRO_ALL_EXPORT: &str = "!all_macros_export";
/// Expands the entire mapping into `-e 'K=V'` docker arguments.
pub const MACRO_ALL_DOCKER: &str = "!all_macros_docker";

lazy_static! {
    static ref MACRO_RE: Regex = Regex::new(r"@(.*?)@").unwrap();
    static ref IMPORT_RE: Regex = Regex::new(r"@import\((.*?)\)@").unwrap();
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("undefined macro @{name}@")]
    UndefinedMacro { name: String },
    #[error("import file not found '{path}'")]
    ImportNotFound { path: String },
    #[error("failed to read '{path}' {source:?}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Splices every `@import(path)@` token with the raw contents of the
/// referenced file. Relative paths resolve against "base_dir". Inserted
/// content is spliced as-is in a single pass; import tokens inside an
/// imported file are left untouched, so import cycles cannot occur.
pub fn resolve_imports(text: &str, base_dir: &Path) -> Result<String, Error> {
    let mut resolved = text.to_string();
    for path in IMPORT_RE
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect::<Vec<String>>()
    {
        let include = if Path::new(&path).is_absolute() {
            PathBuf::from(&path)
        } else {
            base_dir.join(&path)
        };
        info!("splicing '@import({})@' from '{}'", path, include.display());
        if !include.is_file() {
            return Err(Error::ImportNotFound {
                path: include.display().to_string(),
            });
        }
        let contents = fs::read_to_string(&include).map_err(|e| Error::Io {
            path: include.display().to_string(),
            source: e,
        })?;
        resolved = resolved.replace(&format!("@import({})@", path), &contents);
    }
    Ok(resolved)
}

/// Returns the distinct `@NAME@`-shaped tokens in left-to-right discovery
/// order, without substituting anything.
pub fn list_macro_names(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in MACRO_RE.captures_iter(text) {
        let name = caps[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Substitutes every `@NAME@` token from the ordered "macros" mapping.
///
/// Tokens are processed in left-to-right discovery order over the input;
/// each unique name is replaced globally in one shot, and substituted values
/// are never re-scanned, so a value containing `@OTHER@` survives literally.
/// `@NAME|fallback@` falls back to the literal text when the name is not
/// mapped. A bare `@NAME@` without a mapping aborts the whole operation --
/// no partially substituted script is ever returned.
pub fn substitute_macros(text: &str, macros: &[(String, String)]) -> Result<String, Error> {
    let mut substituted = text.to_string();
    for name in MACRO_RE
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect::<Vec<String>>()
    {
        if name == MACRO_ALL_EXPORT {
            let lines = macros
                .iter()
                .map(|(k, v)| format!("export {}=\"{}\"", k, v))
                .collect::<Vec<String>>()
                .join("\n");
            substituted = substituted.replace(&format!("@{}@", name), &lines);
        } else if name == MACRO_ALL_DOCKER {
            let args = macros
                .iter()
                .map(|(k, v)| format!("-e '{}={}'", k, v))
                .collect::<Vec<String>>()
                .join(" ");
            substituted = substituted.replace(&format!("@{}@", name), &args);
        } else if let Some((base, fallback)) = name.split_once('|') {
            let value = lookup(macros, base).unwrap_or(fallback);
            substituted = substituted.replace(&format!("@{}|{}@", base, fallback), value);
        } else {
            match lookup(macros, &name) {
                Some(value) => {
                    substituted = substituted.replace(&format!("@{}@", name), value);
                }
                None => return Err(Error::UndefinedMacro { name }),
            }
        }
    }
    Ok(substituted)
}

fn lookup<'a>(macros: &'a [(String, String)], name: &str) -> Option<&'a str> {
    macros
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- userdata::test_substitute_macros --exact --show-output
#[test]
fn test_substitute_macros() {
    let _ = env_logger::builder().is_test(true).try_init();

    let macros = vec![
        (String::from("FOO"), String::from("FOOVAL")),
        (String::from("BAR"), String::from("BARVAL")),
    ];

    let out = substitute_macros("echo @FOO@; echo @BAR@ and @FOO@ again", &macros).unwrap();
    assert_eq!(out, "echo FOOVAL; echo BARVAL and FOOVAL again");
    assert!(!out.contains("@FOO@"));
    assert!(!out.contains("@BAR@"));

    // already fully substituted documents pass through unchanged
    let again = substitute_macros(&out, &macros).unwrap();
    assert_eq!(again, out);
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- userdata::test_aggregate_macros --exact --show-output
#[test]
fn test_aggregate_macros() {
    let _ = env_logger::builder().is_test(true).try_init();

    let macros = vec![
        (String::from("FOO"), String::from("FOOVAL")),
        (String::from("BAR"), String::from("BARVAL")),
    ];

    let exported = substitute_macros("@!all_macros_export@", &macros).unwrap();
    assert_eq!(exported, "export FOO=\"FOOVAL\"\nexport BAR=\"BARVAL\"");

    let dockered = substitute_macros("@!all_macros_docker@", &macros).unwrap();
    assert_eq!(dockered, "-e 'FOO=FOOVAL' -e 'BAR=BARVAL'");
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- userdata::test_undefined_macro --exact --show-output
#[test]
fn test_undefined_macro() {
    let _ = env_logger::builder().is_test(true).try_init();

    let macros = vec![(String::from("FOO"), String::from("FOOVAL"))];
    let ret = substitute_macros("echo @FOO@ and @MISSING@", &macros);
    match ret {
        Err(Error::UndefinedMacro { name }) => assert_eq!(name, "MISSING"),
        other => panic!("unexpected {:?}", other),
    }
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- userdata::test_default_value_macro --exact --show-output
#[test]
fn test_default_value_macro() {
    let _ = env_logger::builder().is_test(true).try_init();

    let macros = vec![(String::from("NAME"), String::from("ceres"))];
    let out = substitute_macros("host=@NAME|localhost@ port=@PORT|8080@", &macros).unwrap();
    assert_eq!(out, "host=ceres port=8080");
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- userdata::test_macro_value_not_rescanned --exact --show-output
#[test]
fn test_macro_value_not_rescanned() {
    let _ = env_logger::builder().is_test(true).try_init();

    let macros = vec![
        (String::from("OUTER"), String::from("@INNER@")),
        (String::from("INNER"), String::from("nope")),
    ];
    let out = substitute_macros("value=@OUTER@", &macros).unwrap();
    assert_eq!(out, "value=@INNER@");
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- userdata::test_list_macro_names --exact --show-output
#[test]
fn test_list_macro_names() {
    let _ = env_logger::builder().is_test(true).try_init();

    let names = list_macro_names("run @FOO@ @BAR@ @FOO@ end");
    assert_eq!(names, vec![String::from("FOO"), String::from("BAR")]);
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- userdata::test_resolve_imports --exact --show-output
#[test]
fn test_resolve_imports() {
    use std::io::Write;

    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let mut f = std::fs::File::create(dir.path().join("x.sh")).unwrap();
    f.write_all(b"MIDDLE").unwrap();

    let out = resolve_imports("pre @import(x.sh)@ post", dir.path()).unwrap();
    assert_eq!(out, "pre MIDDLE post");

    let ret = resolve_imports("pre @import(missing.sh)@ post", dir.path());
    assert!(matches!(ret, Err(Error::ImportNotFound { .. })));
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- userdata::test_nested_imports_left_alone --exact --show-output
#[test]
fn test_nested_imports_left_alone() {
    use std::io::Write;

    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let mut outer = std::fs::File::create(dir.path().join("outer.sh")).unwrap();
    outer.write_all(b"before @import(inner.sh)@ after").unwrap();

    // single pass: the nested token is spliced in literally, never chased
    let out = resolve_imports("@import(outer.sh)@", dir.path()).unwrap();
    assert_eq!(out, "before @import(inner.sh)@ after");
}
