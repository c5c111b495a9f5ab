//! `--config` support: a file of `option value` lines spliced into the
//! argument list before clap parses it, so every long option can also live
//! in a config file.

use std::fs;

use eyre::{eyre, Result};

/// Replace any `--config <path>` pair with the options read from the file.
/// Config lines use the long option name without the leading dashes, e.g.
/// `model ETM`; blank lines and `#` comments are skipped. Command-line
/// options win because clap sees them later.
pub fn expand_config_args(argv: Vec<String>) -> Result<Vec<String>> {
    let position = argv.iter().position(|a| a == "--config");
    let Some(pos) = position else {
        return Ok(argv);
    };
    let path = argv
        .get(pos + 1)
        .ok_or_else(|| eyre!("--config needs a file path"))?
        .clone();

    let text = fs::read_to_string(&path).map_err(|e| eyre!("{path}: {e}"))?;
    let mut expanded: Vec<String> = argv[..pos].to_vec();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let key = tokens.next().expect("non-empty line");
        expanded.push(format!("--{key}"));
        expanded.extend(tokens.map(str::to_string));
    }
    expanded.extend_from_slice(&argv[pos + 2..]);
    Ok(expanded)
}

#[cfg(test)]
mod test {
    use assert_fs::prelude::*;

    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_config_is_untouched() {
        let argv = args(&["qmri", "dce", "--model", "ETM"]);
        assert_eq!(expand_config_args(argv.clone()).unwrap(), argv);
    }

    #[test]
    fn config_lines_are_spliced_in_place() {
        let tmp = assert_fs::TempDir::new().unwrap();
        let cfg = tmp.child("run.cfg");
        cfg.write_str("# comment\nmodel ETM\niauc 60 90\n").unwrap();

        let argv = args(&[
            "qmri",
            "dce",
            "--config",
            cfg.path().to_str().unwrap(),
            "--max_iter",
            "100",
        ]);
        let expanded = expand_config_args(argv).unwrap();
        assert_eq!(
            expanded,
            args(&[
                "qmri", "dce", "--model", "ETM", "--iauc", "60", "90", "--max_iter", "100"
            ])
        );
    }

    #[test]
    fn missing_config_file_errors() {
        let argv = args(&["qmri", "dce", "--config", "/no/such/file.cfg"]);
        assert!(expand_config_args(argv).is_err());
    }
}
