//! Preprocessors staging run inputs into the run directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{PreConfig, TemplatePreConfig};
use crate::error::{Error, Result};
use crate::row::Row;
use crate::util;

pub trait Preprocessor: Send + Sync {
    fn label(&self) -> &'static str;

    /// Whether the run needs its own working directory.
    fn requires_working_directory(&self) -> bool;

    /// Stages the input row into the run directory.
    fn prepare(&self, input: &Row, run_dir: &Path) -> Result<()>;

    /// Removes whatever `prepare` created.
    fn clean(&self, run_dir: &Path) -> Result<()> {
        if self.requires_working_directory() && run_dir.exists() {
            fs::remove_dir_all(run_dir)?;
        }
        Ok(())
    }
}

/// No staging, for runs not needing a working directory.
pub struct NoPreprocessor;

impl Preprocessor for NoPreprocessor {
    fn label(&self) -> &'static str {
        "none"
    }

    fn requires_working_directory(&self) -> bool {
        false
    }

    fn prepare(&self, input: &Row, _run_dir: &Path) -> Result<()> {
        trace!("no preprocessing, input: {:?}", input.values());
        Ok(())
    }
}

/// Copies a template directory and fills `{name}` placeholders with
/// input values.
pub struct TemplatePreprocessor {
    path: PathBuf,
    param_files: Option<Vec<String>>,
    strict: bool,
    overwrite: bool,
}

impl TemplatePreprocessor {
    pub fn new(config: &TemplatePreConfig) -> Self {
        TemplatePreprocessor {
            path: config.path.clone(),
            param_files: config.param_files.as_ref().map(|n| n.to_vec()),
            strict: config.strict,
            overwrite: config.overwrite,
        }
    }

    fn is_param_file(&self, run_dir: &Path, file: &Path) -> bool {
        match &self.param_files {
            None => true,
            Some(list) => {
                let relative = file.strip_prefix(run_dir).unwrap_or(file);
                let name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                list.iter()
                    .any(|p| Path::new(p) == relative || *p == name)
            }
        }
    }

    fn fill(&self, input: &Row, file: &Path) -> Result<()> {
        let content = match fs::read_to_string(file) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData && self.param_files.is_none() => {
                debug!("skipping non-text template file {}", file.display());
                return Ok(());
            }
            Err(e) => {
                return Err(Error::StagingFailure(format!(
                    "can't read {}: {}",
                    file.display(),
                    e
                )))
            }
        };
        let lookup = |name: &str| input.get(name).map(|v| v.to_string());
        let filled = util::substitute(&content, lookup, self.strict).map_err(|placeholder| {
            Error::MissingPlaceholder {
                placeholder,
                file: file.to_string_lossy().to_string(),
            }
        })?;
        if filled != content {
            fs::write(file, filled)?;
        }
        Ok(())
    }
}

impl Preprocessor for TemplatePreprocessor {
    fn label(&self) -> &'static str {
        "template"
    }

    fn requires_working_directory(&self) -> bool {
        true
    }

    fn prepare(&self, input: &Row, run_dir: &Path) -> Result<()> {
        if run_dir.exists() {
            if self.overwrite {
                fs::remove_dir_all(run_dir)?;
            } else {
                return Err(Error::StagingFailure(format!(
                    "run directory not empty: {}",
                    run_dir.display()
                )));
            }
        }
        if !self.path.is_dir() {
            return Err(Error::StagingFailure(format!(
                "template directory not found: {}",
                self.path.display()
            )));
        }
        util::copy_dir(&self.path, run_dir)
            .map_err(|e| Error::StagingFailure(format!("copying template failed: {}", e)))?;
        for file in util::files_in(run_dir)? {
            if self.is_param_file(run_dir, &file) {
                self.fill(input, &file)?;
            }
        }
        Ok(())
    }
}

pub fn from_config(config: &PreConfig) -> Box<dyn Preprocessor> {
    match config {
        PreConfig::None => Box::new(NoPreprocessor),
        PreConfig::Template(t) => Box::new(TemplatePreprocessor::new(t)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Names;
    use crate::row::{Field, Schema};
    use crate::var::{Var, VarType};
    use std::sync::Arc;

    fn input() -> Row {
        let schema = Arc::new(Schema::new(vec![Field {
            name: "u".to_string(),
            vtype: VarType::Float,
            len: None,
        }]));
        let mut row = schema.default_row();
        row.set("u", Var::Float(4.5)).unwrap();
        row
    }

    fn template(strict: bool, param_files: Option<Names>) -> (tempfile::TempDir, TemplatePreprocessor) {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template");
        fs::create_dir_all(template.join("sub")).unwrap();
        fs::write(template.join("params.in"), "u = {u}\nv = {v}\n").unwrap();
        fs::write(template.join("sub").join("other.in"), "{u}").unwrap();
        let pre = TemplatePreprocessor::new(&TemplatePreConfig {
            path: template,
            param_files,
            strict,
            overwrite: false,
        });
        (dir, pre)
    }

    #[test]
    fn fills_placeholders_and_keeps_unknown() {
        let (dir, pre) = template(false, None);
        let run_dir = dir.path().join("run_000");
        pre.prepare(&input(), &run_dir).unwrap();
        assert_eq!(
            fs::read_to_string(run_dir.join("params.in")).unwrap(),
            "u = 4.5\nv = {v}\n"
        );
        assert_eq!(
            fs::read_to_string(run_dir.join("sub").join("other.in")).unwrap(),
            "4.5"
        );
        match pre.prepare(&input(), &run_dir) {
            Err(Error::StagingFailure(_)) => (),
            other => panic!("unexpected: {:?}", other),
        }
        pre.clean(&run_dir).unwrap();
        assert!(!run_dir.exists());
    }

    #[test]
    fn strict_mode_reports_missing_placeholder() {
        let (dir, pre) = template(true, None);
        match pre.prepare(&input(), &dir.path().join("run_000")) {
            Err(Error::MissingPlaceholder { placeholder, .. }) => assert_eq!(placeholder, "v"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn only_param_files_are_filled() {
        let (dir, pre) = template(false, Some(Names::One("other.in".to_string())));
        let run_dir = dir.path().join("run_000");
        pre.prepare(&input(), &run_dir).unwrap();
        assert_eq!(
            fs::read_to_string(run_dir.join("params.in")).unwrap(),
            "u = {u}\nv = {v}\n"
        );
        assert_eq!(
            fs::read_to_string(run_dir.join("sub").join("other.in")).unwrap(),
            "4.5"
        );
    }
}
