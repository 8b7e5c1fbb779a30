//! Postprocessors extracting the output row from a run's artifacts.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{JsonPostConfig, NumpytxtPostConfig, PostConfig};
use crate::error::{Error, Result};
use crate::row::{Row, Schema};
use crate::var::{Var, VarType};
use crate::Float;

pub trait Postprocessor: Send + Sync {
    fn label(&self) -> &'static str;

    /// Whether artifacts are read from the run's working directory.
    fn requires_working_directory(&self) -> bool;

    /// Fills the output row from the artifacts in `run_dir`.
    fn retrieve(&self, run_dir: &Path, output: &mut Row) -> Result<()>;
}

/// Leaves the output as written by the execution.
pub struct NoPostprocessor;

impl Postprocessor for NoPostprocessor {
    fn label(&self) -> &'static str {
        "none"
    }

    fn requires_working_directory(&self) -> bool {
        false
    }

    fn retrieve(&self, _run_dir: &Path, _output: &mut Row) -> Result<()> {
        Ok(())
    }
}

fn read_artifact(run_dir: &Path, path: &Path) -> Result<String> {
    let file = run_dir.join(path);
    fs::read_to_string(&file)
        .map_err(|e| Error::MalformedOutput(format!("can't read {}: {}", file.display(), e)))
}

/// Reads a json object mapping output names to values.
pub struct JsonPostprocessor {
    path: PathBuf,
}

impl JsonPostprocessor {
    pub fn new(config: &JsonPostConfig) -> Self {
        JsonPostprocessor {
            path: config.path.clone(),
        }
    }
}

impl Postprocessor for JsonPostprocessor {
    fn label(&self) -> &'static str {
        "json"
    }

    fn requires_working_directory(&self) -> bool {
        true
    }

    fn retrieve(&self, run_dir: &Path, output: &mut Row) -> Result<()> {
        let text = read_artifact(run_dir, &self.path)?;
        let json: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| Error::MalformedOutput(format!("invalid json: {}", e)))?;
        let row = Row::from_json(output.schema().clone(), &json)?;
        output.copy_from(&row);
        Ok(())
    }
}

/// Reads whitespace separated numeric columns, one per output.
pub struct NumpytxtPostprocessor {
    path: PathBuf,
    names: Option<Vec<String>>,
}

impl NumpytxtPostprocessor {
    pub fn new(config: &NumpytxtPostConfig) -> Self {
        NumpytxtPostprocessor {
            path: config.path.clone(),
            names: config.names.as_ref().map(|n| n.to_vec()),
        }
    }

    fn names(&self, schema: &Arc<Schema>) -> Vec<String> {
        match &self.names {
            Some(names) => names.clone(),
            None => schema.names().map(|n| n.to_string()).collect(),
        }
    }
}

/// Parses numeric rows, skipping blank lines and `#` comments.
pub fn parse_columns(text: &str) -> Result<Vec<Vec<Float>>> {
    let mut rows = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        };
        if line.trim().is_empty() {
            continue;
        }
        let mut row = Vec::new();
        for value in line.split(|c: char| c.is_whitespace() || c == ',') {
            if value.is_empty() {
                continue;
            }
            row.push(value.parse::<Float>().map_err(|e| {
                Error::MalformedOutput(format!("line {}: {}: {}", n + 1, value, e))
            })?);
        }
        rows.push(row);
    }
    Ok(rows)
}

impl Postprocessor for NumpytxtPostprocessor {
    fn label(&self) -> &'static str {
        "numpytxt"
    }

    fn requires_working_directory(&self) -> bool {
        true
    }

    fn retrieve(&self, run_dir: &Path, output: &mut Row) -> Result<()> {
        let text = read_artifact(run_dir, &self.path)?;
        let rows = parse_columns(&text)?;
        if rows.is_empty() {
            return Err(Error::MalformedOutput(format!(
                "no data in {}",
                self.path.display()
            )));
        }
        let schema = output.schema().clone();
        for (column, name) in self.names(&schema).iter().enumerate() {
            let field = schema
                .index_of(name)
                .map(|n| &schema.fields[n])
                .ok_or_else(|| Error::MalformedOutput(format!("unknown output {}", name)))?;
            let mut values = Vec::with_capacity(rows.len());
            for (n, row) in rows.iter().enumerate() {
                let value = row.get(column).ok_or_else(|| {
                    Error::MalformedOutput(format!(
                        "row {} has no column {} for {}",
                        n + 1,
                        column + 1,
                        name
                    ))
                })?;
                values.push(*value);
            }
            let var = match field.vtype {
                VarType::FloatList => Var::FloatList(values),
                vtype => Var::from_float(vtype, values[0])?,
            };
            output
                .set(name, var)
                .map_err(|e| Error::MalformedOutput(e.to_string()))?;
        }
        Ok(())
    }
}

pub fn from_config(config: &PostConfig) -> Box<dyn Postprocessor> {
    match config {
        PostConfig::None => Box::new(NoPostprocessor),
        PostConfig::Json(c) => Box::new(JsonPostprocessor::new(c)),
        PostConfig::Numpytxt(c) => Box::new(NumpytxtPostprocessor::new(c)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Names;
    use crate::row::Field;

    fn output() -> Row {
        Arc::new(Schema::new(vec![
            Field {
                name: "f".to_string(),
                vtype: VarType::Float,
                len: None,
            },
            Field {
                name: "g".to_string(),
                vtype: VarType::FloatList,
                len: Some(3),
            },
        ]))
        .default_row()
    }

    #[test]
    fn json_reads_named_values() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("stdout"), r#"{"f": 1.5, "g": [1, 2, 3]}"#).unwrap();
        let post = JsonPostprocessor::new(&JsonPostConfig::default());
        let mut row = output();
        post.retrieve(dir.path(), &mut row).unwrap();
        assert_eq!(row.get("f"), Some(&Var::Float(1.5)));
        assert_eq!(row.get("g"), Some(&Var::FloatList(vec![1., 2., 3.])));

        fs::write(dir.path().join("stdout"), "not json").unwrap();
        match post.retrieve(dir.path(), &mut output()) {
            Err(Error::MalformedOutput(_)) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn numpytxt_reads_columns_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("out.txt"),
            "# g f\n0.5 7\n1.5 8 # trailing\n\n2.5 9\n",
        )
        .unwrap();
        let post = NumpytxtPostprocessor::new(&NumpytxtPostConfig {
            path: PathBuf::from("out.txt"),
            names: Some(Names::One("g f".to_string())),
        });
        let mut row = output();
        post.retrieve(dir.path(), &mut row).unwrap();
        assert_eq!(row.get("f"), Some(&Var::Float(7.)));
        assert_eq!(row.get("g"), Some(&Var::FloatList(vec![0.5, 1.5, 2.5])));
    }

    #[test]
    fn numpytxt_missing_file_is_malformed_output() {
        let dir = tempfile::tempdir().unwrap();
        let post = NumpytxtPostprocessor::new(&NumpytxtPostConfig::default());
        match post.retrieve(dir.path(), &mut output()) {
            Err(Error::MalformedOutput(_)) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
