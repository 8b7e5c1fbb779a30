//! Input and output tables on disk.
//!
//! `.txt` tables are whitespace separated columns under a `#` header, with
//! vector cells expanded into `name[i]` columns. `.json` tables are arrays
//! of objects keyed by field name.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::row::{Row, Schema};
use crate::var::{Var, VarType};
use crate::worker::post::parse_columns;
use crate::Float;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Txt,
    Json,
}

impl Format {
    pub fn from_path(path: &Path) -> Result<Format> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("txt") | Some("dat") => Ok(Format::Txt),
            Some("json") => Ok(Format::Json),
            _ => Err(Error::InvalidConfiguration(format!(
                "unsupported table format: {}",
                path.display()
            ))),
        }
    }
}

pub fn save(path: &Path, schema: &Schema, rows: &[Row]) -> Result<()> {
    let content = match Format::from_path(path)? {
        Format::Txt => to_txt(schema, rows),
        Format::Json => {
            let array: Vec<serde_json::Value> = rows.iter().map(|r| r.to_json()).collect();
            serde_json::to_string_pretty(&array)?
        }
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    debug!("saved {} rows to {}", rows.len(), path.display());
    Ok(())
}

pub fn load(path: &Path, schema: Arc<Schema>) -> Result<Vec<Row>> {
    let content = fs::read_to_string(path)?;
    match Format::from_path(path)? {
        Format::Txt => from_txt(&content, schema),
        Format::Json => {
            let json: serde_json::Value = serde_json::from_str(&content)?;
            let array = json.as_array().ok_or_else(|| {
                Error::ParsingError(format!("{}: expected a json array", path.display()))
            })?;
            array
                .iter()
                .map(|v| Row::from_json(schema.clone(), v))
                .collect()
        }
    }
}

/// Saves inputs and outputs of every completed run, in run id order, so
/// that rows of both tables line up.
pub fn save_results(registry: &Registry, input: &Path, output: &Path) -> Result<usize> {
    let completed = registry.completed();
    let (inputs, outputs): (Vec<Row>, Vec<Row>) =
        completed.into_iter().map(|(_, i, o)| (i, o)).unzip();
    save(input, registry.input_schema(), &inputs)?;
    save(output, registry.output_schema(), &outputs)?;
    let missing = registry.ids().len() - inputs.len();
    if missing > 0 {
        warn!("{} runs without output left out of the tables", missing);
    }
    Ok(inputs.len())
}

fn widths(schema: &Schema, rows: &[Row]) -> Vec<Option<usize>> {
    schema
        .fields
        .iter()
        .enumerate()
        .map(|(n, field)| match field.vtype {
            VarType::FloatList => Some(field.len.unwrap_or_else(|| {
                rows.first()
                    .map(|r| r.values()[n].to_floats().len())
                    .unwrap_or(0)
            })),
            _ => None,
        })
        .collect()
}

fn to_txt(schema: &Schema, rows: &[Row]) -> String {
    let widths = widths(schema, rows);
    let mut header = Vec::new();
    for (field, width) in schema.fields.iter().zip(&widths) {
        match width {
            Some(w) => header.extend((0..*w).map(|i| format!("{}[{}]", field.name, i))),
            None => header.push(field.name.clone()),
        }
    }
    let mut out = format!("# {}\n", header.join(" "));
    for row in rows {
        let mut cells = Vec::with_capacity(header.len());
        for value in row.values() {
            match value {
                Var::FloatList(list) => cells.extend(list.iter().map(|v| v.to_string())),
                v => cells.push(v.to_string()),
            }
        }
        let _ = writeln!(out, "{}", cells.join(" "));
    }
    out
}

fn from_txt(content: &str, schema: Arc<Schema>) -> Result<Vec<Row>> {
    let header: Vec<String> = content
        .lines()
        .find(|l| l.trim_start().starts_with('#'))
        .map(|l| {
            l.trim_start()
                .trim_start_matches('#')
                .split_whitespace()
                .map(|s| s.to_string())
                .collect()
        })
        .ok_or_else(|| Error::ParsingError("table is missing its header".to_string()))?;

    // column indices feeding each field
    let mut sources = Vec::with_capacity(schema.len());
    for field in &schema.fields {
        let columns: Vec<usize> = match field.vtype {
            VarType::FloatList => {
                let prefix = format!("{}[", field.name);
                header
                    .iter()
                    .enumerate()
                    .filter(|(_, h)| h.starts_with(&prefix))
                    .map(|(n, _)| n)
                    .collect()
            }
            _ => header
                .iter()
                .position(|h| *h == field.name)
                .into_iter()
                .collect(),
        };
        if columns.is_empty() {
            return Err(Error::ParsingError(format!(
                "table has no column for {}",
                field.name
            )));
        }
        sources.push(columns);
    }

    let numeric = schema
        .fields
        .iter()
        .all(|f| f.vtype.is_numeric() || f.vtype == VarType::FloatList);
    let mut rows = Vec::new();
    if numeric {
        for values in parse_columns(content)? {
            let mut row = schema.default_row();
            for (n, (field, columns)) in schema.fields.iter().zip(&sources).enumerate() {
                let cell = |c: usize| {
                    values.get(c).copied().ok_or_else(|| {
                        Error::ParsingError(format!("row is missing column {}", c + 1))
                    })
                };
                let var = match field.vtype {
                    VarType::FloatList => Var::FloatList(
                        columns
                            .iter()
                            .map(|c| cell(*c))
                            .collect::<Result<Vec<Float>>>()?,
                    ),
                    vtype => Var::from_float(vtype, cell(columns[0])?)?,
                };
                row.set_at(n, var)?;
            }
            rows.push(row);
        }
    } else {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let mut row = schema.default_row();
            for (n, (field, columns)) in schema.fields.iter().zip(&sources).enumerate() {
                let token = tokens.get(columns[0]).ok_or_else(|| {
                    Error::ParsingError(format!("row is missing column {}", columns[0] + 1))
                })?;
                row.set_at(n, Var::from_str(token, field.vtype)?)?;
            }
            rows.push(row);
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Field;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field {
                name: "f".to_string(),
                vtype: VarType::Float,
                len: None,
            },
            Field {
                name: "n".to_string(),
                vtype: VarType::Int,
                len: None,
            },
            Field {
                name: "g".to_string(),
                vtype: VarType::FloatList,
                len: Some(2),
            },
        ]))
    }

    fn rows(schema: &Arc<Schema>) -> Vec<Row> {
        vec![
            Row::from_values(
                schema.clone(),
                vec![Var::Float(0.5), Var::Int(3), Var::FloatList(vec![1., 2.])],
            )
            .unwrap(),
            Row::from_values(
                schema.clone(),
                vec![Var::Float(-1.25), Var::Int(-7), Var::FloatList(vec![3., 4.5])],
            )
            .unwrap(),
        ]
    }

    #[test]
    fn txt_expands_vector_columns() {
        let schema = schema();
        let text = to_txt(&schema, &rows(&schema));
        assert_eq!(text, "# f n g[0] g[1]\n0.5 3 1 2\n-1.25 -7 3 4.5\n");
        assert_eq!(from_txt(&text, schema.clone()).unwrap(), rows(&schema));
    }

    #[test]
    fn json_table_loads_again() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.json");
        let schema = schema();
        save(&path, &schema, &rows(&schema)).unwrap();
        assert_eq!(load(&path, schema.clone()).unwrap(), rows(&schema));
        assert!(save(&dir.path().join("output.csv"), &schema, &[]).is_err());
    }
}
