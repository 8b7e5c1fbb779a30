//! Named, typed rows of values exchanged between runners and workers.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::var::{Var, VarType};
use crate::{Float, VarName};

/// Single named column of a row schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: VarName,
    pub vtype: VarType,
    /// Expected length for `float_list` fields bound to an independent
    /// variable axis.
    #[serde(default)]
    pub len: Option<usize>,
}

/// Fixed ordered set of fields shared by every row of a table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Schema { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Row with every cell holding its type's default value.
    pub fn default_row(self: &Arc<Self>) -> Row {
        Row {
            schema: self.clone(),
            values: self.fields.iter().map(|f| f.vtype.default_var()).collect(),
        }
    }
}

/// Row of values following a shared schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    schema: Arc<Schema>,
    values: Vec<Var>,
}

impl Row {
    /// Creates a row out of raw values, checking them against the schema.
    pub fn from_values(schema: Arc<Schema>, values: Vec<Var>) -> Result<Row> {
        if values.len() != schema.len() {
            return Err(Error::ParsingError(format!(
                "expected {} values, got {}",
                schema.len(),
                values.len()
            )));
        }
        let mut row = schema.default_row();
        for (n, value) in values.into_iter().enumerate() {
            row.set_at(n, value)?;
        }
        Ok(row)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn values(&self) -> &[Var] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Var> {
        self.values
    }

    pub fn get(&self, name: &str) -> Option<&Var> {
        self.schema.index_of(name).map(|n| &self.values[n])
    }

    pub fn get_float(&self, name: &str) -> Result<Float> {
        self.get(name)
            .ok_or_else(|| Error::Other(format!("no such column: {}", name)))?
            .as_float()
            .ok_or_else(|| Error::Other(format!("column {} is not numeric", name)))
    }

    /// Sets the named cell, coercing numeric values to the field type.
    pub fn set(&mut self, name: &str, value: Var) -> Result<()> {
        let n = self
            .schema
            .index_of(name)
            .ok_or_else(|| Error::Other(format!("no such column: {}", name)))?;
        self.set_at(n, value)
    }

    pub fn set_at(&mut self, n: usize, value: Var) -> Result<()> {
        let field = self
            .schema
            .fields
            .get(n)
            .ok_or_else(|| Error::Other(format!("column index out of bounds: {}", n)))?;
        let value = coerce(value, field.vtype)?;
        if let (Var::FloatList(list), Some(len)) = (&value, field.len) {
            if list.len() != len {
                return Err(Error::MalformedOutput(format!(
                    "{} expects {} values, got {}",
                    field.name,
                    len,
                    list.len()
                )));
            }
        }
        self.values[n] = value;
        Ok(())
    }

    /// Copies values from another row with the same schema.
    pub fn copy_from(&mut self, other: &Row) {
        self.values.clone_from(&other.values);
    }

    /// Numeric cells flattened, in schema order.
    pub fn to_floats(&self) -> Vec<Float> {
        self.values.iter().flat_map(|v| v.to_floats()).collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (field, value) in self.schema.fields.iter().zip(self.values.iter()) {
            map.insert(field.name.clone(), value.to_json());
        }
        serde_json::Value::Object(map)
    }

    /// Reads a row from a json object keyed by field name. Every field of
    /// the schema must be present.
    pub fn from_json(schema: Arc<Schema>, json: &serde_json::Value) -> Result<Row> {
        let map = json
            .as_object()
            .ok_or_else(|| Error::MalformedOutput("expected a json object".to_string()))?;
        let mut row = schema.default_row();
        for (n, field) in schema.fields.iter().enumerate() {
            let value = map.get(&field.name).ok_or_else(|| {
                Error::MalformedOutput(format!("missing value for {}", field.name))
            })?;
            let var = Var::from_json(value, field.vtype)
                .map_err(|e| Error::MalformedOutput(format!("{}: {}", field.name, e)))?;
            row.set_at(n, var)?;
        }
        Ok(row)
    }
}

fn coerce(value: Var, target: VarType) -> Result<Var> {
    if value.get_type() == target {
        return Ok(value);
    }
    match (target, &value) {
        (VarType::String, v) => Ok(Var::String(v.to_string())),
        (VarType::FloatList, Var::FloatList(_)) => Ok(value),
        (_, Var::String(s)) => Var::from_str(s, target),
        (t, v) => match v.as_float() {
            Some(f) => Var::from_float(t, f),
            None => Err(Error::InvalidVarType(format!(
                "can't store {} value in {} cell",
                v.get_type(),
                t
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field {
                name: "u".to_string(),
                vtype: VarType::Float,
                len: None,
            },
            Field {
                name: "n".to_string(),
                vtype: VarType::Int,
                len: None,
            },
            Field {
                name: "f".to_string(),
                vtype: VarType::FloatList,
                len: Some(2),
            },
        ]))
    }

    #[test]
    fn set_coerces_numeric_values() {
        let mut row = schema().default_row();
        row.set("u", Var::Int(2)).unwrap();
        row.set("n", Var::Float(2.7)).unwrap();
        assert_eq!(row.get("u"), Some(&Var::Float(2.0)));
        assert_eq!(row.get("n"), Some(&Var::Int(3)));
        assert!(row.set("missing", Var::Int(1)).is_err());
    }

    #[test]
    fn vector_length_is_checked() {
        let mut row = schema().default_row();
        assert!(row.set("f", Var::FloatList(vec![1.0])).is_err());
        row.set("f", Var::FloatList(vec![1.0, 2.0])).unwrap();
    }

    #[test]
    fn json_requires_every_field() {
        let json = serde_json::json!({"u": 1.5, "n": 4, "f": [0.0, 1.0]});
        let row = Row::from_json(schema(), &json).unwrap();
        assert_eq!(row.to_json(), json);

        let partial = serde_json::json!({"u": 1.5});
        match Row::from_json(schema(), &partial) {
            Err(Error::MalformedOutput(_)) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
